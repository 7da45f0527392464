use crate::cache::Entity;
use chrono::{DateTime, Utc};
use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrainStatus {
    #[default]
    OnTime,
    Delayed,
    Cancelled,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    #[default]
    Info,
    Warning,
    Critical,
}

/// Weak reference to a station: always the id, the name only when it was
/// joined by the store or filled in from the station directory.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StationRef {
    pub id: Uuid,
    #[serde(default)]
    pub name: Option<CompactString>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Station {
    pub id: Uuid,
    pub name: CompactString,
    #[serde(default)]
    pub code: Option<CompactString>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Train {
    pub id: Uuid,
    pub train_identifier: CompactString,
    #[serde(default)]
    pub direction: Option<CompactString>,

    #[serde(default)]
    pub start_station_id: Option<Uuid>,
    #[serde(default)]
    pub destination_station_id: Option<Uuid>,
    #[serde(default)]
    pub current_station_id: Option<Uuid>,

    // Embedded by the store when the select joins stations. Feed rows never
    // carry these, see `fill_station_names`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_station: Option<StationRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_station: Option<StationRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_station: Option<StationRef>,

    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub eta: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: TrainStatus,
    #[serde(default)]
    pub is_delayed: bool,
    #[serde(default)]
    pub live_latitude: Option<f64>,
    #[serde(default)]
    pub live_longitude: Option<f64>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Train {
    /// Anything not cancelled is shown on the dashboard and the map.
    pub fn is_active(&self) -> bool {
        self.status != TrainStatus::Cancelled
    }

    pub fn position(&self) -> Option<(f64, f64)> {
        Some((self.live_latitude?, self.live_longitude?))
    }

    /// Populate the embedded station references from a name lookup.
    pub fn fill_station_names<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&Uuid) -> Option<CompactString>,
    {
        fill_ref(&mut self.start_station, self.start_station_id, &lookup);
        fill_ref(&mut self.destination_station, self.destination_station_id, &lookup);
        fill_ref(&mut self.current_station, self.current_station_id, &lookup);
        self
    }
}

fn fill_ref<F>(slot: &mut Option<StationRef>, id: Option<Uuid>, lookup: &F)
where
    F: Fn(&Uuid) -> Option<CompactString>,
{
    match (slot.as_mut(), id) {
        (Some(existing), _) if existing.name.is_none() => {
            existing.name = lookup(&existing.id);
        }
        (Some(_), _) => {}
        (None, Some(id)) => {
            *slot = Some(StationRef {
                id,
                name: lookup(&id),
            });
        }
        (None, None) => {}
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub message: String,
    #[serde(default)]
    pub alert_level: AlertLevel,
    #[serde(default = "default_true")]
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Alert {
    /// Critical and warning alerts get the banner treatment.
    pub fn is_prominent(&self) -> bool {
        matches!(self.alert_level, AlertLevel::Critical | AlertLevel::Warning)
    }
}

fn default_true() -> bool {
    true
}

// Mutation payloads forwarded to the store by the admin API.

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NewTrain {
    pub train_identifier: CompactString,
    #[serde(default)]
    pub direction: Option<CompactString>,
    #[serde(default)]
    pub start_station_id: Option<Uuid>,
    #[serde(default)]
    pub destination_station_id: Option<Uuid>,
    #[serde(default)]
    pub current_station_id: Option<Uuid>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub eta: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: TrainStatus,
    #[serde(default)]
    pub is_delayed: bool,
    #[serde(default)]
    pub live_latitude: Option<f64>,
    #[serde(default)]
    pub live_longitude: Option<f64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub train_identifier: Option<CompactString>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<CompactString>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_station_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_station_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_station_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TrainStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_delayed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub live_latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub live_longitude: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewAlert {
    pub message: String,
    #[serde(default)]
    pub alert_level: AlertLevel,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert_level: Option<AlertLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
}

impl Entity for Train {
    type Key = Uuid;
    const TABLE: &'static str = "trains";

    fn key(&self) -> Uuid {
        self.id
    }
}

impl Entity for Alert {
    type Key = Uuid;
    const TABLE: &'static str = "alerts";

    fn key(&self) -> Uuid {
        self.id
    }
}
