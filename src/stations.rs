use crate::error::StoreError;
use crate::models::{Station, Train};
use crate::store::{Query, RemoteStore};
use compact_str::CompactString;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

pub fn stations_query() -> Query {
    Query::table("stations").order_by("name", true)
}

/// Station id -> station, refreshed in the background. Trains arriving on
/// the change feed only carry station ids; this is where their names come
/// from.
#[derive(Clone)]
pub struct StationDirectory {
    store: Arc<dyn RemoteStore>,
    data: Arc<DashMap<Uuid, Station>>,
}

impl StationDirectory {
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        Self {
            store,
            data: Arc::new(DashMap::new()),
        }
    }

    pub fn start_updater(&self, every: Duration) {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(every).await;
                if let Err(e) = this.refresh().await {
                    warn!(error = %e, "station refresh failed");
                }
            }
        });
    }

    /// Replace the directory with the store's current station list.
    pub async fn refresh(&self) -> Result<usize, StoreError> {
        let rows = self.store.select(&stations_query()).await?;
        let mut seen = HashSet::with_capacity(rows.len());
        for row in rows {
            match serde_json::from_value::<Station>(row) {
                Ok(station) => {
                    seen.insert(station.id);
                    self.data.insert(station.id, station);
                }
                Err(e) => warn!(error = %e, "skipping malformed station row"),
            }
        }
        self.data.retain(|id, _| seen.contains(id));
        info!(stations = self.len(), "station directory loaded");
        Ok(self.len())
    }

    pub fn name_of(&self, id: &Uuid) -> Option<CompactString> {
        self.data.get(id).map(|s| s.name.clone())
    }

    /// All stations ordered by name.
    pub fn all(&self) -> Vec<Station> {
        let mut stations: Vec<Station> = self.data.iter().map(|r| r.value().clone()).collect();
        stations.sort_by(|a, b| a.name.cmp(&b.name));
        stations
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Enricher for the train cache.
    pub fn train_enricher(&self) -> impl Fn(Train) -> Train + Send + Sync + 'static {
        let this = self.clone();
        move |train: Train| train.fill_station_names(|id| this.name_of(id))
    }
}
