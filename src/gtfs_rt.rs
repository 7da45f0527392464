use crate::models::{Alert, AlertLevel, Train};
use chrono::Utc;
use gtfs_realtime::{
    EntitySelector, FeedEntity, FeedHeader, FeedMessage, Position, TimeRange, TranslatedString,
    VehicleDescriptor, VehiclePosition,
    alert::{Cause, Effect},
    translated_string::Translation,
};
use prost::Message;

// GTFS route_type for rail.
const ROUTE_TYPE_RAIL: i32 = 2;

/// Encode the live snapshot as a GTFS-Realtime feed: one vehicle position
/// per running train with coordinates, one alert per active alert.
pub fn build_feed(trains: &[Train], alerts: &[Alert]) -> FeedMessage {
    let mut msg = FeedMessage::default();
    let mut header = FeedHeader::default();
    header.gtfs_realtime_version = "2.0".to_string();
    header.timestamp = Some(Utc::now().timestamp() as u64);
    msg.header = header;

    for t in trains.iter().filter(|t| t.is_active()) {
        if let Some(entity) = vehicle_entity(t) {
            msg.entity.push(entity);
        }
    }
    for a in alerts.iter().filter(|a| a.is_active) {
        msg.entity.push(alert_entity(a));
    }
    msg
}

pub fn encode_feed(trains: &[Train], alerts: &[Alert]) -> Vec<u8> {
    build_feed(trains, alerts).encode_to_vec()
}

fn vehicle_entity(train: &Train) -> Option<FeedEntity> {
    let (lat, lon) = train.position()?;

    let mut position = Position::default();
    position.latitude = lat as f32;
    position.longitude = lon as f32;

    let mut descriptor = VehicleDescriptor::default();
    descriptor.id = Some(train.id.to_string());
    descriptor.label = Some(train.train_identifier.to_string());

    let mut vp = VehiclePosition::default();
    vp.position = Some(position);
    vp.vehicle = Some(descriptor);
    vp.stop_id = train.current_station_id.map(|id| id.to_string());
    vp.timestamp = train
        .updated_at
        .or(train.created_at)
        .map(|t| t.timestamp() as u64);

    let mut fe = FeedEntity::default();
    fe.id = format!("{}_VP", train.id);
    fe.vehicle = Some(vp);
    Some(fe)
}

fn alert_entity(alert: &Alert) -> FeedEntity {
    let mut translation = Translation::default();
    translation.text = alert.message.clone();
    translation.language = Some("en".to_string());
    let mut text = TranslatedString::default();
    text.translation.push(translation);

    let mut period = TimeRange::default();
    period.start = Some(alert.created_at.timestamp() as u64);

    let mut selector = EntitySelector::default();
    selector.route_type = Some(ROUTE_TYPE_RAIL);

    let mut rt = gtfs_realtime::Alert::default();
    rt.header_text = Some(text);
    rt.active_period.push(period);
    rt.informed_entity.push(selector);
    rt.cause = Some(Cause::UnknownCause as i32);
    rt.effect = Some(match alert.alert_level {
        AlertLevel::Critical => Effect::SignificantDelays as i32,
        AlertLevel::Warning | AlertLevel::Info => Effect::OtherEffect as i32,
    });

    let mut fe = FeedEntity::default();
    fe.id = format!("{}_ALERT", alert.id);
    fe.alert = Some(rt);
    fe
}
