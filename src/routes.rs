//! HTTP surface: dashboard reads served from the caches, admin writes passed
//! through to the store.

use crate::cache::{CacheStatus, Entity, LiveCache};
use crate::error::StoreError;
use crate::gtfs_rt::encode_feed;
use crate::metrics::SystemMetrics;
use crate::models::{AlertPatch, NewAlert, NewTrain, TrainPatch};
use crate::state::AppState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;
use warp::filters::BoxedFilter;
use warp::http::StatusCode;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

const MAX_BODY: u64 = 64 * 1024;

/// Cache contents as served to the dashboard.
#[derive(Serialize)]
struct View<T> {
    updated_at: Option<DateTime<Utc>>,
    live: bool,
    data: T,
}

pub fn routes(state: Arc<AppState>) -> BoxedFilter<(Response,)> {
    let state_filter = warp::any().map(move || state.clone()).boxed();

    let health_route = warp::path!("health")
        .and(warp::get())
        .map(|| json_reply(&json!({"status": "ok"}), StatusCode::OK));

    let trains_route = warp::path!("trains")
        .and(warp::get())
        .and(state_filter.clone())
        .map(|state: Arc<AppState>| cache_view(&state.trains, state.trains.snapshot()));

    let active_trains_route = warp::path!("trains" / "active")
        .and(warp::get())
        .and(state_filter.clone())
        .map(|state: Arc<AppState>| {
            let mut trains = state.trains.snapshot();
            trains.retain(|t| t.is_active());
            // Earliest arrival first, unknown ETAs last.
            trains.sort_by_key(|t| (t.eta.is_none(), t.eta));
            cache_view(&state.trains, trains)
        });

    let alerts_route = warp::path!("alerts")
        .and(warp::get())
        .and(state_filter.clone())
        .map(|state: Arc<AppState>| cache_view(&state.alerts, state.alerts.snapshot()));

    let stations_route = warp::path!("stations")
        .and(warp::get())
        .and(state_filter.clone())
        .map(|state: Arc<AppState>| json_reply(&json!({"data": state.stations.all()}), StatusCode::OK));

    let metrics_route = warp::path!("metrics")
        .and(warp::get())
        .and(state_filter.clone())
        .map(|state: Arc<AppState>| {
            let m = SystemMetrics::compute(&state.trains.snapshot(), &state.admin_alerts.snapshot());
            cache_view(&state.trains, m)
        });

    let gtfs_rt_route = warp::path!("gtfs-rt")
        .and(warp::get())
        .and(state_filter.clone())
        .map(|state: Arc<AppState>| {
            let buf = encode_feed(&state.trains.snapshot(), &state.admin_alerts.snapshot());
            warp::reply::with_header(buf, "content-type", "application/x-protobuf").into_response()
        });

    let refresh_route = warp::path!("refresh")
        .and(warp::post())
        .and(state_filter.clone())
        .and_then(refresh);

    let admin_alerts_route = warp::path!("admin" / "alerts")
        .and(warp::get())
        .and(state_filter.clone())
        .map(|state: Arc<AppState>| cache_view(&state.admin_alerts, state.admin_alerts.snapshot()));

    let create_train_route = warp::path!("admin" / "trains")
        .and(warp::post())
        .and(json_body::<NewTrain>())
        .and(state_filter.clone())
        .and_then(create_train);

    let update_train_route = warp::path!("admin" / "trains" / Uuid)
        .and(warp::patch())
        .and(json_body::<TrainPatch>())
        .and(state_filter.clone())
        .and_then(update_train);

    let delete_train_route = warp::path!("admin" / "trains" / Uuid)
        .and(warp::delete())
        .and(state_filter.clone())
        .and_then(delete_train);

    let create_alert_route = warp::path!("admin" / "alerts")
        .and(warp::post())
        .and(json_body::<NewAlert>())
        .and(state_filter.clone())
        .and_then(create_alert);

    let update_alert_route = warp::path!("admin" / "alerts" / Uuid)
        .and(warp::patch())
        .and(json_body::<AlertPatch>())
        .and(state_filter.clone())
        .and_then(update_alert);

    let delete_alert_route = warp::path!("admin" / "alerts" / Uuid)
        .and(warp::delete())
        .and(state_filter.clone())
        .and_then(delete_alert);

    let toggle_alert_route = warp::path!("admin" / "alerts" / Uuid / "toggle")
        .and(warp::post())
        .and(state_filter)
        .and_then(toggle_alert);

    let public = health_route
        .or(trains_route)
        .unify()
        .or(active_trains_route)
        .unify()
        .or(alerts_route)
        .unify()
        .or(stations_route)
        .unify()
        .or(metrics_route)
        .unify()
        .or(gtfs_rt_route)
        .unify()
        .or(refresh_route)
        .unify()
        .boxed();

    let admin = admin_alerts_route
        .or(create_train_route)
        .unify()
        .or(update_train_route)
        .unify()
        .or(delete_train_route)
        .unify()
        .or(create_alert_route)
        .unify()
        .or(update_alert_route)
        .unify()
        .or(delete_alert_route)
        .unify()
        .or(toggle_alert_route)
        .unify()
        .boxed();

    public.or(admin).unify().boxed()
}

fn json_body<T: DeserializeOwned + Send>() -> impl Filter<Extract = (T,), Error = Rejection> + Clone {
    warp::body::content_length_limit(MAX_BODY).and(warp::body::json())
}

fn json_reply<T: Serialize>(body: &T, status: StatusCode) -> Response {
    warp::reply::with_status(warp::reply::json(body), status).into_response()
}

fn error_reply(err: &StoreError) -> Response {
    warn!(error = %err, "request failed");
    json_reply(&json!({"error": err.user_message()}), err.status_code())
}

fn cache_view<E: Entity, T: Serialize>(cache: &LiveCache<E>, data: T) -> Response {
    match cache.status() {
        CacheStatus::Failed(message) => {
            json_reply(&json!({"error": message}), StatusCode::SERVICE_UNAVAILABLE)
        }
        CacheStatus::Closed => error_reply(&StoreError::TornDown(E::TABLE.to_string())),
        _ => json_reply(
            &View {
                updated_at: cache.last_updated(),
                live: cache.is_live(),
                data,
            },
            StatusCode::OK,
        ),
    }
}

fn stored<T: Serialize>(result: Result<T, StoreError>, status: StatusCode) -> Response {
    match result {
        Ok(row) => json_reply(&row, status),
        Err(e) => error_reply(&e),
    }
}

fn deleted(result: Result<(), StoreError>) -> Response {
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_reply(&e),
    }
}

async fn refresh(state: Arc<AppState>) -> Result<Response, Infallible> {
    if let Err(e) = state.stations.refresh().await {
        warn!(error = %e, "station refresh failed");
    }
    Ok(match state.sync_all().await {
        Ok(()) => {
            info!("caches refreshed on request");
            json_reply(&json!({"status": "ok"}), StatusCode::OK)
        }
        Err(e) => error_reply(&e),
    })
}

async fn create_train(body: NewTrain, state: Arc<AppState>) -> Result<Response, Infallible> {
    Ok(stored(state.trains.create(&body).await, StatusCode::CREATED))
}

async fn update_train(id: Uuid, patch: TrainPatch, state: Arc<AppState>) -> Result<Response, Infallible> {
    Ok(stored(state.trains.update(&id, &patch).await, StatusCode::OK))
}

async fn delete_train(id: Uuid, state: Arc<AppState>) -> Result<Response, Infallible> {
    Ok(deleted(state.trains.delete(&id).await))
}

async fn create_alert(body: NewAlert, state: Arc<AppState>) -> Result<Response, Infallible> {
    Ok(stored(state.admin_alerts.create(&body).await, StatusCode::CREATED))
}

async fn update_alert(id: Uuid, patch: AlertPatch, state: Arc<AppState>) -> Result<Response, Infallible> {
    Ok(stored(state.admin_alerts.update(&id, &patch).await, StatusCode::OK))
}

async fn delete_alert(id: Uuid, state: Arc<AppState>) -> Result<Response, Infallible> {
    Ok(deleted(state.admin_alerts.delete(&id).await))
}

async fn toggle_alert(id: Uuid, state: Arc<AppState>) -> Result<Response, Infallible> {
    let Some(current) = state.admin_alerts.get(&id) else {
        return Ok(error_reply(&StoreError::Query(format!("alerts {} not found", id))));
    };
    let patch = AlertPatch {
        is_active: Some(!current.is_active),
        ..Default::default()
    };
    Ok(stored(state.admin_alerts.update(&id, &patch).await, StatusCode::OK))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::models::Alert;
    use crate::store::MemoryStore;
    use gtfs_realtime::FeedMessage;
    use prost::Message;
    use serde_json::Value;
    use std::time::Duration;

    fn seeded_store() -> (Arc<MemoryStore>, Uuid) {
        let store = Arc::new(MemoryStore::new());
        let station = Uuid::new_v4();
        let alert = Uuid::new_v4();
        store.seed("stations", vec![json!({"id": station, "name": "Union Station"})]);
        store.seed(
            "trains",
            vec![
                json!({"id": Uuid::new_v4(), "train_identifier": "101", "status": "on-time",
                       "eta": "2026-03-02T09:30:00Z", "current_station_id": station,
                       "live_latitude": 38.897, "live_longitude": -77.006,
                       "created_at": "2026-03-02T07:00:00Z"}),
                json!({"id": Uuid::new_v4(), "train_identifier": "102", "status": "delayed",
                       "eta": "2026-03-02T08:15:00Z", "is_delayed": true,
                       "created_at": "2026-03-02T07:05:00Z"}),
                json!({"id": Uuid::new_v4(), "train_identifier": "103", "status": "cancelled",
                       "created_at": "2026-03-02T07:10:00Z"}),
            ],
        );
        store.seed(
            "alerts",
            vec![json!({"id": alert, "message": "Single tracking near Union Station",
                        "alert_level": "warning", "is_active": true,
                        "created_at": "2026-03-02T06:00:00Z"})],
        );
        (store, alert)
    }

    async fn running(store: Arc<MemoryStore>) -> (Arc<AppState>, BoxedFilter<(Response,)>) {
        let state = Arc::new(AppState::new(Config::from_lookup(|_| None), store));
        state.stations.refresh().await.unwrap();
        state.sync_all().await.unwrap();
        let api = routes(state.clone());
        (state, api)
    }

    fn body(resp: &warp::http::Response<warp::hyper::body::Bytes>) -> Value {
        serde_json::from_slice(resp.body()).unwrap()
    }

    async fn settle<F: Fn() -> bool>(done: F) {
        for _ in 0..100 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_health() {
        let (_, api) = running(Arc::new(MemoryStore::new())).await;
        let resp = warp::test::request().path("/health").reply(&api).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body(&resp), json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn test_train_views() {
        let (store, _) = seeded_store();
        let (state, api) = running(store).await;

        let resp = warp::test::request().path("/trains").reply(&api).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let v = body(&resp);
        assert_eq!(v["live"], json!(true));
        assert!(v["updated_at"].is_string());
        assert_eq!(v["data"].as_array().unwrap().len(), 3);
        // Newest first.
        assert_eq!(v["data"][0]["train_identifier"], "103");

        let resp = warp::test::request().path("/trains/active").reply(&api).await;
        let v = body(&resp);
        let ids: Vec<&str> = v["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["train_identifier"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["102", "101"]);
        assert_eq!(v["data"][1]["current_station"]["name"], "Union Station");

        state.teardown_all().await;
    }

    #[tokio::test]
    async fn test_failed_cache_reports_unavailable() {
        let store = Arc::new(MemoryStore::new());
        store.set_offline(true);
        let state = Arc::new(AppState::new(Config::from_lookup(|_| None), store.clone()));
        assert!(state.initialize_all().await.is_err());
        let api = routes(state.clone());

        let resp = warp::test::request().path("/alerts").reply(&api).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            body(&resp)["error"],
            StoreError::Connectivity(String::new()).user_message()
        );

        store.set_offline(false);
        let resp = warp::test::request().method("POST").path("/refresh").reply(&api).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let resp = warp::test::request().path("/alerts").reply(&api).await;
        assert_eq!(resp.status(), StatusCode::OK);
        state.teardown_all().await;
    }

    #[tokio::test]
    async fn test_admin_alert_lifecycle() {
        let (store, seeded) = seeded_store();
        let (state, api) = running(store).await;

        let resp = warp::test::request()
            .method("POST")
            .path("/admin/alerts")
            .json(&json!({"message": "Trains held at Gallery Place", "alert_level": "critical"}))
            .reply(&api)
            .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let created: Alert = serde_json::from_slice(resp.body()).unwrap();
        assert!(created.is_active);

        settle(|| state.alerts.len() == 2).await;
        let resp = warp::test::request().path("/alerts").reply(&api).await;
        assert_eq!(body(&resp)["data"].as_array().unwrap().len(), 2);

        let resp = warp::test::request()
            .method("POST")
            .path(&format!("/admin/alerts/{}/toggle", seeded))
            .reply(&api)
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body(&resp)["is_active"], json!(false));

        // Deactivated alerts leave the dashboard but stay in the admin list.
        settle(|| state.alerts.len() == 1).await;
        assert!(state.alerts.get(&seeded).is_none());
        let resp = warp::test::request().path("/admin/alerts").reply(&api).await;
        assert_eq!(body(&resp)["data"].as_array().unwrap().len(), 2);

        let resp = warp::test::request()
            .method("DELETE")
            .path(&format!("/admin/alerts/{}", created.id))
            .reply(&api)
            .await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        settle(|| state.admin_alerts.len() == 1).await;
        assert_eq!(state.admin_alerts.len(), 1);

        state.teardown_all().await;
    }

    #[tokio::test]
    async fn test_admin_errors_map_to_status() {
        let (store, _) = seeded_store();
        let (state, api) = running(store.clone()).await;

        let resp = warp::test::request()
            .method("PATCH")
            .path(&format!("/admin/trains/{}", Uuid::new_v4()))
            .json(&json!({"status": "delayed"}))
            .reply(&api)
            .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = warp::test::request()
            .method("POST")
            .path(&format!("/admin/alerts/{}/toggle", Uuid::new_v4()))
            .reply(&api)
            .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        store.set_offline(true);
        let resp = warp::test::request()
            .method("POST")
            .path("/admin/trains")
            .json(&json!({"train_identifier": "900"}))
            .reply(&api)
            .await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(body(&resp)["error"].as_str().unwrap().starts_with("Cannot connect"));

        state.teardown_all().await;
    }

    #[tokio::test]
    async fn test_admin_train_update_reaches_cache() {
        let (store, _) = seeded_store();
        let (state, api) = running(store).await;
        let target = state
            .trains
            .snapshot()
            .into_iter()
            .find(|t| t.train_identifier == "101")
            .unwrap();

        let resp = warp::test::request()
            .method("PATCH")
            .path(&format!("/admin/trains/{}", target.id))
            .json(&json!({"status": "delayed", "is_delayed": true}))
            .reply(&api)
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body(&resp)["status"], "delayed");

        settle(|| state.trains.get(&target.id).is_some_and(|t| t.is_delayed)).await;
        let cached = state.trains.get(&target.id).unwrap();
        assert!(cached.is_delayed);
        assert_eq!(
            cached.current_station.and_then(|s| s.name).as_deref(),
            Some("Union Station")
        );
        state.teardown_all().await;
    }

    #[tokio::test]
    async fn test_metrics_and_gtfs_rt() {
        let (store, _) = seeded_store();
        let (state, api) = running(store).await;

        let resp = warp::test::request().path("/metrics").reply(&api).await;
        let v = body(&resp);
        assert_eq!(v["data"]["total_trains"], 3);
        assert_eq!(v["data"]["active_trains"], 2);
        assert_eq!(v["data"]["on_time_performance"], 50);

        let resp = warp::test::request().path("/gtfs-rt").reply(&api).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["content-type"], "application/x-protobuf");
        let feed = FeedMessage::decode(resp.body().as_ref()).unwrap();
        // One positioned train plus one alert.
        assert_eq!(feed.entity.len(), 2);

        let resp = warp::test::request().path("/stations").reply(&api).await;
        assert_eq!(body(&resp)["data"][0]["name"], "Union Station");

        state.teardown_all().await;
    }
}
