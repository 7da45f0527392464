//! transit-live: live train and alert caches behind a small HTTP API.
//!
//! Startup order:
//! 1. Configuration from the environment.
//! 2. Tracing.
//! 3. Remote store (PostgREST + STOMP feed, or the in-memory demo store).
//! 4. Station directory, then the change feeds, then the cache loads.
//! 5. HTTP server until Ctrl-C, then cache teardown.

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

mod cache;
mod config;
mod error;
mod gtfs_rt;
mod metrics;
mod models;
mod routes;
mod state;
mod stations;
mod store;

use config::{Config, StoreKind};
use state::AppState;
use store::stomp::StompFeed;
use store::{MemoryStore, RemoteStore, RestStore};

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    init_tracing(&cfg);
    info!(version = env!("CARGO_PKG_VERSION"), store = ?cfg.store, "transit-live starting");

    let store = open_store(&cfg)?;
    let state = Arc::new(AppState::new(cfg.clone(), store));

    if let Err(e) = state.stations.refresh().await {
        warn!(error = %e, "initial station load failed, the updater will retry");
    }
    state.stations.start_updater(cfg.station_refresh);

    if let Err(e) = state.sync_all().await {
        warn!(
            error = %e,
            retry_secs = cfg.retry_interval.as_secs(),
            "initial cache load failed, serving errors until the store is back"
        );
    }
    state.start_supervisor();

    let api = routes::routes(state.clone());
    let (addr, server) = warp::serve(api)
        .try_bind_with_graceful_shutdown(([0, 0, 0, 0], cfg.port), async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "cannot listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            info!("shutdown requested");
        })
        .with_context(|| format!("cannot bind port {}", cfg.port))?;
    info!(%addr, "server listening");

    server.await;
    state.teardown_all().await;
    Ok(())
}

fn init_tracing(cfg: &Config) {
    let env_filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match cfg.log_level.parse::<tracing_subscriber::EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "WARN: TRANSIT_LOG='{}' is not a valid tracing filter ({}); falling back to 'info'",
                    cfg.log_level, e
                );
                tracing_subscriber::EnvFilter::new("info")
            }
        },
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true);

    if cfg.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

fn open_store(cfg: &Config) -> Result<Arc<dyn RemoteStore>> {
    match cfg.store {
        StoreKind::Rest => {
            let url = cfg
                .store_url
                .as_deref()
                .context("TRANSIT_STORE_URL is required for the rest store")?;
            let feed = cfg.feed.clone().map(StompFeed::new);
            if feed.is_none() {
                warn!("TRANSIT_FEED_HOST not set, caches will not receive live updates");
            }
            info!(url, "using rest store");
            Ok(Arc::new(RestStore::new(url, &cfg.store_key, feed)?))
        }
        StoreKind::Memory => {
            info!("using in-memory demo store");
            Ok(Arc::new(demo_store()))
        }
    }
}

/// A small network to click around in without a database.
fn demo_store() -> MemoryStore {
    let store = MemoryStore::new();
    let now = Utc::now();
    let stations = [
        (Uuid::new_v4(), "Union Station", "UNS", 38.8973, -77.0063),
        (Uuid::new_v4(), "Metro Center", "MTC", 38.8983, -77.0281),
        (Uuid::new_v4(), "Gallery Place", "GLP", 38.8983, -77.0219),
        (Uuid::new_v4(), "Judiciary Square", "JSQ", 38.8960, -77.0166),
    ];
    store.seed(
        "stations",
        stations.iter().map(|(id, name, code, lat, lon)| {
            json!({"id": id, "name": name, "code": code, "latitude": lat, "longitude": lon,
                   "created_at": now})
        }),
    );

    let (union, metro, gallery, judiciary) = (stations[0].0, stations[1].0, stations[2].0, stations[3].0);
    store.seed(
        "trains",
        vec![
            json!({"id": Uuid::new_v4(), "train_identifier": "RD-101", "direction": "eastbound",
                   "start_station_id": metro, "destination_station_id": union,
                   "current_station_id": gallery, "start_time": now - ChronoDuration::minutes(12),
                   "eta": now + ChronoDuration::minutes(6), "status": "on-time", "is_delayed": false,
                   "live_latitude": 38.8983, "live_longitude": -77.0219,
                   "created_at": now - ChronoDuration::minutes(12)}),
            json!({"id": Uuid::new_v4(), "train_identifier": "RD-204", "direction": "westbound",
                   "start_station_id": union, "destination_station_id": metro,
                   "current_station_id": judiciary, "start_time": now - ChronoDuration::minutes(8),
                   "eta": now + ChronoDuration::minutes(9), "status": "delayed", "is_delayed": true,
                   "live_latitude": 38.8960, "live_longitude": -77.0166,
                   "created_at": now - ChronoDuration::minutes(8)}),
            json!({"id": Uuid::new_v4(), "train_identifier": "RD-310", "direction": "eastbound",
                   "start_station_id": metro, "destination_station_id": union,
                   "start_time": now + ChronoDuration::minutes(20),
                   "eta": now + ChronoDuration::minutes(35), "status": "cancelled",
                   "is_delayed": false, "created_at": now - ChronoDuration::minutes(2)}),
        ],
    );

    store.seed(
        "alerts",
        vec![
            json!({"id": Uuid::new_v4(), "message": "Single tracking between Gallery Place and Union Station",
                   "alert_level": "warning", "is_active": true,
                   "created_at": now - ChronoDuration::minutes(30)}),
            json!({"id": Uuid::new_v4(), "message": "Elevator out of service at Judiciary Square",
                   "alert_level": "info", "is_active": true,
                   "created_at": now - ChronoDuration::hours(3)}),
        ],
    );
    store
}
