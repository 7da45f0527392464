use crate::cache::{CacheStatus, Entity, LiveCache};
use crate::config::Config;
use crate::error::StoreError;
use crate::models::{Alert, Train};
use crate::stations::StationDirectory;
use crate::store::{EventFilter, Query, RemoteStore};
use std::sync::Arc;
use tracing::{info, warn};

const STATION_JOIN: &str = "*,\
start_station:start_station_id(id,name),\
destination_station:destination_station_id(id,name),\
current_station:current_station_id(id,name)";

pub fn all_trains() -> Query {
    Query::table("trains")
        .select(STATION_JOIN)
        .order_by("created_at", false)
}

pub fn critical_alerts() -> Query {
    Query::table("alerts")
        .eq("is_active", true)
        .within("alert_level", ["critical", "warning"])
        .order_by("alert_level", false)
        .order_by("created_at", false)
}

pub fn all_alerts() -> Query {
    Query::table("alerts").order_by("created_at", false)
}

pub struct AppState {
    pub config: Arc<Config>,
    pub stations: StationDirectory,
    /// Every train, station names filled in.
    pub trains: LiveCache<Train>,
    /// Active critical and warning alerts for the dashboard banner.
    pub alerts: LiveCache<Alert>,
    /// Every alert, for the admin console.
    pub admin_alerts: LiveCache<Alert>,
}

impl AppState {
    pub fn new(config: Config, store: Arc<dyn RemoteStore>) -> Self {
        let stations = StationDirectory::new(store.clone());
        let limit = config.pending_limit;

        let trains = LiveCache::new(store.clone())
            .with_enricher(stations.train_enricher())
            .with_pending_limit(limit);
        let alerts = LiveCache::new(store.clone())
            .with_admission(|a: &Alert| a.is_active && a.is_prominent())
            .with_pending_limit(limit);
        let admin_alerts = LiveCache::new(store).with_pending_limit(limit);

        Self {
            config: Arc::new(config),
            stations,
            trains,
            alerts,
            admin_alerts,
        }
    }

    /// Attach the feeds, then load. Events committed while a snapshot is being
    /// read are buffered by the caches and replayed over it.
    pub async fn sync_all(&self) -> Result<(), StoreError> {
        self.attach_all().await;
        self.initialize_all().await
    }

    /// Load every cache. All caches are attempted; the first error is returned.
    pub async fn initialize_all(&self) -> Result<(), StoreError> {
        let results = [
            self.trains.initialize(&all_trains()).await.map(|_| ()),
            self.alerts.initialize(&critical_alerts()).await.map(|_| ()),
            self.admin_alerts.initialize(&all_alerts()).await.map(|_| ()),
        ];
        results.into_iter().collect::<Result<(), StoreError>>()?;
        info!(
            trains = self.trains.len(),
            alerts = self.alerts.len(),
            admin_alerts = self.admin_alerts.len(),
            "caches loaded"
        );
        Ok(())
    }

    /// Attach the change feed of every cache that is not live yet. A cache
    /// whose feed cannot be opened keeps serving its snapshot.
    pub async fn attach_all(&self) {
        attach(&self.trains).await;
        attach(&self.alerts).await;
        attach(&self.admin_alerts).await;
    }

    /// Re-attach dead feeds, then reload caches stuck in `Failed` or whose
    /// pending buffer overflowed.
    pub async fn retry_failed(&self) {
        revive(&self.trains, &all_trains()).await;
        revive(&self.alerts, &critical_alerts()).await;
        revive(&self.admin_alerts, &all_alerts()).await;
        if self.stations.is_empty() {
            if let Err(e) = self.stations.refresh().await {
                warn!(error = %e, "station directory still unavailable");
            }
        }
    }

    pub fn start_supervisor(self: &Arc<Self>) {
        let state = self.clone();
        let every = state.config.retry_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(every).await;
                state.retry_failed().await;
            }
        });
    }

    pub async fn teardown_all(&self) {
        self.trains.teardown().await;
        self.alerts.teardown().await;
        self.admin_alerts.teardown().await;
        info!("caches torn down");
    }
}

async fn attach<E: Entity>(cache: &LiveCache<E>) {
    if cache.is_live() || cache.status() == CacheStatus::Closed {
        return;
    }
    // Failures are logged by the cache.
    let _ = cache.attach_stream(EventFilter::all()).await;
}

async fn revive<E: Entity>(cache: &LiveCache<E>, query: &Query) {
    attach(cache).await;
    let failed = matches!(cache.status(), CacheStatus::Failed(_));
    if (failed || cache.needs_reload()) && cache.initialize(query).await.is_ok() {
        info!(table = cache.table(), "cache recovered");
    }
}
