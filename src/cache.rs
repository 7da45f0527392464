//! Live entity cache.
//!
//! A `LiveCache<E>` mirrors one remote table: one bulk read through
//! [`LiveCache::initialize`], then a change feed applied event by event.
//! Events that arrive while a read is in flight are buffered and replayed
//! over the snapshot once it lands, so attach order does not matter.
//!
//! Ordering across feed reconnects is whatever the store delivers. Events
//! dropped or redelivered by the store during a reconnect are not detected
//! here and the cache can drift until the next `initialize`.

use crate::error::StoreError;
use crate::store::{ChangeKind, EventFilter, Query, RemoteStore, RowChange};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const DEFAULT_PENDING_LIMIT: usize = 10_000;

/// A record the cache can track: it knows its table and its primary key.
pub trait Entity: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    type Key: Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + DeserializeOwned + 'static;

    const TABLE: &'static str;

    fn key(&self) -> Self::Key;

    /// Primary key of a raw row. Delete events may carry nothing but this.
    fn key_of(row: &Value) -> Option<Self::Key> {
        row.get("id")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CacheStatus {
    Idle,
    Loading,
    Ready,
    /// The last initialize failed; holds the user-facing message.
    Failed(String),
    Closed,
}

type Admission<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;
type Enricher<E> = Arc<dyn Fn(E) -> E + Send + Sync>;

struct Attached {
    id: u64,
    pump: Option<JoinHandle<()>>,
}

struct Inner<E: Entity> {
    entries: Vec<E>,
    status: CacheStatus,
    pending: VecDeque<RowChange>,
    pending_limit: usize,
    /// Buffered events were dropped since the current load started.
    overflowed: bool,
    subscription: Option<Attached>,
    next_subscription: u64,
    epoch: u64,
    last_updated: Option<DateTime<Utc>>,
    admission: Option<Admission<E>>,
    enricher: Option<Enricher<E>>,
}

struct Shared<E: Entity> {
    inner: Mutex<Inner<E>>,
}

pub struct LiveCache<E: Entity> {
    store: Arc<dyn RemoteStore>,
    shared: Arc<Shared<E>>,
}

/// Handle to an attached change feed.
///
/// Dropping the handle does not detach; the cache keeps the feed until
/// `close` or `LiveCache::teardown`.
pub struct SubscriptionHandle<E: Entity> {
    id: u64,
    shared: Arc<Shared<E>>,
}

impl<E: Entity> SubscriptionHandle<E> {
    /// Detach the feed. No event is applied once this returns. Safe to call
    /// more than once.
    pub async fn close(&self) {
        let pump = self.shared.detach(Some(self.id));
        finish(pump).await;
    }
}

async fn finish(pump: Option<JoinHandle<()>>) {
    if let Some(pump) = pump {
        pump.abort();
        // Cancellation is the expected outcome here.
        let _ = pump.await;
    }
}

impl<E: Entity> Shared<E> {
    fn lock(&self) -> MutexGuard<'_, Inner<E>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Release the subscription slot. `None` releases whatever is attached.
    fn detach(&self, id: Option<u64>) -> Option<JoinHandle<()>> {
        let mut inner = self.lock();
        let owned = match (&inner.subscription, id) {
            (None, _) => false,
            (Some(a), Some(id)) => a.id == id,
            (Some(_), None) => true,
        };
        if !owned {
            return None;
        }
        let attached = inner.subscription.take()?;
        debug!(table = E::TABLE, subscription = attached.id, "change feed detached");
        attached.pump
    }

    /// Apply an event coming from subscription `id`. Returns false once that
    /// subscription is no longer the attached one.
    fn apply_from(&self, id: u64, change: RowChange) -> bool {
        let mut inner = self.lock();
        if !inner.subscription.as_ref().is_some_and(|a| a.id == id) {
            return false;
        }
        inner.accept(change);
        true
    }
}

impl<E: Entity> Inner<E> {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            status: CacheStatus::Idle,
            pending: VecDeque::new(),
            pending_limit: DEFAULT_PENDING_LIMIT,
            overflowed: false,
            subscription: None,
            next_subscription: 0,
            epoch: 0,
            last_updated: None,
            admission: None,
            enricher: None,
        }
    }

    fn admits(&self, entity: &E) -> bool {
        self.admission.as_ref().is_none_or(|f| f(entity))
    }

    fn enrich(&self, entity: E) -> E {
        match &self.enricher {
            Some(f) => f(entity),
            None => entity,
        }
    }

    fn position(&self, key: &E::Key) -> Option<usize> {
        self.entries.iter().position(|e| &e.key() == key)
    }

    /// Route an event: apply it when a snapshot is in place, buffer it while
    /// there is none, drop it after teardown.
    fn accept(&mut self, change: RowChange) {
        match self.status {
            CacheStatus::Ready => self.reconcile(change),
            CacheStatus::Closed => {}
            CacheStatus::Idle | CacheStatus::Loading | CacheStatus::Failed(_) => {
                if self.pending.len() >= self.pending_limit {
                    self.pending.pop_front();
                    self.overflowed = true;
                    warn!(
                        table = E::TABLE,
                        limit = self.pending_limit,
                        "pending change buffer full, dropping oldest event"
                    );
                }
                self.pending.push_back(change);
            }
        }
    }

    fn decode(&self, row: Value) -> Option<E> {
        match serde_json::from_value::<E>(row) {
            Ok(e) => Some(self.enrich(e)),
            Err(e) => {
                warn!(table = E::TABLE, error = %e, "undecodable row skipped");
                None
            }
        }
    }

    fn reconcile(&mut self, change: RowChange) {
        if change.table != E::TABLE {
            debug!(table = E::TABLE, other = %change.table, "ignoring change for another table");
            return;
        }

        match change.kind {
            ChangeKind::Insert => {
                let Some(entity) = change.new.and_then(|row| self.decode(row)) else {
                    return;
                };
                // Duplicate delivery of an insert is an update.
                let idx = self.position(&entity.key());
                self.upsert(idx, entity);
            }
            ChangeKind::Update => {
                let old_key = change.old.as_ref().and_then(E::key_of);
                let Some(entity) = change.new.and_then(|row| self.decode(row)) else {
                    return;
                };
                let new_key = entity.key();
                let idx = old_key
                    .and_then(|k| self.position(&k))
                    .or_else(|| self.position(&new_key));
                self.upsert(idx, entity);
            }
            ChangeKind::Delete => {
                let key = change
                    .old
                    .as_ref()
                    .and_then(E::key_of)
                    .or_else(|| change.new.as_ref().and_then(E::key_of));
                if let Some(key) = key {
                    self.entries.retain(|e| e.key() != key);
                }
            }
        }
        self.last_updated = Some(Utc::now());
    }

    /// Replace in place when `idx` is known, otherwise prepend. Entities the
    /// admission predicate rejects are removed instead.
    fn upsert(&mut self, idx: Option<usize>, entity: E) {
        let key = entity.key();
        match idx {
            Some(idx) if self.admits(&entity) => {
                self.entries[idx] = entity;
                let mut i = 0;
                self.entries.retain(|e| {
                    let keep = i == idx || e.key() != key;
                    i += 1;
                    keep
                });
            }
            Some(idx) => {
                self.entries.remove(idx);
            }
            None if self.admits(&entity) => self.entries.insert(0, entity),
            None => {}
        }
    }
}

impl<E: Entity> LiveCache<E> {
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        Self {
            store,
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner::new()),
            }),
        }
    }

    /// Only entities passing `f` are kept. An update that stops passing
    /// removes the entity.
    pub fn with_admission<F>(self, f: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.shared.lock().admission = Some(Arc::new(f));
        self
    }

    /// Transform every entity on its way into the cache.
    pub fn with_enricher<F>(self, f: F) -> Self
    where
        F: Fn(E) -> E + Send + Sync + 'static,
    {
        self.shared.lock().enricher = Some(Arc::new(f));
        self
    }

    pub fn with_pending_limit(self, limit: usize) -> Self {
        self.shared.lock().pending_limit = limit.max(1);
        self
    }

    pub fn table(&self) -> &'static str {
        E::TABLE
    }

    /// Bulk-load the table and make the result the cache contents.
    ///
    /// Events buffered since the last snapshot are replayed on top, in the
    /// order they arrived. On failure the cache is left empty and in
    /// `Failed` state; buffered events are kept for the next attempt.
    pub async fn initialize(&self, query: &Query) -> Result<Vec<E>, StoreError> {
        let epoch = {
            let mut inner = self.shared.lock();
            if inner.status == CacheStatus::Closed {
                return Err(StoreError::TornDown(E::TABLE.to_string()));
            }
            inner.epoch += 1;
            inner.status = CacheStatus::Loading;
            // Anything dropped before this read started is in the snapshot.
            inner.overflowed = false;
            inner.epoch
        };

        let result = self.store.select(query).await;

        let mut inner = self.shared.lock();
        if inner.status == CacheStatus::Closed {
            return Err(StoreError::TornDown(E::TABLE.to_string()));
        }
        if inner.epoch != epoch {
            // A later initialize owns the cache now.
            debug!(table = E::TABLE, "superseded initialize result discarded");
            return result.map(|_| inner.entries.clone());
        }

        match result {
            Ok(rows) => {
                let mut seen = HashSet::new();
                let mut entries = Vec::with_capacity(rows.len());
                for row in rows {
                    let Some(entity) = inner.decode(row) else {
                        continue;
                    };
                    if inner.admits(&entity) && seen.insert(entity.key()) {
                        entries.push(entity);
                    }
                }
                inner.entries = entries;
                inner.status = CacheStatus::Ready;

                let replay = std::mem::take(&mut inner.pending);
                let replayed = replay.len();
                for change in replay {
                    inner.reconcile(change);
                }
                inner.last_updated = Some(Utc::now());
                info!(
                    table = E::TABLE,
                    entries = inner.entries.len(),
                    replayed,
                    "cache initialized"
                );
                Ok(inner.entries.clone())
            }
            Err(e) => {
                inner.entries.clear();
                inner.status = CacheStatus::Failed(e.user_message());
                warn!(table = E::TABLE, error = %e, "cache initialize failed");
                Err(e)
            }
        }
    }

    /// Open the table's change feed and start applying its events.
    ///
    /// At most one feed per cache; a second attach while the first is alive
    /// is refused. A failed attach leaves the cache readable but not live.
    pub async fn attach_stream(&self, filter: EventFilter) -> Result<SubscriptionHandle<E>, StoreError> {
        let id = {
            let mut inner = self.shared.lock();
            if inner.status == CacheStatus::Closed {
                return Err(StoreError::TornDown(E::TABLE.to_string()));
            }
            let stale = inner
                .subscription
                .as_ref()
                .is_some_and(|a| a.pump.as_ref().is_some_and(JoinHandle::is_finished));
            if stale {
                inner.subscription = None;
            }
            if inner.subscription.is_some() {
                warn!(table = E::TABLE, "change feed already attached");
                return Err(StoreError::AlreadyAttached(E::TABLE.to_string()));
            }
            inner.next_subscription += 1;
            let id = inner.next_subscription;
            inner.subscription = Some(Attached { id, pump: None });
            id
        };

        let mut feed = match self.store.subscribe(E::TABLE, filter).await {
            Ok(feed) => feed,
            Err(e) => {
                self.shared.detach(Some(id));
                let e = match e {
                    StoreError::Subscription(_) => e,
                    other => StoreError::Subscription(other.to_string()),
                };
                warn!(table = E::TABLE, error = %e, "change feed unavailable, serving last snapshot");
                return Err(e);
            }
        };

        let shared = self.shared.clone();
        let pump = tokio::spawn(async move {
            while let Some(change) = feed.recv().await {
                if !shared.apply_from(id, change) {
                    break;
                }
            }
            debug!(table = E::TABLE, subscription = id, "change feed ended");
        });

        let mut inner = self.shared.lock();
        match inner.subscription.as_mut() {
            Some(a) if a.id == id => a.pump = Some(pump),
            _ => {
                // Torn down while subscribing.
                pump.abort();
                return Err(StoreError::TornDown(E::TABLE.to_string()));
            }
        }
        info!(table = E::TABLE, subscription = id, "change feed attached");

        Ok(SubscriptionHandle {
            id,
            shared: self.shared.clone(),
        })
    }

    /// Apply one change event directly, with the same rules as the feed.
    pub fn apply(&self, change: RowChange) {
        self.shared.lock().accept(change);
    }

    pub fn snapshot(&self) -> Vec<E> {
        self.shared.lock().entries.clone()
    }

    pub fn get(&self, key: &E::Key) -> Option<E> {
        let inner = self.shared.lock();
        inner.position(key).map(|i| inner.entries[i].clone())
    }

    pub fn len(&self) -> usize {
        self.shared.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn status(&self) -> CacheStatus {
        self.shared.lock().status.clone()
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.shared.lock().last_updated
    }

    /// True when events were dropped from the pending buffer after the last
    /// load began, so replay could not bring the snapshot fully up to date.
    pub fn needs_reload(&self) -> bool {
        self.shared.lock().overflowed
    }

    /// True while a change feed is attached and still running.
    pub fn is_live(&self) -> bool {
        self.shared.lock().subscription.as_ref().is_some_and(|a| {
            a.pump.as_ref().is_some_and(|p| !p.is_finished())
        })
    }

    /// Close the feed and drop everything. Later events are ignored and later
    /// initializes fail. Safe to call more than once.
    pub async fn teardown(&self) {
        let pump = {
            let mut inner = self.shared.lock();
            if inner.status != CacheStatus::Closed {
                info!(table = E::TABLE, "cache torn down");
            }
            inner.status = CacheStatus::Closed;
            inner.entries.clear();
            inner.pending.clear();
            inner.subscription.take().and_then(|a| a.pump)
        };
        finish(pump).await;
    }

    // Mutations go straight to the store. The cache changes only when the
    // resulting event comes back through the feed.

    pub async fn create<P: Serialize + Sync>(&self, payload: &P) -> Result<E, StoreError> {
        let record = to_record(payload)?;
        let row = self.store.insert(E::TABLE, record).await?;
        self.decode_result(row)
    }

    pub async fn update<P: Serialize + Sync>(&self, key: &E::Key, patch: &P) -> Result<E, StoreError> {
        let patch = to_record(patch)?;
        let row = self.store.update(E::TABLE, &key.to_string(), patch).await?;
        self.decode_result(row)
    }

    pub async fn delete(&self, key: &E::Key) -> Result<(), StoreError> {
        self.store.delete(E::TABLE, &key.to_string()).await
    }

    fn decode_result(&self, row: Value) -> Result<E, StoreError> {
        let entity = serde_json::from_value::<E>(row).map_err(|e| StoreError::decode(E::TABLE, e))?;
        Ok(self.shared.lock().enrich(entity))
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.shared.lock().pending.len()
    }
}

fn to_record<P: Serialize>(payload: &P) -> Result<Value, StoreError> {
    serde_json::to_value(payload).map_err(|e| StoreError::Query(format!("invalid payload: {}", e)))
}
