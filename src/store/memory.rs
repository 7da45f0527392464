//! In-process store: JSON rows per table plus a change fan-out.
//!
//! Backs the demo mode and the tests. Mutations publish a `RowChange` to
//! every open subscription on the table, in commit order. Writes are
//! serialized so that order holds across concurrent callers.

use super::{ChangeFeed, EventFilter, Query, RemoteStore, RowChange};
use crate::error::StoreError;
use async_trait::async_trait;
use chrono::Utc;
use compact_str::CompactString;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

struct Subscriber {
    table: CompactString,
    filter: EventFilter,
    tx: mpsc::Sender<RowChange>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<CompactString, Vec<Value>>>,
    subscribers: Mutex<Vec<Subscriber>>,
    /// Held from commit until the change is queued to every subscriber.
    commits: tokio::sync::Mutex<()>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load rows without publishing change events.
    pub fn seed(&self, table: &str, rows: impl IntoIterator<Item = Value>) {
        let mut tables = self.tables();
        tables.entry(table.into()).or_default().extend(rows);
    }

    /// While offline every call fails with a connectivity error.
    #[cfg(test)]
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub fn subscriber_count(&self, table: &str) -> usize {
        let mut subs = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subs.retain(|s| !s.tx.is_closed());
        subs.iter().filter(|s| s.table == table).count()
    }

    fn tables(&self) -> MutexGuard<'_, HashMap<CompactString, Vec<Value>>> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Connectivity("memory store is offline".into()));
        }
        Ok(())
    }

    async fn publish(&self, change: RowChange) {
        let targets: Vec<mpsc::Sender<RowChange>> = {
            let mut subs = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
            subs.retain(|s| !s.tx.is_closed());
            subs.iter()
                .filter(|s| s.table == change.table && s.filter.admits(change.kind))
                .map(|s| s.tx.clone())
                .collect()
        };
        for tx in targets {
            // A subscriber that went away between collection and send is fine.
            let _ = tx.send(change.clone()).await;
        }
    }
}

fn id_matches(row: &Value, id: &str) -> bool {
    match row.get("id") {
        Some(Value::String(s)) => s == id,
        Some(v @ Value::Number(_)) => v.to_string() == id,
        _ => false,
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn select(&self, query: &Query) -> Result<Vec<Value>, StoreError> {
        self.check_online()?;
        let tables = self.tables();
        let mut rows: Vec<Value> = tables
            .get(query.table.as_str())
            .map(|rows| rows.iter().filter(|r| query.matches(r)).cloned().collect())
            .unwrap_or_default();
        rows.sort_by(|a, b| query.compare(a, b));
        Ok(rows)
    }

    async fn insert(&self, table: &str, record: Value) -> Result<Value, StoreError> {
        self.check_online()?;
        let Value::Object(mut fields) = record else {
            return Err(StoreError::Query("insert expects a JSON object".into()));
        };
        fields
            .entry("id")
            .or_insert_with(|| Value::String(Uuid::new_v4().to_string()));
        fields
            .entry("created_at")
            .or_insert_with(|| Value::String(Utc::now().to_rfc3339()));
        let row = Value::Object(fields);
        let id = match &row["id"] {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };

        let _commit = self.commits.lock().await;
        {
            let mut tables = self.tables();
            let rows = tables.entry(table.into()).or_default();
            if rows.iter().any(|r| id_matches(r, &id)) {
                return Err(StoreError::Query(format!(
                    "duplicate key value violates unique constraint on {}",
                    table
                )));
            }
            rows.push(row.clone());
        }
        debug!(table, "memory insert");
        self.publish(RowChange::insert(table, row.clone())).await;
        Ok(row)
    }

    async fn update(&self, table: &str, id: &str, patch: Value) -> Result<Value, StoreError> {
        self.check_online()?;
        let Value::Object(patch) = patch else {
            return Err(StoreError::Query("update expects a JSON object".into()));
        };

        let _commit = self.commits.lock().await;
        let (old, new) = {
            let mut tables = self.tables();
            let row = tables
                .get_mut(table)
                .and_then(|rows| rows.iter_mut().find(|r| id_matches(r, id)))
                .ok_or_else(|| StoreError::Query(format!("{} {} not found", table, id)))?;
            let old = row.clone();
            if let Value::Object(fields) = row {
                for (k, v) in patch {
                    fields.insert(k, v);
                }
                fields.insert("updated_at".into(), Value::String(Utc::now().to_rfc3339()));
            }
            (old, row.clone())
        };
        debug!(table, id, "memory update");
        self.publish(RowChange::update(table, old, new.clone())).await;
        Ok(new)
    }

    async fn delete(&self, table: &str, id: &str) -> Result<(), StoreError> {
        self.check_online()?;
        let _commit = self.commits.lock().await;
        let removed = {
            let mut tables = self.tables();
            tables.get_mut(table).and_then(|rows| {
                let idx = rows.iter().position(|r| id_matches(r, id))?;
                Some(rows.remove(idx))
            })
        };
        if let Some(old) = removed {
            debug!(table, id, "memory delete");
            self.publish(RowChange::delete(table, old)).await;
        }
        Ok(())
    }

    async fn subscribe(&self, table: &str, filter: EventFilter) -> Result<ChangeFeed, StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Subscription("memory store is offline".into()));
        }
        let (tx, feed) = ChangeFeed::channel(table);
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscriber {
                table: table.into(),
                filter,
                tx,
            });
        Ok(feed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ChangeKind;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_mutations_reach_subscribers_in_order() {
        let store = MemoryStore::new();
        let mut feed = store.subscribe("alerts", EventFilter::all()).await.unwrap();

        let row = store
            .insert("alerts", json!({"message": "Signal failure", "alert_level": "critical"}))
            .await
            .unwrap();
        let id = row["id"].as_str().unwrap().to_string();
        assert!(row.get("created_at").is_some());

        store
            .update("alerts", &id, json!({"is_active": false}))
            .await
            .unwrap();
        store.delete("alerts", &id).await.unwrap();

        let kinds: Vec<ChangeKind> = vec![
            feed.recv().await.unwrap().kind,
            feed.recv().await.unwrap().kind,
            feed.recv().await.unwrap().kind,
        ];
        assert_eq!(kinds, vec![ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete]);
    }

    #[tokio::test]
    async fn test_subscription_is_per_table() {
        let store = MemoryStore::new();
        let mut trains = store.subscribe("trains", EventFilter::all()).await.unwrap();
        store.insert("alerts", json!({"message": "x"})).await.unwrap();
        store.insert("trains", json!({"train_identifier": "T1"})).await.unwrap();

        let change = trains.recv().await.unwrap();
        assert_eq!(change.table, "trains");
        assert_eq!(change.new.unwrap()["train_identifier"], "T1");
    }

    #[tokio::test]
    async fn test_dropped_feed_is_released() {
        let store = MemoryStore::new();
        let feed = store.subscribe("trains", EventFilter::all()).await.unwrap();
        assert_eq!(store.subscriber_count("trains"), 1);
        drop(feed);
        assert_eq!(store.subscriber_count("trains"), 0);
    }

    #[tokio::test]
    async fn test_offline_reports_connectivity() {
        let store = MemoryStore::new();
        store.set_offline(true);
        let err = store.select(&Query::table("trains")).await.unwrap_err();
        assert!(err.is_connectivity());
        let err = store.subscribe("trains", EventFilter::all()).await.unwrap_err();
        assert!(matches!(err, StoreError::Subscription(_)));
    }

    #[tokio::test]
    async fn test_numeric_ids_are_unique() {
        let store = MemoryStore::new();
        store.insert("items", json!({"id": 7, "message": "first"})).await.unwrap();
        let err = store
            .insert("items", json!({"id": 7, "message": "second"}))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Query(m) if m.contains("duplicate key")));
        // Same key spelled as a string collides too.
        assert!(store.insert("items", json!({"id": "7"})).await.is_err());
        assert_eq!(store.select(&Query::table("items")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_writes_publish_in_commit_order() {
        let store = Arc::new(MemoryStore::new());
        let mut feed = store.subscribe("trains", EventFilter::all()).await.unwrap();

        let writers: Vec<_> = (0..32)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .insert("trains", json!({"train_identifier": format!("T{}", i)}))
                        .await
                        .unwrap();
                })
            })
            .collect();
        for w in writers {
            w.await.unwrap();
        }

        let committed: Vec<Value> = store
            .select(&Query::table("trains"))
            .await
            .unwrap()
            .into_iter()
            .map(|r| r["id"].clone())
            .collect();
        let mut published = Vec::new();
        for _ in 0..committed.len() {
            published.push(feed.recv().await.unwrap().new.unwrap()["id"].clone());
        }
        assert_eq!(published, committed);
    }

    #[tokio::test]
    async fn test_update_missing_row() {
        let store = MemoryStore::new();
        let err = store
            .update("trains", "nope", json!({"status": "delayed"}))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Query(m) if m.contains("not found")));
    }
}
