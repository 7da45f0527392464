//! The remote store seam.
//!
//! Every table read, mutation and change feed goes through [`RemoteStore`].
//! The caches never see which backend they are talking to.

pub mod memory;
pub mod rest;
pub mod stomp;

use crate::error::StoreError;
use async_trait::async_trait;
use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use tokio::sync::mpsc;

pub use memory::MemoryStore;
pub use rest::RestStore;

/// Events buffered between a feed producer and the cache pump.
pub const FEED_CAPACITY: usize = 256;

#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn select(&self, query: &Query) -> Result<Vec<Value>, StoreError>;

    async fn insert(&self, table: &str, record: Value) -> Result<Value, StoreError>;

    async fn update(&self, table: &str, id: &str, patch: Value) -> Result<Value, StoreError>;

    async fn delete(&self, table: &str, id: &str) -> Result<(), StoreError>;

    /// Open a push subscription for one table. Dropping the returned feed
    /// releases it.
    async fn subscribe(&self, table: &str, filter: EventFilter) -> Result<ChangeFeed, StoreError>;
}

#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    Eq(CompactString, Value),
    Neq(CompactString, Value),
    In(CompactString, Vec<Value>),
}

impl Filter {
    pub fn column(&self) -> &str {
        match self {
            Filter::Eq(c, _) | Filter::Neq(c, _) | Filter::In(c, _) => c,
        }
    }

    pub fn matches(&self, row: &Value) -> bool {
        let cell = row.get(self.column()).unwrap_or(&Value::Null);
        match self {
            Filter::Eq(_, v) => cell == v,
            Filter::Neq(_, v) => cell != v,
            Filter::In(_, vs) => vs.iter().any(|v| v == cell),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Order {
    pub column: CompactString,
    pub ascending: bool,
}

/// A one-shot table read: which table, which columns, which rows, what order.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    pub table: CompactString,
    pub columns: Option<String>,
    pub filters: Vec<Filter>,
    pub order: Vec<Order>,
}

impl Query {
    pub fn table(name: &str) -> Self {
        Self {
            table: CompactString::from(name),
            columns: None,
            filters: Vec::new(),
            order: Vec::new(),
        }
    }

    pub fn select(mut self, columns: &str) -> Self {
        self.columns = Some(columns.to_string());
        self
    }

    pub fn eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Eq(column.into(), value.into()));
        self
    }

    pub fn neq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Neq(column.into(), value.into()));
        self
    }

    pub fn within<V: Into<Value>>(mut self, column: &str, values: impl IntoIterator<Item = V>) -> Self {
        let values = values.into_iter().map(Into::into).collect();
        self.filters.push(Filter::In(column.into(), values));
        self
    }

    pub fn order_by(mut self, column: &str, ascending: bool) -> Self {
        self.order.push(Order {
            column: column.into(),
            ascending,
        });
        self
    }

    pub fn matches(&self, row: &Value) -> bool {
        self.filters.iter().all(|f| f.matches(row))
    }

    /// Compare two rows by this query's order clauses, nulls last.
    pub fn compare(&self, a: &Value, b: &Value) -> Ordering {
        for o in &self.order {
            let ord = compare_cells(a.get(o.column.as_str()), b.get(o.column.as_str()));
            let ord = if o.ascending { ord } else { ord.reverse() };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

fn compare_cells(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One notification from a table's change feed.
#[derive(Clone, Debug, PartialEq)]
pub struct RowChange {
    pub kind: ChangeKind,
    pub table: CompactString,
    pub new: Option<Value>,
    pub old: Option<Value>,
}

impl RowChange {
    pub fn insert(table: &str, new: Value) -> Self {
        Self {
            kind: ChangeKind::Insert,
            table: table.into(),
            new: Some(new),
            old: None,
        }
    }

    pub fn update(table: &str, old: Value, new: Value) -> Self {
        Self {
            kind: ChangeKind::Update,
            table: table.into(),
            new: Some(new),
            old: Some(old),
        }
    }

    pub fn delete(table: &str, old: Value) -> Self {
        Self {
            kind: ChangeKind::Delete,
            table: table.into(),
            new: None,
            old: Some(old),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventFilter {
    pub kinds: Vec<ChangeKind>,
}

impl EventFilter {
    /// Insert, update and delete, every row.
    pub fn all() -> Self {
        Self {
            kinds: vec![ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete],
        }
    }

    pub fn admits(&self, kind: ChangeKind) -> bool {
        self.kinds.contains(&kind)
    }
}

impl Default for EventFilter {
    fn default() -> Self {
        Self::all()
    }
}

/// Receiving end of a table subscription.
#[derive(Debug)]
pub struct ChangeFeed {
    pub table: CompactString,
    events: mpsc::Receiver<RowChange>,
}

impl ChangeFeed {
    pub fn channel(table: &str) -> (mpsc::Sender<RowChange>, ChangeFeed) {
        let (tx, rx) = mpsc::channel(FEED_CAPACITY);
        (
            tx,
            ChangeFeed {
                table: table.into(),
                events: rx,
            },
        )
    }

    pub async fn recv(&mut self) -> Option<RowChange> {
        self.events.recv().await
    }
}
