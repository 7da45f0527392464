//! PostgREST-dialect table access over HTTP, with the change feed delegated
//! to the STOMP relay.

use super::stomp::StompFeed;
use super::{ChangeFeed, EventFilter, Filter, Query, RemoteStore};
use crate::error::StoreError;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct RestStore {
    client: Client,
    base_url: String,
    api_key: String,
    feed: Option<StompFeed>,
}

impl RestStore {
    pub fn new(base_url: &str, api_key: &str, feed: Option<StompFeed>) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| StoreError::Connectivity(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            feed,
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
        req.header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .header("Accept", "application/json")
    }

    async fn rows(resp: Response) -> Result<Vec<Value>, StoreError> {
        let resp = check(resp).await?;
        let body: Value = resp.json().await?;
        match body {
            Value::Array(rows) => Ok(rows),
            Value::Null => Ok(Vec::new()),
            other => Ok(vec![other]),
        }
    }

    async fn single(resp: Response, table: &str, id: Option<&str>) -> Result<Value, StoreError> {
        Self::rows(resp).await?.into_iter().next().ok_or_else(|| {
            StoreError::Query(format!("{} {} not found", table, id.unwrap_or("row")))
        })
    }
}

async fn check(resp: Response) -> Result<Response, StoreError> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    Err(classify_status(status, &body))
}

/// Map a failed HTTP exchange to the error taxonomy. Gateway errors and the
/// paused-project status mean the database is not there at all.
pub fn classify_status(status: u16, body: &str) -> StoreError {
    if matches!(status, 502 | 503 | 504 | 540) {
        return StoreError::Connectivity(format!("HTTP {}", status));
    }
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| format!("HTTP {}", status));
    if status == 404 || status == 406 {
        return StoreError::Query(format!("not found: {}", message));
    }
    StoreError::Query(message)
}

fn render_value(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn render_list_item(v: &Value) -> String {
    let s = render_value(v);
    if s.contains([',', '(', ')', '"']) {
        format!("\"{}\"", s.replace('"', "\\\""))
    } else {
        s
    }
}

/// Encode a query descriptor as PostgREST query-string pairs.
pub fn query_params(query: &Query) -> Vec<(String, String)> {
    let mut params = vec![(
        "select".to_string(),
        query.columns.clone().unwrap_or_else(|| "*".to_string()),
    )];

    for f in &query.filters {
        let rendered = match f {
            Filter::Eq(_, v) if v.is_null() => "is.null".to_string(),
            Filter::Eq(_, v) => format!("eq.{}", render_value(v)),
            Filter::Neq(_, v) if v.is_null() => "not.is.null".to_string(),
            Filter::Neq(_, v) => format!("neq.{}", render_value(v)),
            Filter::In(_, vs) => format!(
                "in.({})",
                vs.iter().map(render_list_item).collect::<Vec<_>>().join(",")
            ),
        };
        params.push((f.column().to_string(), rendered));
    }

    if !query.order.is_empty() {
        let order = query
            .order
            .iter()
            .map(|o| format!("{}.{}", o.column, if o.ascending { "asc" } else { "desc" }))
            .collect::<Vec<_>>()
            .join(",");
        params.push(("order".to_string(), order));
    }
    params
}

#[async_trait]
impl RemoteStore for RestStore {
    async fn select(&self, query: &Query) -> Result<Vec<Value>, StoreError> {
        debug!(table = %query.table, "select");
        let req = self
            .client
            .get(self.table_url(&query.table))
            .query(&query_params(query));
        let resp = self.authorized(req).send().await?;
        Self::rows(resp).await
    }

    async fn insert(&self, table: &str, record: Value) -> Result<Value, StoreError> {
        let req = self
            .client
            .post(self.table_url(table))
            .header("Prefer", "return=representation")
            .json(&record);
        let resp = self.authorized(req).send().await?;
        Self::single(resp, table, None).await
    }

    async fn update(&self, table: &str, id: &str, patch: Value) -> Result<Value, StoreError> {
        let req = self
            .client
            .patch(self.table_url(table))
            .query(&[("id", format!("eq.{}", id))])
            .header("Prefer", "return=representation")
            .json(&patch);
        let resp = self.authorized(req).send().await?;
        Self::single(resp, table, Some(id)).await
    }

    async fn delete(&self, table: &str, id: &str) -> Result<(), StoreError> {
        let req = self
            .client
            .delete(self.table_url(table))
            .query(&[("id", format!("eq.{}", id))]);
        let resp = self.authorized(req).send().await?;
        check(resp).await?;
        Ok(())
    }

    async fn subscribe(&self, table: &str, filter: EventFilter) -> Result<ChangeFeed, StoreError> {
        match &self.feed {
            Some(feed) => feed.subscribe(table, filter).await,
            None => Err(StoreError::Subscription(
                "no change feed broker configured".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_params_for_critical_alerts() {
        let q = Query::table("alerts")
            .eq("is_active", true)
            .within("alert_level", ["critical", "warning"])
            .order_by("alert_level", false)
            .order_by("created_at", false);

        assert_eq!(
            query_params(&q),
            vec![
                ("select".to_string(), "*".to_string()),
                ("is_active".to_string(), "eq.true".to_string()),
                ("alert_level".to_string(), "in.(critical,warning)".to_string()),
                ("order".to_string(), "alert_level.desc,created_at.desc".to_string()),
            ]
        );
    }

    #[test]
    fn test_query_params_with_join_and_neq() {
        let q = Query::table("trains")
            .select("*,start_station:start_station_id(id,name)")
            .neq("status", "cancelled")
            .order_by("eta", true);
        let params = query_params(&q);
        assert_eq!(params[0].1, "*,start_station:start_station_id(id,name)");
        assert_eq!(params[1], ("status".to_string(), "neq.cancelled".to_string()));
        assert_eq!(params[2], ("order".to_string(), "eta.asc".to_string()));
    }

    #[test]
    fn test_list_items_with_commas_are_quoted() {
        let q = Query::table("stations").within("name", ["Union Station", "Gallery Place, East"]);
        assert_eq!(
            query_params(&q)[1].1,
            "in.(Union Station,\"Gallery Place, East\")"
        );
    }

    #[test]
    fn test_classify_status() {
        assert!(classify_status(503, "").is_connectivity());
        assert!(classify_status(540, "").is_connectivity());
        assert_eq!(
            classify_status(409, r#"{"code":"23505","message":"duplicate key value violates unique constraint"}"#),
            StoreError::Query("duplicate key value violates unique constraint".into())
        );
        assert_eq!(
            classify_status(400, "garbage"),
            StoreError::Query("HTTP 400".into())
        );
        assert!(matches!(classify_status(406, ""), StoreError::Query(m) if m.starts_with("not found")));
    }

    #[tokio::test]
    async fn test_subscribe_without_broker() {
        let store = RestStore::new("http://127.0.0.1:1/", "key", None).unwrap();
        let err = store.subscribe("trains", EventFilter::all()).await.unwrap_err();
        assert!(matches!(err, StoreError::Subscription(_)));
    }

    #[tokio::test]
    async fn test_unreachable_store_is_connectivity_error() {
        let store = RestStore::new("http://127.0.0.1:1", "key", None).unwrap();
        let err = store.select(&Query::table("trains")).await.unwrap_err();
        assert!(err.is_connectivity(), "{:?}", err);
    }
}
