//! Server configuration, loaded from environment variables at startup.

use crate::store::stomp::StompConfig;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    /// PostgREST over HTTP plus the STOMP change feed.
    Rest,
    /// In-process tables seeded with demo data.
    Memory,
}

/// Runtime configuration.
///
/// Everything except the store credentials has a default; with no store URL
/// the server falls back to the in-memory store.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub store: StoreKind,
    pub store_url: Option<String>,
    pub store_key: String,
    /// Change feed broker. `None` when `TRANSIT_FEED_HOST` is unset.
    pub feed: Option<StompConfig>,
    /// `tracing` filter string, e.g. `"info"` or `"transit_live=debug"`.
    pub log_level: String,
    pub log_json: bool,
    pub retry_interval: Duration,
    pub station_refresh: Duration,
    pub pending_limit: usize,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(get: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let env_or = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_owned());
        let flag = |key: &str| {
            get(key)
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false)
        };

        let store_url = get("TRANSIT_STORE_URL").filter(|s| !s.is_empty());
        let store = match get("TRANSIT_STORE").as_deref() {
            Some("memory") => StoreKind::Memory,
            Some("rest") => StoreKind::Rest,
            _ if store_url.is_some() => StoreKind::Rest,
            _ => StoreKind::Memory,
        };

        let feed = get("TRANSIT_FEED_HOST")
            .filter(|h| !h.is_empty())
            .map(|host| StompConfig {
                host,
                port: parse_or(get("TRANSIT_FEED_PORT"), 61613),
                user: env_or("TRANSIT_FEED_USER", ""),
                pass: env_or("TRANSIT_FEED_PASS", ""),
                prefix: env_or("TRANSIT_FEED_PREFIX", "realtime.public"),
            });

        Self {
            port: parse_or(get("PORT"), 3000),
            store,
            store_url,
            store_key: env_or("TRANSIT_STORE_KEY", ""),
            feed,
            log_level: env_or("TRANSIT_LOG", "info"),
            log_json: flag("TRANSIT_LOG_JSON"),
            retry_interval: Duration::from_secs(parse_or(get("TRANSIT_RETRY_SECS"), 30)),
            station_refresh: Duration::from_secs(parse_or(get("TRANSIT_STATION_REFRESH_SECS"), 3600)),
            pending_limit: parse_or(get("TRANSIT_PENDING_LIMIT"), crate::cache::DEFAULT_PENDING_LIMIT),
        }
    }
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn test_defaults() {
        let cfg = config(&[]);
        assert_eq!(cfg.port, 3000);
        assert_eq!(cfg.store, StoreKind::Memory);
        assert!(cfg.feed.is_none());
        assert_eq!(cfg.log_level, "info");
        assert!(!cfg.log_json);
        assert_eq!(cfg.retry_interval, Duration::from_secs(30));
        assert_eq!(cfg.pending_limit, 10_000);
    }

    #[test]
    fn test_store_url_selects_rest() {
        let cfg = config(&[
            ("TRANSIT_STORE_URL", "https://db.example.org"),
            ("TRANSIT_FEED_HOST", "broker.example.org"),
            ("TRANSIT_LOG_JSON", "true"),
            ("PORT", "8080"),
        ]);
        assert_eq!(cfg.store, StoreKind::Rest);
        assert_eq!(cfg.port, 8080);
        assert!(cfg.log_json);
        let feed = cfg.feed.unwrap();
        assert_eq!(feed.port, 61613);
        assert_eq!(feed.destination("trains"), "/topic/realtime.public.trains");
    }

    #[test]
    fn test_explicit_memory_and_bad_numbers() {
        let cfg = config(&[
            ("TRANSIT_STORE", "memory"),
            ("TRANSIT_STORE_URL", "https://db.example.org"),
            ("PORT", "not-a-port"),
        ]);
        assert_eq!(cfg.store, StoreKind::Memory);
        assert_eq!(cfg.port, 3000);
    }
}
