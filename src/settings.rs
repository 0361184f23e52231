//! # Settings
//!
//! A string-keyed map of JSON values with typed getters-with-default.
//! One `Settings` can be shared by several crawls; every component reads the
//! keys it cares about at construction and never looks back.
//!
//! The defaults below mirror a conventional polite-crawler configuration:
//! 16 concurrent requests globally, one per domain, a one second randomized
//! delay, retries on transient HTTP codes, and a dupe filter switched on.

use std::collections::BTreeMap;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{json, Value};

#[derive(Debug, Default)]
pub struct Settings {
    values: DashMap<String, Value>,
}

impl Settings {
    /// An empty map. Most callers want [`Settings::with_defaults`].
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in default table.
    pub fn with_defaults() -> Self {
        let settings = Settings::new();
        for (key, value) in default_table() {
            settings.values.insert(key.to_string(), value);
        }
        settings
    }

    pub fn set(&self, key: &str, value: impl Into<Value>) {
        self.values.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.get(key).map(|v| v.value().clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn get_i64(&self, key: &str, default: i64) -> i64 {
        match self.get(key) {
            Some(Value::Number(n)) => n.as_i64().unwrap_or_else(|| {
                n.as_f64().map(|f| f as i64).unwrap_or(default)
            }),
            _ => default,
        }
    }

    pub fn get_f64(&self, key: &str, default: f64) -> f64 {
        match self.get(key) {
            Some(Value::Number(n)) => n.as_f64().unwrap_or(default),
            _ => default,
        }
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(Value::Bool(b)) => b,
            _ => default,
        }
    }

    pub fn get_str(&self, key: &str, default: &str) -> String {
        match self.get(key) {
            Some(Value::String(s)) => s,
            _ => default.to_string(),
        }
    }

    pub fn get_str_list(&self, key: &str) -> Vec<String> {
        match self.get(key) {
            Some(Value::Array(items)) => items
                .into_iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn get_int_list(&self, key: &str) -> Vec<i64> {
        match self.get(key) {
            Some(Value::Array(items)) => items.into_iter().filter_map(|v| v.as_i64()).collect(),
            _ => Vec::new(),
        }
    }

    /// Seconds-valued setting (integer or float) as a `Duration`.
    pub fn get_duration_secs(&self, key: &str, default_secs: f64) -> Duration {
        Duration::from_secs_f64(self.get_f64(key, default_secs).max(0.0))
    }

    /// A `{name: order}` object, sorted ascending by order. Used for the
    /// middleware, pipeline and extension tables.
    pub fn get_order_map(&self, key: &str) -> Vec<(String, i64)> {
        let mut merged: BTreeMap<String, i64> = BTreeMap::new();
        if let Some(Value::Object(map)) = self.get(key) {
            for (name, order) in map {
                if let Some(order) = order.as_i64() {
                    merged.insert(name, order);
                }
            }
        }
        let mut entries: Vec<(String, i64)> = merged.into_iter().collect();
        entries.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        entries
    }

    /// Merge of `{key}_BASE` and `{key}`, custom entries overriding base
    /// ones, sorted ascending by order.
    pub fn get_merged_order_map(&self, key: &str) -> Vec<(String, i64)> {
        let mut merged: BTreeMap<String, i64> = BTreeMap::new();
        for source in [format!("{key}_BASE"), key.to_string()] {
            if let Some(Value::Object(map)) = self.get(&source) {
                for (name, order) in map {
                    if let Some(order) = order.as_i64() {
                        merged.insert(name, order);
                    }
                }
            }
        }
        let mut entries: Vec<(String, i64)> = merged.into_iter().collect();
        entries.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        entries
    }
}

fn default_table() -> Vec<(&'static str, Value)> {
    vec![
        ("CONCURRENT_REQUESTS", json!(16)),
        ("CONCURRENT_REQUESTS_PER_DOMAIN", json!(1)),
        ("CONCURRENT_ITEMS", json!(100)),
        ("MAX_REQUEST_QUEUE_SIZE_PER_DOMAIN", json!(16)),
        ("DOWNLOAD_DELAY", json!(1)),
        ("RANDOMIZE_DOWNLOAD_DELAY", json!(true)),
        ("DOWNLOAD_TIMEOUT", json!(180)),
        ("DOWNLOAD_MAXSIZE", json!(1_073_741_824)),
        ("DEPTH_LIMIT", json!(0)),
        ("DEPTH_PRIORITY", json!(0)),
        ("DEPTH_STATS_VERBOSE", json!(true)),
        ("RETRY_ENABLED", json!(true)),
        ("RETRY_TIMES", json!(2)),
        (
            "RETRY_HTTP_CODES",
            json!([500, 502, 503, 504, 522, 524, 408, 429]),
        ),
        ("RETRY_PRIORITY_ADJUST", json!(-1)),
        (
            "RETRY_REASONS",
            json!(["timeout", "connection_refused", "dns"]),
        ),
        ("DUPE_FILTER_ENABLED", json!(true)),
        ("SCHEDULER_QUEUE", json!("lifo")),
        ("URL_LENGTH_LIMIT", json!(2083)),
        ("ALLOWED_DOMAINS", json!([])),
        ("HTTPERROR_ALLOWED_CODES", json!([])),
        ("HTTPERROR_ALLOW_ALL", json!(false)),
        (
            "USER_AGENT",
            json!(
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                 (KHTML, like Gecko) Chrome/97.0.4692.99 Safari/537.36 Edg/97.0.1072.76"
            ),
        ),
        (
            "DEFAULT_REQUEST_HEADERS",
            json!({
                "Accept": "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,\
                           image/apng,*/*;q=0.8,application/signed-exchange;v=b3;q=0.9",
                "Accept-Language": "zh-CN,zh;q=0.9,en;q=0.8,en-GB;q=0.7,en-US;q=0.6",
            }),
        ),
        ("HTTP_USER", json!("")),
        ("HTTP_PASS", json!("")),
        ("LOG_LEVEL", json!("info")),
        ("LOG_FILE", json!("")),
        ("LOG_STATS_INTERVAL", json!(60.0)),
        ("SIGNAL_VERBOSE_STATS", json!(false)),
        ("REQUEST_SLOTS", json!({})),
        ("SPIDER_MIDDLEWARES", json!({})),
        (
            "SPIDER_MIDDLEWARES_BASE",
            json!({
                "http_error": 50,
                "url_length": 800,
                "depth": 850,
                "start": 900,
                "allowed_domains": 950,
            }),
        ),
        ("DOWNLOADER_MIDDLEWARES", json!({})),
        (
            "DOWNLOADER_MIDDLEWARES_BASE",
            json!({
                "http_auth": 300,
                "download_timeout": 350,
                "default_headers": 400,
                "user_agent": 500,
                "retry": 550,
                "downloader_stats": 850,
            }),
        ),
        ("ITEM_PIPELINES", json!({})),
        ("ITEM_PIPELINES_BASE", json!({})),
        ("EXTENSIONS", json!({})),
        (
            "EXTENSIONS_BASE",
            json!({
                "core_stats": 50,
                "log_stats": 500,
            }),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_loaded() {
        let settings = Settings::with_defaults();
        assert_eq!(settings.get_i64("CONCURRENT_REQUESTS", 0), 16);
        assert_eq!(settings.get_i64("CONCURRENT_REQUESTS_PER_DOMAIN", 0), 1);
        assert!(settings.get_bool("RANDOMIZE_DOWNLOAD_DELAY", false));
        assert_eq!(
            settings.get_int_list("RETRY_HTTP_CODES"),
            vec![500, 502, 503, 504, 522, 524, 408, 429]
        );
    }

    #[test]
    fn overrides_win() {
        let settings = Settings::with_defaults();
        settings.set("DOWNLOAD_DELAY", 2.5);
        assert_eq!(
            settings.get_duration_secs("DOWNLOAD_DELAY", 1.0),
            Duration::from_millis(2500)
        );
    }

    #[test]
    fn merged_order_map_sorts_and_overrides() {
        let settings = Settings::with_defaults();
        settings.set("SPIDER_MIDDLEWARES", json!({"depth": 10, "mine": 700}));
        let entries = settings.get_merged_order_map("SPIDER_MIDDLEWARES");
        let names: Vec<&str> = entries.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec!["depth", "http_error", "mine", "url_length", "start", "allowed_domains"]
        );
    }
}
