//! # Statistics
//!
//! Namespaced counters and gauges collected throughout a crawl
//! (`scheduler/enqueued`, `downloader/response_status_count/200`,
//! `item_scraped_count`, ...). The map is thread-safe and every mutation is
//! atomic per key, so concurrent pipeline stages can bump counters without
//! coordination.
//!
//! Values are integers, floats or strings; `inc`/`max`/`min` operate on the
//! numeric kinds and keep whichever kind the key already holds.

use std::collections::BTreeMap;
use std::fmt;

use dashmap::DashMap;

#[derive(Debug, Clone, PartialEq)]
pub enum StatValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<i64> for StatValue {
    fn from(v: i64) -> Self {
        StatValue::Int(v)
    }
}

impl From<f64> for StatValue {
    fn from(v: f64) -> Self {
        StatValue::Float(v)
    }
}

impl From<&str> for StatValue {
    fn from(v: &str) -> Self {
        StatValue::Text(v.to_string())
    }
}

impl From<String> for StatValue {
    fn from(v: String) -> Self {
        StatValue::Text(v)
    }
}

impl fmt::Display for StatValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatValue::Int(v) => write!(f, "{v}"),
            StatValue::Float(v) => write!(f, "{v}"),
            StatValue::Text(v) => write!(f, "{v}"),
        }
    }
}

#[derive(Debug, Default)]
pub struct Stats {
    values: DashMap<String, StatValue>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_value(&self, key: &str, value: impl Into<StatValue>) {
        self.values.insert(key.to_string(), value.into());
    }

    pub fn get_value(&self, key: &str) -> Option<StatValue> {
        self.values.get(key).map(|v| v.value().clone())
    }

    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        match self.get_value(key) {
            Some(StatValue::Int(v)) => v,
            Some(StatValue::Float(v)) => v as i64,
            _ => default,
        }
    }

    pub fn get_float(&self, key: &str, default: f64) -> f64 {
        match self.get_value(key) {
            Some(StatValue::Float(v)) => v,
            Some(StatValue::Int(v)) => v as f64,
            _ => default,
        }
    }

    /// Add `count` to `key`, initializing the key to `start` first when it
    /// does not exist yet.
    pub fn inc_value(&self, key: &str, count: i64, start: i64) {
        let mut entry = self
            .values
            .entry(key.to_string())
            .or_insert(StatValue::Int(start));
        match entry.value_mut() {
            StatValue::Int(v) => *v += count,
            StatValue::Float(v) => *v += count as f64,
            StatValue::Text(_) => {}
        }
    }

    /// Keep the larger of the stored value and `value`.
    pub fn max_value(&self, key: &str, value: i64) {
        let mut entry = self
            .values
            .entry(key.to_string())
            .or_insert(StatValue::Int(value));
        match entry.value_mut() {
            StatValue::Int(v) => *v = (*v).max(value),
            StatValue::Float(v) => *v = v.max(value as f64),
            StatValue::Text(_) => {}
        }
    }

    /// Keep the smaller of the stored value and `value`.
    pub fn min_value(&self, key: &str, value: i64) {
        let mut entry = self
            .values
            .entry(key.to_string())
            .or_insert(StatValue::Int(value));
        match entry.value_mut() {
            StatValue::Int(v) => *v = (*v).min(value),
            StatValue::Float(v) => *v = v.min(value as f64),
            StatValue::Text(_) => {}
        }
    }

    pub fn clear(&self) {
        self.values.clear();
    }

    /// Sorted snapshot, used for the end-of-crawl summary line.
    pub fn all(&self) -> BTreeMap<String, StatValue> {
        self.values
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.all();
        writeln!(f, "crawl stats")?;
        for (key, value) in snapshot {
            writeln!(f, "  {key}: {value}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn inc_starts_from_given_base() {
        let stats = Stats::new();
        stats.inc_value("scheduler/enqueued", 1, 0);
        stats.inc_value("scheduler/enqueued", 1, 0);
        assert_eq!(stats.get_int("scheduler/enqueued", 0), 2);
    }

    #[test]
    fn max_and_min_track_extremes() {
        let stats = Stats::new();
        stats.max_value("request_depth_max", 0);
        stats.max_value("request_depth_max", 3);
        stats.max_value("request_depth_max", 1);
        assert_eq!(stats.get_int("request_depth_max", -1), 3);

        stats.min_value("response_min_size", 500);
        stats.min_value("response_min_size", 200);
        stats.min_value("response_min_size", 900);
        assert_eq!(stats.get_int("response_min_size", -1), 200);
    }

    #[test]
    fn mixed_value_kinds() {
        let stats = Stats::new();
        stats.set_value("finish_reason", "finished");
        stats.set_value("elapsed_time_seconds", 1.25);
        assert_eq!(
            stats.get_value("finish_reason"),
            Some(StatValue::Text("finished".into()))
        );
        assert_eq!(stats.get_float("elapsed_time_seconds", 0.0), 1.25);
    }

    #[tokio::test]
    async fn concurrent_increments_do_not_lose_updates() {
        let stats = Arc::new(Stats::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let stats = Arc::clone(&stats);
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    stats.inc_value("downloader/request_count", 1, 0);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(stats.get_int("downloader/request_count", 0), 800);
    }
}
