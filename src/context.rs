//! Shared request/response context.
//!
//! A `Ctx` is a thread-safe string-to-JSON map attached to a request at
//! creation and handed to its response unchanged. Middlewares are the only
//! mutators; the engine passes it along as-is.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

#[derive(Clone, Debug, Default)]
pub struct Ctx {
    map: Arc<DashMap<String, Value>>,
}

impl Ctx {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: &str, value: impl Into<Value>) {
        self.map.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.map.get(key).map(|v| v.value().clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn get_i64_or(&self, key: &str, default: i64) -> i64 {
        match self.map.get(key).map(|v| v.value().clone()) {
            Some(Value::Number(n)) => n.as_i64().unwrap_or_else(|| {
                n.as_f64().map(|f| f as i64).unwrap_or(default)
            }),
            _ => default,
        }
    }

    pub fn get_f64_or(&self, key: &str, default: f64) -> f64 {
        match self.map.get(key).map(|v| v.value().clone()) {
            Some(Value::Number(n)) => n.as_f64().unwrap_or(default),
            _ => default,
        }
    }

    pub fn get_bool_or(&self, key: &str, default: bool) -> bool {
        match self.map.get(key).map(|v| v.value().clone()) {
            Some(Value::Bool(b)) => b,
            _ => default,
        }
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.map.get(key).map(|v| v.value().clone()) {
            Some(Value::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn get_int_list(&self, key: &str) -> Option<Vec<i64>> {
        match self.map.get(key).map(|v| v.value().clone()) {
            Some(Value::Array(items)) => Some(
                items
                    .into_iter()
                    .filter_map(|v| v.as_i64())
                    .collect(),
            ),
            _ => None,
        }
    }

    /// Snapshot as a JSON object, used by the request dict round-trip.
    pub fn to_value(&self) -> Value {
        let mut obj = serde_json::Map::new();
        for entry in self.map.iter() {
            obj.insert(entry.key().clone(), entry.value().clone());
        }
        Value::Object(obj)
    }

    pub fn from_value(value: &Value) -> Self {
        let ctx = Ctx::new();
        if let Value::Object(obj) = value {
            for (k, v) in obj {
                ctx.map.insert(k.clone(), v.clone());
            }
        }
        ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_getters_fall_back_to_defaults() {
        let ctx = Ctx::new();
        ctx.set("depth", 3);
        ctx.set("dont_retry", true);
        ctx.set("proxy", "http://127.0.0.1:8080");

        assert_eq!(ctx.get_i64_or("depth", 0), 3);
        assert_eq!(ctx.get_i64_or("missing", 7), 7);
        assert!(ctx.get_bool_or("dont_retry", false));
        assert_eq!(ctx.get_str("proxy").as_deref(), Some("http://127.0.0.1:8080"));
        assert_eq!(ctx.get_str("depth"), None);
    }

    #[test]
    fn clones_share_the_same_map() {
        let ctx = Ctx::new();
        let other = ctx.clone();
        other.set("retry_times", 2);
        assert_eq!(ctx.get_i64_or("retry_times", 0), 2);
    }

    #[test]
    fn value_round_trip() {
        let ctx = Ctx::new();
        ctx.set("depth", 1);
        ctx.set("domain", "example.com");
        let restored = Ctx::from_value(&ctx.to_value());
        assert_eq!(restored.to_value(), ctx.to_value());
    }
}
