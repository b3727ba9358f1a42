//! Data adapter contract and query definitions
//!
//! The orchestration services never talk to a backend directly. Everything
//! goes through a [`DataAdapter`], which interprets the opaque query payload
//! and the per-schema filter values.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

/// Trait for data adapters
#[async_trait]
pub trait DataAdapter: Send + Sync + 'static {
    /// Query payload, opaque to the managers
    type Query: Serialize + Clone + Send + Sync + 'static;

    /// Result produced by the adapter for a query
    type Output: Send + Sync + 'static;

    /// Execute a query
    async fn execute(&self, query: &QueryDefinition<Self::Query>) -> anyhow::Result<Self::Output>;

    /// Apply a single filter value for a schema
    async fn apply_filter(
        &self,
        schema_id: &str,
        target: &FilterTarget,
        value: &Value,
    ) -> anyhow::Result<()>;

    /// Apply several filter values for a schema in one round-trip
    async fn apply_filters(
        &self,
        schema_id: &str,
        filters: &[(FilterTarget, Value)],
    ) -> anyhow::Result<()>;

    /// Whether `apply_filters` is cheaper than repeated `apply_filter` calls
    fn supports_batch(&self) -> bool {
        true
    }

    /// Adapter name used in log output
    fn name(&self) -> &str;
}

/// Identifies a filter on the adapter side
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct FilterTarget {
    /// Canonical filter id
    pub filter_id: String,

    /// Adapter-side reference (dimension, hierarchy, column...)
    pub reference: String,
}

impl FilterTarget {
    pub fn new(filter_id: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            filter_id: filter_id.into(),
            reference: reference.into(),
        }
    }
}

/// A query to run against a schema
#[derive(Debug, Clone, Serialize)]
pub struct QueryDefinition<Q> {
    /// Query id, shared by every execution of the same logical query
    pub id: String,

    /// Schema the query runs against
    pub schema_id: String,

    /// Adapter-specific payload
    pub query: Q,

    /// Filter values (already projected for the schema) affecting the query
    pub filters: BTreeMap<String, Value>,
}

impl<Q: Serialize> QueryDefinition<Q> {
    /// Create a query definition without filters
    pub fn new(id: impl Into<String>, schema_id: impl Into<String>, query: Q) -> Self {
        Self {
            id: id.into(),
            schema_id: schema_id.into(),
            query,
            filters: BTreeMap::new(),
        }
    }

    /// Attach projected filter values
    pub fn with_filters(mut self, filters: BTreeMap<String, Value>) -> Self {
        self.filters = filters;
        self
    }

    /// Deterministic cache key for this definition.
    ///
    /// The key is a JSON array `[id, schema_id, query, filters]`, so every
    /// component is quoted and escaped. Object keys are sorted at every
    /// depth, so two definitions built from maps with different insertion
    /// orders produce the same key.
    pub fn cache_key(&self) -> String {
        let filters: serde_json::Map<String, Value> = self
            .filters
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        let parts = match serde_json::to_value(&self.query) {
            Ok(query) => vec![
                Value::String(self.id.clone()),
                Value::String(self.schema_id.clone()),
                query,
                Value::Object(filters),
            ],
            Err(e) => {
                tracing::warn!(query_id = %self.id, error = %e, "query payload is not serializable");
                // Three components never collide with a serializable payload
                vec![
                    Value::String(self.id.clone()),
                    Value::String(self.schema_id.clone()),
                    Value::Object(filters),
                ]
            }
        };

        let mut key = String::new();
        write_stable_json(&Value::Array(parts), &mut key);
        key
    }
}

/// Serialize a JSON value with object keys in sorted order
pub fn write_stable_json(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (k, v)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                let _ = write!(out, "{}", Value::String(k.clone()));
                out.push(':');
                write_stable_json(v, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_stable_json(item, out);
            }
            out.push(']');
        }
        other => {
            let _ = write!(out, "{}", other);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn test_cache_key_ignores_map_order() {
        let mut a = HashMap::new();
        a.insert("b", 2);
        a.insert("a", 1);
        let mut b = HashMap::new();
        b.insert("a", 1);
        b.insert("b", 2);

        let qa = QueryDefinition::new("q1", "s", a);
        let qb = QueryDefinition::new("q1", "s", b);
        assert_eq!(qa.cache_key(), qb.cache_key());
    }

    #[test]
    fn test_cache_key_includes_filters() {
        let base = QueryDefinition::new("q1", "vendas", json!({"measure": "revenue"}));
        let mut filters = BTreeMap::new();
        filters.insert("loja".to_string(), json!(["bdn"]));
        let filtered = base.clone().with_filters(filters);

        assert_ne!(base.cache_key(), filtered.cache_key());
        assert!(filtered.cache_key().contains(r#"{"loja":["bdn"]}"#));
    }

    #[test]
    fn test_cache_key_separators_are_escaped() {
        let a = QueryDefinition::new("a|b", "c", json!({}));
        let b = QueryDefinition::new("a", "b|c", json!({}));
        assert_ne!(a.cache_key(), b.cache_key());

        let mut first = BTreeMap::new();
        first.insert("x".to_string(), json!("1;y=2"));
        let mut second = BTreeMap::new();
        second.insert("x".to_string(), json!("1"));
        second.insert("y".to_string(), json!("2"));
        let q1 = QueryDefinition::new("q", "s", json!({})).with_filters(first);
        let q2 = QueryDefinition::new("q", "s", json!({})).with_filters(second);
        assert_ne!(q1.cache_key(), q2.cache_key());
    }

    #[test]
    fn test_stable_json_nested() {
        let mut out = String::new();
        write_stable_json(&json!({"z": {"y": 1, "x": [true, null]}, "a": "s"}), &mut out);
        assert_eq!(out, r#"{"a":"s","z":{"x":[true,null],"y":1}}"#);
    }
}
