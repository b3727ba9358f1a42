//! Dashboard filters and their per-schema projections
//!
//! A filter holds one canonical value. Each schema it is bound to sees that
//! value through the binding's transform. Filters without a binding for a
//! schema are simply not applicable there.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

mod engine;
mod manager;

pub use engine::{FilterConflict, FilterEngine};
pub use manager::{FilterEvent, FilterManager, FilterManagerConfig};

/// Transform between canonical and adapter representations
pub type ValueTransform = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// How a filter maps onto one schema
#[derive(Clone, Default)]
pub struct FilterBinding {
    /// Adapter-side reference; falls back to the config's dimension, then
    /// to the filter id
    pub reference: Option<String>,

    /// Name of the schema filter config governing this binding
    pub config: Option<String>,

    to_adapter: Option<ValueTransform>,
    from_adapter: Option<ValueTransform>,
}

impl FilterBinding {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn with_config(mut self, config: impl Into<String>) -> Self {
        self.config = Some(config.into());
        self
    }

    pub fn with_to_adapter<F>(mut self, transform: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        self.to_adapter = Some(Arc::new(transform));
        self
    }

    pub fn with_from_adapter<F>(mut self, transform: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        self.from_adapter = Some(Arc::new(transform));
        self
    }

    /// Canonical value as the schema's adapter expects it (identity if unset)
    pub fn to_adapter_value(&self, value: &Value) -> Value {
        match &self.to_adapter {
            Some(transform) => transform(value),
            None => value.clone(),
        }
    }

    /// Adapter value back to the canonical representation (identity if unset)
    pub fn from_adapter_value(&self, value: &Value) -> Value {
        match &self.from_adapter {
            Some(transform) => transform(value),
            None => value.clone(),
        }
    }
}

impl fmt::Debug for FilterBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterBinding")
            .field("reference", &self.reference)
            .field("config", &self.config)
            .field("to_adapter", &self.to_adapter.is_some())
            .field("from_adapter", &self.from_adapter.is_some())
            .finish()
    }
}

/// A selectable value with its display label
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterOption {
    pub value: Value,
    pub label: String,
}

/// Definition of a dashboard filter
#[derive(Debug, Clone)]
pub struct FilterDefinition {
    pub id: String,
    pub label: String,
    pub default_value: Value,
    pub options: Vec<FilterOption>,
    pub bindings: AHashMap<String, FilterBinding>,
}

impl FilterDefinition {
    pub fn new(id: impl Into<String>, default_value: Value) -> Self {
        let id = id.into();
        Self {
            label: id.clone(),
            id,
            default_value,
            options: Vec::new(),
            bindings: AHashMap::new(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_option(mut self, value: Value, label: impl Into<String>) -> Self {
        self.options.push(FilterOption {
            value,
            label: label.into(),
        });
        self
    }

    /// Bind the filter to a schema
    pub fn bind(mut self, schema_id: impl Into<String>, binding: FilterBinding) -> Self {
        self.bindings.insert(schema_id.into(), binding);
        self
    }

    pub fn binding(&self, schema_id: &str) -> Option<&FilterBinding> {
        self.bindings.get(schema_id)
    }

    /// Bound schema ids, sorted
    pub fn schemas(&self) -> Vec<String> {
        let mut schemas: Vec<String> = self.bindings.keys().cloned().collect();
        schemas.sort();
        schemas
    }

    /// Display label for a value: option labels when they match, the raw
    /// value otherwise
    pub fn label_for(&self, value: &Value) -> String {
        let single = |v: &Value| {
            self.options
                .iter()
                .find(|o| &o.value == v)
                .map(|o| o.label.clone())
                .unwrap_or_else(|| display_value(v))
        };

        match value {
            Value::Array(items) => items.iter().map(single).collect::<Vec<_>>().join(", "),
            other => single(other),
        }
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// A query's association with a schema and the filters it ignores
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRegistration {
    pub schema_id: String,
    pub ignore_filters: BTreeSet<String>,
}

/// An active filter as shown to users
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveFilterInfo {
    pub id: String,
    pub value: Value,

    /// Resolved display label of the value
    pub label: String,

    pub filter_label: String,
}

/// Null, empty strings and empty collections carry no constraint
pub(crate) fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_binding_round_trip() {
        let binding = FilterBinding::new()
            .with_to_adapter(|v| json!([v]))
            .with_from_adapter(|v| v.get(0).cloned().unwrap_or(Value::Null));

        for value in [json!("bdn"), json!(42), json!({"from": "2024-01-01"})] {
            let adapter = binding.to_adapter_value(&value);
            assert_eq!(binding.from_adapter_value(&adapter), value);
        }
    }

    #[test]
    fn test_identity_without_transforms() {
        let binding = FilterBinding::new();
        assert_eq!(binding.to_adapter_value(&json!("x")), json!("x"));
        assert_eq!(binding.from_adapter_value(&json!("x")), json!("x"));
    }

    #[test]
    fn test_label_for_uses_options() {
        let def = FilterDefinition::new("loja", Value::Null)
            .with_label("Loja")
            .with_option(json!("bdn"), "Bandeirantes")
            .with_option(json!("cps"), "Campinas");

        assert_eq!(def.label_for(&json!("bdn")), "Bandeirantes");
        assert_eq!(def.label_for(&json!(["bdn", "cps"])), "Bandeirantes, Campinas");
        assert_eq!(def.label_for(&json!("xyz")), "xyz");
        assert_eq!(def.label_for(&json!(3)), "3");
    }

    #[test]
    fn test_empty_values() {
        assert!(is_empty_value(&Value::Null));
        assert!(is_empty_value(&json!("")));
        assert!(is_empty_value(&json!([])));
        assert!(!is_empty_value(&json!(0)));
        assert!(!is_empty_value(&json!(["a"])));
    }
}
