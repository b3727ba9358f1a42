//! Schema metadata describing a data source
//!
//! Schemas are immutable once built. The filter and query services only read
//! them, through the [`SchemaRegistry`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

mod builder;
mod registry;

pub use builder::SchemaBuilder;
pub use registry::SchemaRegistry;

/// Immutable description of a data source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    pub id: String,
    pub data_source: String,
    pub dimensions: Vec<Dimension>,
    pub measures: Vec<Measure>,
    pub categories: Vec<Category>,
    pub filter_configs: BTreeMap<String, FilterConfig>,

    /// Filter ids applied to every query of this schema, no opt-out
    pub governance_filters: Vec<String>,
}

impl Schema {
    pub fn dimension(&self, key: &str) -> Option<&Dimension> {
        self.dimensions.iter().find(|d| d.key == key)
    }

    pub fn measure(&self, key: &str) -> Option<&Measure> {
        self.measures.iter().find(|m| m.key == key)
    }

    pub fn category(&self, key: &str) -> Option<&Category> {
        self.categories.iter().find(|c| c.key == key)
    }

    pub fn filter_config(&self, name: &str) -> Option<&FilterConfig> {
        self.filter_configs.get(name)
    }

    pub fn is_governance_filter(&self, filter_id: &str) -> bool {
        self.governance_filters.iter().any(|f| f == filter_id)
    }
}

/// A dimension of the data source
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Dimension {
    pub key: String,
    pub label: String,

    /// Adapter-side hierarchy or column name
    pub hierarchy: Option<String>,
}

/// A measure of the data source
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Measure {
    pub key: String,
    pub label: String,

    /// Formatter name used when displaying the measure
    pub format: String,
}

/// A named group of measures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Category {
    pub key: String,
    pub label: String,
    pub measures: Vec<String>,
}

/// How a schema receives a dashboard filter
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FilterConfig {
    /// Plain mapping onto a dimension
    Simple(SimpleFilterConfig),

    /// Mapping with fixed values and acceptance rules
    Object(ObjectFilterConfig),
}

impl FilterConfig {
    pub fn dimension(&self) -> &str {
        match self {
            FilterConfig::Simple(c) => &c.dimension,
            FilterConfig::Object(c) => &c.dimension,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimpleFilterConfig {
    pub dimension: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ObjectFilterConfig {
    pub dimension: String,

    /// Value the schema's queries are pinned to for this dimension
    #[serde(default)]
    pub fixed_value: Option<Value>,

    /// Dashboard filter ids accepted by this schema; `None` accepts all
    #[serde(default)]
    pub accepts: Option<Vec<String>>,

    /// Reject dashboard values that contradict `fixed_value`
    #[serde(default)]
    pub zero_on_conflict: bool,
}

impl ObjectFilterConfig {
    pub fn accepts_filter(&self, filter_id: &str) -> bool {
        match &self.accepts {
            Some(list) => list.iter().any(|f| f == filter_id),
            None => true,
        }
    }
}
