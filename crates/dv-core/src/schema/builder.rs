//! Fluent builder for [`Schema`]

use std::collections::{BTreeMap, HashSet};

use super::{Category, Dimension, FilterConfig, Measure, Schema};
use crate::error::CoreError;

/// Builder collecting schema metadata before validation
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    id: String,
    data_source: String,
    dimensions: Vec<Dimension>,
    measures: Vec<Measure>,
    categories: Vec<Category>,
    filter_configs: BTreeMap<String, FilterConfig>,
    governance_filters: Vec<String>,
}

impl SchemaBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn data_source(mut self, source: impl Into<String>) -> Self {
        self.data_source = source.into();
        self
    }

    pub fn dimension(mut self, key: impl Into<String>, label: impl Into<String>) -> Self {
        self.dimensions.push(Dimension {
            key: key.into(),
            label: label.into(),
            hierarchy: None,
        });
        self
    }

    /// Add a dimension with an adapter-side hierarchy name
    pub fn dimension_with_hierarchy(
        mut self,
        key: impl Into<String>,
        label: impl Into<String>,
        hierarchy: impl Into<String>,
    ) -> Self {
        self.dimensions.push(Dimension {
            key: key.into(),
            label: label.into(),
            hierarchy: Some(hierarchy.into()),
        });
        self
    }

    pub fn measure(
        mut self,
        key: impl Into<String>,
        label: impl Into<String>,
        format: impl Into<String>,
    ) -> Self {
        self.measures.push(Measure {
            key: key.into(),
            label: label.into(),
            format: format.into(),
        });
        self
    }

    pub fn category(
        mut self,
        key: impl Into<String>,
        label: impl Into<String>,
        measures: &[&str],
    ) -> Self {
        self.categories.push(Category {
            key: key.into(),
            label: label.into(),
            measures: measures.iter().map(|m| m.to_string()).collect(),
        });
        self
    }

    pub fn filter_config(mut self, name: impl Into<String>, config: FilterConfig) -> Self {
        self.filter_configs.insert(name.into(), config);
        self
    }

    pub fn governance_filter(mut self, filter_id: impl Into<String>) -> Self {
        self.governance_filters.push(filter_id.into());
        self
    }

    /// Validate and freeze the schema
    pub fn build(self) -> Result<Schema, CoreError> {
        let invalid = |reason: String| CoreError::InvalidSchema {
            schema: self.id.clone(),
            reason,
        };

        if self.id.trim().is_empty() {
            return Err(invalid("schema id is empty".to_string()));
        }

        let mut seen = HashSet::new();
        for dim in &self.dimensions {
            if !seen.insert(dim.key.as_str()) {
                return Err(invalid(format!("duplicate dimension '{}'", dim.key)));
            }
        }

        let mut measures = HashSet::new();
        for measure in &self.measures {
            if !measures.insert(measure.key.as_str()) {
                return Err(invalid(format!("duplicate measure '{}'", measure.key)));
            }
        }

        for category in &self.categories {
            if let Some(missing) = category.measures.iter().find(|m| !measures.contains(m.as_str())) {
                return Err(invalid(format!(
                    "category '{}' references unknown measure '{}'",
                    category.key, missing
                )));
            }
        }

        Ok(Schema {
            id: self.id,
            data_source: self.data_source,
            dimensions: self.dimensions,
            measures: self.measures,
            categories: self.categories,
            filter_configs: self.filter_configs,
            governance_filters: self.governance_filters,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ObjectFilterConfig, SimpleFilterConfig};
    use serde_json::json;

    #[test]
    fn test_build_schema() {
        let schema = SchemaBuilder::new("vendas")
            .data_source("cube_vendas")
            .dimension_with_hierarchy("loja", "Loja", "[Loja].[Codigo]")
            .dimension("data", "Data")
            .measure("revenue", "Receita", "currency")
            .measure("units", "Unidades", "number")
            .category("financeiro", "Financeiro", &["revenue"])
            .filter_config("loja", FilterConfig::Simple(SimpleFilterConfig { dimension: "loja".into() }))
            .filter_config(
                "canal",
                FilterConfig::Object(ObjectFilterConfig {
                    dimension: "canal".into(),
                    fixed_value: Some(json!("online")),
                    accepts: None,
                    zero_on_conflict: true,
                }),
            )
            .governance_filter("tenant")
            .build()
            .unwrap();

        assert_eq!(schema.id, "vendas");
        assert_eq!(schema.dimension("loja").unwrap().hierarchy.as_deref(), Some("[Loja].[Codigo]"));
        assert_eq!(schema.measure("units").unwrap().format, "number");
        assert_eq!(schema.filter_config("canal").unwrap().dimension(), "canal");
        assert!(schema.is_governance_filter("tenant"));
        assert!(!schema.is_governance_filter("loja"));
    }

    #[test]
    fn test_rejects_unknown_category_measure() {
        let err = SchemaBuilder::new("vendas")
            .measure("revenue", "Receita", "currency")
            .category("x", "X", &["cost"])
            .build()
            .unwrap_err();

        assert!(matches!(err, CoreError::InvalidSchema { .. }));
        assert!(err.to_string().contains("cost"));
    }

    #[test]
    fn test_rejects_duplicate_dimension() {
        let result = SchemaBuilder::new("s")
            .dimension("loja", "Loja")
            .dimension("loja", "Loja 2")
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_empty_id() {
        assert!(SchemaBuilder::new("  ").build().is_err());
    }
}
