//! Pure filter projection and validation logic
//!
//! The engine never mutates filter state. It answers "what does this value
//! look like for schema X", "would this value contradict a fixed query
//! value" and "which filters reach query Y".

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use ahash::AHashMap;
use dv_core::{FilterConfig, FilterTarget, Schema, SchemaRegistry};
use serde_json::Value;

use super::{is_empty_value, FilterBinding, FilterDefinition, QueryRegistration};

/// A dashboard value contradicting a schema's fixed value
#[derive(Debug, Clone, PartialEq)]
pub struct FilterConflict {
    pub filter_id: String,
    pub schema_id: String,
    pub dimension: String,
    pub fixed: Value,
    pub attempted: Value,
}

impl fmt::Display for FilterConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "filter '{}' value {} conflicts with fixed {} on {}.{}",
            self.filter_id, self.attempted, self.fixed, self.schema_id, self.dimension
        )
    }
}

/// Stateless filter logic over the schema registry
#[derive(Clone)]
pub struct FilterEngine {
    registry: Arc<SchemaRegistry>,
}

impl FilterEngine {
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    /// Value of a filter as seen by a schema; `None` when not bound there
    pub fn project(&self, definition: &FilterDefinition, schema_id: &str, value: &Value) -> Option<Value> {
        definition
            .binding(schema_id)
            .map(|binding| binding.to_adapter_value(value))
    }

    /// Adapter-side target for a filter on a schema
    pub fn target(&self, definition: &FilterDefinition, schema_id: &str) -> Option<FilterTarget> {
        let binding = definition.binding(schema_id)?;
        let reference = binding
            .reference
            .clone()
            .or_else(|| {
                let schema = self.registry.get(schema_id)?;
                let config = schema.filter_config(binding.config.as_deref()?)?;
                let dimension = config.dimension();
                Some(
                    schema
                        .dimension(dimension)
                        .and_then(|d| d.hierarchy.clone())
                        .unwrap_or_else(|| dimension.to_string()),
                )
            })
            .unwrap_or_else(|| definition.id.clone());

        Some(FilterTarget::new(definition.id.clone(), reference))
    }

    /// Check a value against every `zero_on_conflict` config it would reach
    pub fn check_conflict(&self, definition: &FilterDefinition, value: &Value) -> Result<(), FilterConflict> {
        let mut schemas: Vec<&String> = definition.bindings.keys().collect();
        schemas.sort();

        for schema_id in schemas {
            let Some(binding) = definition.binding(schema_id) else {
                continue;
            };
            let Some(schema) = self.registry.get(schema_id) else {
                continue;
            };
            let Some(FilterConfig::Object(config)) = binding_config(&schema, binding) else {
                continue;
            };
            if !config.zero_on_conflict {
                continue;
            }
            let Some(fixed) = config.fixed_value.as_ref().filter(|v| !is_empty_value(v)) else {
                continue;
            };

            let projected = binding.to_adapter_value(value);
            if !is_empty_value(&projected) && &projected != fixed {
                return Err(FilterConflict {
                    filter_id: definition.id.clone(),
                    schema_id: schema_id.clone(),
                    dimension: config.dimension.clone(),
                    fixed: fixed.clone(),
                    attempted: projected,
                });
            }
        }
        Ok(())
    }

    /// Group projected values by schema, ready to hand to the adapter
    pub fn plan(
        &self,
        changes: &[(Arc<FilterDefinition>, Value)],
    ) -> BTreeMap<String, Vec<(FilterTarget, Value)>> {
        let mut plan: BTreeMap<String, Vec<(FilterTarget, Value)>> = BTreeMap::new();
        for (definition, value) in changes {
            for schema_id in definition.schemas() {
                let (Some(target), Some(projected)) = (
                    self.target(definition, &schema_id),
                    self.project(definition, &schema_id, value),
                ) else {
                    continue;
                };
                plan.entry(schema_id).or_default().push((target, projected));
            }
        }
        plan
    }

    /// Effective filters for a registered query.
    ///
    /// Active filters bound to the query's schema, projected, minus the
    /// query's ignore list and anything the schema config does not accept.
    /// Governance filters are then added back unconditionally.
    pub fn filters_for_query(
        &self,
        registration: &QueryRegistration,
        definitions: &AHashMap<String, Arc<FilterDefinition>>,
        values: &AHashMap<String, Value>,
    ) -> BTreeMap<String, Value> {
        let schema_id = registration.schema_id.as_str();
        let schema = self.registry.get(schema_id);
        let mut filters = BTreeMap::new();

        for (id, definition) in definitions {
            let Some(binding) = definition.binding(schema_id) else {
                continue;
            };
            let value = values.get(id).unwrap_or(&definition.default_value);
            if *value == definition.default_value || registration.ignore_filters.contains(id) {
                continue;
            }
            if let Some(schema) = &schema {
                if let Some(FilterConfig::Object(config)) = binding_config(schema, binding) {
                    if !config.accepts_filter(id) {
                        continue;
                    }
                }
            }
            filters.insert(id.clone(), binding.to_adapter_value(value));
        }

        if let Some(schema) = &schema {
            for id in &schema.governance_filters {
                let Some(definition) = definitions.get(id) else {
                    tracing::debug!(filter = %id, schema = %schema_id, "governance filter has no definition");
                    continue;
                };
                let value = values.get(id).unwrap_or(&definition.default_value);
                let projected = match definition.binding(schema_id) {
                    Some(binding) => binding.to_adapter_value(value),
                    None => value.clone(),
                };
                filters.insert(id.clone(), projected);
            }
        }

        filters
    }
}

fn binding_config<'a>(schema: &'a Schema, binding: &FilterBinding) -> Option<&'a FilterConfig> {
    schema.filter_config(binding.config.as_deref()?)
}
