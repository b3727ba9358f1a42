//! Append-only schema registry

use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;

use super::{Dimension, FilterConfig, Measure, Schema};
use crate::error::CoreError;

/// Registry of immutable schemas keyed by id.
///
/// Constructed once at start-up and shared by handle; there is no global
/// instance.
#[derive(Default)]
pub struct SchemaRegistry {
    schemas: RwLock<AHashMap<String, Arc<Schema>>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a schema. Ids cannot be re-registered.
    pub fn register(&self, schema: Schema) -> Result<Arc<Schema>, CoreError> {
        let mut schemas = self.schemas.write();
        if schemas.contains_key(&schema.id) {
            return Err(CoreError::DuplicateSchema(schema.id));
        }

        tracing::debug!(schema = %schema.id, dimensions = schema.dimensions.len(), "schema registered");
        let schema = Arc::new(schema);
        schemas.insert(schema.id.clone(), schema.clone());
        Ok(schema)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Schema>> {
        self.schemas.read().get(id).cloned()
    }

    pub fn get_or_err(&self, id: &str) -> Result<Arc<Schema>, CoreError> {
        self.get(id).ok_or_else(|| CoreError::SchemaNotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.schemas.read().contains_key(id)
    }

    /// Registered ids, sorted
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.schemas.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.schemas.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.read().is_empty()
    }

    pub fn dimension(&self, schema_id: &str, key: &str) -> Option<Dimension> {
        self.get(schema_id)?.dimension(key).cloned()
    }

    pub fn measure(&self, schema_id: &str, key: &str) -> Option<Measure> {
        self.get(schema_id)?.measure(key).cloned()
    }

    pub fn filter_config(&self, schema_id: &str, name: &str) -> Option<FilterConfig> {
        self.get(schema_id)?.filter_config(name).cloned()
    }

    pub fn governance_filters(&self, schema_id: &str) -> Vec<String> {
        self.get(schema_id)
            .map(|s| s.governance_filters.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaBuilder;

    fn schema(id: &str) -> Schema {
        SchemaBuilder::new(id)
            .dimension("loja", "Loja")
            .measure("revenue", "Receita", "currency")
            .governance_filter("tenant")
            .build()
            .unwrap()
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = SchemaRegistry::new();
        registry.register(schema("vendas")).unwrap();
        registry.register(schema("estoque")).unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.ids(), vec!["estoque".to_string(), "vendas".to_string()]);
        assert!(registry.get("vendas").is_some());
        assert_eq!(registry.dimension("vendas", "loja").unwrap().label, "Loja");
        assert_eq!(registry.measure("vendas", "revenue").unwrap().format, "currency");
        assert_eq!(registry.governance_filters("vendas"), vec!["tenant".to_string()]);
        assert!(registry.governance_filters("missing").is_empty());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = SchemaRegistry::new();
        let first = registry.register(schema("vendas")).unwrap();
        let err = registry.register(schema("vendas")).unwrap_err();

        assert_eq!(err, CoreError::DuplicateSchema("vendas".into()));
        // The original stays in place
        assert!(Arc::ptr_eq(&first, &registry.get("vendas").unwrap()));
    }

    #[test]
    fn test_get_or_err() {
        let registry = SchemaRegistry::new();
        assert_eq!(
            registry.get_or_err("nope").unwrap_err(),
            CoreError::SchemaNotFound("nope".into())
        );
    }
}
