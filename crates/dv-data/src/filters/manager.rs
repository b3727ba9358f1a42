//! Filter state owner
//!
//! [`FilterManager`] holds the canonical value of every dashboard filter and
//! pushes changes to the adapter, one round-trip per schema where the adapter
//! supports batching.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use ahash::AHashMap;
use dv_core::{DataAdapter, SchemaRegistry};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::engine::FilterEngine;
use super::{ActiveFilterInfo, FilterDefinition, QueryRegistration};
use crate::DataError;

/// Filter manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterManagerConfig {
    /// Group several filters for one schema into a single adapter call
    pub batch_apply: bool,

    /// Capacity of the event channel
    pub event_capacity: usize,
}

impl Default for FilterManagerConfig {
    fn default() -> Self {
        Self {
            batch_apply: true,
            event_capacity: 64,
        }
    }
}

/// Filter state changes
#[derive(Debug, Clone, PartialEq)]
pub enum FilterEvent {
    Changed { filter_id: String, value: Value },
    Cleared { filter_id: String },
    Reset,
}

#[derive(Default)]
struct FilterState {
    definitions: AHashMap<String, Arc<FilterDefinition>>,
    values: AHashMap<String, Value>,
    queries: AHashMap<String, QueryRegistration>,
}

impl FilterState {
    fn current(&self, definition: &FilterDefinition) -> Value {
        self.values
            .get(&definition.id)
            .cloned()
            .unwrap_or_else(|| definition.default_value.clone())
    }
}

type Change = (Arc<FilterDefinition>, Value);

/// Owner of dashboard filter state
pub struct FilterManager<A: DataAdapter> {
    adapter: Arc<A>,
    engine: FilterEngine,
    state: RwLock<FilterState>,
    config: FilterManagerConfig,
    events: broadcast::Sender<FilterEvent>,
}

impl<A: DataAdapter> FilterManager<A> {
    pub fn new(
        adapter: Arc<A>,
        registry: Arc<SchemaRegistry>,
        definitions: Vec<FilterDefinition>,
        config: FilterManagerConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let mut state = FilterState::default();
        for definition in definitions {
            state
                .values
                .insert(definition.id.clone(), definition.default_value.clone());
            state
                .definitions
                .insert(definition.id.clone(), Arc::new(definition));
        }
        info!(filters = state.definitions.len(), adapter = adapter.name(), "filter manager ready");

        Self {
            adapter,
            engine: FilterEngine::new(registry),
            state: RwLock::new(state),
            config,
            events,
        }
    }

    pub fn engine(&self) -> &FilterEngine {
        &self.engine
    }

    pub fn get_config(&self) -> &FilterManagerConfig {
        &self.config
    }

    /// Subscribe to filter state changes
    pub fn subscribe(&self) -> broadcast::Receiver<FilterEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: FilterEvent) {
        let _ = self.events.send(event);
    }

    /// Add or replace a filter definition. A new filter starts at its default;
    /// a replaced one keeps its current value.
    pub fn register_filter(&self, definition: FilterDefinition) -> bool {
        let mut state = self.state.write();
        let id = definition.id.clone();
        if !state.values.contains_key(&id) {
            state.values.insert(id.clone(), definition.default_value.clone());
        }
        let replaced = state.definitions.insert(id.clone(), Arc::new(definition)).is_some();
        debug!(filter = %id, replaced, "filter registered");
        replaced
    }

    /// Validate and store a set of changes under one write lock.
    /// Returns `None`, leaving state untouched, if any change is rejected.
    fn stage<I>(&self, changes: I) -> Option<Vec<Change>>
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        let mut state = self.state.write();
        let mut staged = Vec::new();

        for (filter_id, value) in changes {
            let Some(definition) = state.definitions.get(&filter_id).cloned() else {
                warn!(filter = %filter_id, "unknown filter");
                return None;
            };
            if let Err(conflict) = self.engine.check_conflict(&definition, &value) {
                warn!(%conflict, "filter rejected");
                return None;
            }
            staged.push((definition, value));
        }

        for (definition, value) in &staged {
            state.values.insert(definition.id.clone(), value.clone());
        }
        Some(staged)
    }

    /// Push changes to the adapter, grouped per schema
    async fn propagate(&self, changes: &[Change]) -> Result<(), DataError> {
        let batch = self.config.batch_apply && self.adapter.supports_batch();

        for (schema_id, filters) in self.engine.plan(changes) {
            debug!(schema = %schema_id, count = filters.len(), batch, "applying filters");
            match filters.as_slice() {
                [(target, value)] => self
                    .adapter
                    .apply_filter(&schema_id, target, value)
                    .await
                    .map_err(DataError::adapter)?,
                _ if batch => self
                    .adapter
                    .apply_filters(&schema_id, &filters)
                    .await
                    .map_err(DataError::adapter)?,
                _ => {
                    for (target, value) in &filters {
                        self.adapter
                            .apply_filter(&schema_id, target, value)
                            .await
                            .map_err(DataError::adapter)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Set a filter's value and apply it to every bound schema.
    ///
    /// `Ok(false)` means the value was rejected (unknown filter or a fixed
    /// value conflict) and nothing changed. An adapter failure is returned as
    /// `Err`; the new value is kept as the canonical state.
    pub async fn apply_filter(&self, filter_id: &str, value: Value) -> Result<bool, DataError> {
        let Some(changes) = self.stage([(filter_id.to_string(), value.clone())]) else {
            return Ok(false);
        };
        self.emit(FilterEvent::Changed {
            filter_id: filter_id.to_string(),
            value,
        });
        self.propagate(&changes).await?;
        Ok(true)
    }

    /// Apply several filters at once. All or nothing: one rejected value
    /// rejects the whole set.
    pub async fn apply_filters<I, K>(&self, values: I) -> Result<bool, DataError>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let values: Vec<(String, Value)> = values.into_iter().map(|(k, v)| (k.into(), v)).collect();
        let Some(changes) = self.stage(values) else {
            return Ok(false);
        };
        for (definition, value) in &changes {
            self.emit(FilterEvent::Changed {
                filter_id: definition.id.clone(),
                value: value.clone(),
            });
        }
        self.propagate(&changes).await?;
        Ok(true)
    }

    /// Reset a filter to its default and re-apply it
    pub async fn clear_filter(&self, filter_id: &str) -> Result<bool, DataError> {
        let Some(default) = self.get_definition(filter_id).map(|d| d.default_value.clone()) else {
            return Ok(false);
        };
        let Some(changes) = self.stage([(filter_id.to_string(), default)]) else {
            return Ok(false);
        };
        self.emit(FilterEvent::Cleared {
            filter_id: filter_id.to_string(),
        });
        self.propagate(&changes).await?;
        Ok(true)
    }

    /// Reset every active filter to its default and re-apply them
    pub async fn reset_all(&self) -> Result<(), DataError> {
        let changes: Vec<Change> = {
            let mut state = self.state.write();
            let active: Vec<Arc<FilterDefinition>> = state
                .definitions
                .values()
                .filter(|d| state.current(d) != d.default_value)
                .cloned()
                .collect();
            active
                .into_iter()
                .map(|definition| {
                    let default = definition.default_value.clone();
                    state.values.insert(definition.id.clone(), default.clone());
                    (definition, default)
                })
                .collect()
        };

        info!(count = changes.len(), "filters reset");
        self.emit(FilterEvent::Reset);
        self.propagate(&changes).await
    }

    /// Canonical value of a filter
    pub fn get_value(&self, filter_id: &str) -> Option<Value> {
        let state = self.state.read();
        let definition = state.definitions.get(filter_id)?;
        Some(state.current(definition))
    }

    /// Value of a filter as the schema's adapter sees it
    pub fn get_value_for_schema(&self, filter_id: &str, schema_id: &str) -> Option<Value> {
        let state = self.state.read();
        let definition = state.definitions.get(filter_id)?;
        self.engine
            .project(definition, schema_id, &state.current(definition))
    }

    /// Convert an adapter-side value back to the filter's canonical form
    pub fn value_from_adapter(&self, filter_id: &str, schema_id: &str, value: &Value) -> Option<Value> {
        let state = self.state.read();
        let binding = state.definitions.get(filter_id)?.binding(schema_id)?;
        Some(binding.from_adapter_value(value))
    }

    pub fn get_all_values(&self) -> BTreeMap<String, Value> {
        let state = self.state.read();
        state
            .definitions
            .values()
            .map(|d| (d.id.clone(), state.current(d)))
            .collect()
    }

    pub fn is_active(&self, filter_id: &str) -> bool {
        let state = self.state.read();
        state
            .definitions
            .get(filter_id)
            .map_or(false, |d| state.current(d) != d.default_value)
    }

    pub fn is_dirty(&self) -> bool {
        let state = self.state.read();
        state
            .definitions
            .values()
            .any(|d| state.current(d) != d.default_value)
    }

    /// Active filters with display labels, ordered by id
    pub fn get_active_filters(&self) -> Vec<ActiveFilterInfo> {
        let state = self.state.read();
        let mut active: Vec<ActiveFilterInfo> = state
            .definitions
            .values()
            .filter_map(|d| {
                let value = state.current(d);
                (value != d.default_value).then(|| ActiveFilterInfo {
                    id: d.id.clone(),
                    label: d.label_for(&value),
                    filter_label: d.label.clone(),
                    value,
                })
            })
            .collect();
        active.sort_by(|a, b| a.id.cmp(&b.id));
        active
    }

    /// Associate a query with a schema and the filters it ignores
    pub fn register_query<I, S>(&self, query_id: impl Into<String>, schema_id: impl Into<String>, ignore_filters: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let registration = QueryRegistration {
            schema_id: schema_id.into(),
            ignore_filters: ignore_filters.into_iter().map(Into::into).collect::<BTreeSet<_>>(),
        };
        let query_id = query_id.into();
        debug!(query = %query_id, schema = %registration.schema_id, "query registered");
        self.state.write().queries.insert(query_id, registration);
    }

    pub fn unregister_query(&self, query_id: &str) -> bool {
        self.state.write().queries.remove(query_id).is_some()
    }

    pub fn get_query_registration(&self, query_id: &str) -> Option<QueryRegistration> {
        self.state.read().queries.get(query_id).cloned()
    }

    /// Effective adapter-side filters for a registered query; `None` if the
    /// query is not registered
    pub fn get_filters_for_query(&self, query_id: &str) -> Option<BTreeMap<String, Value>> {
        let state = self.state.read();
        let registration = state.queries.get(query_id)?;
        Some(
            self.engine
                .filters_for_query(registration, &state.definitions, &state.values),
        )
    }

    pub fn has_binding(&self, filter_id: &str, schema_id: &str) -> bool {
        self.state
            .read()
            .definitions
            .get(filter_id)
            .map_or(false, |d| d.binding(schema_id).is_some())
    }

    /// Every schema some filter is bound to, sorted
    pub fn get_schemas(&self) -> Vec<String> {
        let state = self.state.read();
        state
            .definitions
            .values()
            .flat_map(|d| d.bindings.keys().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn get_definition(&self, filter_id: &str) -> Option<Arc<FilterDefinition>> {
        self.state.read().definitions.get(filter_id).cloned()
    }

    /// All definitions, ordered by id
    pub fn get_all_definitions(&self) -> Vec<Arc<FilterDefinition>> {
        let mut definitions: Vec<_> = self.state.read().definitions.values().cloned().collect();
        definitions.sort_by(|a, b| a.id.cmp(&b.id));
        definitions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::FilterBinding;
    use crate::sources::MemorySource;
    use dv_core::{FilterConfig, ObjectFilterConfig, SchemaBuilder};
    use serde_json::json;

    fn registry() -> Arc<SchemaRegistry> {
        let registry = SchemaRegistry::new();
        registry
            .register(
                SchemaBuilder::new("vendas")
                    .dimension("loja", "Loja")
                    .filter_config(
                        "canal",
                        FilterConfig::Object(ObjectFilterConfig {
                            dimension: "canal".into(),
                            fixed_value: Some(json!("online")),
                            accepts: None,
                            zero_on_conflict: true,
                        }),
                    )
                    .governance_filter("empresa")
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registry
            .register(SchemaBuilder::new("estoque").build().unwrap())
            .unwrap();
        Arc::new(registry)
    }

    fn definitions() -> Vec<FilterDefinition> {
        vec![
            FilterDefinition::new("loja", Value::Null)
                .with_label("Loja")
                .with_option(json!("bdn"), "Bandeirantes")
                .bind(
                    "vendas",
                    FilterBinding::new()
                        .with_to_adapter(|v| json!([v]))
                        .with_from_adapter(|v| v.get(0).cloned().unwrap_or(Value::Null)),
                )
                .bind("estoque", FilterBinding::new()),
            FilterDefinition::new("ano", json!(2024)).bind("vendas", FilterBinding::new()),
            FilterDefinition::new("canal", Value::Null)
                .bind("vendas", FilterBinding::new().with_config("canal")),
            FilterDefinition::new("empresa", json!("acme")).bind("vendas", FilterBinding::new()),
        ]
    }

    fn manager(source: Arc<MemorySource>, config: FilterManagerConfig) -> FilterManager<MemorySource> {
        FilterManager::new(source, registry(), definitions(), config)
    }

    #[tokio::test]
    async fn test_apply_projects_per_schema() {
        let source = Arc::new(MemorySource::new("mock"));
        let filters = manager(source.clone(), FilterManagerConfig::default());

        assert!(filters.apply_filter("loja", json!("bdn")).await.unwrap());
        assert_eq!(filters.get_value("loja"), Some(json!("bdn")));
        assert_eq!(filters.get_value_for_schema("loja", "vendas"), Some(json!(["bdn"])));
        assert_eq!(filters.get_value_for_schema("loja", "estoque"), Some(json!("bdn")));
        assert_eq!(filters.get_value_for_schema("ano", "estoque"), None);

        assert_eq!(source.active_filters("vendas")["loja"], json!(["bdn"]));
        assert_eq!(source.active_filters("estoque")["loja"], json!("bdn"));
        assert_eq!(
            filters.value_from_adapter("loja", "vendas", &json!(["bdn"])),
            Some(json!("bdn"))
        );
    }

    #[tokio::test]
    async fn test_unknown_filter_is_rejected() {
        let source = Arc::new(MemorySource::new("mock"));
        let filters = manager(source.clone(), FilterManagerConfig::default());

        assert!(!filters.apply_filter("nope", json!(1)).await.unwrap());
        assert!(!filters.clear_filter("nope").await.unwrap());
        assert!(source.applied_filters().is_empty());
    }

    #[tokio::test]
    async fn test_conflict_leaves_value_unchanged() {
        let source = Arc::new(MemorySource::new("mock"));
        let filters = manager(source.clone(), FilterManagerConfig::default());

        assert!(!filters.apply_filter("canal", json!("loja_fisica")).await.unwrap());
        assert_eq!(filters.get_value("canal"), Some(Value::Null));
        assert!(source.applied_filters().is_empty());

        assert!(filters.apply_filter("canal", json!("online")).await.unwrap());
        assert_eq!(filters.get_value("canal"), Some(json!("online")));
    }

    #[tokio::test]
    async fn test_apply_filters_is_atomic() {
        let source = Arc::new(MemorySource::new("mock"));
        let filters = manager(source.clone(), FilterManagerConfig::default());

        let applied = filters
            .apply_filters([("loja", json!("bdn")), ("canal", json!("loja_fisica"))])
            .await
            .unwrap();
        assert!(!applied);
        assert_eq!(filters.get_value("loja"), Some(Value::Null));
        assert!(!filters.is_dirty());
        assert!(source.applied_filters().is_empty());
    }

    #[tokio::test]
    async fn test_apply_filters_batches_per_schema() {
        let source = Arc::new(MemorySource::new("mock"));
        let filters = manager(source.clone(), FilterManagerConfig::default());

        let applied = filters
            .apply_filters([("loja", json!("bdn")), ("ano", json!(2023))])
            .await
            .unwrap();
        assert!(applied);

        let calls = source.applied_filters();
        let vendas: Vec<_> = calls.iter().filter(|c| c.schema_id == "vendas").collect();
        assert_eq!(vendas.len(), 2);
        assert!(vendas.iter().all(|c| c.batched));
        // A single filter for a schema goes through the plain call
        let estoque: Vec<_> = calls.iter().filter(|c| c.schema_id == "estoque").collect();
        assert_eq!(estoque.len(), 1);
        assert!(!estoque[0].batched);
    }

    #[tokio::test]
    async fn test_batching_disabled() {
        let source = Arc::new(MemorySource::new("mock"));
        let config = FilterManagerConfig {
            batch_apply: false,
            ..Default::default()
        };
        let filters = manager(source.clone(), config);

        filters
            .apply_filters([("loja", json!("bdn")), ("ano", json!(2023))])
            .await
            .unwrap();
        assert!(source.applied_filters().iter().all(|c| !c.batched));
    }

    #[tokio::test]
    async fn test_adapter_failure_keeps_new_value() {
        let source = Arc::new(MemorySource::new("mock"));
        source.set_fail_filters(true);
        let filters = manager(source.clone(), FilterManagerConfig::default());

        let err = filters.apply_filter("loja", json!("bdn")).await.unwrap_err();
        assert!(matches!(err, DataError::Adapter(_)));
        assert_eq!(filters.get_value("loja"), Some(json!("bdn")));
    }

    #[tokio::test]
    async fn test_clear_and_reset() {
        let source = Arc::new(MemorySource::new("mock"));
        let filters = manager(source.clone(), FilterManagerConfig::default());

        filters.apply_filter("loja", json!("bdn")).await.unwrap();
        filters.apply_filter("ano", json!(2023)).await.unwrap();
        assert!(filters.is_dirty());

        assert!(filters.clear_filter("loja").await.unwrap());
        assert!(!filters.is_active("loja"));
        assert_eq!(source.active_filters("vendas")["loja"], json!([null]));

        filters.reset_all().await.unwrap();
        assert!(!filters.is_dirty());
        assert_eq!(filters.get_value("ano"), Some(json!(2024)));
    }

    #[tokio::test]
    async fn test_active_filters_and_labels() {
        let source = Arc::new(MemorySource::new("mock"));
        let filters = manager(source, FilterManagerConfig::default());

        filters.apply_filter("loja", json!("bdn")).await.unwrap();
        let active = filters.get_active_filters();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].label, "Bandeirantes");
        assert_eq!(active[0].filter_label, "Loja");
    }

    #[tokio::test]
    async fn test_governance_filter_cannot_be_ignored() {
        let source = Arc::new(MemorySource::new("mock"));
        let filters = manager(source, FilterManagerConfig::default());

        filters.apply_filter("loja", json!("bdn")).await.unwrap();
        filters.register_query("ranking", "vendas", ["loja", "empresa"]);

        let effective = filters.get_filters_for_query("ranking").unwrap();
        assert!(!effective.contains_key("loja"));
        assert_eq!(effective["empresa"], json!("acme"));

        assert!(filters.unregister_query("ranking"));
        assert!(filters.get_filters_for_query("ranking").is_none());
    }

    #[tokio::test]
    async fn test_introspection() {
        let source = Arc::new(MemorySource::new("mock"));
        let filters = manager(source, FilterManagerConfig::default());

        assert!(filters.has_binding("loja", "estoque"));
        assert!(!filters.has_binding("ano", "estoque"));
        assert_eq!(filters.get_schemas(), vec!["estoque".to_string(), "vendas".to_string()]);
        assert_eq!(filters.get_all_definitions()[0].id, "ano");
        assert_eq!(filters.get_all_values().len(), 4);

        let replaced = filters.register_filter(FilterDefinition::new("marca", Value::Null));
        assert!(!replaced);
        assert_eq!(filters.get_value("marca"), Some(Value::Null));
    }

    #[tokio::test]
    async fn test_events() {
        let source = Arc::new(MemorySource::new("mock"));
        let filters = manager(source, FilterManagerConfig::default());
        let mut events = filters.subscribe();

        filters.apply_filter("loja", json!("bdn")).await.unwrap();
        filters.clear_filter("loja").await.unwrap();
        filters.reset_all().await.unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            FilterEvent::Changed { filter_id: "loja".into(), value: json!("bdn") }
        );
        assert_eq!(events.recv().await.unwrap(), FilterEvent::Cleared { filter_id: "loja".into() });
        assert_eq!(events.recv().await.unwrap(), FilterEvent::Reset);
    }
}
