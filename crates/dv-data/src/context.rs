//! Dashboard service context
//!
//! Builds every orchestration service once, around a shared adapter and
//! schema registry, and hands them out by handle.

use std::sync::Arc;

use dv_core::{ActionBus, ActionBusConfig, DataAdapter, QueryDefinition, SchemaRegistry};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::filters::{FilterDefinition, FilterManager, FilterManagerConfig};
use crate::query::{QueryManager, QueryManagerConfig, QueryResult};
use crate::DataError;

/// Configuration of every dashboard service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
    pub actions: ActionBusConfig,
    pub queries: QueryManagerConfig,
    pub filters: FilterManagerConfig,
}

/// Shared handles to the dashboard services
pub struct DashboardServices<A: DataAdapter> {
    pub registry: Arc<SchemaRegistry>,
    pub bus: ActionBus,
    pub queries: Arc<QueryManager<A>>,
    pub filters: Arc<FilterManager<A>>,
}

impl<A: DataAdapter> Clone for DashboardServices<A> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            bus: self.bus.clone(),
            queries: self.queries.clone(),
            filters: self.filters.clone(),
        }
    }
}

impl<A: DataAdapter> DashboardServices<A> {
    pub fn new(
        adapter: Arc<A>,
        registry: Arc<SchemaRegistry>,
        filters: Vec<FilterDefinition>,
        config: DashboardConfig,
    ) -> Self {
        info!(
            adapter = adapter.name(),
            schemas = registry.len(),
            "dashboard services starting"
        );

        let queries = Arc::new(QueryManager::new(adapter.clone(), config.queries));
        let filters = Arc::new(FilterManager::new(
            adapter,
            registry.clone(),
            filters,
            config.filters,
        ));

        Self {
            registry,
            bus: ActionBus::new(config.actions),
            queries,
            filters,
        }
    }

    /// Execute a registered query with its current effective filters
    pub async fn query_with_filters(
        &self,
        query_id: &str,
        query: A::Query,
    ) -> Result<QueryResult<A::Output>, DataError> {
        let registration = self
            .filters
            .get_query_registration(query_id)
            .ok_or_else(|| DataError::UnknownQuery(query_id.to_string()))?;
        self.registry.get_or_err(&registration.schema_id)?;

        let filters = self.filters.get_filters_for_query(query_id).unwrap_or_default();
        debug!(query_id, filters = filters.len(), "executing with filters");

        let definition =
            QueryDefinition::new(query_id, registration.schema_id, query).with_filters(filters);
        self.queries.execute(&definition).await
    }
}
