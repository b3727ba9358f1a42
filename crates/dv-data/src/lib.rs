//! Query and filter orchestration for the dashboard layer

pub mod cache;
pub mod context;
pub mod filters;
pub mod query;
pub mod sources;

use std::sync::Arc;

use dv_core::CoreError;
use thiserror::Error;
use tokio::task::JoinError;

// Re-exports
pub use cache::{CacheEntryInfo, CacheStats};
pub use context::{DashboardConfig, DashboardServices};
pub use filters::{
    ActiveFilterInfo, FilterBinding, FilterConflict, FilterDefinition, FilterEngine, FilterEvent,
    FilterManager, FilterManagerConfig, FilterOption, QueryRegistration,
};
pub use query::{QueryEvent, QueryManager, QueryManagerConfig, QueryResult};
pub use sources::MemorySource;

/// Errors that can occur in query and filter operations.
///
/// Cloneable so that one adapter failure can be handed to every caller
/// coalesced onto the same request.
#[derive(Error, Debug, Clone)]
pub enum DataError {
    #[error("Adapter error: {0}")]
    Adapter(Arc<anyhow::Error>),

    #[error("Query task aborted: {0}")]
    Aborted(String),

    #[error("Query not registered: {0}")]
    UnknownQuery(String),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl DataError {
    pub fn adapter(error: anyhow::Error) -> Self {
        DataError::Adapter(Arc::new(error))
    }
}

impl From<JoinError> for DataError {
    fn from(error: JoinError) -> Self {
        DataError::Aborted(error.to_string())
    }
}
