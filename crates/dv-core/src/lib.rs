//! Core functionality for the dashboard orchestration layer
//!
//! This crate provides the fundamental abstractions shared by the query,
//! filter and measure services: the data adapter contract, the action bus
//! and the schema registry.

pub mod data;
pub mod error;
pub mod events;
pub mod schema;

// Re-export commonly used types
pub use data::{DataAdapter, FilterTarget, QueryDefinition};
pub use error::CoreError;
pub use events::{
    Action, ActionBus, ActionBusConfig, ActionResult, GuardMiddleware, LoggingMiddleware,
    Middleware, Next, Priority, Subscription,
};
pub use schema::{
    Category, Dimension, FilterConfig, Measure, ObjectFilterConfig, Schema, SchemaBuilder,
    SchemaRegistry, SimpleFilterConfig,
};

/// Cancellation token handed to action handlers
pub use tokio_util::sync::CancellationToken;
