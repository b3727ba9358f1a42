use thiserror::Error;

/// Errors raised by the core registries
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    #[error("Schema not found: {0}")]
    SchemaNotFound(String),

    #[error("Schema already registered: {0}")]
    DuplicateSchema(String),

    #[error("Invalid schema '{schema}': {reason}")]
    InvalidSchema { schema: String, reason: String },
}
