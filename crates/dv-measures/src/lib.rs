//! Measure calculation and display formatting
//!
//! Turns raw query numbers into display-ready values: variation against a
//! previous period, participation in a total, locale-aware formatting and
//! trend metadata.

pub mod calculators;
pub mod engine;
pub mod format;
pub mod schema;

use thiserror::Error;

// Re-exports
pub use calculators::CalcOptions;
pub use engine::{Calculator, Formatter, MeasureEngine, MeasureEngineConfig};
pub use format::{FormatOptions, Locale};
pub use schema::{
    FormatKind, MeasureData, MeasureResult, MeasureSchema, ParticipationInfo, Trend, TrendClass,
    VariationInfo,
};

/// Errors raised by the measure engine
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MeasureError {
    #[error("{kind} not registered: {name}")]
    NotRegistered { kind: &'static str, name: String },
}
