//! Declarative measure descriptions and processing results

use serde::{Deserialize, Serialize};

/// Direction of a variation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Up,
    Down,
    Neutral,
}

impl Trend {
    /// Display class for the trend. Inverted measures (costs) read a rise as
    /// negative.
    pub fn class(self, invert: bool) -> TrendClass {
        match (self, invert) {
            (Trend::Neutral, _) => TrendClass::Neutral,
            (Trend::Up, false) | (Trend::Down, true) => TrendClass::Positive,
            (Trend::Down, false) | (Trend::Up, true) => TrendClass::Negative,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendClass {
    Positive,
    Negative,
    Neutral,
}

/// Built-in display formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatKind {
    Currency,
    Percent,
    #[default]
    Number,
    Compact,
}

impl FormatKind {
    /// Registered formatter name
    pub fn name(self) -> &'static str {
        match self {
            FormatKind::Currency => "currency",
            FormatKind::Percent => "percent",
            FormatKind::Number => "number",
            FormatKind::Compact => "compact",
        }
    }
}

/// Raw numbers for one measure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeasureData {
    pub current: Option<f64>,
    pub previous: Option<f64>,
    pub total: Option<f64>,

    /// Series for aggregate calculators
    pub values: Vec<Option<f64>>,
}

impl MeasureData {
    pub fn new(current: f64) -> Self {
        Self {
            current: Some(current),
            ..Default::default()
        }
    }

    pub fn with_previous(mut self, previous: f64) -> Self {
        self.previous = Some(previous);
        self
    }

    pub fn with_total(mut self, total: f64) -> Self {
        self.total = Some(total);
        self
    }

    pub fn with_values(mut self, values: Vec<Option<f64>>) -> Self {
        self.values = values;
        self
    }
}

/// How a measure is calculated and displayed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeasureSchema {
    pub key: String,
    pub label: String,
    pub format: FormatKind,
    pub decimals: Option<u32>,
    pub with_variation: bool,
    pub with_participation: bool,

    /// A rise is bad news (costs, churn)
    pub invert_trend: bool,

    /// Calculator name; `current` when unset
    pub calculator: Option<String>,

    /// Formatter name overriding `format`
    pub formatter: Option<String>,
}

impl MeasureSchema {
    pub fn new(key: impl Into<String>, format: FormatKind) -> Self {
        let key = key.into();
        Self {
            label: key.clone(),
            key,
            format,
            ..Default::default()
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_decimals(mut self, decimals: u32) -> Self {
        self.decimals = Some(decimals);
        self
    }

    pub fn with_variation(mut self) -> Self {
        self.with_variation = true;
        self
    }

    pub fn with_participation(mut self) -> Self {
        self.with_participation = true;
        self
    }

    pub fn inverted(mut self) -> Self {
        self.invert_trend = true;
        self
    }

    pub fn with_calculator(mut self, name: impl Into<String>) -> Self {
        self.calculator = Some(name.into());
        self
    }

    pub fn with_formatter(mut self, name: impl Into<String>) -> Self {
        self.formatter = Some(name.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariationInfo {
    pub value: Option<f64>,
    pub formatted: String,
    pub trend: Trend,
    pub class: TrendClass,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParticipationInfo {
    pub value: Option<f64>,
    pub formatted: String,
}

/// Display-ready measure
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeasureResult {
    pub key: String,
    pub label: String,
    pub value: Option<f64>,
    pub formatted: String,
    pub variation: Option<VariationInfo>,
    pub participation: Option<ParticipationInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trend_class_inversion() {
        assert_eq!(Trend::Up.class(false), TrendClass::Positive);
        assert_eq!(Trend::Up.class(true), TrendClass::Negative);
        assert_eq!(Trend::Down.class(true), TrendClass::Positive);
        assert_eq!(Trend::Neutral.class(true), TrendClass::Neutral);
    }

    #[test]
    fn test_schema_from_json() {
        let schema: MeasureSchema = serde_json::from_str(
            r#"{"key": "revenue", "format": "currency", "with_variation": true}"#,
        )
        .unwrap();
        assert_eq!(schema.format, FormatKind::Currency);
        assert!(schema.with_variation);
        assert!(!schema.invert_trend);
    }
}
