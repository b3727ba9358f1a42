//! Measure engine: named calculators and formatters plus measure processing

use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::calculators::{self, CalcOptions};
use crate::format::{self, FormatOptions, Locale};
use crate::schema::{
    MeasureData, MeasureResult, MeasureSchema, ParticipationInfo, Trend, VariationInfo,
};
use crate::MeasureError;

/// Named calculation over a measure's raw numbers
pub type Calculator = Arc<dyn Fn(&MeasureData, &CalcOptions) -> Option<f64> + Send + Sync>;

/// Named value formatter
pub type Formatter = Arc<dyn Fn(Option<f64>, &FormatOptions) -> String + Send + Sync>;

/// Measure engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MeasureEngineConfig {
    pub locale: Locale,

    /// Fraction digits used when a measure does not set its own
    pub default_decimals: Option<u32>,
}

/// Registry of calculators and formatters
pub struct MeasureEngine {
    config: MeasureEngineConfig,
    calculators: RwLock<AHashMap<String, Calculator>>,
    formatters: RwLock<AHashMap<String, Formatter>>,
}

impl Default for MeasureEngine {
    fn default() -> Self {
        Self::new(MeasureEngineConfig::default())
    }
}

impl MeasureEngine {
    /// Create an engine with the built-in calculators and formatters
    pub fn new(config: MeasureEngineConfig) -> Self {
        let engine = Self {
            config,
            calculators: RwLock::new(AHashMap::new()),
            formatters: RwLock::new(AHashMap::new()),
        };

        engine.register_calculator("current", |data, opts| calculators::current(data.current, opts));
        engine.register_calculator("variation", |data, opts| {
            calculators::variation(data.current, data.previous, opts)
        });
        engine.register_calculator("participation", |data, opts| {
            calculators::participation(data.current, data.total, opts)
        });
        engine.register_calculator("sum", |data, opts| calculators::sum(&data.values, opts));
        engine.register_calculator("average", |data, opts| {
            calculators::average(&data.values, opts)
        });

        engine.register_formatter("currency", format::format_currency);
        engine.register_formatter("percent", format::format_percent);
        engine.register_formatter("number", format::format_number);
        engine.register_formatter("compact", format::format_compact);

        engine
    }

    pub fn config(&self) -> &MeasureEngineConfig {
        &self.config
    }

    /// Add or replace a calculator
    pub fn register_calculator<F>(&self, name: impl Into<String>, calculator: F)
    where
        F: Fn(&MeasureData, &CalcOptions) -> Option<f64> + Send + Sync + 'static,
    {
        let name = name.into();
        debug!(calculator = %name, "registering calculator");
        self.calculators.write().insert(name, Arc::new(calculator));
    }

    /// Add or replace a formatter
    pub fn register_formatter<F>(&self, name: impl Into<String>, formatter: F)
    where
        F: Fn(Option<f64>, &FormatOptions) -> String + Send + Sync + 'static,
    {
        let name = name.into();
        debug!(formatter = %name, "registering formatter");
        self.formatters.write().insert(name, Arc::new(formatter));
    }

    pub fn has_calculator(&self, name: &str) -> bool {
        self.calculators.read().contains_key(name)
    }

    pub fn has_formatter(&self, name: &str) -> bool {
        self.formatters.read().contains_key(name)
    }

    /// Run a calculator by name
    pub fn calculate(
        &self,
        name: &str,
        data: &MeasureData,
        opts: &CalcOptions,
    ) -> Result<Option<f64>, MeasureError> {
        // Clone out so user code never runs under the registry lock
        let calculator = self
            .calculators
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| MeasureError::NotRegistered {
                kind: "calculator",
                name: name.to_string(),
            })?;
        Ok(calculator(data, opts))
    }

    /// Run a formatter by name
    pub fn format(
        &self,
        name: &str,
        value: Option<f64>,
        opts: &FormatOptions,
    ) -> Result<String, MeasureError> {
        let formatter = self
            .formatters
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| MeasureError::NotRegistered {
                kind: "formatter",
                name: name.to_string(),
            })?;
        Ok(formatter(value, opts))
    }

    /// Format options in the engine's locale
    pub fn format_options(&self, decimals: Option<u32>) -> FormatOptions {
        FormatOptions {
            locale: self.config.locale,
            decimals: decimals.or(self.config.default_decimals),
            show_sign: false,
        }
    }

    pub fn variation(&self, current: Option<f64>, previous: Option<f64>, opts: &CalcOptions) -> Option<f64> {
        calculators::variation(current, previous, opts)
    }

    pub fn participation(&self, value: Option<f64>, total: Option<f64>, opts: &CalcOptions) -> Option<f64> {
        calculators::participation(value, total, opts)
    }

    pub fn ratio(
        &self,
        numerator: Option<f64>,
        denominator: Option<f64>,
        opts: &CalcOptions,
        fallback: Option<f64>,
    ) -> Option<f64> {
        calculators::ratio(numerator, denominator, opts, fallback)
    }

    pub fn sum(&self, values: &[Option<f64>], opts: &CalcOptions) -> Option<f64> {
        calculators::sum(values, opts)
    }

    pub fn average(&self, values: &[Option<f64>], opts: &CalcOptions) -> Option<f64> {
        calculators::average(values, opts)
    }

    pub fn weighted_average(&self, pairs: &[(Option<f64>, Option<f64>)], opts: &CalcOptions) -> Option<f64> {
        calculators::weighted_average(pairs, opts)
    }

    pub fn format_currency(&self, value: Option<f64>, decimals: Option<u32>) -> String {
        format::format_currency(value, &self.format_options(decimals))
    }

    pub fn format_percent(&self, value: Option<f64>, decimals: Option<u32>) -> String {
        format::format_percent(value, &self.format_options(decimals))
    }

    pub fn format_number(&self, value: Option<f64>, decimals: Option<u32>) -> String {
        format::format_number(value, &self.format_options(decimals))
    }

    pub fn format_compact(&self, value: Option<f64>) -> String {
        format::format_compact(value, &self.format_options(None))
    }

    pub fn get_trend_direction(&self, variation: Option<f64>) -> Trend {
        calculators::trend_direction(variation)
    }

    /// Calculate, format and annotate one measure
    pub fn process(&self, data: &MeasureData, schema: &MeasureSchema) -> Result<MeasureResult, MeasureError> {
        let calculator = schema.calculator.as_deref().unwrap_or("current");
        let value = self.calculate(calculator, data, &CalcOptions::default())?;

        let formatter = schema.formatter.as_deref().unwrap_or(schema.format.name());
        let formatted = self.format(formatter, value, &self.format_options(schema.decimals))?;

        let variation = schema.with_variation.then(|| {
            let value = calculators::variation(value, data.previous, &CalcOptions::default());
            let trend = calculators::trend_direction(value);
            VariationInfo {
                value,
                formatted: format::format_percent(value, &self.format_options(None).with_sign()),
                trend,
                class: trend.class(schema.invert_trend),
            }
        });

        let participation = schema.with_participation.then(|| {
            let value = calculators::participation(value, data.total, &CalcOptions::default());
            ParticipationInfo {
                value,
                formatted: format::format_percent(value, &self.format_options(None)),
            }
        });

        Ok(MeasureResult {
            key: schema.key.clone(),
            label: schema.label.clone(),
            value,
            formatted,
            variation,
            participation,
        })
    }

    /// Process measures in order; the first unknown calculator or formatter
    /// fails the batch
    pub fn process_batch(
        &self,
        measures: &[(MeasureData, MeasureSchema)],
    ) -> Result<Vec<MeasureResult>, MeasureError> {
        measures
            .iter()
            .map(|(data, schema)| self.process(data, schema))
            .collect()
    }
}
