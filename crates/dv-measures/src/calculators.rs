//! Numeric calculators
//!
//! Degenerate inputs (missing values, zero denominators, empty sets) yield
//! `None` or the caller's fallback. Nothing here panics or returns a
//! non-finite number.

use serde::{Deserialize, Serialize};

use crate::schema::Trend;

/// Calculation options
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CalcOptions {
    /// Round the result, half away from zero
    pub decimals: Option<u32>,
}

impl CalcOptions {
    pub fn decimals(decimals: u32) -> Self {
        Self {
            decimals: Some(decimals),
        }
    }
}

/// Most fraction digits an `f64` can carry meaningfully
pub const MAX_DECIMALS: u32 = 15;

/// Round half away from zero. `decimals` is capped at [`MAX_DECIMALS`].
pub fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals.min(MAX_DECIMALS) as i32);
    let scaled = value * factor;
    if !scaled.is_finite() {
        // Magnitudes this large have no fractional part left to round
        return value;
    }
    scaled.round() / factor
}

fn finish(value: f64, opts: &CalcOptions) -> Option<f64> {
    let value = match opts.decimals {
        Some(decimals) => round_to(value, decimals),
        None => value,
    };
    value.is_finite().then_some(value)
}

/// A single value, rounded per `opts`
pub fn current(value: Option<f64>, opts: &CalcOptions) -> Option<f64> {
    finish(value?, opts)
}

/// Percentage change from `previous` to `current`
pub fn variation(current: Option<f64>, previous: Option<f64>, opts: &CalcOptions) -> Option<f64> {
    let (current, previous) = (current?, previous?);
    if previous == 0.0 {
        return None;
    }
    finish((current - previous) / previous * 100.0, opts)
}

/// Share of `total` represented by `value`, in percent
pub fn participation(value: Option<f64>, total: Option<f64>, opts: &CalcOptions) -> Option<f64> {
    let (value, total) = (value?, total?);
    if total == 0.0 {
        return None;
    }
    finish(value / total * 100.0, opts)
}

/// `numerator / denominator`, or `fallback` when it cannot be computed
pub fn ratio(
    numerator: Option<f64>,
    denominator: Option<f64>,
    opts: &CalcOptions,
    fallback: Option<f64>,
) -> Option<f64> {
    match (numerator, denominator) {
        (Some(n), Some(d)) if d != 0.0 => finish(n / d, opts).or(fallback),
        _ => fallback,
    }
}

/// Sum of the present values; `None` if there are none
pub fn sum(values: &[Option<f64>], opts: &CalcOptions) -> Option<f64> {
    let mut present = values.iter().flatten().peekable();
    present.peek()?;
    finish(present.sum(), opts)
}

/// Mean of the present values; `None` if there are none
pub fn average(values: &[Option<f64>], opts: &CalcOptions) -> Option<f64> {
    let present: Vec<f64> = values.iter().flatten().copied().collect();
    if present.is_empty() {
        return None;
    }
    finish(present.iter().sum::<f64>() / present.len() as f64, opts)
}

/// Mean of `(value, weight)` pairs where both are present; `None` if the
/// total weight is zero
pub fn weighted_average(pairs: &[(Option<f64>, Option<f64>)], opts: &CalcOptions) -> Option<f64> {
    let (weighted, weights) = pairs
        .iter()
        .filter_map(|(value, weight)| Some((value.as_ref()?, weight.as_ref()?)))
        .fold((0.0, 0.0), |(acc, total), (value, weight)| {
            (acc + value * weight, total + weight)
        });
    if weights == 0.0 {
        return None;
    }
    finish(weighted / weights, opts)
}

/// Direction of a variation, with a dead zone of one percentage point
pub fn trend_direction(variation: Option<f64>) -> Trend {
    match variation {
        Some(v) if v > 1.0 => Trend::Up,
        Some(v) if v < -1.0 => Trend::Down,
        _ => Trend::Neutral,
    }
}
