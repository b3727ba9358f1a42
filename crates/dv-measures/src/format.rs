//! Locale-aware number formatting
//!
//! Missing values always render as `"-"`. Rounding is half away from zero,
//! applied before the digits are laid out.

use serde::{Deserialize, Serialize};

use crate::calculators::{round_to, MAX_DECIMALS};

/// Placeholder for values that cannot be displayed
pub const EMPTY: &str = "-";

/// Display locale
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Locale {
    /// Brazilian Portuguese: `1.234,50`, `R$ 1.234,50`, `1,5 mi`
    #[default]
    PtBr,

    /// US English: `1,234.50`, `$1,234.50`, `1.5M`
    EnUs,
}

impl Locale {
    pub fn decimal_separator(self) -> char {
        match self {
            Locale::PtBr => ',',
            Locale::EnUs => '.',
        }
    }

    pub fn group_separator(self) -> char {
        match self {
            Locale::PtBr => '.',
            Locale::EnUs => ',',
        }
    }

    /// Currency symbol including the separator before the amount
    fn currency_prefix(self) -> &'static str {
        match self {
            Locale::PtBr => "R$\u{a0}",
            Locale::EnUs => "$",
        }
    }

    /// Suffixes for thousands, millions, billions and trillions
    fn compact_suffixes(self) -> [&'static str; 4] {
        match self {
            Locale::PtBr => [" mil", " mi", " bi", " tri"],
            Locale::EnUs => ["K", "M", "B", "T"],
        }
    }
}

/// Formatting options
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatOptions {
    pub locale: Locale,

    /// Fraction digits; each format has its own default
    pub decimals: Option<u32>,

    /// Prefix positive values with `+`
    pub show_sign: bool,
}

impl FormatOptions {
    pub fn new(locale: Locale) -> Self {
        Self {
            locale,
            ..Default::default()
        }
    }

    pub fn with_decimals(mut self, decimals: u32) -> Self {
        self.decimals = Some(decimals);
        self
    }

    pub fn with_sign(mut self) -> Self {
        self.show_sign = true;
        self
    }
}

/// Sign and grouped digits of a rounded value
fn layout(value: f64, decimals: u32, locale: Locale) -> (&'static str, String) {
    let decimals = decimals.min(MAX_DECIMALS);
    let rounded = round_to(value, decimals);
    let digits = format!("{:.*}", decimals as usize, rounded.abs());
    let (integer, fraction) = match digits.split_once('.') {
        Some((integer, fraction)) => (integer, Some(fraction)),
        None => (digits.as_str(), None),
    };

    let mut grouped = String::with_capacity(digits.len() + integer.len() / 3);
    for (i, c) in integer.chars().enumerate() {
        if i > 0 && (integer.len() - i) % 3 == 0 {
            grouped.push(locale.group_separator());
        }
        grouped.push(c);
    }
    if let Some(fraction) = fraction {
        grouped.push(locale.decimal_separator());
        grouped.push_str(fraction);
    }

    let sign = if rounded < 0.0 {
        "-"
    } else if rounded > 0.0 {
        "+"
    } else {
        ""
    };
    (sign, grouped)
}

fn sign_for(sign: &'static str, opts: &FormatOptions) -> &'static str {
    match sign {
        "+" if !opts.show_sign => "",
        other => other,
    }
}

/// Plain number, 0 decimals by default: `1.234`
pub fn format_number(value: Option<f64>, opts: &FormatOptions) -> String {
    let Some(value) = value.filter(|v| v.is_finite()) else {
        return EMPTY.to_string();
    };
    let (sign, digits) = layout(value, opts.decimals.unwrap_or(0), opts.locale);
    format!("{}{}", sign_for(sign, opts), digits)
}

/// Currency, 2 decimals by default: `R$ 1.234,50`, `-$1,234.50`
pub fn format_currency(value: Option<f64>, opts: &FormatOptions) -> String {
    let Some(value) = value.filter(|v| v.is_finite()) else {
        return EMPTY.to_string();
    };
    let (sign, digits) = layout(value, opts.decimals.unwrap_or(2), opts.locale);
    format!("{}{}{}", sign_for(sign, opts), opts.locale.currency_prefix(), digits)
}

/// Percentage of a value already in percent units, 1 decimal by default:
/// `25,0%`
pub fn format_percent(value: Option<f64>, opts: &FormatOptions) -> String {
    let Some(value) = value.filter(|v| v.is_finite()) else {
        return EMPTY.to_string();
    };
    let (sign, digits) = layout(value, opts.decimals.unwrap_or(1), opts.locale);
    format!("{}{}%", sign_for(sign, opts), digits)
}

/// Abbreviated magnitude with at most one decimal: `1,5 mi`, `12K`
pub fn format_compact(value: Option<f64>, opts: &FormatOptions) -> String {
    let Some(value) = value.filter(|v| v.is_finite()) else {
        return EMPTY.to_string();
    };

    let decimals = opts.decimals.unwrap_or(1).min(1);
    let suffixes = opts.locale.compact_suffixes();
    let magnitude = value.abs();

    let mut tier = None;
    for (index, threshold) in [1e3, 1e6, 1e9, 1e12].into_iter().enumerate() {
        if magnitude >= threshold {
            tier = Some((index, threshold));
        }
    }
    // 999.7 rounds to 1000, which belongs to the first tier
    if tier.is_none() && round_to(magnitude, 0) >= 1e3 {
        tier = Some((0, 1e3));
    }
    let Some((mut index, mut threshold)) = tier else {
        return format_number(Some(value), &FormatOptions { decimals: Some(0), ..*opts });
    };

    // 999.96K rounds to 1000K; show it as 1M instead
    if round_to(magnitude / threshold, decimals) >= 1000.0 && index + 1 < suffixes.len() {
        index += 1;
        threshold *= 1000.0;
    }

    let (sign, digits) = layout(value / threshold, decimals, opts.locale);
    let zero_fraction = format!("{}0", opts.locale.decimal_separator());
    let digits = digits.strip_suffix(&zero_fraction).unwrap_or(&digits);
    format!("{}{}{}", sign_for(sign, opts), digits, suffixes[index])
}
