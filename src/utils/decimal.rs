//! Decimal arithmetic utilities for stakes, payouts and quotes.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde_json::Value;
use std::str::FromStr;

/// Round a decimal to a specific number of decimal places, half away from zero.
pub fn round_to_precision(value: Decimal, decimals: u32) -> Decimal {
    value.round_dp_with_strategy(decimals, RoundingStrategy::MidpointAwayFromZero)
}

/// Round a stake or price to the two decimal places the service accepts.
pub fn round_stake(value: Decimal) -> Decimal {
    round_to_precision(value, 2)
}

/// Raise `base` to a non-negative integer power by repeated multiplication.
/// `None` once the result leaves the representable range.
pub fn checked_pow_u32(base: Decimal, exponent: u32) -> Option<Decimal> {
    (0..exponent).try_fold(Decimal::ONE, |acc, _| acc.checked_mul(base))
}

/// Share of `count` in `total` as a percentage, zero for an empty total.
pub fn percentage(count: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        count as f64 / total as f64 * 100.0
    }
}

/// Parse a decimal out of a JSON value that may be a number or a string.
///
/// Numbers go through their shortest textual form so `1234.56` stays exact
/// instead of picking up binary floating point noise.
pub fn decimal_from_value(value: &Value) -> Option<Decimal> {
    let text = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().to_string(),
        _ => return None,
    };

    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .ok()
}

/// Number of decimal places implied by a pip size (e.g. `0.001` -> 3).
pub fn pip_scale(pip: Decimal) -> u32 {
    pip.normalize().scale()
}

/// Lossy conversion for display and ratio math.
pub fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}
