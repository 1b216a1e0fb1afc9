//! Last-digit extraction and per-digit statistics.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use std::str::FromStr;

/// Last digit of `price` written with exactly `pip_scale` decimals.
///
/// Trailing zeros count: `100.10` at scale 2 yields `0`, at scale 3 also `0`.
pub fn extract_last_digit(price: Decimal, pip_scale: u32) -> u8 {
    let mut fixed = price.round_dp_with_strategy(pip_scale, RoundingStrategy::MidpointAwayFromZero);
    fixed.rescale(pip_scale);
    (fixed.mantissa().unsigned_abs() % 10) as u8
}

/// Text variant for untyped input. Non-numeric text yields the sentinel `0`.
pub fn extract_last_digit_text(text: &str, pip_scale: u32) -> u8 {
    let text = text.trim();
    Decimal::from_str(text)
        .or_else(|_| Decimal::from_scientific(text))
        .map(|price| extract_last_digit(price, pip_scale))
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DigitStat {
    pub digit: u8,
    pub count: usize,
    pub percentage: f64,
    /// 1 = most frequent, 10 = least frequent.
    pub rank: u8,
    /// Momentum score in `[0, 100]`; 50 is neutral.
    pub power: f64,
    pub is_increasing: bool,
}

impl DigitStat {
    pub fn empty(digit: u8) -> Self {
        Self {
            digit,
            count: 0,
            percentage: 0.0,
            rank: digit + 1,
            power: 50.0,
            is_increasing: false,
        }
    }
}

/// Digits ordered by count descending; ties keep the lower digit first.
pub fn rank_order(counts: &[usize; 10]) -> [u8; 10] {
    let mut order: [u8; 10] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9];
    order.sort_by(|a, b| counts[*b as usize].cmp(&counts[*a as usize]));
    order
}

/// Occurrences of each digit.
pub fn count_digits<'a, I>(digits: I) -> [usize; 10]
where
    I: IntoIterator<Item = &'a u8>,
{
    let mut counts = [0usize; 10];
    for &d in digits {
        if let Some(slot) = counts.get_mut(d as usize) {
            *slot += 1;
        }
    }
    counts
}

/// Momentum of `digit`: occurrences in the last `short` ticks versus the
/// medium-window rate scaled down to the short window length.
pub fn momentum(digits: &[u8], digit: u8, short: usize, medium: usize) -> (f64, bool) {
    let recent = digits
        .iter()
        .rev()
        .take(short)
        .filter(|d| **d == digit)
        .count() as f64;
    let medium_count = digits
        .iter()
        .rev()
        .take(medium)
        .filter(|d| **d == digit)
        .count() as f64;
    let baseline = if medium == 0 {
        0.0
    } else {
        medium_count * short as f64 / medium as f64
    };
    let power = (50.0 + (recent - baseline) * 10.0).clamp(0.0, 100.0);
    (power, recent > baseline)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_extract_keeps_trailing_zeros() {
        assert_eq!(extract_last_digit(dec!(1234.56), 2), 6);
        assert_eq!(extract_last_digit(dec!(1234.5), 2), 0);
        assert_eq!(extract_last_digit(dec!(100), 2), 0);
        assert_eq!(extract_last_digit(dec!(987.1234), 3), 3);
        assert_eq!(extract_last_digit(dec!(0.125), 2), 3);
        assert_eq!(extract_last_digit(dec!(-45.67), 2), 7);
    }

    #[test]
    fn test_text_sentinel() {
        assert_eq!(extract_last_digit_text("502.19", 2), 9);
        assert_eq!(extract_last_digit_text(" 7.1 ", 3), 0);
        assert_eq!(extract_last_digit_text("n/a", 2), 0);
        assert_eq!(extract_last_digit_text("", 2), 0);
    }

    #[test]
    fn test_rank_order_breaks_ties_by_digit() {
        let counts = count_digits(&[2, 2, 4, 6, 8, 1, 3, 5, 7, 9, 9]);
        let order = rank_order(&counts);
        assert_eq!(order[0], 2);
        assert_eq!(order[1], 9);
        assert_eq!(order[2], 1);
        assert_eq!(order[9], 0);
    }

    #[test]
    fn test_momentum_is_clamped() {
        let digits = vec![3u8; 10];
        let (power, increasing) = momentum(&digits, 3, 10, 50);
        // 10 recent against a baseline of 2 saturates.
        assert_eq!(power, 100.0);
        assert!(increasing);

        let (power, increasing) = momentum(&digits, 4, 10, 50);
        assert_eq!(power, 50.0);
        assert!(!increasing);
    }
}
