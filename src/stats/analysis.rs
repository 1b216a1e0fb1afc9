//! Window-level analysis: entropy, streaks, gaps and high/low split.

use super::digit::{count_digits, rank_order};
use crate::utils::decimal::percentage;
use serde::Serialize;

/// A run of the same digit longer than one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DigitStreak {
    pub digit: u8,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowAnalysis {
    pub total: usize,
    /// Shannon entropy of the digit distribution, in bits (max ~3.32).
    pub entropy: f64,
    pub missing_digits: Vec<u8>,
    pub streaks: Vec<DigitStreak>,
    pub strongest: u8,
    pub weakest: u8,
    /// Percentage point gap between strongest and weakest digit.
    pub gap: f64,
    /// Digits 5-9.
    pub high_pct: f64,
    /// Digits 0-4.
    pub low_pct: f64,
}

impl WindowAnalysis {
    pub fn from_digits(digits: &[u8]) -> Self {
        let total = digits.len();
        let counts = count_digits(digits);
        let order = rank_order(&counts);

        let entropy = counts
            .iter()
            .filter(|c| **c > 0)
            .map(|c| {
                let p = *c as f64 / total as f64;
                -p * p.log2()
            })
            .sum();

        let missing_digits = (0u8..10).filter(|d| counts[*d as usize] == 0).collect();

        let high = digits.iter().filter(|d| **d >= 5).count();
        let (strongest, weakest) = if total == 0 { (0, 0) } else { (order[0], order[9]) };
        let gap = percentage(counts[strongest as usize], total)
            - percentage(counts[weakest as usize], total);

        Self {
            total,
            entropy,
            missing_digits,
            streaks: streaks(digits),
            strongest,
            weakest,
            gap,
            high_pct: percentage(high, total),
            low_pct: percentage(total - high, total),
        }
    }
}

fn streaks(digits: &[u8]) -> Vec<DigitStreak> {
    let mut out = Vec::new();
    let mut iter = digits.iter().copied();
    let Some(mut current) = iter.next() else {
        return out;
    };
    let mut count = 1;
    for digit in iter {
        if digit == current {
            count += 1;
            continue;
        }
        if count > 1 {
            out.push(DigitStreak { digit: current, count });
        }
        current = digit;
        count = 1;
    }
    if count > 1 {
        out.push(DigitStreak { digit: current, count });
    }
    out
}
