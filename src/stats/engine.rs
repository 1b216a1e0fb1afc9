//! Rolling digit statistics over a bounded tick window.

use super::analysis::WindowAnalysis;
use super::digit::{count_digits, extract_last_digit, momentum, rank_order, DigitStat};
use crate::config::StatsConfig;
use crate::utils::decimal::percentage;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::VecDeque;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Parity {
    Even,
    Odd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Side {
    Over,
    Under,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MatchOutcome {
    Match,
    Differ,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
    Rise,
    Fall,
}

impl Parity {
    pub fn of(digit: u8) -> Self {
        if digit % 2 == 0 {
            Parity::Even
        } else {
            Parity::Odd
        }
    }
}

impl Side {
    /// `Over` strictly above the threshold, `Under` otherwise.
    pub fn of(digit: u8, threshold: u8) -> Self {
        if digit > threshold {
            Side::Over
        } else {
            Side::Under
        }
    }
}

/// Qualitative tick histories, newest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Histories {
    pub even_odd: VecDeque<Parity>,
    pub over_under: VecDeque<Side>,
    pub match_differ: VecDeque<MatchOutcome>,
    pub rise_fall: VecDeque<Direction>,
}

impl Histories {
    fn clear(&mut self) {
        self.even_odd.clear();
        self.over_under.clear();
        self.match_differ.clear();
        self.rise_fall.clear();
    }
}

fn push_capped<T>(history: &mut VecDeque<T>, value: T, cap: usize) {
    history.push_front(value);
    history.truncate(cap);
}

/// Derived ratios over the current window, in percent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Percentages {
    pub even: f64,
    pub odd: f64,
    pub over: f64,
    pub under: f64,
    pub matches: f64,
    pub differs: f64,
    pub rise: f64,
    pub fall: f64,
}

/// Read-only view handed to the strategy engine on every tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub digit_stats: [DigitStat; 10],
    pub percentages: Percentages,
    pub window_len: usize,
    pub last_digit: Option<u8>,
    pub current_price: Option<Decimal>,
}

impl StatsSnapshot {
    /// Digit at the given rank (1-based), if the rank exists.
    pub fn digit_at_rank(&self, rank: u8) -> Option<u8> {
        self.digit_stats
            .iter()
            .find(|s| s.rank == rank)
            .map(|s| s.digit)
    }

    pub fn stat(&self, digit: u8) -> Option<&DigitStat> {
        self.digit_stats.get(digit as usize)
    }
}

pub struct DigitStatsEngine {
    config: StatsConfig,
    digits: VecDeque<u8>,
    prices: VecDeque<Decimal>,
    current_price: Option<Decimal>,
    stats: [DigitStat; 10],
    histories: Histories,
}

impl DigitStatsEngine {
    pub fn new(config: StatsConfig) -> Self {
        Self {
            config,
            digits: VecDeque::new(),
            prices: VecDeque::new(),
            current_price: None,
            stats: std::array::from_fn(|d| DigitStat::empty(d as u8)),
            histories: Histories::default(),
        }
    }

    pub fn config(&self) -> &StatsConfig {
        &self.config
    }

    /// Apply new settings and recompute everything from the stored window.
    pub fn set_config(&mut self, config: StatsConfig) {
        debug!(
            capacity = config.window_capacity,
            threshold = config.over_under_threshold,
            target = config.match_differ_digit,
            pip_scale = config.pip_scale,
            "Stats config updated"
        );
        self.config = config;
        self.enforce_capacity();
        self.recompute();
        self.rebuild_histories();
    }

    pub fn set_pip_scale(&mut self, pip_scale: u32) {
        if self.config.pip_scale != pip_scale {
            let mut config = self.config.clone();
            config.pip_scale = pip_scale;
            self.set_config(config);
        }
    }

    pub fn extract_last_digit(&self, price: Decimal) -> u8 {
        extract_last_digit(price, self.config.pip_scale)
    }

    /// Replace the window with `digits` and `prices` (tails kept up to capacity).
    pub fn update(&mut self, digits: &[u8], prices: &[Decimal]) {
        self.digits = digits.iter().copied().filter(|d| *d < 10).collect();
        self.prices = prices.iter().copied().collect();
        self.current_price = prices.last().copied();
        self.enforce_capacity();
        self.recompute();
        self.rebuild_histories();
    }

    /// Load a price history, deriving the digits at the current pip scale.
    pub fn load_history(&mut self, prices: &[Decimal]) {
        let digits: Vec<u8> = prices.iter().map(|p| self.extract_last_digit(*p)).collect();
        self.update(&digits, prices);
    }

    /// Replace the digit window and append one price.
    pub fn update_with_history(&mut self, digits: &[u8], latest_price: Decimal) {
        self.digits = digits.iter().copied().filter(|d| *d < 10).collect();
        self.append_price(latest_price);
        self.enforce_capacity();
        self.recompute();
    }

    /// Append one tick and return its last digit.
    pub fn push_tick(&mut self, price: Decimal) -> u8 {
        let digit = self.extract_last_digit(price);
        self.digits.push_back(digit);
        self.append_price(price);
        self.enforce_capacity();
        self.recompute();
        digit
    }

    pub fn reset(&mut self) {
        self.digits.clear();
        self.prices.clear();
        self.current_price = None;
        self.histories.clear();
        self.recompute();
    }

    pub fn stats(&self) -> &[DigitStat; 10] {
        &self.stats
    }

    pub fn histories(&self) -> &Histories {
        &self.histories
    }

    pub fn window_len(&self) -> usize {
        self.digits.len()
    }

    pub fn digits(&self) -> impl Iterator<Item = u8> + '_ {
        self.digits.iter().copied()
    }

    /// The most recent `k` digits, oldest first.
    pub fn recent_digits(&self, k: usize) -> Vec<u8> {
        let skip = self.digits.len().saturating_sub(k);
        self.digits.iter().skip(skip).copied().collect()
    }

    pub fn last_digit(&self) -> Option<u8> {
        self.digits.back().copied()
    }

    pub fn current_price(&self) -> Option<Decimal> {
        self.current_price
    }

    pub fn percentages(&self) -> Percentages {
        let total = self.digits.len();
        let evens = self.digits.iter().filter(|d| *d % 2 == 0).count();
        let overs = self
            .digits
            .iter()
            .filter(|d| **d > self.config.over_under_threshold)
            .count();
        let matches = self
            .digits
            .iter()
            .filter(|d| **d == self.config.match_differ_digit)
            .count();

        let mut pairs = 0usize;
        let mut rises = 0usize;
        let mut falls = 0usize;
        for (prev, next) in self.prices.iter().zip(self.prices.iter().skip(1)) {
            pairs += 1;
            if next > prev {
                rises += 1;
            } else {
                falls += 1;
            }
        }

        Percentages {
            even: percentage(evens, total),
            odd: percentage(total - evens, total),
            over: percentage(overs, total),
            under: percentage(total - overs, total),
            matches: percentage(matches, total),
            differs: percentage(total - matches, total),
            rise: percentage(rises, pairs),
            fall: percentage(falls, pairs),
        }
    }

    pub fn analysis(&self) -> WindowAnalysis {
        let digits: Vec<u8> = self.digits.iter().copied().collect();
        WindowAnalysis::from_digits(&digits)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            digit_stats: self.stats,
            percentages: self.percentages(),
            window_len: self.digits.len(),
            last_digit: self.last_digit(),
            current_price: self.current_price,
        }
    }

    fn append_price(&mut self, price: Decimal) {
        let previous = self.current_price.replace(price);
        self.prices.push_back(price);

        let cap = self.config.history_len;
        if let Some(previous) = previous {
            let direction = if price > previous {
                Direction::Rise
            } else {
                Direction::Fall
            };
            push_capped(&mut self.histories.rise_fall, direction, cap);
        }
        let digit = self.extract_last_digit(price);
        self.push_digit_histories(digit);
    }

    fn push_digit_histories(&mut self, digit: u8) {
        let cap = self.config.history_len;
        let threshold = self.config.over_under_threshold;
        let target = self.config.match_differ_digit;
        push_capped(&mut self.histories.even_odd, Parity::of(digit), cap);
        push_capped(&mut self.histories.over_under, Side::of(digit, threshold), cap);
        let outcome = if digit == target {
            MatchOutcome::Match
        } else {
            MatchOutcome::Differ
        };
        push_capped(&mut self.histories.match_differ, outcome, cap);
    }

    fn rebuild_histories(&mut self) {
        self.histories.clear();
        let cap = self.config.history_len;

        let skip = self.digits.len().saturating_sub(cap);
        let tail: Vec<u8> = self.digits.iter().skip(skip).copied().collect();
        for digit in tail {
            self.push_digit_histories(digit);
        }

        let skip = self.prices.len().saturating_sub(cap + 1);
        let prices: Vec<Decimal> = self.prices.iter().skip(skip).copied().collect();
        for pair in prices.windows(2) {
            let direction = if pair[1] > pair[0] {
                Direction::Rise
            } else {
                Direction::Fall
            };
            push_capped(&mut self.histories.rise_fall, direction, cap);
        }
    }

    fn enforce_capacity(&mut self) {
        let cap = self.config.window_capacity.max(1);
        while self.digits.len() > cap {
            self.digits.pop_front();
        }
        while self.prices.len() > cap {
            self.prices.pop_front();
        }
    }

    fn recompute(&mut self) {
        let digits: Vec<u8> = self.digits.iter().copied().collect();
        let total = digits.len();
        let counts = count_digits(&digits);
        let order = rank_order(&counts);
        let short = self.config.momentum_short_window;
        let medium = self.config.momentum_medium_window;

        for (position, digit) in order.iter().enumerate() {
            let d = *digit as usize;
            let (power, is_increasing) = momentum(&digits, *digit, short, medium);
            self.stats[d] = DigitStat {
                digit: *digit,
                count: counts[d],
                percentage: percentage(counts[d], total),
                rank: position as u8 + 1,
                power,
                is_increasing,
            };
        }
    }
}
