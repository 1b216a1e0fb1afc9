//! Deterministic next-digit heuristic.
//!
//! Scores every digit from four weighted signals over the last N digits:
//! overall frequency (30), frequency in the last 10 (25), how often it
//! followed the current last digit (20) and an absence bonus (8 if missing
//! from the last 10, else 2).

use serde::Serialize;
use std::collections::VecDeque;

const MIN_SAMPLES: usize = 20;
const RECENT: usize = 10;

const FREQUENCY_WEIGHT: f64 = 30.0;
const RECENT_WEIGHT: f64 = 25.0;
const TRANSITION_WEIGHT: f64 = 20.0;
const TRANSITION_FALLBACK: f64 = 2.0;
const ABSENT_BONUS: f64 = 8.0;
const PRESENT_BONUS: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DigitProbability {
    pub digit: u8,
    pub probability: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    /// All digits, most likely first.
    pub ranked: Vec<DigitProbability>,
    pub top: DigitProbability,
    pub second: DigitProbability,
    pub explanation: String,
}

impl Prediction {
    /// Rounded confidence of the top pick, in percent.
    pub fn confidence(&self) -> u8 {
        self.top.probability.round().clamp(0.0, 100.0) as u8
    }
}

#[derive(Debug, Clone)]
pub struct DigitPredictor {
    history: VecDeque<u8>,
    capacity: usize,
}

impl DigitPredictor {
    pub fn new(capacity: usize) -> Self {
        Self {
            history: VecDeque::with_capacity(capacity),
            capacity: capacity.max(MIN_SAMPLES),
        }
    }

    pub fn push(&mut self, digit: u8) {
        if digit > 9 {
            return;
        }
        self.history.push_back(digit);
        while self.history.len() > self.capacity {
            self.history.pop_front();
        }
    }

    /// Replace the history with the tail of `digits`.
    pub fn load(&mut self, digits: &[u8]) {
        self.history.clear();
        let skip = digits.len().saturating_sub(self.capacity);
        for &digit in &digits[skip..] {
            self.push(digit);
        }
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }

    pub fn predict(&self) -> Option<Prediction> {
        let len = self.history.len();
        if len < MIN_SAMPLES {
            return None;
        }
        let last = *self.history.back()?;

        let mut frequency = [0usize; 10];
        for &d in &self.history {
            frequency[d as usize] += 1;
        }

        let recent_len = len.min(RECENT);
        let mut recent = [0usize; 10];
        for &d in self.history.iter().skip(len - recent_len) {
            recent[d as usize] += 1;
        }

        let mut transitions = [0usize; 10];
        let mut transition_total = 0usize;
        for (current, next) in self.history.iter().zip(self.history.iter().skip(1)) {
            if *current == last {
                transitions[*next as usize] += 1;
                transition_total += 1;
            }
        }

        let scores: Vec<f64> = (0..10)
            .map(|d| {
                let freq = frequency[d] as f64 / len as f64 * FREQUENCY_WEIGHT;
                let rec = recent[d] as f64 / recent_len as f64 * RECENT_WEIGHT;
                let trans = if transition_total > 0 {
                    transitions[d] as f64 / transition_total as f64 * TRANSITION_WEIGHT
                } else {
                    TRANSITION_FALLBACK
                };
                let absence = if recent[d] == 0 { ABSENT_BONUS } else { PRESENT_BONUS };
                freq + rec + trans + absence
            })
            .collect();
        let total: f64 = scores.iter().sum();

        let mut ranked: Vec<DigitProbability> = scores
            .iter()
            .enumerate()
            .map(|(d, score)| DigitProbability {
                digit: d as u8,
                probability: score / total * 100.0,
            })
            .collect();
        ranked.sort_by(|a, b| b.probability.total_cmp(&a.probability));

        let top = ranked[0];
        let second = ranked[1];
        let explanation = format!(
            "Model favors digit {} at {:.1}% based on historical frequency and transition patterns after {}.",
            top.digit, top.probability, last
        );
        Some(Prediction {
            ranked,
            top,
            second,
            explanation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_needs_minimum_samples() {
        let mut predictor = DigitPredictor::new(100);
        for d in 0..19u8 {
            predictor.push(d % 10);
        }
        assert!(predictor.predict().is_none());
        predictor.push(3);
        assert!(predictor.predict().is_some());
    }

    #[test]
    fn test_is_deterministic_and_normalised() {
        let mut predictor = DigitPredictor::new(100);
        let digits: Vec<u8> = (0..40).map(|i| if i % 3 == 0 { 7 } else { (i % 10) as u8 }).collect();
        predictor.load(&digits);

        let first = predictor.predict().unwrap();
        let second = predictor.predict().unwrap();
        assert_eq!(first, second);

        let sum: f64 = first.ranked.iter().map(|p| p.probability).sum();
        assert!((sum - 100.0).abs() < 1e-9);
        assert_eq!(first.top.digit, 7);
        assert!(first.top.probability >= first.second.probability);
    }

    #[test]
    fn test_capacity_is_enforced() {
        let mut predictor = DigitPredictor::new(25);
        for i in 0..60u8 {
            predictor.push(i % 10);
        }
        assert_eq!(predictor.len(), 25);
    }
}
