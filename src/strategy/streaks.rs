//! Consecutive-class counters fed by every tick.

use crate::stats::{Parity, Side};
use serde::Serialize;

/// Lengths of runs that ended on the latest tick; zero when nothing ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EndedRuns {
    pub even: u32,
    pub odd: u32,
    pub over: u32,
    pub under: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StreakTracker {
    pub consecutive_even: u32,
    pub consecutive_odd: u32,
    pub consecutive_over: u32,
    pub consecutive_under: u32,
    pub last_digit: Option<u8>,
}

impl StreakTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count `digit` and report any opposite-class run it terminated.
    pub fn observe(&mut self, digit: u8, threshold: u8) -> EndedRuns {
        let mut ended = EndedRuns::default();

        match Parity::of(digit) {
            Parity::Even => {
                ended.odd = self.consecutive_odd;
                self.consecutive_even += 1;
                self.consecutive_odd = 0;
            }
            Parity::Odd => {
                ended.even = self.consecutive_even;
                self.consecutive_odd += 1;
                self.consecutive_even = 0;
            }
        }

        match Side::of(digit, threshold) {
            Side::Over => {
                ended.under = self.consecutive_under;
                self.consecutive_over += 1;
                self.consecutive_under = 0;
            }
            Side::Under => {
                ended.over = self.consecutive_over;
                self.consecutive_under += 1;
                self.consecutive_over = 0;
            }
        }

        self.last_digit = Some(digit);
        ended
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reports_odd_run_ending_on_even() {
        let mut tracker = StreakTracker::new();
        assert_eq!(tracker.observe(1, 5), EndedRuns::default());
        tracker.observe(3, 5);
        let ended = tracker.observe(4, 5);
        assert_eq!(ended.odd, 2);
        assert_eq!(ended.even, 0);
        assert_eq!(tracker.consecutive_even, 1);
        assert_eq!(tracker.consecutive_odd, 0);
    }

    #[test]
    fn test_over_under_uses_threshold() {
        let mut tracker = StreakTracker::new();
        tracker.observe(7, 5);
        tracker.observe(9, 5);
        tracker.observe(6, 5);
        // 5 is not strictly above the threshold
        let ended = tracker.observe(5, 5);
        assert_eq!(ended.over, 3);
        assert_eq!(tracker.consecutive_under, 1);
        assert_eq!(tracker.last_digit, Some(5));
    }

    #[test]
    fn test_continuing_run_reports_nothing() {
        let mut tracker = StreakTracker::new();
        tracker.observe(2, 5);
        let ended = tracker.observe(4, 5);
        assert_eq!(ended.odd, 0);
        assert_eq!(tracker.consecutive_even, 2);
    }
}
