//! Digit statistics over the tick stream.
//!
//! Every tick is reduced to the last digit of its quote at the instrument's
//! pip scale. The engine keeps a bounded FIFO window of those digits and
//! recomputes counts, ranks and momentum from scratch on each update.

mod analysis;
mod digit;
mod engine;
mod predictor;

pub use analysis::{DigitStreak, WindowAnalysis};
pub use digit::{extract_last_digit, extract_last_digit_text, rank_order, DigitStat};
pub use engine::{
    DigitStatsEngine, Direction, Histories, MatchOutcome, Parity, Percentages, Side,
    StatsSnapshot,
};
pub use predictor::{DigitPredictor, DigitProbability, Prediction};
