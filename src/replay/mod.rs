//! Offline replay of recorded ticks.
//!
//! Feeds an `epoch,quote` tick file through the digit statistics and one
//! strategy, trading against the in-process paper service, and reports how
//! the strategy would have fared.

mod data;
mod engine;

pub use data::{TickCsvLoader, TickRow};
pub use engine::{ReplayEngine, ReplayOptions, ReplaySummary};
