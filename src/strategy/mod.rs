//! Strategy decision engine.
//!
//! Contains:
//! - Strategy kinds and their staking configuration
//! - Trigger policies evaluated against the digit statistics
//! - The per-strategy state machine with stake sizing and stop conditions
//! - Trade execution and settlement polling

mod config;
mod engine;
mod error;
mod executor;
mod journal;
mod kind;
mod policy;
mod runner;
mod streaks;

pub use config::{ConfigUpdate, StrategyConfig};
pub use engine::{
    BusyFlag, BusyGuard, DecisionEngine, EngineSnapshot, StrategyStatus, StrategyView,
    TradeResult, TradeTicket,
};
pub use error::{StrategyError, TradeError};
pub use executor::{TradeExecutor, TradeOrder, TradeOutcome};
pub use journal::{Journal, JournalEntry, JournalKind, JOURNAL_CAPACITY};
pub use kind::StrategyKind;
pub use policy::{policy_for, Signal, StrategyPolicy, TickContext};
pub use runner::StrategyRunner;
pub use streaks::{EndedRuns, StreakTracker};
