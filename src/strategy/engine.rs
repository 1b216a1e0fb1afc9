//! The decision engine: one state machine per strategy kind.
//!
//! Every tick updates the streak counters. If a strategy is running and has
//! no trade in flight, its policy is consulted; a fired policy yields a
//! [`TradeTicket`] holding the strategy's busy guard. The caller performs
//! the asynchronous trade and reports back through
//! [`DecisionEngine::handle_outcome`] or [`DecisionEngine::handle_failure`].

use super::config::{ConfigUpdate, StrategyConfig};
use super::error::{StrategyError, TradeError};
use super::executor::{TradeOrder, TradeOutcome};
use super::journal::{Journal, JournalEntry};
use super::kind::StrategyKind;
use super::policy::{policy_for, StrategyPolicy, TickContext};
use super::streaks::StreakTracker;
use crate::config::{StrategiesConfig, TriggerConfig};
use crate::exchange::ContractKind;
use crate::stats::StatsSnapshot;
use crate::utils::decimal::{checked_pow_u32, round_stake};
use rust_decimal::Decimal;
use serde::{Serialize, Serializer};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrategyStatus {
    Idle,
    Running,
    Stopped,
    Trading(ContractKind),
    Error(String),
    TakeProfitHit,
    MaxLossHit,
    MaxRunsReached,
    SwitchedTo(StrategyKind),
}

impl StrategyStatus {
    /// Stops caused by a risk limit rather than the user.
    pub fn is_limit_stop(&self) -> bool {
        matches!(
            self,
            StrategyStatus::TakeProfitHit | StrategyStatus::MaxLossHit | StrategyStatus::MaxRunsReached
        )
    }
}

impl fmt::Display for StrategyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyStatus::Idle => f.write_str("IDLE"),
            StrategyStatus::Running => f.write_str("RUNNING"),
            StrategyStatus::Stopped => f.write_str("STOPPED"),
            StrategyStatus::Trading(contract) => write!(f, "TRADING: {}", contract),
            StrategyStatus::Error(message) => write!(f, "ERROR: {}", message),
            StrategyStatus::TakeProfitHit => f.write_str("TAKE PROFIT HIT"),
            StrategyStatus::MaxLossHit => f.write_str("MAX LOSS HIT"),
            StrategyStatus::MaxRunsReached => f.write_str("MAX RUNS REACHED"),
            StrategyStatus::SwitchedTo(kind) => {
                write!(f, "SWITCHED TO {}", kind.as_str().to_ascii_uppercase())
            }
        }
    }
}

impl Serialize for StrategyStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeResult {
    Win,
    Loss,
}

/// In-flight marker for one strategy.
///
/// Each acquisition gets a fresh generation; a guard only clears the flag
/// while it still holds its own generation, so releasing twice or releasing
/// a stale guard is harmless.
#[derive(Debug, Default)]
pub struct BusyFlag {
    holder: AtomicU64,
    next: AtomicU64,
}

impl BusyFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_busy(&self) -> bool {
        self.holder.load(Ordering::SeqCst) != 0
    }

    pub fn try_acquire(self: &Arc<Self>) -> Option<BusyGuard> {
        let generation = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        self.holder
            .compare_exchange(0, generation, Ordering::SeqCst, Ordering::SeqCst)
            .ok()?;
        Some(BusyGuard {
            flag: Arc::clone(self),
            generation,
            released: false,
        })
    }

    fn release(&self, generation: u64) -> bool {
        self.holder
            .compare_exchange(generation, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// Holds a strategy's busy flag; dropping it releases the flag.
#[derive(Debug)]
pub struct BusyGuard {
    flag: Arc<BusyFlag>,
    generation: u64,
    released: bool,
}

impl BusyGuard {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Clear the flag. Returns `false` if this guard already released it or
    /// no longer owns it.
    pub fn release(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        self.flag.release(self.generation)
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// A fired trigger, ready to be executed.
#[derive(Debug)]
pub struct TradeTicket {
    pub kind: StrategyKind,
    pub order: TradeOrder,
    pub guard: BusyGuard,
}

struct StrategyState {
    config: StrategyConfig,
    status: StrategyStatus,
    journal: Journal,
    policy: Box<dyn StrategyPolicy>,
    busy: Arc<BusyFlag>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyView {
    pub kind: StrategyKind,
    pub config: StrategyConfig,
    pub status: StrategyStatus,
    pub busy: bool,
    pub journal: Vec<JournalEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineSnapshot {
    pub active: Option<StrategyKind>,
    pub session_profit: Decimal,
    pub total_profit: Decimal,
    pub loss_streak: u32,
    pub last_result: Option<TradeResult>,
    pub streaks: StreakTracker,
    pub strategies: Vec<StrategyView>,
}

pub struct DecisionEngine {
    states: Vec<StrategyState>,
    active: Option<StrategyKind>,
    streaks: StreakTracker,
    over_under_threshold: u8,
    session_profit: Decimal,
    total_profit: Decimal,
    loss_streak: u32,
    last_result: Option<TradeResult>,
}

impl DecisionEngine {
    pub fn new(
        strategies: &StrategiesConfig,
        triggers: &TriggerConfig,
        over_under_threshold: u8,
    ) -> Self {
        let states = StrategyKind::ALL
            .iter()
            .map(|kind| {
                let policy = policy_for(*kind, triggers);
                debug_assert_eq!(policy.kind(), *kind);
                StrategyState {
                    config: StrategyConfig {
                        is_running: false,
                        ..strategies.for_kind(*kind).clone()
                    },
                    status: StrategyStatus::Idle,
                    journal: Journal::new(*kind),
                    policy,
                    busy: Arc::new(BusyFlag::new()),
                }
            })
            .collect();

        Self {
            states,
            active: None,
            streaks: StreakTracker::new(),
            over_under_threshold,
            session_profit: Decimal::ZERO,
            total_profit: Decimal::ZERO,
            loss_streak: 0,
            last_result: None,
        }
    }

    fn state(&self, kind: StrategyKind) -> &StrategyState {
        &self.states[kind.index()]
    }

    fn state_mut(&mut self, kind: StrategyKind) -> &mut StrategyState {
        &mut self.states[kind.index()]
    }

    pub fn active(&self) -> Option<StrategyKind> {
        self.active
    }

    pub fn config(&self, kind: StrategyKind) -> &StrategyConfig {
        &self.state(kind).config
    }

    pub fn status(&self, kind: StrategyKind) -> &StrategyStatus {
        &self.state(kind).status
    }

    pub fn journal(&self, kind: StrategyKind) -> &Journal {
        &self.state(kind).journal
    }

    pub fn is_busy(&self, kind: StrategyKind) -> bool {
        self.state(kind).busy.is_busy()
    }

    pub fn session_profit(&self) -> Decimal {
        self.session_profit
    }

    pub fn total_profit(&self) -> Decimal {
        self.total_profit
    }

    pub fn loss_streak(&self) -> u32 {
        self.loss_streak
    }

    pub fn last_result(&self) -> Option<TradeResult> {
        self.last_result
    }

    pub fn streaks(&self) -> &StreakTracker {
        &self.streaks
    }

    pub fn set_over_under_threshold(&mut self, threshold: u8) {
        self.over_under_threshold = threshold;
    }

    /// Start `kind` if idle (stopping any other strategy first), or stop it
    /// if running. Returns whether `kind` is now running.
    pub fn toggle(&mut self, kind: StrategyKind) -> bool {
        if self.state(kind).config.is_running {
            self.stop(kind, StrategyStatus::Stopped);
            self.state_mut(kind).journal.info("Strategy stopped.");
            return false;
        }

        for other in StrategyKind::ALL {
            if other != kind && self.state(other).config.is_running {
                self.stop(other, StrategyStatus::Stopped);
                self.state_mut(other)
                    .journal
                    .info(format!("Stopped in favour of {}.", kind));
            }
        }
        self.start(kind);
        true
    }

    fn start(&mut self, kind: StrategyKind) {
        self.session_profit = Decimal::ZERO;
        self.loss_streak = 0;
        self.last_result = None;
        self.active = Some(kind);

        let state = self.state_mut(kind);
        state.config.is_running = true;
        state.config.runs_count = 0;
        state.status = StrategyStatus::Running;
        let stake = state.config.stake;
        state
            .journal
            .info(format!("Strategy started. Base stake ${:.2}.", stake));
    }

    fn stop(&mut self, kind: StrategyKind, status: StrategyStatus) {
        let state = self.state_mut(kind);
        state.config.is_running = false;
        state.status = status;
        if self.active == Some(kind) {
            self.active = None;
        }
    }

    /// Stop every running strategy, recording `status` on each.
    pub fn stop_all(&mut self, status: StrategyStatus) {
        for kind in StrategyKind::ALL {
            if self.state(kind).config.is_running {
                self.stop(kind, status.clone());
            }
        }
        self.active = None;
    }

    pub fn update_config(
        &mut self,
        kind: StrategyKind,
        update: &ConfigUpdate,
    ) -> Result<(), StrategyError> {
        update.apply(&mut self.state_mut(kind).config)?;
        debug!(strategy = %kind, ?update, "Strategy config updated");
        Ok(())
    }

    /// Next stake for `kind`: compounding after a win, then martingale after
    /// a loss, rounded to cents.
    pub fn compute_stake(&self, kind: StrategyKind) -> Result<Decimal, StrategyError> {
        let config = &self.state(kind).config;
        let mut stake = config.stake;

        if config.use_compounding
            && self.session_profit > Decimal::ZERO
            && self.last_result == Some(TradeResult::Win)
        {
            stake = stake
                .checked_add(self.session_profit)
                .ok_or(StrategyError::StakeOverflow { loss_streak: 0 })?;
        }

        if config.use_martingale && self.last_result == Some(TradeResult::Loss) {
            stake = checked_pow_u32(config.martingale_multiplier, self.loss_streak)
                .and_then(|factor| stake.checked_mul(factor))
                .ok_or(StrategyError::StakeOverflow {
                    loss_streak: self.loss_streak,
                })?;
        }

        Ok(round_stake(stake))
    }

    /// Feed one tick. Returns a ticket when the active strategy fires.
    pub fn on_tick(
        &mut self,
        digit: u8,
        snapshot: &StatsSnapshot,
        symbol: &str,
        currency: &str,
    ) -> Option<TradeTicket> {
        let ended = self.streaks.observe(digit, self.over_under_threshold);

        let kind = self.active?;
        let state = self.state(kind);
        if !state.config.is_running || state.busy.is_busy() {
            return None;
        }

        if state.config.runs_count >= state.config.max_runs {
            let max_runs = state.config.max_runs;
            self.state_mut(kind)
                .journal
                .info(format!("Max runs reached ({}). Stopping bot.", max_runs));
            self.stop_all(StrategyStatus::MaxRunsReached);
            return None;
        }

        if snapshot.window_len == 0 {
            return None;
        }

        let ctx = TickContext {
            digit,
            snapshot,
            streaks: &self.streaks,
            ended,
        };
        let signal = state.policy.evaluate(&ctx, &state.config)?;
        let guard = state.busy.try_acquire()?;
        let stake = match self.compute_stake(kind) {
            Ok(stake) => stake,
            Err(e) => {
                error!(strategy = %kind, error = %e, "Cannot size next trade");
                self.state_mut(kind)
                    .journal
                    .error(format!("Error: {}. Stopping bot.", e));
                self.stop_all(StrategyStatus::Error(e.to_string()));
                return None;
            }
        };

        let state = self.state_mut(kind);
        if state.policy.tracks_prediction() && state.config.prediction_digit != signal.prediction {
            state.config.prediction_digit = signal.prediction;
            debug!(strategy = %kind, prediction = signal.prediction, "Prediction updated");
        }
        state.journal.info(signal.reason);
        state
            .journal
            .trade(format!("Buying {} for ${:.2}", signal.contract, stake));

        Some(TradeTicket {
            kind,
            order: TradeOrder {
                contract: signal.contract,
                prediction: signal.prediction,
                stake,
                symbol: symbol.to_string(),
                currency: currency.to_string(),
                duration_ticks: state.config.tick_duration,
            },
            guard,
        })
    }

    /// The contract was bought and is awaiting settlement.
    pub fn record_purchase(&mut self, kind: StrategyKind, contract: ContractKind, contract_id: &str) {
        let state = self.state_mut(kind);
        if state.config.is_running {
            state.status = StrategyStatus::Trading(contract);
        }
        state
            .journal
            .trade(format!("Bought {} contract {}", contract, contract_id));
    }

    /// Apply a settled trade. Returns the strategy switched to, if any.
    pub fn handle_outcome(
        &mut self,
        kind: StrategyKind,
        outcome: &TradeOutcome,
    ) -> Option<StrategyKind> {
        let profit = outcome.profit;
        let won = profit > Decimal::ZERO;

        self.session_profit += profit;
        self.total_profit += profit;
        let session = self.session_profit;
        if won {
            self.loss_streak = 0;
            self.last_result = Some(TradeResult::Win);
        } else {
            self.loss_streak += 1;
            self.last_result = Some(TradeResult::Loss);
        }
        let streak = self.loss_streak;

        let state = self.state_mut(kind);
        state.config.runs_count = state.config.runs_count.saturating_add(1);
        let running = state.config.is_running;
        let config = state.config.clone();

        if won {
            state.journal.success(format!(
                "Trade WON: +${:.2} | {} [Session: {:.2}]",
                profit,
                outcome.detail(),
                session
            ));
            if let Some(take_profit) = config.take_profit_amount.filter(|tp| running && session >= *tp) {
                state
                    .journal
                    .success(format!("Take Profit Reached (${}). Stopping bot.", take_profit));
                self.stop_all(StrategyStatus::TakeProfitHit);
                return None;
            }
        } else {
            state.journal.error(format!(
                "Trade LOST: -${:.2} | {} [Streak: {}]",
                profit.abs(),
                outcome.detail(),
                streak
            ));
            if running && config.use_max_loss && session <= -config.max_loss_amount {
                state.journal.error(format!(
                    "Max Loss Limit Reached (${}). Stopping bot.",
                    config.max_loss_amount
                ));
                self.stop_all(StrategyStatus::MaxLossHit);
                return self.switch_after_max_loss(kind, &config);
            }
        }

        if running && config.runs_count >= config.max_runs {
            let state = self.state_mut(kind);
            state
                .journal
                .info(format!("Max runs reached ({}). Stopping bot.", config.max_runs));
            self.stop_all(StrategyStatus::MaxRunsReached);
        } else if running {
            self.state_mut(kind).status = StrategyStatus::Running;
        }
        None
    }

    fn switch_after_max_loss(
        &mut self,
        from: StrategyKind,
        config: &StrategyConfig,
    ) -> Option<StrategyKind> {
        if !config.switch_on_max_loss {
            return None;
        }
        let to = from.partner()?;
        self.start(to);
        self.state_mut(from).status = StrategyStatus::SwitchedTo(to);
        self.state_mut(to)
            .journal
            .info(format!("Switched from {} after max loss.", from));
        Some(to)
    }

    /// Record a failed quote, buy or settlement. The strategy keeps running.
    pub fn handle_failure(&mut self, kind: StrategyKind, error: &TradeError) {
        let state = self.state_mut(kind);
        if matches!(error, TradeError::Cancelled) {
            state.journal.info("Trade cancelled.");
            return;
        }
        let message = error.user_message();
        state.journal.error(format!("Error: {}", message));
        state.status = StrategyStatus::Error(message);
    }

    pub fn view(&self, kind: StrategyKind) -> StrategyView {
        let state = self.state(kind);
        StrategyView {
            kind,
            config: state.config.clone(),
            status: state.status.clone(),
            busy: state.busy.is_busy(),
            journal: state.journal.to_vec(),
        }
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            active: self.active,
            session_profit: self.session_profit,
            total_profit: self.total_profit,
            loss_streak: self.loss_streak,
            last_result: self.last_result,
            streaks: self.streaks.clone(),
            strategies: StrategyKind::ALL.iter().map(|k| self.view(*k)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::ApiError;
    use crate::strategy::journal::JournalKind;
    use crate::strategy::policy::tests::snapshot;
    use rust_decimal_macros::dec;

    fn engine() -> DecisionEngine {
        DecisionEngine::new(&StrategiesConfig::default(), &TriggerConfig::default(), 5)
    }

    fn rising() -> StatsSnapshot {
        let mut snap = snapshot([1; 10], [false; 10]);
        snap.percentages.rise = 80.0;
        snap
    }

    fn outcome(contract: ContractKind, profit: Decimal) -> TradeOutcome {
        TradeOutcome {
            contract_id: "c-1".to_string(),
            contract,
            prediction: 0,
            profit,
            exit_tick: Some(dec!(1234.57)),
        }
    }

    #[test]
    fn test_differs_scenario_fires_digit_diff_on_four() {
        let mut engine = engine();
        assert!(engine.toggle(StrategyKind::Differs));
        let snap = snapshot([15, 14, 12, 11, 7, 11, 10, 10, 5, 5], [false; 10]);

        let ticket = engine.on_tick(4, &snap, "R_100", "USD").unwrap();
        assert_eq!(ticket.kind, StrategyKind::Differs);
        assert_eq!(ticket.order.contract, ContractKind::DigitDiff);
        assert_eq!(ticket.order.prediction, 4);
        assert_eq!(engine.config(StrategyKind::Differs).prediction_digit, 4);
        assert!(engine.is_busy(StrategyKind::Differs));
    }

    #[test]
    fn test_martingale_stake_after_two_losses() {
        let mut engine = engine();
        engine.toggle(StrategyKind::EvenOdd);
        for update in [
            ConfigUpdate::Stake(dec!(1)),
            ConfigUpdate::MartingaleMultiplier(dec!(2)),
            ConfigUpdate::UseMartingale(true),
        ] {
            engine.update_config(StrategyKind::EvenOdd, &update).unwrap();
        }

        engine.handle_outcome(StrategyKind::EvenOdd, &outcome(ContractKind::DigitEven, dec!(-1)));
        engine.handle_outcome(StrategyKind::EvenOdd, &outcome(ContractKind::DigitEven, dec!(-1)));

        assert_eq!(engine.loss_streak(), 2);
        let stake = engine.compute_stake(StrategyKind::EvenOdd).unwrap();
        assert_eq!(stake, dec!(4));
        assert_eq!(format!("{:.2}", stake), "4.00");
    }

    fn losing_matches_run(losses: usize) -> DecisionEngine {
        let mut engine = engine();
        engine.toggle(StrategyKind::Matches);
        for update in [ConfigUpdate::UseMaxLoss(false), ConfigUpdate::MaxRuns(100)] {
            engine.update_config(StrategyKind::Matches, &update).unwrap();
        }
        for _ in 0..losses {
            engine.handle_outcome(
                StrategyKind::Matches,
                &outcome(ContractKind::DigitMatch, dec!(-0.35)),
            );
        }
        engine
    }

    #[test]
    fn test_runaway_martingale_reports_overflow() {
        let engine = losing_matches_run(30);
        assert_eq!(engine.loss_streak(), 30);
        assert!(engine.config(StrategyKind::Matches).is_running);
        assert_eq!(
            engine.compute_stake(StrategyKind::Matches),
            Err(StrategyError::StakeOverflow { loss_streak: 30 })
        );
    }

    #[test]
    fn test_runaway_martingale_stops_instead_of_trading() {
        let mut engine = losing_matches_run(30);
        let snap = snapshot([15, 14, 12, 11, 7, 11, 10, 10, 5, 5], [true; 10]);

        assert!(engine.on_tick(4, &snap, "R_100", "USD").is_none());
        assert!(!engine.config(StrategyKind::Matches).is_running);
        assert!(!engine.is_busy(StrategyKind::Matches));
        assert_eq!(engine.active(), None);
        assert!(engine
            .status(StrategyKind::Matches)
            .to_string()
            .starts_with("ERROR: stake overflow"));
        let latest = engine.journal(StrategyKind::Matches).latest().unwrap();
        assert_eq!(latest.kind, JournalKind::Error);
        assert!(latest.message.ends_with("Stopping bot."));
    }

    #[test]
    fn test_long_losing_run_still_sizes_stake() {
        let engine = losing_matches_run(5);
        assert_eq!(
            engine.compute_stake(StrategyKind::Matches).unwrap(),
            round_stake(dec!(0.35) * dec!(161051))
        );
    }

    #[test]
    fn test_max_runs_stops_without_trading() {
        let mut engine = engine();
        engine.toggle(StrategyKind::RiseFall);
        engine
            .update_config(StrategyKind::RiseFall, &ConfigUpdate::MaxRuns(5))
            .unwrap();
        engine
            .update_config(StrategyKind::RiseFall, &ConfigUpdate::RunsCount(5))
            .unwrap();

        assert!(engine.on_tick(3, &rising(), "R_100", "USD").is_none());
        assert_eq!(
            engine.status(StrategyKind::RiseFall).to_string(),
            "MAX RUNS REACHED"
        );
        assert!(!engine.config(StrategyKind::RiseFall).is_running);
        assert_eq!(engine.active(), None);
    }

    #[test]
    fn test_toggle_keeps_one_strategy_active() {
        let mut engine = engine();
        assert!(engine.toggle(StrategyKind::EvenOdd));
        assert!(engine.toggle(StrategyKind::Matches));
        assert!(!engine.config(StrategyKind::EvenOdd).is_running);
        assert_eq!(engine.status(StrategyKind::EvenOdd), &StrategyStatus::Stopped);
        assert_eq!(engine.active(), Some(StrategyKind::Matches));

        assert!(!engine.toggle(StrategyKind::Matches));
        assert_eq!(engine.active(), None);
        let running = StrategyKind::ALL
            .iter()
            .filter(|k| engine.config(**k).is_running)
            .count();
        assert_eq!(running, 0);
    }

    #[test]
    fn test_busy_strategy_skips_ticks_until_released() {
        let mut engine = engine();
        engine.toggle(StrategyKind::RiseFall);

        let mut ticket = engine.on_tick(1, &rising(), "R_100", "USD").unwrap();
        assert_eq!(ticket.order.contract, ContractKind::Call);
        assert!(engine.on_tick(2, &rising(), "R_100", "USD").is_none());

        assert!(ticket.guard.release());
        assert!(!ticket.guard.release());
        assert!(engine.on_tick(3, &rising(), "R_100", "USD").is_some());
    }

    #[test]
    fn test_stale_guard_cannot_clear_newer_trade() {
        let flag = Arc::new(BusyFlag::new());
        let mut first = flag.try_acquire().unwrap();
        assert!(flag.try_acquire().is_none());
        assert!(first.release());

        let second = flag.try_acquire().unwrap();
        assert!(second.generation() > first.generation());
        drop(first);
        assert!(flag.is_busy());
        drop(second);
        assert!(!flag.is_busy());
    }

    #[test]
    fn test_compounding_adds_session_profit_after_win() {
        let mut engine = engine();
        engine.toggle(StrategyKind::EvenOdd);
        engine
            .update_config(StrategyKind::EvenOdd, &ConfigUpdate::UseCompounding(true))
            .unwrap();
        engine.handle_outcome(StrategyKind::EvenOdd, &outcome(ContractKind::DigitEven, dec!(0.33)));
        assert_eq!(engine.compute_stake(StrategyKind::EvenOdd).unwrap(), dec!(0.68));
    }

    #[test]
    fn test_take_profit_stops_strategy() {
        let mut engine = engine();
        engine.toggle(StrategyKind::EvenOdd);
        engine
            .update_config(StrategyKind::EvenOdd, &ConfigUpdate::TakeProfitAmount(Some(dec!(1))))
            .unwrap();

        engine.handle_outcome(StrategyKind::EvenOdd, &outcome(ContractKind::DigitEven, dec!(1.2)));
        assert_eq!(engine.status(StrategyKind::EvenOdd), &StrategyStatus::TakeProfitHit);
        assert!(!engine.config(StrategyKind::EvenOdd).is_running);
        assert_eq!(engine.total_profit(), dec!(1.2));
        assert_eq!(engine.config(StrategyKind::EvenOdd).runs_count, 1);
    }

    #[test]
    fn test_max_loss_switches_to_partner() {
        let mut engine = engine();
        engine.toggle(StrategyKind::EvenOdd);
        engine
            .update_config(StrategyKind::EvenOdd, &ConfigUpdate::SwitchOnMaxLoss(true))
            .unwrap();

        let switched = engine.handle_outcome(
            StrategyKind::EvenOdd,
            &outcome(ContractKind::DigitOdd, dec!(-5)),
        );
        assert_eq!(switched, Some(StrategyKind::OverUnder));
        assert_eq!(
            engine.status(StrategyKind::EvenOdd).to_string(),
            "SWITCHED TO OVER_UNDER"
        );
        assert_eq!(engine.active(), Some(StrategyKind::OverUnder));
        assert!(engine.config(StrategyKind::OverUnder).is_running);
        assert_eq!(engine.session_profit(), Decimal::ZERO);
        assert_eq!(engine.total_profit(), dec!(-5));
    }

    #[test]
    fn test_max_loss_without_switch_stops() {
        let mut engine = engine();
        engine.toggle(StrategyKind::Matches);
        let switched = engine.handle_outcome(
            StrategyKind::Matches,
            &outcome(ContractKind::DigitMatch, dec!(-6)),
        );
        assert_eq!(switched, None);
        assert_eq!(engine.status(StrategyKind::Matches), &StrategyStatus::MaxLossHit);
        assert!(engine.status(StrategyKind::Matches).is_limit_stop());
    }

    #[test]
    fn test_failure_is_journaled_and_strategy_keeps_running() {
        let mut engine = engine();
        engine.toggle(StrategyKind::RiseFall);
        let error = TradeError::Api(ApiError::Service {
            code: "InsufficientBalance".to_string(),
            message: "Insufficient balance.".to_string(),
        });
        engine.handle_failure(StrategyKind::RiseFall, &error);

        assert_eq!(
            engine.status(StrategyKind::RiseFall).to_string(),
            "ERROR: Insufficient balance."
        );
        let latest = engine.journal(StrategyKind::RiseFall).latest().unwrap();
        assert_eq!(latest.kind, JournalKind::Error);
        assert_eq!(latest.message, "Error: Insufficient balance.");
        assert!(engine.on_tick(1, &rising(), "R_100", "USD").is_some());
    }

    #[test]
    fn test_streaks_update_without_active_strategy() {
        let mut engine = engine();
        let snap = snapshot([1; 10], [false; 10]);
        for digit in [1, 3, 5] {
            assert!(engine.on_tick(digit, &snap, "R_100", "USD").is_none());
        }
        assert_eq!(engine.streaks().consecutive_odd, 3);
    }

    #[test]
    fn test_win_log_reports_exit_digit() {
        let mut engine = engine();
        engine.toggle(StrategyKind::EvenOdd);
        engine.handle_outcome(StrategyKind::EvenOdd, &outcome(ContractKind::DigitOdd, dec!(0.33)));
        let latest = engine.journal(StrategyKind::EvenOdd).latest().unwrap();
        assert_eq!(
            latest.message,
            "Trade WON: +$0.33 | Predicted ODD, Exit Digit: 7 [Session: 0.33]"
        );
        assert_eq!(engine.status(StrategyKind::EvenOdd), &StrategyStatus::Running);
    }
}
