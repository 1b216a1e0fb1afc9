//! Drives the decision engine from the tick stream.
//!
//! Ticks are evaluated synchronously under the engine lock. A fired trigger
//! is executed on its own task so the tick loop never waits on the quote
//! service; the ticket's busy guard travels with the task and is released
//! on every exit path.

use super::config::ConfigUpdate;
use super::engine::{DecisionEngine, EngineSnapshot, TradeTicket};
use super::error::{StrategyError, TradeError};
use super::executor::{TradeExecutor, TradeOrder, TradeOutcome};
use super::kind::StrategyKind;
use crate::config::ExecutionConfig;
use crate::exchange::QuoteApi;
use crate::stats::StatsSnapshot;
use crate::utils::lock;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct StrategyRunner {
    engine: Arc<Mutex<DecisionEngine>>,
    api: Arc<dyn QuoteApi>,
    executor: TradeExecutor,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    revision: watch::Sender<u64>,
}

impl StrategyRunner {
    pub fn new(engine: DecisionEngine, api: Arc<dyn QuoteApi>, execution: ExecutionConfig) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            engine: Arc::new(Mutex::new(engine)),
            api,
            executor: TradeExecutor::new(execution),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            revision,
        }
    }

    pub fn engine(&self) -> Arc<Mutex<DecisionEngine>> {
        Arc::clone(&self.engine)
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        lock(&self.engine).snapshot()
    }

    /// Bumped whenever engine state changes outside a tick (trade results,
    /// toggles, config edits).
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    fn bump(revision: &watch::Sender<u64>) {
        revision.send_modify(|r| *r = r.wrapping_add(1));
    }

    pub fn toggle(&self, kind: StrategyKind) -> bool {
        let running = lock(&self.engine).toggle(kind);
        info!(strategy = %kind, running, "Strategy toggled");
        Self::bump(&self.revision);
        running
    }

    pub fn update_config(&self, kind: StrategyKind, update: &ConfigUpdate) -> Result<(), StrategyError> {
        lock(&self.engine).update_config(kind, update)?;
        Self::bump(&self.revision);
        Ok(())
    }

    /// Number of trade tasks still running.
    pub fn in_flight(&self) -> usize {
        let mut tasks = lock(&self.tasks);
        tasks.retain(|t| !t.is_finished());
        tasks.len()
    }

    /// Evaluate one tick; spawns a trade task if the active strategy fires.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn on_tick(&self, digit: u8, snapshot: &StatsSnapshot, symbol: &str, currency: &str) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        let Some(ticket) = lock(&self.engine).on_tick(digit, snapshot, symbol, currency) else {
            return false;
        };
        Self::bump(&self.revision);

        let handle = tokio::spawn(run_trade(
            Arc::clone(&self.engine),
            Arc::clone(&self.api),
            self.executor.clone(),
            ticket,
            self.shutdown.child_token(),
            self.revision.clone(),
        ));

        let mut tasks = lock(&self.tasks);
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
        true
    }

    /// Cancel in-flight trades and wait for their tasks to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *lock(&self.tasks));
        for task in tasks {
            let _ = task.await;
        }
        debug!("Strategy runner stopped");
    }
}

async fn run_trade(
    engine: Arc<Mutex<DecisionEngine>>,
    api: Arc<dyn QuoteApi>,
    executor: TradeExecutor,
    ticket: TradeTicket,
    cancel: CancellationToken,
    revision: watch::Sender<u64>,
) {
    let TradeTicket { kind, order, mut guard } = ticket;
    debug!(strategy = %kind, generation = guard.generation(), contract = %order.contract, "Trade started");

    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TradeError::Cancelled),
        result = execute_ticket(&engine, api.as_ref(), &executor, kind, &order, &revision) => result,
    };

    {
        let mut engine = lock(&engine);
        match result {
            Ok(outcome) => {
                if let Some(to) = engine.handle_outcome(kind, &outcome) {
                    info!(from = %kind, %to, "Switched strategy after max loss");
                }
            }
            Err(e) => engine.handle_failure(kind, &e),
        }
    }
    guard.release();
    StrategyRunner::bump(&revision);
}

async fn execute_ticket(
    engine: &Mutex<DecisionEngine>,
    api: &dyn QuoteApi,
    executor: &TradeExecutor,
    kind: StrategyKind,
    order: &TradeOrder,
    revision: &watch::Sender<u64>,
) -> Result<TradeOutcome, TradeError> {
    let receipt = executor.place(api, order).await?;
    lock(engine).record_purchase(kind, order.contract, &receipt.contract_id);
    StrategyRunner::bump(revision);
    executor.settle(api, order, &receipt.contract_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, StatsConfig};
    use crate::exchange::{ApiError, MockQuoteApi, PaperQuoteService};
    use crate::stats::DigitStatsEngine;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn engine() -> DecisionEngine {
        let config = Config::default();
        DecisionEngine::new(&config.strategies, &config.triggers, config.stats.over_under_threshold)
    }

    fn fast_execution() -> ExecutionConfig {
        ExecutionConfig {
            poll_interval_ms: 5,
            max_poll_attempts: 200,
        }
    }

    /// Strictly rising quotes, so rise is 100%.
    fn rising_stats() -> DigitStatsEngine {
        let mut stats = DigitStatsEngine::new(StatsConfig::default());
        let prices: Vec<Decimal> = (0..20).map(|i| dec!(1000.00) + Decimal::new(i, 2)).collect();
        stats.load_history(&prices);
        stats
    }

    async fn eventually<F: Fn() -> bool>(check: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn wait_for_open_contract(paper: &PaperQuoteService) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while paper.open_contracts().await == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("contract never bought");
    }

    #[tokio::test]
    async fn test_rise_fall_trade_settles_against_paper_service() {
        let paper = Arc::new(PaperQuoteService::new(dec!(100), 2));
        paper.seed_history("R_100", &[(1, dec!(1000.19))]).await;
        let runner = StrategyRunner::new(engine(), paper.clone(), fast_execution());
        runner.toggle(StrategyKind::RiseFall);

        let mut stats = rising_stats();
        let digit = stats.push_tick(dec!(1000.20));
        assert!(runner.on_tick(digit, &stats.snapshot(), "R_100", "USD"));
        // Busy while the first contract is open
        assert!(!runner.on_tick(digit, &stats.snapshot(), "R_100", "USD"));

        wait_for_open_contract(&paper).await;
        paper.observe_tick("R_100", dec!(1000.25), 3).await;

        let engine = runner.engine();
        eventually(|| lock(&engine).config(StrategyKind::RiseFall).runs_count == 1).await;

        let snapshot = runner.snapshot();
        assert_eq!(snapshot.total_profit, dec!(0.33));
        assert_eq!(snapshot.total_profit, paper.total_profit().await);
        assert!(!lock(&engine).is_busy(StrategyKind::RiseFall));
        assert_eq!(
            lock(&engine).status(StrategyKind::RiseFall).to_string(),
            "RUNNING"
        );
        runner.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_quote_releases_busy_flag() {
        let mut api = MockQuoteApi::new();
        api.expect_default_timeout()
            .returning(|| Duration::from_millis(20));
        api.expect_send_request()
            .returning(|_, _| Err(ApiError::NotConnected));
        let runner = StrategyRunner::new(engine(), Arc::new(api), fast_execution());
        runner.toggle(StrategyKind::RiseFall);

        let stats = rising_stats();
        let digit = stats.last_digit().unwrap();
        assert!(runner.on_tick(digit, &stats.snapshot(), "R_100", "USD"));

        let engine = runner.engine();
        eventually(|| !lock(&engine).is_busy(StrategyKind::RiseFall)).await;
        let status = lock(&engine).status(StrategyKind::RiseFall).to_string();
        assert_eq!(status, "ERROR: not connected to the quote service");
        assert!(lock(&engine).config(StrategyKind::RiseFall).is_running);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pending_settlement() {
        let paper = Arc::new(PaperQuoteService::new(dec!(100), 2));
        paper.seed_history("R_100", &[(1, dec!(1000.19))]).await;
        let runner = StrategyRunner::new(engine(), paper.clone(), fast_execution());
        runner.toggle(StrategyKind::RiseFall);

        let stats = rising_stats();
        let digit = stats.last_digit().unwrap();
        assert!(runner.on_tick(digit, &stats.snapshot(), "R_100", "USD"));
        wait_for_open_contract(&paper).await;

        runner.shutdown().await;
        assert_eq!(runner.in_flight(), 0);
        let engine = runner.engine();
        assert!(!lock(&engine).is_busy(StrategyKind::RiseFall));
        assert_eq!(
            lock(&engine).journal(StrategyKind::RiseFall).latest().unwrap().message,
            "Trade cancelled."
        );
        assert!(!runner.on_tick(digit, &stats.snapshot(), "R_100", "USD"));
    }
}
