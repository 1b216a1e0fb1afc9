//! Replay engine.

use super::data::TickRow;
use crate::config::{Config, ExecutionConfig};
use crate::exchange::PaperQuoteService;
use crate::stats::DigitStatsEngine;
use crate::strategy::{DecisionEngine, StrategyKind, StrategyRunner};
use crate::utils::lock;
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct ReplayOptions {
    pub strategy: StrategyKind,
    pub symbol: String,
    pub initial_balance: Decimal,
    /// Upper bound on waiting for the strategy to book a result.
    pub settle_timeout: Duration,
}

impl ReplayOptions {
    pub fn new(strategy: StrategyKind, symbol: impl Into<String>) -> Self {
        Self {
            strategy,
            symbol: symbol.into(),
            initial_balance: dec!(1000),
            settle_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplaySummary {
    pub strategy: StrategyKind,
    pub symbol: String,
    pub ticks: usize,
    pub first_epoch: i64,
    pub last_epoch: i64,
    pub signals: u64,
    pub wins: u64,
    pub losses: u64,
    /// Contracts still open when the data ran out.
    pub unsettled: usize,
    pub total_profit: Decimal,
    pub initial_balance: Decimal,
    pub final_balance: Decimal,
    pub max_loss_streak: u32,
    pub final_status: String,
}

impl ReplaySummary {
    pub fn win_rate(&self) -> f64 {
        let settled = self.wins + self.losses;
        if settled == 0 {
            return 0.0;
        }
        self.wins as f64 / settled as f64 * 100.0
    }

    pub fn summary(&self) -> String {
        let period = |epoch: i64| {
            chrono::DateTime::from_timestamp(epoch, 0)
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| epoch.to_string())
        };
        format!(
            r#"═══════════════════════════════════════════════
REPLAY RESULTS ({} on {})
═══════════════════════════════════════════════
TICKS
  Processed:         {}
  Period:            {} to {}

TRADES
  Signals:           {}
  Wins:              {}
  Losses:            {}
  Win Rate:          {:.1}%
  Unsettled:         {}

PROFIT
  Total Profit:      ${:.2}
  Start Balance:     ${:.2}
  Final Balance:     ${:.2}
  Max Loss Streak:   {}

STATUS
  Final Status:      {}
═══════════════════════════════════════════════"#,
            self.strategy.as_str().to_uppercase(),
            self.symbol,
            self.ticks,
            period(self.first_epoch),
            period(self.last_epoch),
            self.signals,
            self.wins,
            self.losses,
            self.win_rate(),
            self.unsettled,
            self.total_profit,
            self.initial_balance,
            self.final_balance,
            self.max_loss_streak,
            self.final_status,
        )
    }
}

/// Runs one strategy over recorded ticks against the paper service.
///
/// Every tick is fed to the paper service first so due contracts settle,
/// the engine books those results, and only then does the strategy see the
/// tick. A fired trigger is waited on until the paper service holds the
/// contract, which keeps runs reproducible.
pub struct ReplayEngine {
    config: Config,
    options: ReplayOptions,
}

impl ReplayEngine {
    pub fn new(config: Config, options: ReplayOptions) -> Self {
        Self { config, options }
    }

    pub async fn run(&self, ticks: &[TickRow]) -> Result<ReplaySummary> {
        let (first, last) = match (ticks.first(), ticks.last()) {
            (Some(first), Some(last)) => (first.epoch, last.epoch),
            _ => anyhow::bail!("No ticks to replay"),
        };
        let symbol = self.options.symbol.as_str();
        let currency = self.config.market.currency.as_str();
        let kind = self.options.strategy;

        info!(
            strategy = %kind,
            %symbol,
            ticks = ticks.len(),
            "Starting replay"
        );

        let paper = Arc::new(
            PaperQuoteService::new(self.options.initial_balance, self.config.stats.pip_scale)
                .with_currency(currency),
        );
        let mut stats = DigitStatsEngine::new(self.config.stats.clone());
        let engine = DecisionEngine::new(
            &self.config.strategies,
            &self.config.triggers,
            self.config.stats.over_under_threshold,
        );
        let execution = ExecutionConfig {
            poll_interval_ms: 1,
            max_poll_attempts: u32::MAX,
        };
        let runner = StrategyRunner::new(engine, paper.clone(), execution);
        runner.toggle(kind);
        let engine = runner.engine();

        let mut signals = 0u64;
        let mut wins = 0u64;
        let mut losses = 0u64;
        let mut max_loss_streak = 0u32;

        for (i, tick) in ticks.iter().enumerate() {
            let settled = paper.observe_tick(symbol, tick.quote, tick.epoch).await;
            if !settled.is_empty() {
                for settlement in &settled {
                    if settlement.profit > Decimal::ZERO {
                        wins += 1;
                    } else {
                        losses += 1;
                    }
                }
                self.wait_idle(&engine)
                    .await
                    .with_context(|| format!("Result not booked at epoch {}", tick.epoch))?;
                max_loss_streak = max_loss_streak.max(lock(&engine).loss_streak());
            }

            let digit = stats.push_tick(tick.quote);
            if runner.on_tick(digit, &stats.snapshot(), symbol, currency) {
                signals += 1;
                self.wait_placed(&paper, &engine)
                    .await
                    .with_context(|| format!("Trade not placed at epoch {}", tick.epoch))?;
            }

            if i % 1000 == 0 {
                debug!(
                    "Progress: {}/{} ({:.1}%), Signals: {}",
                    i,
                    ticks.len(),
                    (i as f64 / ticks.len() as f64) * 100.0,
                    signals
                );
            }
        }

        let unsettled = paper.open_contracts().await;
        runner.shutdown().await;

        let snapshot = runner.snapshot();
        let final_status = lock(&engine).status(kind).to_string();
        let summary = ReplaySummary {
            strategy: kind,
            symbol: symbol.to_string(),
            ticks: ticks.len(),
            first_epoch: first,
            last_epoch: last,
            signals,
            wins,
            losses,
            unsettled,
            total_profit: snapshot.total_profit,
            initial_balance: self.options.initial_balance,
            final_balance: paper.balance().await,
            max_loss_streak,
            final_status,
        };

        info!(
            total_profit = %summary.total_profit,
            wins,
            losses,
            "Replay complete"
        );
        Ok(summary)
    }

    async fn wait_idle(&self, engine: &Mutex<DecisionEngine>) -> Result<()> {
        let idle = || StrategyKind::ALL.iter().all(|k| !lock(engine).is_busy(*k));
        self.poll_until(idle).await
    }

    async fn wait_placed(&self, paper: &PaperQuoteService, engine: &Mutex<DecisionEngine>) -> Result<()> {
        tokio::time::timeout(self.options.settle_timeout, async {
            loop {
                if paper.open_contracts().await > 0 {
                    return;
                }
                // A rejected order releases the flag without a contract
                if StrategyKind::ALL.iter().all(|k| !lock(engine).is_busy(*k)) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .context("Timed out waiting for the paper service")
    }

    async fn poll_until<F: Fn() -> bool>(&self, check: F) -> Result<()> {
        tokio::time::timeout(self.options.settle_timeout, async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .context("Timed out waiting for the strategy")
    }
}
