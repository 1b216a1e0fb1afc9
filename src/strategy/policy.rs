//! Trigger policies, one per strategy kind.
//!
//! A policy looks at the statistics snapshot plus the streak counters and
//! either stays quiet or returns the contract to buy. Thresholds come from
//! [`TriggerConfig`]; policies never touch stake or bookkeeping.

use super::config::StrategyConfig;
use super::kind::StrategyKind;
use super::streaks::{EndedRuns, StreakTracker};
use crate::config::TriggerConfig;
use crate::exchange::ContractKind;
use crate::stats::{DigitStat, StatsSnapshot};
use std::cmp::Reverse;

/// Everything a policy may inspect on one tick.
#[derive(Debug, Clone, Copy)]
pub struct TickContext<'a> {
    pub digit: u8,
    pub snapshot: &'a StatsSnapshot,
    pub streaks: &'a StreakTracker,
    pub ended: EndedRuns,
}

/// A fired trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    pub contract: ContractKind,
    pub prediction: u8,
    pub reason: String,
}

pub trait StrategyPolicy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    fn evaluate(&self, ctx: &TickContext<'_>, config: &StrategyConfig) -> Option<Signal>;

    /// Whether a fired prediction should be written back to the config.
    fn tracks_prediction(&self) -> bool {
        false
    }
}

/// Build the policy for `kind` with the configured thresholds.
pub fn policy_for(kind: StrategyKind, triggers: &TriggerConfig) -> Box<dyn StrategyPolicy> {
    match kind {
        StrategyKind::EvenOdd => Box::new(EvenOddPolicy {
            threshold_pct: triggers.polarity_threshold_pct,
            min_run: triggers.min_reversal_run,
        }),
        StrategyKind::OverUnder => Box::new(OverUnderPolicy {
            threshold_pct: triggers.polarity_threshold_pct,
            min_run: triggers.min_reversal_run,
        }),
        StrategyKind::Differs => Box::new(DiffersPolicy {
            max_pct: triggers.differs_max_pct,
            min_digit: triggers.differs_min_digit,
            max_digit: triggers.differs_max_digit,
        }),
        StrategyKind::Matches => Box::new(MatchesPolicy),
        StrategyKind::RiseFall => Box::new(RiseFallPolicy {
            threshold_pct: triggers.polarity_threshold_pct,
        }),
    }
}

/// Most frequent, second most frequent and least frequent digit.
fn extremes(snapshot: &StatsSnapshot) -> Option<(u8, u8, u8)> {
    Some((
        snapshot.digit_at_rank(1)?,
        snapshot.digit_at_rank(2)?,
        snapshot.digit_at_rank(10)?,
    ))
}

pub struct EvenOddPolicy {
    pub threshold_pct: f64,
    pub min_run: u32,
}

impl StrategyPolicy for EvenOddPolicy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::EvenOdd
    }

    fn evaluate(&self, ctx: &TickContext<'_>, _config: &StrategyConfig) -> Option<Signal> {
        let pct = &ctx.snapshot.percentages;
        if pct.even > self.threshold_pct {
            if ctx.streaks.consecutive_even >= 1 && ctx.ended.odd >= self.min_run {
                return Some(Signal {
                    contract: ContractKind::DigitEven,
                    prediction: 0,
                    reason: format!(
                        "Trigger: EVEN Strong ({:.1}%) & {} consecutive ODDs ended.",
                        pct.even, ctx.ended.odd
                    ),
                });
            }
        } else if pct.odd > self.threshold_pct
            && ctx.streaks.consecutive_odd >= 1
            && ctx.ended.even >= self.min_run
        {
            return Some(Signal {
                contract: ContractKind::DigitOdd,
                prediction: 0,
                reason: format!(
                    "Trigger: ODD Strong ({:.1}%) & {} consecutive EVENs ended.",
                    pct.odd, ctx.ended.even
                ),
            });
        }
        None
    }
}

pub struct OverUnderPolicy {
    pub threshold_pct: f64,
    pub min_run: u32,
}

impl OverUnderPolicy {
    /// Under barriers below 6 are replaced by 8.
    fn under_barrier(configured: u8) -> u8 {
        if configured >= 6 {
            configured
        } else {
            8
        }
    }

    /// Over barriers above 3 are replaced by 1.
    fn over_barrier(configured: u8) -> u8 {
        if configured <= 3 {
            configured
        } else {
            1
        }
    }
}

impl StrategyPolicy for OverUnderPolicy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::OverUnder
    }

    fn evaluate(&self, ctx: &TickContext<'_>, config: &StrategyConfig) -> Option<Signal> {
        let pct = &ctx.snapshot.percentages;
        if pct.under > self.threshold_pct {
            if ctx.streaks.consecutive_under >= 1 && ctx.ended.over >= self.min_run {
                let prediction = Self::under_barrier(config.prediction_digit);
                return Some(Signal {
                    contract: ContractKind::DigitUnder,
                    prediction,
                    reason: format!(
                        "Trigger: UNDER Strong ({:.1}%) & {} consecutive OVERs ended. Trading UNDER {}.",
                        pct.under, ctx.ended.over, prediction
                    ),
                });
            }
        } else if pct.over > self.threshold_pct
            && ctx.streaks.consecutive_over >= 1
            && ctx.ended.under >= self.min_run
        {
            let prediction = Self::over_barrier(config.prediction_digit);
            return Some(Signal {
                contract: ContractKind::DigitOver,
                prediction,
                reason: format!(
                    "Trigger: OVER Strong ({:.1}%) & {} consecutive UNDERs ended. Trading OVER {}.",
                    pct.over, ctx.ended.under, prediction
                ),
            });
        }
        None
    }
}

/// Bets a rare, fading digit will not appear.
pub struct DiffersPolicy {
    pub max_pct: f64,
    pub min_digit: u8,
    pub max_digit: u8,
}

impl StrategyPolicy for DiffersPolicy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Differs
    }

    fn evaluate(&self, ctx: &TickContext<'_>, _config: &StrategyConfig) -> Option<Signal> {
        let (highest, second, least) = extremes(ctx.snapshot)?;
        let target = ctx
            .snapshot
            .digit_stats
            .iter()
            .filter(|s| (self.min_digit..=self.max_digit).contains(&s.digit))
            .filter(|s| s.digit != highest && s.digit != second && s.digit != least)
            .filter(|s| s.percentage < self.max_pct && !s.is_increasing)
            .min_by(|a, b| a.percentage.total_cmp(&b.percentage))?;

        Some(Signal {
            contract: ContractKind::DigitDiff,
            prediction: target.digit,
            reason: format!(
                "Differ Trigger: Digit {} prob < {}% & decreasing.",
                target.digit, self.max_pct
            ),
        })
    }

    fn tracks_prediction(&self) -> bool {
        true
    }
}

/// Bets on whichever extreme digit is gaining momentum.
pub struct MatchesPolicy;

impl StrategyPolicy for MatchesPolicy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Matches
    }

    fn evaluate(&self, ctx: &TickContext<'_>, _config: &StrategyConfig) -> Option<Signal> {
        let (highest, second, least) = extremes(ctx.snapshot)?;
        let target: &DigitStat = [highest, second, least]
            .iter()
            .filter_map(|d| ctx.snapshot.stat(*d))
            .filter(|s| s.is_increasing)
            .min_by_key(|s| Reverse(s.count))?;

        Some(Signal {
            contract: ContractKind::DigitMatch,
            prediction: target.digit,
            reason: format!("Match Trigger: Digit {} prob increasing.", target.digit),
        })
    }

    fn tracks_prediction(&self) -> bool {
        true
    }
}

pub struct RiseFallPolicy {
    pub threshold_pct: f64,
}

impl StrategyPolicy for RiseFallPolicy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::RiseFall
    }

    fn evaluate(&self, ctx: &TickContext<'_>, _config: &StrategyConfig) -> Option<Signal> {
        let pct = &ctx.snapshot.percentages;
        let (contract, label, value) = if pct.rise > self.threshold_pct {
            (ContractKind::Call, "RISE", pct.rise)
        } else if pct.fall > self.threshold_pct {
            (ContractKind::Put, "FALL", pct.fall)
        } else {
            return None;
        };
        Some(Signal {
            contract,
            prediction: 0,
            reason: format!("Trend Detected: {} ({:.1}%)", label, value),
        })
    }
}
