//! Per-strategy staking configuration and typed updates.

use super::error::StrategyError;
use anyhow::Result;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    /// Base stake per contract
    pub stake: Decimal,
    /// Stake multiplier applied per consecutive loss
    pub martingale_multiplier: Decimal,
    /// Contract duration in ticks
    pub tick_duration: u32,
    /// Session loss that stops the strategy
    pub max_loss_amount: Decimal,
    pub use_max_loss: bool,
    /// Session profit that stops the strategy
    pub take_profit_amount: Option<Decimal>,
    /// Barrier digit for over/under/matches/differs
    pub prediction_digit: u8,
    pub max_runs: u32,
    pub runs_count: u32,
    pub use_martingale: bool,
    pub use_compounding: bool,
    /// Start the partner strategy after a max-loss stop
    pub switch_on_max_loss: bool,
    pub is_running: bool,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            stake: dec!(0.35),
            martingale_multiplier: dec!(2.1),
            tick_duration: 1,
            max_loss_amount: dec!(5),
            use_max_loss: true,
            take_profit_amount: Some(dec!(10)),
            prediction_digit: 0,
            max_runs: 12,
            runs_count: 0,
            use_martingale: true,
            use_compounding: false,
            switch_on_max_loss: false,
            is_running: false,
        }
    }
}

impl StrategyConfig {
    /// Defaults for the high-payout digit contracts (matches, differs).
    pub fn high_payout() -> Self {
        Self {
            martingale_multiplier: dec!(11),
            take_profit_amount: None,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.stake > Decimal::ZERO, "stake must be positive");
        anyhow::ensure!(
            self.martingale_multiplier >= Decimal::ONE,
            "martingale_multiplier must be at least 1"
        );
        anyhow::ensure!(
            (1..=10).contains(&self.tick_duration),
            "tick_duration must be between 1 and 10"
        );
        anyhow::ensure!(
            self.max_loss_amount >= Decimal::ZERO,
            "max_loss_amount must not be negative"
        );
        if let Some(take_profit) = self.take_profit_amount {
            anyhow::ensure!(take_profit > Decimal::ZERO, "take_profit_amount must be positive");
        }
        anyhow::ensure!(self.prediction_digit <= 9, "prediction_digit must be a digit (0-9)");
        anyhow::ensure!(self.max_runs > 0, "max_runs must be positive");
        Ok(())
    }
}

/// A single field change, as issued by the UI.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigUpdate {
    Stake(Decimal),
    MartingaleMultiplier(Decimal),
    TickDuration(u32),
    MaxLossAmount(Decimal),
    UseMaxLoss(bool),
    TakeProfitAmount(Option<Decimal>),
    PredictionDigit(u8),
    MaxRuns(u32),
    RunsCount(u32),
    UseMartingale(bool),
    UseCompounding(bool),
    SwitchOnMaxLoss(bool),
}

impl ConfigUpdate {
    /// Parse a `key = value` pair. Accepts both the field names and the
    /// short keys used by the dashboard (`multiplier`, `ticks`, `prediction`...).
    pub fn parse(key: &str, value: &str) -> Result<Self, StrategyError> {
        let invalid = || StrategyError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        };
        let value = value.trim();
        let update = match key.trim() {
            "stake" => ConfigUpdate::Stake(parse_decimal(value).ok_or_else(invalid)?),
            "multiplier" | "martingale_multiplier" => {
                ConfigUpdate::MartingaleMultiplier(parse_decimal(value).ok_or_else(invalid)?)
            }
            "ticks" | "tick_duration" => {
                ConfigUpdate::TickDuration(value.parse().map_err(|_| invalid())?)
            }
            "max_loss" | "max_loss_amount" => {
                ConfigUpdate::MaxLossAmount(parse_decimal(value).ok_or_else(invalid)?)
            }
            "use_max_loss" => ConfigUpdate::UseMaxLoss(parse_bool(value).ok_or_else(invalid)?),
            "take_profit" | "take_profit_amount" => {
                let amount = match value.to_ascii_lowercase().as_str() {
                    "" | "none" | "off" => None,
                    _ => Some(parse_decimal(value).ok_or_else(invalid)?),
                };
                ConfigUpdate::TakeProfitAmount(amount.filter(|a| *a > Decimal::ZERO))
            }
            "prediction" | "prediction_digit" => {
                ConfigUpdate::PredictionDigit(value.parse().map_err(|_| invalid())?)
            }
            "max_runs" => ConfigUpdate::MaxRuns(value.parse().map_err(|_| invalid())?),
            "runs_count" => ConfigUpdate::RunsCount(value.parse().map_err(|_| invalid())?),
            "use_martingale" => {
                ConfigUpdate::UseMartingale(parse_bool(value).ok_or_else(invalid)?)
            }
            "use_compounding" => {
                ConfigUpdate::UseCompounding(parse_bool(value).ok_or_else(invalid)?)
            }
            "switch_condition" | "switch_on_max_loss" => {
                ConfigUpdate::SwitchOnMaxLoss(parse_bool(value).ok_or_else(invalid)?)
            }
            other => return Err(StrategyError::UnknownKey(other.to_string())),
        };
        Ok(update)
    }

    /// Apply to `config`, leaving it untouched if the result would be invalid.
    pub fn apply(&self, config: &mut StrategyConfig) -> Result<(), StrategyError> {
        let mut next = config.clone();
        match self {
            ConfigUpdate::Stake(v) => next.stake = *v,
            ConfigUpdate::MartingaleMultiplier(v) => next.martingale_multiplier = *v,
            ConfigUpdate::TickDuration(v) => next.tick_duration = *v,
            ConfigUpdate::MaxLossAmount(v) => next.max_loss_amount = *v,
            ConfigUpdate::UseMaxLoss(v) => next.use_max_loss = *v,
            ConfigUpdate::TakeProfitAmount(v) => next.take_profit_amount = *v,
            ConfigUpdate::PredictionDigit(v) => next.prediction_digit = *v,
            ConfigUpdate::MaxRuns(v) => next.max_runs = *v,
            ConfigUpdate::RunsCount(v) => next.runs_count = *v,
            ConfigUpdate::UseMartingale(v) => next.use_martingale = *v,
            ConfigUpdate::UseCompounding(v) => next.use_compounding = *v,
            ConfigUpdate::SwitchOnMaxLoss(v) => next.switch_on_max_loss = *v,
        }
        next.validate()
            .map_err(|e| StrategyError::Rejected(e.to_string()))?;
        *config = next;
        Ok(())
    }
}

fn parse_decimal(value: &str) -> Option<Decimal> {
    Decimal::from_str(value)
        .or_else(|_| Decimal::from_scientific(value))
        .ok()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(StrategyConfig::default().validate().is_ok());
        let high = StrategyConfig::high_payout();
        assert_eq!(high.martingale_multiplier, dec!(11));
        assert_eq!(high.take_profit_amount, None);
        assert!(high.validate().is_ok());
    }

    #[test]
    fn test_parse_short_and_long_keys() {
        assert_eq!(
            ConfigUpdate::parse("multiplier", "2").unwrap(),
            ConfigUpdate::MartingaleMultiplier(dec!(2))
        );
        assert_eq!(
            ConfigUpdate::parse("prediction_digit", " 4 ").unwrap(),
            ConfigUpdate::PredictionDigit(4)
        );
        assert_eq!(
            ConfigUpdate::parse("take_profit", "none").unwrap(),
            ConfigUpdate::TakeProfitAmount(None)
        );
        assert_eq!(
            ConfigUpdate::parse("switch_condition", "yes").unwrap(),
            ConfigUpdate::SwitchOnMaxLoss(true)
        );
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(matches!(
            ConfigUpdate::parse("colour", "red"),
            Err(StrategyError::UnknownKey(_))
        ));
        assert!(matches!(
            ConfigUpdate::parse("stake", "lots"),
            Err(StrategyError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_apply_keeps_config_on_invalid_value() {
        let mut config = StrategyConfig::default();
        let err = ConfigUpdate::PredictionDigit(12).apply(&mut config);
        assert!(matches!(err, Err(StrategyError::Rejected(_))));
        assert_eq!(config.prediction_digit, 0);

        ConfigUpdate::Stake(dec!(1.5)).apply(&mut config).unwrap();
        assert_eq!(config.stake, dec!(1.5));
    }
}
