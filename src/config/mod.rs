//! Configuration management for the digit cracker.
//!
//! Loads settings from an optional config file, then environment variables
//! (prefix `DCR`, separator `__`), after reading `.env`.

use crate::strategy::{StrategyConfig, StrategyKind};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Quote service endpoint and connection lifecycle
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Instrument and account defaults
    #[serde(default)]
    pub market: MarketConfig,
    /// Digit statistics window settings
    #[serde(default)]
    pub stats: StatsConfig,
    /// Strategy trigger thresholds
    #[serde(default)]
    pub triggers: TriggerConfig,
    /// Trade placement and settlement polling
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Per-strategy staking defaults
    #[serde(default)]
    pub strategies: StrategiesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// WebSocket endpoint of the quote service
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Application id appended to the endpoint URL
    #[serde(default = "default_app_id")]
    pub app_id: String,
    /// API token used to authorize the session (empty = read-only)
    #[serde(default)]
    pub api_token: String,
    /// Deadline for a correlated request/response pair
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Deadline for the WebSocket handshake
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Base reconnect delay
    #[serde(default = "default_reconnect_min_delay_ms")]
    pub reconnect_min_delay_ms: u64,
    /// Delay added per failed attempt
    #[serde(default = "default_reconnect_step_ms")]
    pub reconnect_step_ms: u64,
    /// Upper bound on the reconnect delay
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    /// Keep-alive ping period
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    /// Capacity of the decoded-message broadcast channel
    #[serde(default = "default_message_channel_capacity")]
    pub message_channel_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketConfig {
    /// Symbol streamed on startup
    #[serde(default = "default_symbol")]
    pub symbol: String,
    /// Account currency used for proposals
    #[serde(default = "default_currency")]
    pub currency: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsConfig {
    /// Maximum number of digits kept in the sliding window
    #[serde(default = "default_window_capacity")]
    pub window_capacity: usize,
    /// Digits strictly above this value count as "over"
    #[serde(default = "default_over_under_threshold")]
    pub over_under_threshold: u8,
    /// Target digit for match/differ classification
    #[serde(default = "default_match_differ_digit")]
    pub match_differ_digit: u8,
    /// Decimal places used to extract the last digit of a quote
    #[serde(default = "default_pip_scale")]
    pub pip_scale: u32,
    /// Length of each rolling qualitative history
    #[serde(default = "default_history_len")]
    pub history_len: usize,
    /// Short momentum window (ticks)
    #[serde(default = "default_momentum_short_window")]
    pub momentum_short_window: usize,
    /// Medium momentum window (ticks)
    #[serde(default = "default_momentum_medium_window")]
    pub momentum_medium_window: usize,
    /// Digits retained by the predictor
    #[serde(default = "default_predictor_history")]
    pub predictor_history: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Percentage a polarity must exceed before a polarity strategy fires
    #[serde(default = "default_polarity_threshold_pct")]
    pub polarity_threshold_pct: f64,
    /// Minimum length of the opposite run that must just have ended
    #[serde(default = "default_min_reversal_run")]
    pub min_reversal_run: u32,
    /// Differs candidates must sit below this percentage
    #[serde(default = "default_differs_max_pct")]
    pub differs_max_pct: f64,
    /// Lowest digit eligible for differs
    #[serde(default = "default_differs_min_digit")]
    pub differs_min_digit: u8,
    /// Highest digit eligible for differs
    #[serde(default = "default_differs_max_digit")]
    pub differs_max_digit: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Interval between settlement checks
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Settlement checks before giving up on a contract
    #[serde(default = "default_max_poll_attempts")]
    pub max_poll_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategiesConfig {
    #[serde(default = "default_even_odd")]
    pub even_odd: StrategyConfig,
    #[serde(default = "default_over_under")]
    pub over_under: StrategyConfig,
    #[serde(default = "default_matches")]
    pub matches: StrategyConfig,
    #[serde(default = "default_differs")]
    pub differs: StrategyConfig,
    #[serde(default = "default_rise_fall")]
    pub rise_fall: StrategyConfig,
}

impl StrategiesConfig {
    /// Configuration for one strategy kind.
    pub fn for_kind(&self, kind: StrategyKind) -> &StrategyConfig {
        match kind {
            StrategyKind::EvenOdd => &self.even_odd,
            StrategyKind::OverUnder => &self.over_under,
            StrategyKind::Matches => &self.matches,
            StrategyKind::Differs => &self.differs,
            StrategyKind::RiseFall => &self.rise_fall,
        }
    }
}

// Default value functions
fn default_endpoint() -> String {
    "wss://ws.derivws.com/websockets/v3".to_string()
}

fn default_app_id() -> String {
    "1089".to_string()
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_reconnect_min_delay_ms() -> u64 {
    2_000
}

fn default_reconnect_step_ms() -> u64 {
    1_000
}

fn default_reconnect_max_delay_ms() -> u64 {
    5_000
}

fn default_ping_interval_ms() -> u64 {
    30_000
}

fn default_message_channel_capacity() -> usize {
    1024
}

fn default_symbol() -> String {
    "R_100".to_string()
}

fn default_currency() -> String {
    "USD".to_string()
}

fn default_window_capacity() -> usize {
    1000
}

fn default_over_under_threshold() -> u8 {
    5
}

fn default_match_differ_digit() -> u8 {
    6
}

fn default_pip_scale() -> u32 {
    2
}

fn default_history_len() -> usize {
    50
}

fn default_momentum_short_window() -> usize {
    10
}

fn default_momentum_medium_window() -> usize {
    50
}

fn default_predictor_history() -> usize {
    100
}

fn default_polarity_threshold_pct() -> f64 {
    55.0
}

fn default_min_reversal_run() -> u32 {
    2
}

fn default_differs_max_pct() -> f64 {
    10.0
}

fn default_differs_min_digit() -> u8 {
    2
}

fn default_differs_max_digit() -> u8 {
    7
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_max_poll_attempts() -> u32 {
    30
}

fn default_even_odd() -> StrategyConfig {
    StrategyConfig::default()
}

fn default_over_under() -> StrategyConfig {
    StrategyConfig {
        prediction_digit: 4,
        ..StrategyConfig::default()
    }
}

fn default_matches() -> StrategyConfig {
    StrategyConfig::high_payout()
}

fn default_differs() -> StrategyConfig {
    StrategyConfig::high_payout()
}

fn default_rise_fall() -> StrategyConfig {
    StrategyConfig::default()
}

impl ConnectionConfig {
    /// Full socket URL including the application id.
    pub fn url(&self) -> String {
        format!("{}?app_id={}", self.endpoint, self.app_id)
    }

    /// Stored credential, if any.
    pub fn token(&self) -> Option<String> {
        let token = self.api_token.trim();
        (!token.is_empty()).then(|| token.to_string())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }
}

impl ExecutionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("DCR"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.connection.reconnect_min_delay_ms <= self.connection.reconnect_max_delay_ms,
            "reconnect_min_delay_ms must not exceed reconnect_max_delay_ms"
        );

        anyhow::ensure!(
            self.connection.request_timeout_ms > 0,
            "request_timeout_ms must be positive"
        );

        anyhow::ensure!(
            self.connection.ping_interval_ms > 0,
            "ping_interval_ms must be positive"
        );

        anyhow::ensure!(
            self.stats.window_capacity > 0,
            "window_capacity must be positive"
        );

        anyhow::ensure!(
            self.stats.over_under_threshold <= 9 && self.stats.match_differ_digit <= 9,
            "over_under_threshold and match_differ_digit must be digits (0-9)"
        );

        anyhow::ensure!(
            self.stats.momentum_short_window <= self.stats.momentum_medium_window,
            "momentum_short_window must not exceed momentum_medium_window"
        );

        anyhow::ensure!(
            self.triggers.differs_min_digit <= self.triggers.differs_max_digit
                && self.triggers.differs_max_digit <= 9,
            "differs digit range must be an ordered range within 0-9"
        );

        anyhow::ensure!(
            self.execution.max_poll_attempts > 0,
            "max_poll_attempts must be positive"
        );

        for kind in StrategyKind::ALL {
            self.strategies
                .for_kind(kind)
                .validate()
                .with_context(|| format!("Invalid {} strategy config", kind))?;
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            market: MarketConfig::default(),
            stats: StatsConfig::default(),
            triggers: TriggerConfig::default(),
            execution: ExecutionConfig::default(),
            strategies: StrategiesConfig::default(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            app_id: default_app_id(),
            api_token: String::new(),
            request_timeout_ms: default_request_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            reconnect_min_delay_ms: default_reconnect_min_delay_ms(),
            reconnect_step_ms: default_reconnect_step_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            ping_interval_ms: default_ping_interval_ms(),
            message_channel_capacity: default_message_channel_capacity(),
        }
    }
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            currency: default_currency(),
        }
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            window_capacity: default_window_capacity(),
            over_under_threshold: default_over_under_threshold(),
            match_differ_digit: default_match_differ_digit(),
            pip_scale: default_pip_scale(),
            history_len: default_history_len(),
            momentum_short_window: default_momentum_short_window(),
            momentum_medium_window: default_momentum_medium_window(),
            predictor_history: default_predictor_history(),
        }
    }
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            polarity_threshold_pct: default_polarity_threshold_pct(),
            min_reversal_run: default_min_reversal_run(),
            differs_max_pct: default_differs_max_pct(),
            differs_min_digit: default_differs_min_digit(),
            differs_max_digit: default_differs_max_digit(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_poll_attempts: default_max_poll_attempts(),
        }
    }
}

impl Default for StrategiesConfig {
    fn default() -> Self {
        Self {
            even_odd: default_even_odd(),
            over_under: default_over_under(),
            matches: default_matches(),
            differs: default_differs(),
            rise_fall: default_rise_fall(),
        }
    }
}
