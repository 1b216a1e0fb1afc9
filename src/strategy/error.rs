//! Strategy and trade error types.

use crate::exchange::ApiError;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StrategyError {
    #[error("unknown strategy: {0}")]
    UnknownStrategy(String),

    #[error("unknown config key: {0}")]
    UnknownKey(String),

    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },

    #[error("rejected config update: {0}")]
    Rejected(String),

    #[error("stake overflow after {loss_streak} consecutive losses")]
    StakeOverflow { loss_streak: u32 },
}

/// Failure while quoting, buying or settling a contract.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TradeError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("contract {contract_id} not settled after {attempts} checks")]
    SettlementTimeout { contract_id: String, attempts: u32 },

    #[error("settled contract {0} reported no profit")]
    MissingProfit(String),

    #[error("trade cancelled")]
    Cancelled,
}

impl TradeError {
    /// Message shown in the strategy journal.
    pub fn user_message(&self) -> String {
        match self {
            TradeError::Api(ApiError::Service { message, .. }) => message.clone(),
            other => other.to_string(),
        }
    }
}
