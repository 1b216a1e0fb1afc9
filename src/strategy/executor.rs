//! Contract execution and settlement tracking.

use super::error::TradeError;
use crate::config::ExecutionConfig;
use crate::exchange::{BuyReceipt, ContractKind, OpenContract, ProposalRequest, QuoteApi, QuoteApiExt};
use crate::stats::extract_last_digit;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, warn};

/// What to buy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TradeOrder {
    pub contract: ContractKind,
    pub prediction: u8,
    pub stake: Decimal,
    pub symbol: String,
    pub currency: String,
    pub duration_ticks: u32,
}

impl TradeOrder {
    pub fn to_proposal(&self) -> ProposalRequest {
        ProposalRequest {
            contract: self.contract,
            amount: self.stake,
            currency: self.currency.clone(),
            duration_ticks: self.duration_ticks,
            symbol: self.symbol.clone(),
            barrier: self.contract.needs_barrier().then_some(self.prediction),
        }
    }
}

/// A settled contract.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradeOutcome {
    pub contract_id: String,
    pub contract: ContractKind,
    pub prediction: u8,
    pub profit: Decimal,
    pub exit_tick: Option<Decimal>,
}

impl TradeOutcome {
    pub fn is_win(&self) -> bool {
        self.profit > Decimal::ZERO
    }

    /// Last digit of the exit quote as it was reported.
    pub fn exit_digit(&self) -> Option<u8> {
        self.exit_tick.map(|tick| extract_last_digit(tick, tick.scale()))
    }

    /// Human-readable prediction vs. result, for the journal.
    pub fn detail(&self) -> String {
        let exit = self
            .exit_digit()
            .map(|d| d.to_string())
            .unwrap_or_else(|| "?".to_string());
        match self.contract {
            ContractKind::DigitEven => format!("Predicted EVEN, Exit Digit: {}", exit),
            ContractKind::DigitOdd => format!("Predicted ODD, Exit Digit: {}", exit),
            ContractKind::DigitOver => format!("Predicted OVER {}, Exit Digit: {}", self.prediction, exit),
            ContractKind::DigitUnder => format!("Predicted UNDER {}, Exit Digit: {}", self.prediction, exit),
            ContractKind::DigitMatch => format!("Predicted MATCH {}, Exit Digit: {}", self.prediction, exit),
            ContractKind::DigitDiff => format!("Predicted DIFF {}, Exit Digit: {}", self.prediction, exit),
            ContractKind::Call | ContractKind::Put => {
                let exit = self
                    .exit_tick
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "?".to_string());
                format!("Predicted {}, Exit: {}", self.contract, exit)
            }
        }
    }
}

/// Places contracts and waits for them to settle.
#[derive(Debug, Clone)]
pub struct TradeExecutor {
    config: ExecutionConfig,
}

impl TradeExecutor {
    pub fn new(config: ExecutionConfig) -> Self {
        Self { config }
    }

    /// Request a quote and buy it at the quoted stake.
    pub async fn place(&self, api: &dyn QuoteApi, order: &TradeOrder) -> Result<BuyReceipt, TradeError> {
        let proposal = api.proposal(&order.to_proposal()).await?;
        debug!(
            symbol = %order.symbol,
            contract = %order.contract,
            proposal_id = %proposal.id,
            ask_price = %proposal.ask_price,
            "Proposal received"
        );

        let receipt = api.buy(&proposal.id, order.stake).await?;
        info!(
            symbol = %order.symbol,
            contract = %order.contract,
            contract_id = %receipt.contract_id,
            buy_price = %receipt.buy_price,
            "Contract bought"
        );
        Ok(receipt)
    }

    /// Poll `proposal_open_contract` until the contract is sold.
    ///
    /// Request timeouts count as a failed check and polling continues; any
    /// other API error ends the wait.
    pub async fn await_settlement(
        &self,
        api: &dyn QuoteApi,
        contract_id: &str,
    ) -> Result<OpenContract, TradeError> {
        let attempts = self.config.max_poll_attempts;
        for attempt in 1..=attempts {
            tokio::time::sleep(self.config.poll_interval()).await;

            match api.open_contract(contract_id).await {
                Ok(contract) if contract.is_sold => {
                    debug!(%contract_id, attempt, "Contract settled");
                    return Ok(contract);
                }
                Ok(_) => {}
                Err(e) if e.is_timeout() => {
                    warn!(%contract_id, attempt, error = %e, "Settlement check timed out, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        warn!(%contract_id, attempts, "Contract did not settle in time");
        Err(TradeError::SettlementTimeout {
            contract_id: contract_id.to_string(),
            attempts,
        })
    }

    /// Place `order` and wait for its result.
    pub async fn execute(&self, api: &dyn QuoteApi, order: &TradeOrder) -> Result<TradeOutcome, TradeError> {
        let receipt = self.place(api, order).await?;
        self.settle(api, order, &receipt.contract_id).await
    }

    /// Wait for an already bought contract and turn it into an outcome.
    pub async fn settle(
        &self,
        api: &dyn QuoteApi,
        order: &TradeOrder,
        contract_id: &str,
    ) -> Result<TradeOutcome, TradeError> {
        let settled = self.await_settlement(api, contract_id).await?;
        let profit = settled
            .profit
            .ok_or_else(|| TradeError::MissingProfit(contract_id.to_string()))?;
        Ok(TradeOutcome {
            contract_id: contract_id.to_string(),
            contract: order.contract,
            prediction: order.prediction,
            profit,
            exit_tick: settled.exit_tick,
        })
    }
}
