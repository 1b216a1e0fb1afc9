//! Transport-agnostic seam for the quote and trade service.
//!
//! The subscription multiplexer and trade executor only need correlated
//! request/response plus a feed of decoded frames. `ConnectionManager` talks
//! to the live socket; `PaperQuoteService` answers in-process.

use super::error::ApiError;
use super::types::{
    active_symbols_request, authorize_request, buy_request, forget_all_request, forget_request,
    open_contract_request, sell_request, ActiveSymbol, BuyReceipt, OpenContract, Proposal,
    ProposalRequest, Request, Response, SellReceipt,
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QuoteApi: Send + Sync {
    /// Send a request and wait for the reply bearing the same `req_id`.
    ///
    /// Service-reported errors come back as `ApiError::Service`; a missing
    /// reply becomes `ApiError::Timeout` once `timeout` elapses.
    async fn send_request(&self, request: Request, timeout: Duration)
        -> Result<Response, ApiError>;

    /// Whether frames can currently be written.
    fn is_open(&self) -> bool;

    /// Every decoded frame, including stream pushes.
    fn messages(&self) -> broadcast::Receiver<Arc<Response>>;

    /// Deadline applied by callers that have no specific one.
    fn default_timeout(&self) -> Duration;
}

fn missing(msg_type: &str) -> ApiError {
    ApiError::Protocol(format!("{} reply without payload", msg_type))
}

/// Typed convenience requests on top of [`QuoteApi::send_request`].
#[async_trait]
pub trait QuoteApiExt: QuoteApi {
    async fn authorize_with(&self, token: &str) -> Result<Response, ApiError> {
        self.send_request(authorize_request(token), self.default_timeout())
            .await
    }

    async fn proposal(&self, params: &ProposalRequest) -> Result<Proposal, ApiError> {
        let response = self
            .send_request(params.to_request(), self.default_timeout())
            .await?;
        response.proposal().ok_or_else(|| missing("proposal"))
    }

    async fn buy(&self, proposal_id: &str, price: Decimal) -> Result<BuyReceipt, ApiError> {
        let response = self
            .send_request(buy_request(proposal_id, price), self.default_timeout())
            .await?;
        response.buy().ok_or_else(|| missing("buy"))
    }

    async fn sell(&self, contract_id: &str, price: Decimal) -> Result<SellReceipt, ApiError> {
        let response = self
            .send_request(sell_request(contract_id, price), self.default_timeout())
            .await?;
        response.sell().ok_or_else(|| missing("sell"))
    }

    async fn open_contract(&self, contract_id: &str) -> Result<OpenContract, ApiError> {
        let response = self
            .send_request(open_contract_request(contract_id), self.default_timeout())
            .await?;
        response
            .open_contract()
            .ok_or_else(|| missing("proposal_open_contract"))
    }

    async fn active_symbols(&self) -> Result<Vec<ActiveSymbol>, ApiError> {
        let response = self
            .send_request(active_symbols_request(), self.default_timeout())
            .await?;
        response
            .active_symbols()
            .ok_or_else(|| missing("active_symbols"))
    }

    async fn forget(&self, subscription_id: &str) -> Result<(), ApiError> {
        self.send_request(forget_request(subscription_id), self.default_timeout())
            .await
            .map(|_| ())
    }

    async fn forget_all(&self, category: &str) -> Result<(), ApiError> {
        self.send_request(forget_all_request(category), self.default_timeout())
            .await
            .map(|_| ())
    }
}

impl<T: QuoteApi + ?Sized> QuoteApiExt for T {}
