//! In-process quote service for paper trading and replay.
//!
//! Answers the same request verbs as the live service, settles contracts
//! against ticks fed through [`PaperQuoteService::observe_tick`] and pushes
//! tick frames to stream consumers the way the live socket does.

use super::error::ApiError;
use super::traits::QuoteApi;
use super::types::{ContractKind, Request, Response};
use crate::stats::extract_last_digit;
use crate::utils::decimal::{decimal_from_value, round_stake};
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

const HISTORY_LIMIT: usize = 5_000;

/// Gross payout per unit of stake for each contract kind.
#[derive(Debug, Clone)]
pub struct PayoutTable {
    ratios: HashMap<ContractKind, Decimal>,
}

impl Default for PayoutTable {
    fn default() -> Self {
        let ratios = HashMap::from([
            (ContractKind::DigitEven, dec!(1.95)),
            (ContractKind::DigitOdd, dec!(1.95)),
            (ContractKind::DigitOver, dec!(1.95)),
            (ContractKind::DigitUnder, dec!(1.95)),
            (ContractKind::DigitMatch, dec!(9.5)),
            (ContractKind::DigitDiff, dec!(1.09)),
            (ContractKind::Call, dec!(1.95)),
            (ContractKind::Put, dec!(1.95)),
        ]);
        Self { ratios }
    }
}

impl PayoutTable {
    pub fn ratio(&self, contract: ContractKind) -> Decimal {
        self.ratios.get(&contract).copied().unwrap_or(Decimal::ONE)
    }

    pub fn set(&mut self, contract: ContractKind, ratio: Decimal) {
        self.ratios.insert(contract, ratio);
    }
}

#[derive(Debug, Clone)]
struct Quote {
    contract: ContractKind,
    symbol: String,
    stake: Decimal,
    payout: Decimal,
    barrier: u8,
    duration: u32,
}

/// A purchased, unsettled contract.
#[derive(Debug, Clone)]
pub struct PaperContract {
    pub contract_id: String,
    pub contract: ContractKind,
    pub symbol: String,
    pub stake: Decimal,
    pub payout: Decimal,
    pub barrier: u8,
    pub entry_price: Option<Decimal>,
    pub ticks_remaining: u32,
}

#[derive(Debug, Clone)]
pub struct Settlement {
    pub contract_id: String,
    pub contract: ContractKind,
    pub profit: Decimal,
    pub exit_price: Decimal,
    pub exit_digit: u8,
}

/// Paper account state.
#[derive(Debug)]
pub struct PaperState {
    pub initial_balance: Decimal,
    pub balance: Decimal,
    pub total_profit: Decimal,
    pub contract_count: u64,
    pub open: HashMap<String, PaperContract>,
    pub settled: HashMap<String, Settlement>,
    quotes: HashMap<String, Quote>,
    last_price: HashMap<String, Decimal>,
    history: HashMap<String, VecDeque<(i64, Decimal)>>,
    streams: HashMap<String, String>,
}

impl PaperState {
    fn new(balance: Decimal) -> Self {
        Self {
            initial_balance: balance,
            balance,
            total_profit: Decimal::ZERO,
            contract_count: 0,
            open: HashMap::new(),
            settled: HashMap::new(),
            quotes: HashMap::new(),
            last_price: HashMap::new(),
            history: HashMap::new(),
            streams: HashMap::new(),
        }
    }
}

pub struct PaperQuoteService {
    state: Arc<RwLock<PaperState>>,
    id_counter: AtomicU64,
    payouts: PayoutTable,
    pip_scale: u32,
    currency: String,
    open: AtomicBool,
    messages: broadcast::Sender<Arc<Response>>,
}

impl PaperQuoteService {
    pub fn new(initial_balance: Decimal, pip_scale: u32) -> Self {
        let (messages, _) = broadcast::channel(1024);
        Self {
            state: Arc::new(RwLock::new(PaperState::new(initial_balance))),
            id_counter: AtomicU64::new(1),
            payouts: PayoutTable::default(),
            pip_scale,
            currency: "USD".to_string(),
            open: AtomicBool::new(true),
            messages,
        }
    }

    pub fn with_payouts(mut self, payouts: PayoutTable) -> Self {
        self.payouts = payouts;
        self
    }

    pub fn with_currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = currency.into();
        self
    }

    /// Simulate the transport going away (requests fail with `NotConnected`).
    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    pub async fn balance(&self) -> Decimal {
        self.state.read().await.balance
    }

    pub async fn total_profit(&self) -> Decimal {
        self.state.read().await.total_profit
    }

    pub async fn open_contracts(&self) -> usize {
        self.state.read().await.open.len()
    }

    pub async fn settlement(&self, contract_id: &str) -> Option<Settlement> {
        self.state.read().await.settled.get(contract_id).cloned()
    }

    /// Seed history returned by `ticks_history` without settling anything.
    pub async fn seed_history(&self, symbol: &str, ticks: &[(i64, Decimal)]) {
        let mut state = self.state.write().await;
        let history = state.history.entry(symbol.to_string()).or_default();
        for &(epoch, quote) in ticks {
            history.push_back((epoch, quote));
            if history.len() > HISTORY_LIMIT {
                history.pop_front();
            }
        }
        if let Some(&(_, last)) = ticks.last() {
            state.last_price.insert(symbol.to_string(), last);
        }
    }

    /// Feed one tick: settles expiring contracts and pushes a tick frame to
    /// any live `ticks_history` stream for the symbol.
    pub async fn observe_tick(&self, symbol: &str, quote: Decimal, epoch: i64) -> Vec<Settlement> {
        let (settlements, stream_id) = {
            let mut state = self.state.write().await;
            let history = state.history.entry(symbol.to_string()).or_default();
            history.push_back((epoch, quote));
            if history.len() > HISTORY_LIMIT {
                history.pop_front();
            }
            state.last_price.insert(symbol.to_string(), quote);

            let exit_digit = extract_last_digit(quote, self.pip_scale);
            let mut expired = Vec::new();
            for contract in state.open.values_mut().filter(|c| c.symbol == symbol) {
                if contract.entry_price.is_none() {
                    contract.entry_price = Some(quote);
                }
                contract.ticks_remaining = contract.ticks_remaining.saturating_sub(1);
                if contract.ticks_remaining == 0 {
                    expired.push(contract.contract_id.clone());
                }
            }

            let mut settlements = Vec::with_capacity(expired.len());
            for contract_id in expired {
                let Some(contract) = state.open.remove(&contract_id) else {
                    continue;
                };
                let entry = contract.entry_price.unwrap_or(quote);
                let won = contract
                    .contract
                    .wins(contract.barrier, exit_digit, quote - entry);
                let profit = if won {
                    contract.payout - contract.stake
                } else {
                    -contract.stake
                };
                if won {
                    state.balance += contract.payout;
                }
                state.total_profit += profit;

                info!(
                    contract_id = %contract.contract_id,
                    contract = %contract.contract,
                    exit_digit,
                    profit = %profit,
                    balance = %state.balance,
                    "Paper contract settled"
                );

                let settlement = Settlement {
                    contract_id: contract.contract_id.clone(),
                    contract: contract.contract,
                    profit,
                    exit_price: quote,
                    exit_digit,
                };
                state.settled.insert(contract.contract_id, settlement.clone());
                settlements.push(settlement);
            }
            (settlements, state.streams.get(symbol).cloned())
        };

        if let Some(stream_id) = stream_id {
            let frame = json!({
                "msg_type": "tick",
                "echo_req": {"ticks_history": symbol, "subscribe": 1},
                "subscription": {"id": stream_id},
                "tick": {
                    "symbol": symbol,
                    "quote": quote.to_string(),
                    "epoch": epoch,
                    "pip_size": self.pip_scale,
                },
            });
            if let Ok(response) = serde_json::from_value::<Response>(frame) {
                let _ = self.messages.send(Arc::new(response));
            }
        }
        settlements
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.id_counter.fetch_add(1, Ordering::SeqCst))
    }

    async fn answer(&self, request: &Request) -> Result<(String, Value), ApiError> {
        if request.contains_key("proposal") {
            return self.open_quote(request).await;
        }
        if let Some(proposal_id) = request.get("buy").and_then(Value::as_str) {
            return self.fill(proposal_id).await;
        }
        if let Some(contract_id) = request.get("sell").and_then(Value::as_str) {
            return self.close_early(contract_id).await;
        }
        if request.contains_key("proposal_open_contract") {
            let contract_id = text_field(request, "contract_id")?;
            return Ok(self.contract_status(&contract_id).await);
        }
        if let Some(symbol) = request.get("ticks_history").and_then(Value::as_str) {
            return Ok(self.history_reply(symbol, request).await);
        }
        if request.contains_key("balance") {
            let state = self.state.read().await;
            return Ok((
                "balance".to_string(),
                json!({"balance": {"balance": state.balance.to_string(), "currency": self.currency, "loginid": "PAPER"}}),
            ));
        }
        if request.contains_key("active_symbols") {
            let state = self.state.read().await;
            let pip = Decimal::new(1, self.pip_scale);
            let symbols: Vec<Value> = state
                .history
                .keys()
                .map(|symbol| json!({"symbol": symbol, "display_name": symbol, "market": "synthetic_index", "pip": pip.to_string()}))
                .collect();
            return Ok(("active_symbols".to_string(), json!({ "active_symbols": symbols })));
        }
        if let Some(id) = request.get("forget").and_then(Value::as_str) {
            let mut state = self.state.write().await;
            let before = state.streams.len();
            state.streams.retain(|_, stream| stream != id);
            let removed = i64::from(state.streams.len() != before);
            return Ok(("forget".to_string(), json!({ "forget": removed })));
        }
        if request.contains_key("forget_all") {
            self.state.write().await.streams.clear();
            return Ok(("forget_all".to_string(), json!({ "forget_all": [] })));
        }
        if request.contains_key("authorize") {
            let state = self.state.read().await;
            return Ok((
                "authorize".to_string(),
                json!({"authorize": {"loginid": "PAPER", "balance": state.balance.to_string(), "currency": self.currency}}),
            ));
        }
        if request.contains_key("ping") {
            return Ok(("ping".to_string(), json!({"ping": "pong"})));
        }
        Err(ApiError::Service {
            code: "UnrecognisedRequest".to_string(),
            message: "Unrecognised request".to_string(),
        })
    }

    async fn open_quote(&self, request: &Request) -> Result<(String, Value), ApiError> {
        let contract: ContractKind = request
            .get("contract_type")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .ok_or_else(|| invalid("contract_type"))?;
        let stake = request
            .get("amount")
            .and_then(decimal_from_value)
            .map(round_stake)
            .ok_or_else(|| invalid("amount"))?;
        let symbol = text_field(request, "symbol")?;
        let duration = request
            .get("duration")
            .and_then(Value::as_u64)
            .unwrap_or(1)
            .max(1) as u32;
        let barrier = request
            .get("barrier")
            .and_then(|v| v.as_str().map(str::to_string).or_else(|| v.as_u64().map(|n| n.to_string())))
            .and_then(|s| s.parse::<u8>().ok())
            .unwrap_or(0);

        let payout = stake
            .checked_mul(self.payouts.ratio(contract))
            .map(round_stake)
            .ok_or_else(|| invalid("amount"))?;
        let id = self.next_id("proposal");
        self.state.write().await.quotes.insert(
            id.clone(),
            Quote {
                contract,
                symbol,
                stake,
                payout,
                barrier,
                duration,
            },
        );
        debug!(proposal_id = %id, %contract, stake = %stake, payout = %payout, "Paper proposal");
        Ok((
            "proposal".to_string(),
            json!({"proposal": {"id": id, "ask_price": stake.to_string(), "payout": payout.to_string()}}),
        ))
    }

    async fn fill(&self, proposal_id: &str) -> Result<(String, Value), ApiError> {
        let mut state = self.state.write().await;
        let quote = state.quotes.remove(proposal_id).ok_or_else(|| ApiError::Service {
            code: "InvalidContractProposal".to_string(),
            message: format!("Unknown proposal {}", proposal_id),
        })?;
        if quote.stake > state.balance {
            return Err(ApiError::Service {
                code: "InsufficientBalance".to_string(),
                message: "Insufficient balance".to_string(),
            });
        }

        state.balance -= quote.stake;
        state.contract_count += 1;
        let contract_id = self.next_id("contract");
        let entry_price = state.last_price.get(&quote.symbol).copied();
        state.open.insert(
            contract_id.clone(),
            PaperContract {
                contract_id: contract_id.clone(),
                contract: quote.contract,
                symbol: quote.symbol,
                stake: quote.stake,
                payout: quote.payout,
                barrier: quote.barrier,
                entry_price,
                ticks_remaining: quote.duration,
            },
        );
        info!(%contract_id, contract = %quote.contract, stake = %quote.stake, "Paper contract bought");
        Ok((
            "buy".to_string(),
            json!({"buy": {"contract_id": contract_id, "buy_price": quote.stake.to_string(), "payout": quote.payout.to_string()}}),
        ))
    }

    async fn close_early(&self, contract_id: &str) -> Result<(String, Value), ApiError> {
        let mut state = self.state.write().await;
        let contract = state.open.remove(contract_id).ok_or_else(|| ApiError::Service {
            code: "InvalidSellContractProposal".to_string(),
            message: format!("Contract {} is not open", contract_id),
        })?;
        state.balance += contract.stake;
        let exit_price = state.last_price.get(&contract.symbol).copied().unwrap_or_default();
        state.settled.insert(
            contract_id.to_string(),
            Settlement {
                contract_id: contract_id.to_string(),
                contract: contract.contract,
                profit: Decimal::ZERO,
                exit_price,
                exit_digit: extract_last_digit(exit_price, self.pip_scale),
            },
        );
        Ok(("sell".to_string(), json!({"sell": {"sold_for": contract.stake.to_string()}})))
    }

    async fn contract_status(&self, contract_id: &str) -> (String, Value) {
        let state = self.state.read().await;
        let body = match (state.settled.get(contract_id), state.open.get(contract_id)) {
            (Some(done), _) => json!({
                "contract_id": contract_id,
                "is_sold": 1,
                "profit": done.profit.to_string(),
                "status": if done.profit > Decimal::ZERO { "won" } else { "lost" },
                "exit_tick": done.exit_price.to_string(),
                "contract_type": done.contract.as_str(),
            }),
            (None, Some(open)) => json!({
                "contract_id": contract_id,
                "is_sold": 0,
                "status": "open",
                "contract_type": open.contract.as_str(),
            }),
            (None, None) => json!({ "contract_id": contract_id, "is_sold": 0 }),
        };
        ("proposal_open_contract".to_string(), json!({ "proposal_open_contract": body }))
    }

    async fn history_reply(&self, symbol: &str, request: &Request) -> (String, Value) {
        let count = request.get("count").and_then(Value::as_u64).unwrap_or(1000) as usize;
        let subscribe = request.get("subscribe").and_then(Value::as_i64) == Some(1);

        let mut state = self.state.write().await;
        let stream_id = if subscribe {
            let next = self.next_id("stream");
            Some(state.streams.entry(symbol.to_string()).or_insert(next).clone())
        } else {
            None
        };
        let ticks: Vec<(i64, Decimal)> = state
            .history
            .get(symbol)
            .map(|h| h.iter().rev().take(count).rev().copied().collect())
            .unwrap_or_default();
        let prices: Vec<String> = ticks.iter().map(|(_, q)| q.to_string()).collect();
        let times: Vec<i64> = ticks.iter().map(|(t, _)| *t).collect();

        let mut body = json!({"history": {"prices": prices, "times": times}, "pip_size": self.pip_scale});
        if let (Some(id), Some(obj)) = (stream_id, body.as_object_mut()) {
            obj.insert("subscription".to_string(), json!({ "id": id }));
        }
        ("history".to_string(), body)
    }
}

fn invalid(field: &str) -> ApiError {
    ApiError::Service {
        code: "InputValidationFailed".to_string(),
        message: format!("Invalid or missing field: {}", field),
    }
}

fn text_field(request: &Request, field: &str) -> Result<String, ApiError> {
    match request.get(field) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(invalid(field)),
    }
}

#[async_trait]
impl QuoteApi for PaperQuoteService {
    async fn send_request(
        &self,
        request: Request,
        _timeout: Duration,
    ) -> Result<Response, ApiError> {
        if !self.is_open() {
            return Err(ApiError::NotConnected);
        }
        let req_id = self.id_counter.fetch_add(1, Ordering::SeqCst);
        let mut echo = request.clone();
        echo.insert("req_id".to_string(), Value::from(req_id));

        let (msg_type, body) = self.answer(&request).await?;
        let mut frame = json!({ "msg_type": msg_type, "req_id": req_id, "echo_req": echo });
        if let (Some(obj), Value::Object(extra)) = (frame.as_object_mut(), body) {
            obj.extend(extra);
        }
        let response: Response =
            serde_json::from_value(frame).map_err(|e| ApiError::Protocol(e.to_string()))?;
        let _ = self.messages.send(Arc::new(response.clone()));
        Ok(response)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn messages(&self) -> broadcast::Receiver<Arc<Response>> {
        self.messages.subscribe()
    }

    fn default_timeout(&self) -> Duration {
        Duration::from_secs(5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::traits::QuoteApiExt;
    use crate::exchange::types::{ticks_history_request, ProposalRequest};

    fn proposal(contract: ContractKind, barrier: Option<u8>, duration_ticks: u32) -> ProposalRequest {
        ProposalRequest {
            contract,
            amount: dec!(1),
            currency: "USD".to_string(),
            duration_ticks,
            symbol: "R_100".to_string(),
            barrier,
        }
    }

    async fn buy(service: &PaperQuoteService, params: &ProposalRequest) -> String {
        let quote = service.proposal(params).await.unwrap();
        service.buy(&quote.id, quote.ask_price).await.unwrap().contract_id
    }

    #[tokio::test]
    async fn test_differs_contract_settles_on_next_tick() {
        let service = PaperQuoteService::new(dec!(100), 2);
        service.seed_history("R_100", &[(1, dec!(100.00))]).await;

        let contract_id = buy(&service, &proposal(ContractKind::DigitDiff, Some(4), 1)).await;
        assert_eq!(service.balance().await, dec!(99));
        assert_eq!(service.open_contracts().await, 1);

        let open = service.open_contract(&contract_id).await.unwrap();
        assert!(!open.is_sold);

        let settled = service.observe_tick("R_100", dec!(100.25), 2).await;
        assert_eq!(settled.len(), 1);
        assert_eq!(settled[0].exit_digit, 5);
        assert_eq!(settled[0].profit, dec!(0.09));

        let done = service.open_contract(&contract_id).await.unwrap();
        assert!(done.is_sold);
        assert_eq!(done.profit, Some(dec!(0.09)));
        assert_eq!(service.balance().await, dec!(100.09));
    }

    #[tokio::test]
    async fn test_losing_rise_contract() {
        let service = PaperQuoteService::new(dec!(10), 2);
        service.seed_history("R_100", &[(1, dec!(50.00))]).await;

        let contract_id = buy(&service, &proposal(ContractKind::Call, None, 2)).await;
        assert!(service.observe_tick("R_100", dec!(50.10), 2).await.is_empty());
        let settled = service.observe_tick("R_100", dec!(49.90), 3).await;

        assert_eq!(settled[0].contract_id, contract_id);
        assert_eq!(settled[0].profit, dec!(-1));
        assert_eq!(service.total_profit().await, dec!(-1));
    }

    #[tokio::test]
    async fn test_history_stream_pushes_ticks() {
        let service = PaperQuoteService::new(dec!(10), 2);
        service
            .seed_history("R_50", &[(1, dec!(10.01)), (2, dec!(10.02)), (3, dec!(10.03))])
            .await;

        let mut feed = service.messages();
        let reply = service
            .send_request(ticks_history_request("R_50", 2), Duration::from_secs(1))
            .await
            .unwrap();
        let history = reply.history().unwrap();
        assert_eq!(history.prices, vec![dec!(10.02), dec!(10.03)]);
        let stream_id = reply.subscription.unwrap().id;

        // Drain the history reply itself.
        let _ = feed.recv().await.unwrap();
        service.observe_tick("R_50", dec!(10.04), 4).await;
        let pushed = feed.recv().await.unwrap();
        assert_eq!(pushed.tick().unwrap().quote, dec!(10.04));
        assert_eq!(pushed.subscription.as_ref().unwrap().id, stream_id);

        service.forget(&stream_id).await.unwrap();
        let _ = feed.recv().await.unwrap();
        service.observe_tick("R_50", dec!(10.05), 5).await;
        assert!(feed.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_transport_and_unknown_proposal() {
        let service = PaperQuoteService::new(dec!(10), 2);
        let err = service.buy("proposal-404", dec!(1)).await.unwrap_err();
        assert!(matches!(err, ApiError::Service { ref code, .. } if code == "InvalidContractProposal"));

        service.set_open(false);
        let err = service
            .send_request(crate::exchange::types::ping_request(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, ApiError::NotConnected);
    }
}
