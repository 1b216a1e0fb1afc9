//! Wire types for the JSON-over-WebSocket quote and trade protocol.
//!
//! A request is a flat JSON object of verb -> arguments; the connection
//! manager injects `req_id`. Replies echo `req_id`, carry `msg_type`, an
//! optional `error` and `echo_req` with the original request fields.

use crate::utils::decimal::{decimal_from_value, to_f64};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;

/// Outgoing request body (without `req_id`).
pub type Request = Map<String, Value>;

/// Build a request from a `json!` object literal.
pub fn request(value: Value) -> Request {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Error object reported by the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceError {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

/// Server-assigned subscription handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    pub id: String,
}

/// A decoded frame from the service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub msg_type: String,
    #[serde(default)]
    pub req_id: Option<u64>,
    #[serde(default)]
    pub error: Option<ServiceError>,
    #[serde(default)]
    pub echo_req: Map<String, Value>,
    #[serde(default)]
    pub subscription: Option<SubscriptionInfo>,
    /// Payload fields keyed by message type (`tick`, `history`, `buy`, ...).
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl Response {
    /// Whether every field of `request` is echoed back unchanged.
    pub fn matches_request(&self, request: &Request) -> bool {
        !self.echo_req.is_empty()
            && request
                .iter()
                .all(|(key, value)| self.echo_req.get(key) == Some(value))
    }

    /// Symbol this frame refers to, from the tick body or the echoed request.
    pub fn stream_symbol(&self) -> Option<&str> {
        self.body
            .get("tick")
            .and_then(|t| t.get("symbol"))
            .and_then(Value::as_str)
            .or_else(|| self.echo_req.get("ticks_history").and_then(Value::as_str))
            .or_else(|| self.echo_req.get("ticks").and_then(Value::as_str))
    }

    fn payload<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Option<T> {
        self.body
            .get(key)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    pub fn tick(&self) -> Option<Tick> {
        self.payload("tick")
    }

    pub fn history(&self) -> Option<History> {
        self.payload("history")
    }

    pub fn proposal(&self) -> Option<Proposal> {
        self.payload("proposal")
    }

    pub fn buy(&self) -> Option<BuyReceipt> {
        self.payload("buy")
    }

    pub fn sell(&self) -> Option<SellReceipt> {
        self.payload("sell")
    }

    pub fn open_contract(&self) -> Option<OpenContract> {
        self.payload("proposal_open_contract")
    }

    pub fn balance(&self) -> Option<Balance> {
        self.payload("balance")
    }

    pub fn active_symbols(&self) -> Option<Vec<ActiveSymbol>> {
        self.payload("active_symbols")
    }
}

fn de_decimal<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    decimal_from_value(&value)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid decimal: {}", value)))
}

fn de_decimal_opt<'de, D>(deserializer: D) -> Result<Option<Decimal>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(decimal_from_value))
}

fn de_decimal_vec<'de, D>(deserializer: D) -> Result<Vec<Decimal>, D::Error>
where
    D: Deserializer<'de>,
{
    let values = Vec::<Value>::deserialize(deserializer)?;
    values
        .iter()
        .map(|v| {
            decimal_from_value(v)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid decimal: {}", v)))
        })
        .collect()
}

fn de_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Bool(b) => b,
        Value::Number(n) => n.as_i64().unwrap_or(0) != 0,
        _ => false,
    })
}

fn de_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        other => other.to_string(),
    })
}

/// One timestamped quote for a symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    #[serde(deserialize_with = "de_decimal")]
    pub quote: Decimal,
    pub epoch: i64,
    #[serde(default, deserialize_with = "de_decimal_opt")]
    pub pip_size: Option<Decimal>,
}

/// Historical quotes returned by `ticks_history`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct History {
    #[serde(deserialize_with = "de_decimal_vec")]
    pub prices: Vec<Decimal>,
    #[serde(default)]
    pub times: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: String,
    #[serde(deserialize_with = "de_decimal")]
    pub ask_price: Decimal,
    #[serde(default, deserialize_with = "de_decimal_opt")]
    pub payout: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuyReceipt {
    #[serde(deserialize_with = "de_id")]
    pub contract_id: String,
    #[serde(deserialize_with = "de_decimal")]
    pub buy_price: Decimal,
    #[serde(default, deserialize_with = "de_decimal_opt")]
    pub payout: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SellReceipt {
    #[serde(deserialize_with = "de_decimal")]
    pub sold_for: Decimal,
}

/// Snapshot of a purchased contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenContract {
    #[serde(deserialize_with = "de_id")]
    pub contract_id: String,
    #[serde(default, deserialize_with = "de_flag")]
    pub is_sold: bool,
    #[serde(default, deserialize_with = "de_decimal_opt")]
    pub profit: Option<Decimal>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "de_decimal_opt")]
    pub exit_tick: Option<Decimal>,
    #[serde(default)]
    pub contract_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    #[serde(deserialize_with = "de_decimal")]
    pub balance: Decimal,
    pub currency: String,
    #[serde(default)]
    pub loginid: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveSymbol {
    pub symbol: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub market: String,
    #[serde(default)]
    pub submarket: String,
    #[serde(default, deserialize_with = "de_decimal_opt")]
    pub pip: Option<Decimal>,
}

/// Contract types the strategies trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContractKind {
    #[serde(rename = "DIGITEVEN")]
    DigitEven,
    #[serde(rename = "DIGITODD")]
    DigitOdd,
    #[serde(rename = "DIGITOVER")]
    DigitOver,
    #[serde(rename = "DIGITUNDER")]
    DigitUnder,
    #[serde(rename = "DIGITMATCH")]
    DigitMatch,
    #[serde(rename = "DIGITDIFF")]
    DigitDiff,
    #[serde(rename = "CALL")]
    Call,
    #[serde(rename = "PUT")]
    Put,
}

impl ContractKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContractKind::DigitEven => "DIGITEVEN",
            ContractKind::DigitOdd => "DIGITODD",
            ContractKind::DigitOver => "DIGITOVER",
            ContractKind::DigitUnder => "DIGITUNDER",
            ContractKind::DigitMatch => "DIGITMATCH",
            ContractKind::DigitDiff => "DIGITDIFF",
            ContractKind::Call => "CALL",
            ContractKind::Put => "PUT",
        }
    }

    /// Whether the contract takes a digit barrier.
    pub fn needs_barrier(&self) -> bool {
        matches!(
            self,
            ContractKind::DigitOver
                | ContractKind::DigitUnder
                | ContractKind::DigitMatch
                | ContractKind::DigitDiff
        )
    }

    /// Whether a settled exit digit / price move wins this contract.
    pub fn wins(&self, barrier: u8, exit_digit: u8, price_delta: Decimal) -> bool {
        match self {
            ContractKind::DigitEven => exit_digit % 2 == 0,
            ContractKind::DigitOdd => exit_digit % 2 == 1,
            ContractKind::DigitOver => exit_digit > barrier,
            ContractKind::DigitUnder => exit_digit < barrier,
            ContractKind::DigitMatch => exit_digit == barrier,
            ContractKind::DigitDiff => exit_digit != barrier,
            ContractKind::Call => price_delta > Decimal::ZERO,
            ContractKind::Put => price_delta < Decimal::ZERO,
        }
    }
}

impl fmt::Display for ContractKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters for a `proposal` request.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposalRequest {
    pub contract: ContractKind,
    pub amount: Decimal,
    pub currency: String,
    pub duration_ticks: u32,
    pub symbol: String,
    pub barrier: Option<u8>,
}

impl ProposalRequest {
    pub fn to_request(&self) -> Request {
        let mut req = request(json!({
            "proposal": 1,
            "amount": to_f64(self.amount),
            "basis": "stake",
            "contract_type": self.contract.as_str(),
            "currency": self.currency,
            "duration": self.duration_ticks,
            "duration_unit": "t",
            "symbol": self.symbol,
        }));
        if let (true, Some(barrier)) = (self.contract.needs_barrier(), self.barrier) {
            req.insert("barrier".to_string(), Value::String(barrier.to_string()));
        }
        req
    }
}

/// `ticks_history` request streaming live ticks after the snapshot.
pub fn ticks_history_request(symbol: &str, count: usize) -> Request {
    request(json!({
        "ticks_history": symbol,
        "count": count,
        "end": "latest",
        "style": "ticks",
        "subscribe": 1,
    }))
}

pub fn buy_request(proposal_id: &str, price: Decimal) -> Request {
    request(json!({ "buy": proposal_id, "price": to_f64(price) }))
}

pub fn sell_request(contract_id: &str, price: Decimal) -> Request {
    request(json!({ "sell": contract_id, "price": to_f64(price) }))
}

pub fn open_contract_request(contract_id: &str) -> Request {
    request(json!({ "proposal_open_contract": 1, "contract_id": contract_id }))
}

pub fn forget_request(subscription_id: &str) -> Request {
    request(json!({ "forget": subscription_id }))
}

pub fn forget_all_request(category: &str) -> Request {
    request(json!({ "forget_all": category }))
}

pub fn authorize_request(token: &str) -> Request {
    request(json!({ "authorize": token }))
}

pub fn active_symbols_request() -> Request {
    request(json!({ "active_symbols": "brief", "product_type": "basic" }))
}

pub fn balance_subscription_request() -> Request {
    request(json!({ "balance": 1, "subscribe": 1 }))
}

pub fn ping_request() -> Request {
    request(json!({ "ping": 1 }))
}
