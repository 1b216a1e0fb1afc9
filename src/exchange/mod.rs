//! Quote and trade service connectivity.
//!
//! ## Live
//! `ConnectionManager` owns one WebSocket to the service:
//! - Request/response correlation by `req_id`
//! - Keep-alive pings and latency measurement
//! - Linear capped backoff reconnection with re-authorization
//! - Tracked subscriptions replayed after every reopen
//!
//! ## Paper
//! `PaperQuoteService` answers the same verbs in-process and settles
//! contracts against replayed ticks.

pub mod connection;
pub mod error;
pub mod mock;
pub mod traits;
mod types;

#[cfg(test)]
pub(crate) mod test_server;

pub use connection::{Backoff, ConnectionManager, ConnectionState, ResponseCallback, TrackedHandle};
pub use error::ApiError;
pub use mock::{PaperQuoteService, PayoutTable, Settlement};
pub use traits::{QuoteApi, QuoteApiExt};
pub use types::*;

#[cfg(test)]
pub use traits::MockQuoteApi;
