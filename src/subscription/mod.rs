//! Per-symbol tick stream multiplexer.
//!
//! One upstream `ticks_history` subscription per symbol, shared by any number
//! of local consumers. Late joiners get the last history and tick replayed.
//! The last consumer to detach triggers a best-effort `forget`.

use crate::exchange::{ticks_history_request, ApiError, QuoteApi, QuoteApiExt, Response, Tick};
use crate::utils::lock;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Typed stream payload delivered to consumers.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    History {
        symbol: String,
        prices: Vec<Decimal>,
        times: Vec<i64>,
    },
    Tick(Tick),
}

impl StreamEvent {
    pub fn symbol(&self) -> &str {
        match self {
            StreamEvent::History { symbol, .. } => symbol,
            StreamEvent::Tick(tick) => &tick.symbol,
        }
    }

    fn from_response(symbol: &str, response: &Response) -> Option<Self> {
        if response.error.is_some() || response.stream_symbol() != Some(symbol) {
            return None;
        }
        if let Some(history) = response.history() {
            return Some(StreamEvent::History {
                symbol: symbol.to_string(),
                prices: history.prices,
                times: history.times,
            });
        }
        response.tick().map(StreamEvent::Tick)
    }
}

pub type StreamCallback = Arc<dyn Fn(&StreamEvent) + Send + Sync>;

struct SymbolStream {
    generation: u64,
    subscription_id: Option<String>,
    callbacks: Vec<(u64, StreamCallback)>,
    last_history: Option<StreamEvent>,
    last_tick: Option<StreamEvent>,
    router: CancellationToken,
}

impl SymbolStream {
    fn snapshot(&self) -> Vec<StreamEvent> {
        self.last_history
            .iter()
            .chain(self.last_tick.iter())
            .cloned()
            .collect()
    }
}

type Streams = Arc<Mutex<HashMap<String, SymbolStream>>>;

pub struct SubscriptionMultiplexer {
    api: Arc<dyn QuoteApi>,
    streams: Streams,
    next_id: AtomicU64,
}

impl SubscriptionMultiplexer {
    pub fn new(api: Arc<dyn QuoteApi>) -> Arc<Self> {
        Arc::new(Self {
            api,
            streams: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        })
    }

    /// Attach `callback` to the tick stream for `symbol`, opening the
    /// upstream subscription if this is the first consumer.
    pub async fn subscribe_to_symbol<F>(
        self: &Arc<Self>,
        symbol: &str,
        callback: F,
        window_size: usize,
    ) -> Result<SymbolSubscription, ApiError>
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let callback: StreamCallback = Arc::new(callback);
        let handle = SymbolSubscription {
            symbol: symbol.to_string(),
            id,
            mux: Arc::downgrade(self),
            released: AtomicBool::new(false),
        };

        let generation = {
            let mut streams = lock(&self.streams);
            if let Some(stream) = streams.get_mut(symbol) {
                stream.callbacks.push((id, Arc::clone(&callback)));
                let replay = stream.snapshot();
                drop(streams);
                debug!(%symbol, replayed = replay.len(), "Attached to existing stream");
                for event in &replay {
                    callback(event);
                }
                return Ok(handle);
            }

            if !self.api.is_open() {
                return Err(ApiError::NotConnected);
            }

            let router = CancellationToken::new();
            let generation = id;
            streams.insert(
                symbol.to_string(),
                SymbolStream {
                    generation,
                    subscription_id: None,
                    callbacks: vec![(id, callback)],
                    last_history: None,
                    last_tick: None,
                    router: router.clone(),
                },
            );
            // Listen before sending so the history reply is not missed.
            let feed = self.api.messages();
            tokio::spawn(route(
                Arc::downgrade(&self.streams),
                symbol.to_string(),
                generation,
                router,
                feed,
            ));
            generation
        };

        let request = ticks_history_request(symbol, window_size);
        match self.api.send_request(request, self.api.default_timeout()).await {
            Ok(response) => {
                let subscription_id = response.subscription.map(|s| s.id);
                info!(%symbol, subscription_id = ?subscription_id, "Symbol stream opened");
                if let Some(stream) = lock(&self.streams).get_mut(symbol) {
                    if stream.generation == generation && subscription_id.is_some() {
                        stream.subscription_id = subscription_id;
                    }
                }
                Ok(handle)
            }
            Err(e) if e.is_already_subscribed() => {
                debug!(%symbol, "Upstream already streaming symbol, treating as live");
                Ok(handle)
            }
            Err(e) => {
                warn!(%symbol, error = %e, "Symbol subscription failed");
                let mut streams = lock(&self.streams);
                if streams.get(symbol).map(|s| s.generation) == Some(generation) {
                    if let Some(stream) = streams.remove(symbol) {
                        stream.router.cancel();
                    }
                }
                handle.released.store(true, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn detach(&self, symbol: &str, id: u64) {
        let forget = {
            let mut streams = lock(&self.streams);
            let Some(stream) = streams.get_mut(symbol) else {
                return;
            };
            stream.callbacks.retain(|(existing, _)| *existing != id);
            if !stream.callbacks.is_empty() {
                return;
            }
            let Some(stream) = streams.remove(symbol) else {
                return;
            };
            stream.router.cancel();
            stream.subscription_id
        };

        info!(%symbol, "Last consumer detached, stream closed");
        let Some(subscription_id) = forget else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(%symbol, "No runtime for forget, skipping");
            return;
        };
        let api = Arc::clone(&self.api);
        let symbol = symbol.to_string();
        runtime.spawn(async move {
            if let Err(e) = api.forget(&subscription_id).await {
                debug!(%symbol, %subscription_id, error = %e, "Forget failed");
            }
        });
    }

    /// Drop all local state without contacting the upstream.
    pub fn reset(&self) {
        let drained: Vec<(String, SymbolStream)> = lock(&self.streams).drain().collect();
        for (symbol, stream) in &drained {
            stream.router.cancel();
            debug!(%symbol, "Stream dropped by reset");
        }
    }

    /// Close every stream and forget its upstream subscription.
    pub async fn unsubscribe_all(&self) {
        let drained: Vec<(String, SymbolStream)> = lock(&self.streams).drain().collect();
        for (symbol, stream) in drained {
            stream.router.cancel();
            if let Some(subscription_id) = stream.subscription_id {
                if let Err(e) = self.api.forget(&subscription_id).await {
                    debug!(%symbol, error = %e, "Forget failed");
                }
            }
        }
    }

    pub fn active_count(&self) -> usize {
        lock(&self.streams).len()
    }

    pub fn is_subscribed(&self, symbol: &str) -> bool {
        lock(&self.streams).contains_key(symbol)
    }

    pub fn subscription_id(&self, symbol: &str) -> Option<String> {
        lock(&self.streams)
            .get(symbol)
            .and_then(|s| s.subscription_id.clone())
    }

    pub fn consumer_count(&self, symbol: &str) -> usize {
        lock(&self.streams)
            .get(symbol)
            .map(|s| s.callbacks.len())
            .unwrap_or(0)
    }
}

async fn route(
    streams: Weak<Mutex<HashMap<String, SymbolStream>>>,
    symbol: String,
    generation: u64,
    cancel: CancellationToken,
    mut feed: broadcast::Receiver<Arc<Response>>,
) {
    loop {
        let response = tokio::select! {
            _ = cancel.cancelled() => break,
            received = feed.recv() => match received {
                Ok(response) => response,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(%symbol, skipped, "Stream router lagged");
                    continue;
                }
                Err(RecvError::Closed) => break,
            },
        };

        let Some(event) = StreamEvent::from_response(&symbol, &response) else {
            continue;
        };
        let Some(streams) = streams.upgrade() else {
            break;
        };

        let callbacks: Vec<StreamCallback> = {
            let mut streams = lock(&streams);
            let Some(stream) = streams.get_mut(&symbol) else {
                break;
            };
            if stream.generation != generation {
                break;
            }
            if stream.subscription_id.is_none() {
                stream.subscription_id = response.subscription.as_ref().map(|s| s.id.clone());
            }
            match &event {
                StreamEvent::History { .. } => stream.last_history = Some(event.clone()),
                StreamEvent::Tick(_) => stream.last_tick = Some(event.clone()),
            }
            stream.callbacks.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };

        for callback in callbacks {
            callback(&event);
        }
    }
    debug!(%symbol, "Stream router stopped");
}

/// A consumer's attachment to a symbol stream.
pub struct SymbolSubscription {
    symbol: String,
    id: u64,
    mux: Weak<SubscriptionMultiplexer>,
    released: AtomicBool,
}

impl SymbolSubscription {
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Detach this consumer. Idempotent.
    pub fn unsubscribe(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(mux) = self.mux.upgrade() {
            mux.detach(&self.symbol, self.id);
        }
    }
}
