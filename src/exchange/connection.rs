//! Single-socket connection manager for the quote and trade service.
//!
//! One background session task owns the socket. It reconnects with a linear
//! capped backoff, sends keep-alive pings, re-authorizes and replays tracked
//! subscriptions after every reopen. Requests are correlated by `req_id`.
//! A session-fatal service error closes the socket so the session reopens.

use super::error::ApiError;
use super::traits::QuoteApi;
use super::types::{authorize_request, forget_request, ping_request, Request, Response};
use crate::config::ConnectionConfig;
use crate::state::Observable;
use crate::utils::lock;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Waiter = oneshot::Sender<Result<Response, ApiError>>;

/// Callback invoked for every frame answering a tracked subscription.
pub type ResponseCallback = Arc<dyn Fn(&Response) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Authorized,
    Error,
}

impl ConnectionState {
    /// Whether the socket is open (authorized or not).
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Authorized)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Authorized => "authorized",
            ConnectionState::Error => "error",
        };
        f.write_str(label)
    }
}

/// Linear backoff: `min(min + attempts * step, max)`.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    step: Duration,
    max: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(min: Duration, step: Duration, max: Duration) -> Self {
        Self {
            min,
            step,
            max,
            attempts: 0,
        }
    }

    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self::new(
            Duration::from_millis(config.reconnect_min_delay_ms),
            Duration::from_millis(config.reconnect_step_ms),
            Duration::from_millis(config.reconnect_max_delay_ms),
        )
    }

    /// Delay before the next attempt; bumps the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self
            .min
            .saturating_add(self.step.saturating_mul(self.attempts))
            .min(self.max);
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

struct TrackedSubscription {
    request: Request,
    subscription_id: Option<String>,
    callbacks: Vec<(u64, ResponseCallback)>,
}

struct Session {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

enum SessionEnd {
    Cancelled,
    Closed,
    Failed(ApiError),
    /// The service answered with a session-fatal error.
    Rejected(ApiError),
}

/// Pending reply slot, removed when the waiting request goes away.
struct PendingSlot<'a> {
    pending: &'a Mutex<HashMap<u64, Waiter>>,
    req_id: u64,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.req_id);
    }
}

pub struct ConnectionManager {
    config: ConnectionConfig,
    state: Observable<ConnectionState>,
    pending: Mutex<HashMap<u64, Waiter>>,
    tracked: Mutex<HashMap<String, TrackedSubscription>>,
    next_req_id: AtomicU64,
    next_callback_id: AtomicU64,
    backoff: Mutex<Backoff>,
    credential: Mutex<Option<String>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    messages: broadcast::Sender<Arc<Response>>,
    ping_sent: Mutex<Option<(u64, Instant)>>,
    latency: Mutex<Option<Duration>>,
    session: Mutex<Option<Session>>,
    sockets_opened: AtomicU64,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig) -> Arc<Self> {
        let (messages, _) = broadcast::channel(config.message_channel_capacity.max(1));
        let credential = config.token();
        Arc::new(Self {
            backoff: Mutex::new(Backoff::from_config(&config)),
            config,
            state: Observable::new(ConnectionState::Disconnected),
            pending: Mutex::new(HashMap::new()),
            tracked: Mutex::new(HashMap::new()),
            next_req_id: AtomicU64::new(1),
            next_callback_id: AtomicU64::new(1),
            credential: Mutex::new(credential),
            outbound: Mutex::new(None),
            messages,
            ping_sent: Mutex::new(None),
            latency: Mutex::new(None),
            session: Mutex::new(None),
            sockets_opened: AtomicU64::new(0),
        })
    }

    /// Start the session task. No-op while a session is already running.
    pub fn connect(self: &Arc<Self>, credential: Option<String>) {
        if let Some(token) = credential {
            *lock(&self.credential) = Some(token);
        }

        let mut session = lock(&self.session);
        if let Some(existing) = session.as_ref() {
            if !existing.cancel.is_cancelled() && !existing.handle.is_finished() {
                debug!(state = %self.state.get(), "Connect ignored, session already running");
                return;
            }
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(self).run(cancel.clone()));
        *session = Some(Session { cancel, handle });
    }

    /// Close the socket on purpose; no reconnect follows.
    pub fn disconnect(&self) {
        if let Some(session) = lock(&self.session).take() {
            session.cancel.cancel();
        }
        *lock(&self.outbound) = None;
        *lock(&self.ping_sent) = None;
        self.fail_pending(ApiError::Shutdown);
        self.state.set(ConnectionState::Disconnected);
        info!("Disconnected from quote service");
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Observable connection state.
    pub fn state_cell(&self) -> &Observable<ConnectionState> {
        &self.state
    }

    /// Round trip of the last answered keep-alive ping.
    pub fn latency(&self) -> Option<Duration> {
        *lock(&self.latency)
    }

    /// Sockets opened so far; each reopen starts with empty upstream streams.
    pub fn sockets_opened(&self) -> u64 {
        self.sockets_opened.load(Ordering::SeqCst)
    }

    pub fn reconnect_attempts(&self) -> u32 {
        lock(&self.backoff).attempts()
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn tracked_count(&self) -> usize {
        lock(&self.tracked).len()
    }

    pub fn has_credential(&self) -> bool {
        lock(&self.credential).is_some()
    }

    /// Send `{authorize: token}` and remember the token for reconnects.
    pub async fn authorize(&self, token: &str) -> Result<Response, ApiError> {
        *lock(&self.credential) = Some(token.to_string());
        self.send_request(authorize_request(token), self.config.request_timeout())
            .await
    }

    /// Send a request and wait for the reply with the same `req_id`.
    pub async fn send_request(
        &self,
        request: Request,
        timeout: Duration,
    ) -> Result<Response, ApiError> {
        let req_id = self.next_req_id.fetch_add(1, Ordering::SeqCst);
        let (tx, mut rx) = oneshot::channel();
        lock(&self.pending).insert(req_id, tx);
        let _slot = PendingSlot {
            pending: &self.pending,
            req_id,
        };

        self.write_frame(request, req_id)?;

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ApiError::ConnectionLost),
            Err(_) => {
                if lock(&self.pending).remove(&req_id).is_some() {
                    warn!(req_id, timeout_ms = timeout.as_millis() as u64, "Request timed out");
                    Err(ApiError::Timeout { req_id, timeout })
                } else {
                    // Reply was delivered between the deadline firing and the removal.
                    rx.await.unwrap_or(Err(ApiError::ConnectionLost))
                }
            }
        }
    }

    /// Track a subscription request. It is sent now if the socket is open and
    /// replayed verbatim after every reopen until the handle unsubscribes.
    pub fn subscribe<F>(self: &Arc<Self>, request: Request, callback: F) -> TrackedHandle
    where
        F: Fn(&Response) + Send + Sync + 'static,
    {
        let key = Value::Object(request.clone()).to_string();
        let id = self.next_callback_id.fetch_add(1, Ordering::SeqCst);
        let callback: ResponseCallback = Arc::new(callback);

        let is_new = {
            let mut tracked = lock(&self.tracked);
            match tracked.get_mut(&key) {
                Some(entry) => {
                    entry.callbacks.push((id, callback));
                    false
                }
                None => {
                    tracked.insert(
                        key.clone(),
                        TrackedSubscription {
                            request: request.clone(),
                            subscription_id: None,
                            callbacks: vec![(id, callback)],
                        },
                    );
                    true
                }
            }
        };

        if is_new && self.is_open() {
            let req_id = self.next_req_id.fetch_add(1, Ordering::SeqCst);
            if let Err(e) = self.write_frame(request, req_id) {
                debug!(error = %e, "Tracked subscription deferred until reconnect");
            }
        }

        TrackedHandle {
            key,
            id,
            manager: Arc::downgrade(self),
            released: AtomicBool::new(false),
        }
    }

    fn release(&self, key: &str, id: u64) {
        let forget = {
            let mut tracked = lock(&self.tracked);
            let Some(entry) = tracked.get_mut(key) else {
                return;
            };
            entry.callbacks.retain(|(existing, _)| *existing != id);
            if !entry.callbacks.is_empty() {
                return;
            }
            tracked.remove(key).and_then(|entry| entry.subscription_id)
        };

        if let Some(subscription_id) = forget {
            let req_id = self.next_req_id.fetch_add(1, Ordering::SeqCst);
            if let Err(e) = self.write_frame(forget_request(&subscription_id), req_id) {
                debug!(error = %e, %subscription_id, "Forget skipped");
            }
        }
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                break;
            }

            self.state.set(ConnectionState::Connecting);
            let url = self.config.url();
            info!(endpoint = %self.config.endpoint, "Connecting to quote service");

            let opened = tokio::select! {
                _ = cancel.cancelled() => break,
                result = tokio::time::timeout(self.config.connect_timeout(), connect_async(url.as_str())) => result,
            };

            let end = match opened {
                Ok(Ok((stream, _))) => {
                    lock(&self.backoff).reset();
                    self.drive(stream, &cancel).await
                }
                Ok(Err(e)) => SessionEnd::Failed(ApiError::Transport(e.to_string())),
                Err(_) => SessionEnd::Failed(ApiError::Transport("connect timed out".to_string())),
            };

            if matches!(end, SessionEnd::Cancelled) || cancel.is_cancelled() {
                break;
            }

            *lock(&self.outbound) = None;
            *lock(&self.ping_sent) = None;
            self.fail_pending(ApiError::ConnectionLost);

            match end {
                SessionEnd::Failed(err) => {
                    error!(error = %err, "Quote service connection failed");
                    self.state.set(ConnectionState::Error);
                }
                SessionEnd::Rejected(err) => {
                    error!(error = %err, "Session rejected by service, reopening");
                    self.state.set(ConnectionState::Error);
                }
                _ => {
                    warn!("Quote service closed the connection");
                    self.state.set(ConnectionState::Disconnected);
                }
            }

            let (delay, attempt) = {
                let mut backoff = lock(&self.backoff);
                let delay = backoff.next_delay();
                (delay, backoff.attempts())
            };
            info!(attempt, delay_ms = delay.as_millis() as u64, "Scheduling reconnect");

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        debug!("Session task stopped");
    }

    async fn drive(&self, stream: WsStream, cancel: &CancellationToken) -> SessionEnd {
        let (mut write, mut read) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        *lock(&self.outbound) = Some(tx);

        self.sockets_opened.fetch_add(1, Ordering::SeqCst);
        self.state.set(ConnectionState::Connected);
        info!("Connected to quote service");
        self.on_open();

        let period = self.config.ping_interval();
        let mut keepalive = interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Cancelled;
                }
                Some(frame) = rx.recv() => {
                    if let Err(e) = write.send(frame).await {
                        return SessionEnd::Failed(ApiError::Transport(e.to_string()));
                    }
                }
                _ = keepalive.tick() => self.send_ping(),
                incoming = read.next() => {
                    let rejected = match incoming {
                        Some(Ok(Message::Text(text))) => self.handle_frame(text.as_str()),
                        Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                            Ok(text) => self.handle_frame(text),
                            Err(e) => {
                                warn!(error = %e, "Dropping non-UTF-8 binary frame");
                                None
                            }
                        },
                        Some(Ok(Message::Close(frame))) => {
                            debug!(?frame, "Close frame received");
                            return SessionEnd::Closed;
                        }
                        Some(Ok(_)) => None,
                        Some(Err(e)) => return SessionEnd::Failed(ApiError::Transport(e.to_string())),
                        None => return SessionEnd::Closed,
                    };
                    if let Some(err) = rejected {
                        let _ = write.send(Message::Close(None)).await;
                        return SessionEnd::Rejected(err);
                    }
                }
            }
        }
    }

    fn on_open(&self) {
        let token = lock(&self.credential).clone();
        match token {
            Some(token) => {
                let req_id = self.next_req_id.fetch_add(1, Ordering::SeqCst);
                if let Err(e) = self.write_frame(authorize_request(&token), req_id) {
                    warn!(error = %e, "Failed to send authorization");
                }
            }
            None => self.restore_subscriptions(),
        }
    }

    fn restore_subscriptions(&self) {
        let requests: Vec<Request> = lock(&self.tracked)
            .values()
            .map(|entry| entry.request.clone())
            .collect();
        if requests.is_empty() {
            return;
        }
        info!(count = requests.len(), "Restoring tracked subscriptions");
        for request in requests {
            let req_id = self.next_req_id.fetch_add(1, Ordering::SeqCst);
            if let Err(e) = self.write_frame(request, req_id) {
                warn!(error = %e, "Failed to restore subscription");
            }
        }
    }

    fn send_ping(&self) {
        let req_id = self.next_req_id.fetch_add(1, Ordering::SeqCst);
        match self.write_frame(ping_request(), req_id) {
            Ok(()) => *lock(&self.ping_sent) = Some((req_id, Instant::now())),
            Err(e) => debug!(error = %e, "Keep-alive ping not sent"),
        }
    }

    fn write_frame(&self, mut request: Request, req_id: u64) -> Result<(), ApiError> {
        request.insert("req_id".to_string(), Value::from(req_id));
        let text = Value::Object(request).to_string();
        match lock(&self.outbound).as_ref() {
            Some(tx) => tx
                .send(Message::text(text))
                .map_err(|_| ApiError::Transport("session writer closed".to_string())),
            None => Err(ApiError::NotConnected),
        }
    }

    /// Decode and route one frame. Returns the error when the service
    /// rejected the session, which ends it.
    fn handle_frame(&self, text: &str) -> Option<ApiError> {
        let response: Response = match serde_json::from_str(text) {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Dropping malformed frame");
                return None;
            }
        };

        let answers_authorize =
            response.msg_type == "authorize" || response.echo_req.contains_key("authorize");
        if answers_authorize {
            self.on_authorize(&response);
        } else if response.msg_type == "ping" {
            self.record_latency(&response);
        }

        let mut rejected = None;
        if let Some(service_error) = &response.error {
            let err = ApiError::from(service_error);
            if err.is_already_subscribed() {
                debug!(msg_type = %response.msg_type, "Subscription already active upstream");
            } else if err.is_session_fatal() || answers_authorize {
                error!(
                    msg_type = %response.msg_type,
                    code = %service_error.code,
                    message = %service_error.message,
                    "Session rejected by service"
                );
                self.drop_refused_subscriptions(&response);
                rejected = Some(err);
            } else {
                warn!(
                    msg_type = %response.msg_type,
                    code = %service_error.code,
                    message = %service_error.message,
                    "Service reported an error"
                );
            }
        }

        if let Some(req_id) = response.req_id {
            let waiter = lock(&self.pending).remove(&req_id);
            if let Some(waiter) = waiter {
                let result = match &response.error {
                    Some(service_error) => Err(ApiError::from(service_error)),
                    None => Ok(response.clone()),
                };
                let _ = waiter.send(result);
            }
        }

        if response.error.is_none() {
            self.dispatch_tracked(&response);
        }

        let _ = self.messages.send(Arc::new(response));
        rejected
    }

    fn on_authorize(&self, response: &Response) {
        if response.error.is_some() {
            if lock(&self.credential).take().is_some() {
                warn!("Credential rejected, reopening without authorization");
            }
            return;
        }
        let login = response
            .body
            .get("authorize")
            .and_then(|a| a.get("loginid"))
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        info!(loginid = %login, "Authorized");
        self.state.set(ConnectionState::Authorized);
        self.restore_subscriptions();
    }

    fn record_latency(&self, response: &Response) {
        let mut sent = lock(&self.ping_sent);
        if let Some((req_id, at)) = *sent {
            if response.req_id == Some(req_id) {
                let elapsed = at.elapsed();
                *lock(&self.latency) = Some(elapsed);
                *sent = None;
                debug!(latency_ms = elapsed.as_millis() as u64, "Keep-alive pong");
            }
        }
    }

    fn dispatch_tracked(&self, response: &Response) {
        let callbacks: Vec<ResponseCallback> = {
            let mut tracked = lock(&self.tracked);
            tracked
                .values_mut()
                .filter(|entry| response.matches_request(&entry.request))
                .flat_map(|entry| {
                    if let Some(info) = &response.subscription {
                        entry.subscription_id = Some(info.id.clone());
                    }
                    entry.callbacks.iter().map(|(_, cb)| Arc::clone(cb)).collect::<Vec<_>>()
                })
                .collect()
        };
        for callback in callbacks {
            callback(response);
        }
    }

    /// Tracked requests the service refused would be refused again on replay.
    fn drop_refused_subscriptions(&self, response: &Response) {
        let mut tracked = lock(&self.tracked);
        let before = tracked.len();
        tracked.retain(|_, entry| !response.matches_request(&entry.request));
        let dropped = before - tracked.len();
        if dropped > 0 {
            warn!(dropped, "Dropped tracked subscriptions refused by the service");
        }
    }

    fn fail_pending(&self, error: ApiError) {
        let waiters: Vec<Waiter> = lock(&self.pending).drain().map(|(_, w)| w).collect();
        if !waiters.is_empty() {
            debug!(count = waiters.len(), error = %error, "Failing pending requests");
        }
        for waiter in waiters {
            let _ = waiter.send(Err(error.clone()));
        }
    }
}

#[async_trait]
impl QuoteApi for ConnectionManager {
    async fn send_request(
        &self,
        request: Request,
        timeout: Duration,
    ) -> Result<Response, ApiError> {
        ConnectionManager::send_request(self, request, timeout).await
    }

    fn is_open(&self) -> bool {
        self.state.get().is_open() && lock(&self.outbound).is_some()
    }

    fn messages(&self) -> broadcast::Receiver<Arc<Response>> {
        self.messages.subscribe()
    }

    fn default_timeout(&self) -> Duration {
        self.config.request_timeout()
    }
}

/// Registration of one callback on a tracked subscription.
pub struct TrackedHandle {
    key: String,
    id: u64,
    manager: Weak<ConnectionManager>,
    released: AtomicBool,
}

impl TrackedHandle {
    /// Detach the callback. Idempotent; the last detach forgets upstream.
    pub fn unsubscribe(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(manager) = self.manager.upgrade() {
            manager.release(&self.key, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::test_server::{
        eventually, reply, service_error, standard_handler, wait_for_state, Handler, MockServer,
    };
    use crate::exchange::types::{balance_subscription_request, request};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_backoff_is_linear_and_capped() {
        let mut backoff = Backoff::new(
            Duration::from_millis(2_000),
            Duration::from_millis(1_000),
            Duration::from_millis(5_000),
        );
        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![2_000, 3_000, 4_000, 5_000, 5_000, 5_000]);
        assert_eq!(backoff.attempts(), 6);

        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(2_000));
    }

    #[tokio::test]
    async fn test_send_request_without_socket_fails_fast() {
        let manager = ConnectionManager::new(ConnectionConfig::default());
        let result = manager
            .send_request(request(json!({"time": 1})), Duration::from_secs(5))
            .await;
        assert_eq!(result.unwrap_err(), ApiError::NotConnected);
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_round_trip_ignores_late_duplicate() {
        let server = MockServer::spawn(0, standard_handler()).await;
        let manager = ConnectionManager::new(server.config());
        manager.connect(None);
        wait_for_state(&manager, ConnectionState::Connected).await;

        let response = assert_ok!(
            manager
                .send_request(request(json!({"time": 1})), Duration::from_secs(2))
                .await
        );
        assert_eq!(response.msg_type, "time");
        assert_eq!(manager.pending_count(), 0);

        // The duplicate has arrived by the time the next reply does.
        let again = assert_ok!(
            manager
                .send_request(request(json!({"time": 1})), Duration::from_secs(2))
                .await
        );
        assert_ne!(again.req_id, response.req_id);
        assert_eq!(manager.pending_count(), 0);

        manager.disconnect();
    }

    #[tokio::test]
    async fn test_timeout_and_service_errors_are_distinct() {
        let server = MockServer::spawn(0, standard_handler()).await;
        let manager = ConnectionManager::new(server.config());
        manager.connect(None);
        wait_for_state(&manager, ConnectionState::Connected).await;

        let err = assert_err!(
            manager
                .send_request(request(json!({"silent": 1})), Duration::from_millis(50))
                .await
        );
        assert!(err.is_timeout());
        assert_eq!(manager.pending_count(), 0);

        let err = assert_err!(
            manager
                .send_request(request(json!({"bogus": 1})), Duration::from_secs(2))
                .await
        );
        assert!(matches!(err, ApiError::Service { ref code, .. } if code == "InputValidationFailed"));
        assert_eq!(manager.state(), ConnectionState::Connected);

        manager.disconnect();
    }

    #[tokio::test]
    async fn test_authorizes_then_replays_tracked_subscriptions() {
        let server = MockServer::spawn(0, standard_handler()).await;
        let manager = ConnectionManager::new(server.config());

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let handle = manager.subscribe(balance_subscription_request(), move |response| {
            if response.balance().is_some() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert_eq!(manager.tracked_count(), 1);

        manager.connect(Some("secret-token".to_string()));
        wait_for_state(&manager, ConnectionState::Authorized).await;

        let delivered = tokio::time::timeout(Duration::from_secs(5), async {
            while hits.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(delivered.is_ok());
        assert_eq!(server.received_with("authorize"), 1);
        assert_eq!(server.received_with("balance"), 1);

        handle.unsubscribe();
        handle.unsubscribe();
        assert_eq!(manager.tracked_count(), 0);

        manager.disconnect();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_reconnects_with_backoff_and_resets_attempts() {
        let server = MockServer::spawn(3, standard_handler()).await;
        let manager = ConnectionManager::new(server.config());
        manager.connect(None);

        let settled = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if server.accepted() >= 4
                    && manager.state() == ConnectionState::Connected
                {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(settled.is_ok());
        assert_eq!(manager.reconnect_attempts(), 0);

        // A second connect while the session runs is a no-op.
        manager.connect(None);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.accepted(), 4);

        manager.disconnect();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.accepted(), 4);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending_requests() {
        let server = MockServer::spawn(0, standard_handler()).await;
        let manager = ConnectionManager::new(server.config());
        manager.connect(None);
        wait_for_state(&manager, ConnectionState::Connected).await;

        let waiting = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager
                    .send_request(request(json!({"silent": 1})), Duration::from_secs(5))
                    .await
            })
        };
        while manager.pending_count() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        manager.disconnect();

        let result = waiting.await.unwrap();
        assert_eq!(result.unwrap_err(), ApiError::Shutdown);
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_request_releases_pending_slot() {
        let server = MockServer::spawn(0, standard_handler()).await;
        let manager = ConnectionManager::new(server.config());
        manager.connect(None);
        wait_for_state(&manager, ConnectionState::Connected).await;

        let waiting = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager
                    .send_request(request(json!({"silent": 1})), Duration::from_secs(30))
                    .await
            })
        };
        assert!(eventually(|| manager.pending_count() == 1).await);

        waiting.abort();
        assert!(waiting.await.unwrap_err().is_cancelled());
        assert_eq!(manager.pending_count(), 0);

        manager.disconnect();
    }

    #[tokio::test]
    async fn test_closed_writer_is_a_transport_error() {
        let manager = ConnectionManager::new(ConnectionConfig::default());
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        *lock(&manager.outbound) = Some(tx);

        let err = assert_err!(
            manager
                .send_request(request(json!({"time": 1})), Duration::from_secs(1))
                .await
        );
        assert!(matches!(err, ApiError::Transport(_)));
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_frames_keep_session_and_requests_alive() {
        let handler: Handler = Arc::new(|req: &Value| {
            if req.get("garbled").is_some() {
                vec![
                    Value::String("{not json".to_string()),
                    Value::String("42".to_string()),
                    reply(req, "time", json!({"time": 1_700_000_000})),
                ]
            } else {
                vec![]
            }
        });
        let server = MockServer::spawn(0, handler).await;
        let manager = ConnectionManager::new(server.config());
        manager.connect(None);
        wait_for_state(&manager, ConnectionState::Connected).await;

        let in_flight = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager
                    .send_request(request(json!({"silent": 1})), Duration::from_secs(30))
                    .await
            })
        };
        assert!(eventually(|| manager.pending_count() == 1).await);

        let response = assert_ok!(
            manager
                .send_request(request(json!({"garbled": 1})), Duration::from_secs(2))
                .await
        );
        assert_eq!(response.msg_type, "time");
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(manager.pending_count(), 1);
        assert!(!in_flight.is_finished());
        assert_eq!(server.accepted(), 1);

        manager.disconnect();
        assert_eq!(in_flight.await.unwrap().unwrap_err(), ApiError::Shutdown);
    }

    #[tokio::test]
    async fn test_session_fatal_error_reopens_socket() {
        let server = MockServer::spawn(0, standard_handler()).await;
        let manager = ConnectionManager::new(server.config());
        manager.connect(None);
        wait_for_state(&manager, ConnectionState::Connected).await;

        let in_flight = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager
                    .send_request(request(json!({"silent": 1})), Duration::from_secs(30))
                    .await
            })
        };
        assert!(eventually(|| manager.pending_count() == 1).await);

        let err = assert_err!(
            manager
                .send_request(request(json!({"privileged": 1})), Duration::from_secs(2))
                .await
        );
        assert!(err.is_session_fatal());
        assert_eq!(in_flight.await.unwrap().unwrap_err(), ApiError::ConnectionLost);
        assert_eq!(manager.sockets_opened(), 1);

        assert!(
            eventually(|| server.accepted() == 2 && manager.state() == ConnectionState::Connected)
                .await
        );
        assert_eq!(manager.reconnect_attempts(), 0);
        assert_eq!(manager.sockets_opened(), 2);
        assert_ok!(
            manager
                .send_request(request(json!({"time": 1})), Duration::from_secs(2))
                .await
        );

        manager.disconnect();
    }

    #[tokio::test]
    async fn test_rejected_credential_is_not_retried() {
        let handler: Handler = Arc::new(|req: &Value| {
            if req.get("authorize").is_some() {
                vec![service_error(req, "authorize", "InvalidToken")]
            } else {
                vec![]
            }
        });
        let server = MockServer::spawn(0, handler).await;
        let manager = ConnectionManager::new(server.config());
        manager.connect(Some("stale-token".to_string()));

        assert!(
            eventually(|| server.accepted() == 2 && manager.state() == ConnectionState::Connected)
                .await
        );
        assert!(!manager.has_credential());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.received_with("authorize"), 1);
        assert_eq!(server.accepted(), 2);

        manager.disconnect();
    }

    #[tokio::test]
    async fn test_refused_tracked_subscription_is_not_replayed() {
        let handler: Handler = Arc::new(|req: &Value| {
            if req.get("balance").is_some() {
                vec![service_error(req, "balance", "AuthorizationRequired")]
            } else {
                vec![]
            }
        });
        let server = MockServer::spawn(0, handler).await;
        let manager = ConnectionManager::new(server.config());
        let _handle = manager.subscribe(balance_subscription_request(), |_| {});
        manager.connect(None);

        assert!(
            eventually(|| server.accepted() == 2 && manager.state() == ConnectionState::Connected)
                .await
        );
        assert_eq!(manager.tracked_count(), 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.received_with("balance"), 1);

        manager.disconnect();
    }

    #[tokio::test]
    async fn test_keepalive_ping_measures_latency() {
        let server = MockServer::spawn(0, standard_handler()).await;
        let config = ConnectionConfig {
            ping_interval_ms: 20,
            ..server.config()
        };
        let manager = ConnectionManager::new(config);
        assert_eq!(manager.latency(), None);
        manager.connect(None);
        wait_for_state(&manager, ConnectionState::Connected).await;

        assert!(eventually(|| manager.latency().is_some()).await);
        assert!(server.received_with("ping") >= 1);
        assert_eq!(manager.state(), ConnectionState::Connected);

        manager.disconnect();
    }
}
