//! Composition root.
//!
//! `DigitCracker` owns the connection, the stream multiplexer, the digit
//! statistics and the strategy runner, and exposes the operations a
//! dashboard drives. Stream events, balance pushes and connection state
//! changes are all consumed by one event-loop task, so tick processing is
//! strictly sequential.

use crate::config::Config;
use crate::exchange::{
    balance_subscription_request, request, ApiError, Balance, ConnectionManager, ConnectionState,
    QuoteApi, QuoteApiExt, TrackedHandle,
};
use crate::export::{ExportFormat, StatsExport};
use crate::state::{Observable, ObserverId};
use crate::stats::{DigitPredictor, DigitStat, DigitStatsEngine, Histories, Percentages, Prediction};
use crate::strategy::{ConfigUpdate, DecisionEngine, EngineSnapshot, StrategyError, StrategyKind, StrategyRunner};
use crate::subscription::{StreamEvent, SubscriptionMultiplexer, SymbolSubscription};
use crate::utils::decimal::pip_scale;
use crate::utils::lock;
use anyhow::Result;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Everything a dashboard renders.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardSnapshot {
    pub connection: ConnectionState,
    pub latency_ms: Option<u64>,
    pub symbol: String,
    pub currency: String,
    pub pip_scale: u32,
    pub current_price: Option<Decimal>,
    pub last_digit: Option<u8>,
    pub window_len: usize,
    pub digit_stats: [DigitStat; 10],
    pub percentages: Percentages,
    pub histories: Histories,
    pub prediction: Option<Prediction>,
    pub balance: Option<Balance>,
    pub strategies: EngineSnapshot,
}

enum AppEvent {
    Stream(StreamEvent),
    Balance(Balance),
}

#[derive(Debug, Clone)]
struct Market {
    symbol: String,
    currency: String,
    pip_scale: u32,
}

pub struct DigitCracker {
    config: Config,
    connection: Option<Arc<ConnectionManager>>,
    api: Arc<dyn QuoteApi>,
    mux: Arc<SubscriptionMultiplexer>,
    stats: Mutex<DigitStatsEngine>,
    predictor: Mutex<DigitPredictor>,
    runner: StrategyRunner,
    dashboard: Observable<DashboardSnapshot>,
    market: Mutex<Market>,
    balance: Mutex<Option<Balance>>,
    symbol_stream: tokio::sync::Mutex<Option<SymbolSubscription>>,
    balance_stream: Mutex<Option<TrackedHandle>>,
    events_tx: mpsc::UnboundedSender<AppEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<AppEvent>>>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl DigitCracker {
    /// Live instance backed by a WebSocket connection manager.
    pub fn new(config: Config) -> Arc<Self> {
        let connection = ConnectionManager::new(config.connection.clone());
        let api: Arc<dyn QuoteApi> = connection.clone();
        Self::assemble(config, api, Some(connection))
    }

    /// Instance over any transport, e.g. the paper service.
    pub fn with_api(config: Config, api: Arc<dyn QuoteApi>) -> Arc<Self> {
        Self::assemble(config, api, None)
    }

    fn assemble(
        config: Config,
        api: Arc<dyn QuoteApi>,
        connection: Option<Arc<ConnectionManager>>,
    ) -> Arc<Self> {
        let mux = SubscriptionMultiplexer::new(Arc::clone(&api));
        let stats = DigitStatsEngine::new(config.stats.clone());
        let predictor = DigitPredictor::new(config.stats.predictor_history);
        let engine = DecisionEngine::new(
            &config.strategies,
            &config.triggers,
            config.stats.over_under_threshold,
        );
        let runner = StrategyRunner::new(engine, Arc::clone(&api), config.execution.clone());
        let market = Market {
            symbol: config.market.symbol.clone(),
            currency: config.market.currency.clone(),
            pip_scale: config.stats.pip_scale,
        };
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let app = Arc::new(Self {
            dashboard: Observable::new(DashboardSnapshot {
                connection: ConnectionState::Disconnected,
                latency_ms: None,
                symbol: market.symbol.clone(),
                currency: market.currency.clone(),
                pip_scale: market.pip_scale,
                current_price: None,
                last_digit: None,
                window_len: 0,
                digit_stats: *stats.stats(),
                percentages: stats.percentages(),
                histories: Histories::default(),
                prediction: None,
                balance: None,
                strategies: runner.snapshot(),
            }),
            config,
            connection,
            api,
            mux,
            stats: Mutex::new(stats),
            predictor: Mutex::new(predictor),
            runner,
            market: Mutex::new(market),
            balance: Mutex::new(None),
            symbol_stream: tokio::sync::Mutex::new(None),
            balance_stream: Mutex::new(None),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            event_loop: Mutex::new(None),
            shutdown: CancellationToken::new(),
        });
        app.refresh();
        app
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn runner(&self) -> &StrategyRunner {
        &self.runner
    }

    pub fn symbol(&self) -> String {
        lock(&self.market).symbol.clone()
    }

    /// Open the session. With a live connection this returns once the
    /// session task is started; stream setup happens when the socket opens.
    pub async fn connect(self: &Arc<Self>, token: Option<String>) {
        self.ensure_event_loop();

        match &self.connection {
            Some(connection) => {
                if token.is_some() {
                    self.track_balance(connection);
                }
                connection.connect(token);
            }
            None => {
                if let Some(token) = token {
                    if let Err(e) = self.api.authorize_with(&token).await {
                        warn!(error = %e, "Authorization failed");
                    }
                }
                self.fetch_balance().await;
                self.on_open().await;
            }
        }
        self.refresh();
    }

    /// Close the session on purpose; streams are dropped and not restored.
    pub async fn disconnect(&self) {
        if let Some(stream) = self.symbol_stream.lock().await.take() {
            stream.unsubscribe();
        }
        if let Some(handle) = lock(&self.balance_stream).take() {
            handle.unsubscribe();
        }
        self.mux.reset();
        if let Some(connection) = &self.connection {
            connection.disconnect();
        }
        self.refresh();
    }

    /// Switch the streamed symbol. The statistics window starts over.
    pub async fn change_symbol(self: &Arc<Self>, symbol: &str) -> Result<(), ApiError> {
        {
            let mut market = lock(&self.market);
            if market.symbol == symbol {
                return Ok(());
            }
            market.symbol = symbol.to_string();
        }
        lock(&self.stats).reset();
        lock(&self.predictor).clear();
        info!(%symbol, "Symbol changed");

        let result = if self.api.is_open() {
            self.attach_symbol(symbol).await
        } else {
            debug!(%symbol, "Not connected, symbol will be streamed on open");
            Ok(())
        };
        self.refresh();
        result
    }

    pub fn toggle_strategy(&self, kind: StrategyKind) -> bool {
        let running = self.runner.toggle(kind);
        self.refresh();
        running
    }

    pub fn update_config(&self, kind: StrategyKind, update: &ConfigUpdate) -> Result<(), StrategyError> {
        self.runner.update_config(kind, update)?;
        self.refresh();
        Ok(())
    }

    /// String form of [`DigitCracker::update_config`].
    pub fn update_config_value(&self, kind: StrategyKind, key: &str, value: &str) -> Result<(), StrategyError> {
        self.update_config(kind, &ConfigUpdate::parse(key, value)?)
    }

    pub fn export_data(&self, format: ExportFormat) -> Result<String> {
        let symbol = self.symbol();
        let export = StatsExport::from_engine(&symbol, &lock(&self.stats));
        export.render(format)
    }

    pub fn snapshot(&self) -> DashboardSnapshot {
        self.dashboard.get()
    }

    pub fn subscribe<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&DashboardSnapshot) + Send + Sync + 'static,
    {
        self.dashboard.subscribe(observer)
    }

    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        self.dashboard.unsubscribe(id)
    }

    pub fn watch(&self) -> watch::Receiver<DashboardSnapshot> {
        self.dashboard.watch()
    }

    /// Stop the event loop, cancel in-flight trades and close the session.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = lock(&self.event_loop).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.runner.shutdown().await;
        self.disconnect().await;
        self.dashboard.clear_observers();
        info!("Digit cracker shut down");
    }

    fn ensure_event_loop(self: &Arc<Self>) {
        let mut event_loop = lock(&self.event_loop);
        if event_loop.is_some() {
            return;
        }
        let Some(rx) = lock(&self.events_rx).take() else {
            return;
        };
        *event_loop = Some(tokio::spawn(Arc::clone(self).run_events(rx)));
    }

    fn track_balance(&self, connection: &Arc<ConnectionManager>) {
        let mut slot = lock(&self.balance_stream);
        if slot.is_some() {
            return;
        }
        let tx = self.events_tx.clone();
        *slot = Some(connection.subscribe(balance_subscription_request(), move |response| {
            if let Some(balance) = response.balance() {
                let _ = tx.send(AppEvent::Balance(balance));
            }
        }));
    }

    async fn fetch_balance(&self) {
        let reply = self
            .api
            .send_request(request(json!({ "balance": 1 })), self.api.default_timeout())
            .await;
        match reply.map(|r| r.balance()) {
            Ok(Some(balance)) => {
                let _ = self.events_tx.send(AppEvent::Balance(balance));
            }
            Ok(None) => debug!("Balance reply without payload"),
            Err(e) => warn!(error = %e, "Balance request failed"),
        }
    }

    async fn run_events(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<AppEvent>) {
        let mut changes = self.runner.changes();
        let mut states = self.connection.as_ref().map(|c| c.state_cell().watch());
        let mut attached_socket = None;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
                Ok(()) = changes.changed() => self.refresh(),
                Some(state) = next_state(&mut states) => {
                    self.on_state(state, &mut attached_socket).await;
                }
            }
        }
        debug!("Event loop stopped");
    }

    /// Streams belong to the socket they were opened on. `attached` holds
    /// that socket's sequence number; a reopen the state watch skipped over
    /// still shows up as a new number.
    async fn on_state(self: &Arc<Self>, state: ConnectionState, attached: &mut Option<u64>) {
        let socket = self.connection.as_ref().map(|c| c.sockets_opened());
        if state.is_open() {
            if *attached != socket {
                if attached.is_some() {
                    info!(%state, "Socket reopened, dropping stale symbol streams");
                    self.drop_symbol_streams().await;
                }
                *attached = socket;
                self.on_open().await;
            }
        } else if attached.take().is_some() {
            info!(%state, "Connection lost, dropping symbol streams");
            self.drop_symbol_streams().await;
        }
        self.refresh();
    }

    async fn drop_symbol_streams(&self) {
        self.mux.reset();
        self.symbol_stream.lock().await.take();
    }

    async fn on_open(self: &Arc<Self>) {
        let symbol = self.symbol();
        if let Err(e) = self.attach_symbol(&symbol).await {
            warn!(%symbol, error = %e, "Failed to stream symbol");
        }
    }

    /// Resolve the pip scale for `symbol` and (re)subscribe its stream.
    async fn attach_symbol(self: &Arc<Self>, symbol: &str) -> Result<(), ApiError> {
        match self.api.active_symbols().await {
            Ok(symbols) => {
                let pip = symbols
                    .iter()
                    .find(|s| s.symbol == symbol)
                    .and_then(|s| s.pip);
                if let Some(pip) = pip {
                    let scale = pip_scale(pip);
                    lock(&self.market).pip_scale = scale;
                    lock(&self.stats).set_pip_scale(scale);
                    debug!(%symbol, pip_scale = scale, "Pip scale resolved");
                }
            }
            Err(e) => warn!(%symbol, error = %e, "Active symbols unavailable, keeping pip scale"),
        }

        let mut slot = self.symbol_stream.lock().await;
        if let Some(previous) = slot.take() {
            previous.unsubscribe();
        }
        let tx = self.events_tx.clone();
        let stream = self
            .mux
            .subscribe_to_symbol(
                symbol,
                move |event| {
                    let _ = tx.send(AppEvent::Stream(event.clone()));
                },
                self.config.stats.window_capacity,
            )
            .await?;
        *slot = Some(stream);
        Ok(())
    }

    fn handle_event(&self, event: AppEvent) {
        match event {
            AppEvent::Stream(event) => self.handle_stream(event),
            AppEvent::Balance(balance) => {
                if !balance.currency.is_empty() {
                    lock(&self.market).currency = balance.currency.clone();
                }
                *lock(&self.balance) = Some(balance);
            }
        }
        self.refresh();
    }

    fn handle_stream(&self, event: StreamEvent) {
        let market = lock(&self.market).clone();
        if event.symbol() != market.symbol {
            return;
        }
        match event {
            StreamEvent::History { prices, .. } => {
                let digits: Vec<u8> = {
                    let mut stats = lock(&self.stats);
                    stats.load_history(&prices);
                    stats.digits().collect()
                };
                lock(&self.predictor).load(&digits);
                debug!(symbol = %market.symbol, ticks = prices.len(), "History loaded");
            }
            StreamEvent::Tick(tick) => {
                let (digit, snapshot) = {
                    let mut stats = lock(&self.stats);
                    let digit = stats.push_tick(tick.quote);
                    (digit, stats.snapshot())
                };
                lock(&self.predictor).push(digit);
                self.runner
                    .on_tick(digit, &snapshot, &market.symbol, &market.currency);
            }
        }
    }

    fn refresh(&self) {
        let market = lock(&self.market).clone();
        let (stats_snapshot, histories) = {
            let stats = lock(&self.stats);
            (stats.snapshot(), stats.histories().clone())
        };
        let prediction = lock(&self.predictor).predict();
        let (connection, latency_ms) = match &self.connection {
            Some(c) => (c.state(), c.latency().map(|l| l.as_millis() as u64)),
            None if self.api.is_open() => (ConnectionState::Connected, None),
            None => (ConnectionState::Disconnected, None),
        };

        self.dashboard.set(DashboardSnapshot {
            connection,
            latency_ms,
            symbol: market.symbol,
            currency: market.currency,
            pip_scale: market.pip_scale,
            current_price: stats_snapshot.current_price,
            last_digit: stats_snapshot.last_digit,
            window_len: stats_snapshot.window_len,
            digit_stats: stats_snapshot.digit_stats,
            percentages: stats_snapshot.percentages,
            histories,
            prediction,
            balance: lock(&self.balance).clone(),
            strategies: self.runner.snapshot(),
        });
    }
}

async fn next_state(states: &mut Option<watch::Receiver<ConnectionState>>) -> Option<ConnectionState> {
    match states {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(*rx.borrow_and_update()),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::test_server::{eventually, reply, standard_handler, Handler, MockServer};
    use crate::exchange::PaperQuoteService;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn config() -> Config {
        let mut config = Config::default();
        config.execution.poll_interval_ms = 5;
        config.execution.max_poll_attempts = 200;
        config
    }

    /// `count` strictly rising quotes at two decimals.
    fn rising(count: i64) -> Vec<(i64, Decimal)> {
        (0..count)
            .map(|i| (i, dec!(1000.00) + Decimal::new(i, 2)))
            .collect()
    }

    async fn wait_until<F: Fn(&DashboardSnapshot) -> bool>(app: &DigitCracker, check: F) -> DashboardSnapshot {
        let mut rx = app.watch();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let current = rx.borrow_and_update().clone();
                if check(&current) {
                    return current;
                }
                if rx.changed().await.is_err() {
                    return app.snapshot();
                }
            }
        })
        .await
        .expect("dashboard never reached the expected state")
    }

    async fn paper_app() -> (Arc<DigitCracker>, Arc<PaperQuoteService>) {
        let paper = Arc::new(PaperQuoteService::new(dec!(100), 2));
        paper.seed_history("R_100", &rising(30)).await;
        let app = DigitCracker::with_api(config(), paper.clone());
        (app, paper)
    }

    #[tokio::test]
    async fn test_connect_loads_history_and_streams_ticks() {
        let (app, paper) = paper_app().await;
        app.connect(None).await;

        let snapshot = wait_until(&app, |s| s.window_len == 30).await;
        assert_eq!(snapshot.connection, ConnectionState::Connected);
        assert_eq!(snapshot.pip_scale, 2);
        assert_eq!(snapshot.balance.as_ref().map(|b| b.balance), Some(dec!(100)));
        assert_eq!(snapshot.percentages.rise, 100.0);
        assert!(snapshot.prediction.is_some());

        paper.observe_tick("R_100", dec!(1000.35), 31).await;
        let snapshot = wait_until(&app, |s| s.window_len == 31).await;
        assert_eq!(snapshot.last_digit, Some(5));
        assert_eq!(snapshot.current_price, Some(dec!(1000.35)));

        app.shutdown().await;
    }

    #[tokio::test]
    async fn test_running_strategy_trades_on_ticks() {
        let (app, paper) = paper_app().await;
        app.connect(None).await;
        wait_until(&app, |s| s.window_len == 30).await;

        assert!(app.toggle_strategy(StrategyKind::RiseFall));
        paper.observe_tick("R_100", dec!(1000.31), 31).await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while paper.open_contracts().await == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        paper.observe_tick("R_100", dec!(1000.40), 32).await;
        let snapshot = wait_until(&app, |s| s.strategies.total_profit != Decimal::ZERO).await;
        assert_eq!(snapshot.strategies.total_profit, dec!(0.33));
        assert_eq!(snapshot.strategies.active, Some(StrategyKind::RiseFall));

        app.shutdown().await;
    }

    #[tokio::test]
    async fn test_change_symbol_restarts_window() {
        let (app, paper) = paper_app().await;
        paper.seed_history("R_50", &rising(12)).await;
        app.connect(None).await;
        wait_until(&app, |s| s.window_len == 30).await;

        app.change_symbol("R_50").await.unwrap();
        let snapshot = wait_until(&app, |s| s.symbol == "R_50" && s.window_len == 12).await;
        assert_eq!(snapshot.symbol, "R_50");

        // Ticks for the old symbol no longer reach the window
        paper.observe_tick("R_100", dec!(1000.99), 99).await;
        paper.observe_tick("R_50", dec!(1000.12), 13).await;
        let snapshot = wait_until(&app, |s| s.window_len == 13).await;
        assert_eq!(snapshot.last_digit, Some(2));

        app.shutdown().await;
    }

    #[tokio::test]
    async fn test_observers_and_config_updates() {
        let (app, _paper) = paper_app().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let id = app.subscribe(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        app.update_config_value(StrategyKind::Differs, "stake", "1.25")
            .unwrap();
        assert!(calls.load(Ordering::SeqCst) >= 1);
        let differs = app
            .snapshot()
            .strategies
            .strategies
            .into_iter()
            .find(|v| v.kind == StrategyKind::Differs)
            .unwrap();
        assert_eq!(differs.config.stake, dec!(1.25));

        assert!(app
            .update_config_value(StrategyKind::Differs, "prediction", "11")
            .is_err());
        assert!(app.unsubscribe(id));
    }

    #[tokio::test]
    async fn test_export_reflects_window() {
        let (app, _paper) = paper_app().await;
        app.connect(None).await;
        wait_until(&app, |s| s.window_len == 30).await;

        let csv = app.export_data(ExportFormat::Csv).unwrap();
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some("digit,count,percentage,rank,power,is_increasing"));
        assert_eq!(lines.count(), 10);

        app.shutdown().await;
    }

    /// Serves R_100 with one more history price on every subscription.
    fn market_handler() -> Handler {
        let histories = Arc::new(AtomicUsize::new(0));
        let fallback = standard_handler();
        Arc::new(move |req: &serde_json::Value| {
            if req.get("active_symbols").is_some() {
                vec![reply(
                    req,
                    "active_symbols",
                    json!({"active_symbols": [{"symbol": "R_100", "pip": 0.01}]}),
                )]
            } else if req.get("ticks_history").is_some() {
                let n = histories.fetch_add(1, Ordering::SeqCst) + 3;
                let prices: Vec<f64> = (0..n).map(|i| 1000.0 + i as f64 / 100.0).collect();
                vec![reply(
                    req,
                    "history",
                    json!({
                        "history": {"prices": prices, "times": (0..n).collect::<Vec<usize>>()},
                        "subscription": {"id": format!("sub-{}", n)},
                    }),
                )]
            } else if req.get("forget").is_some() {
                vec![reply(req, "forget", json!({"forget": 1}))]
            } else {
                fallback(req)
            }
        })
    }

    #[tokio::test]
    async fn test_session_rejection_reattaches_symbol_stream() {
        let server = MockServer::spawn(0, market_handler()).await;
        let mut config = config();
        config.connection = server.config();
        let app = DigitCracker::new(config);
        app.connect(None).await;
        let snapshot = wait_until(&app, |s| s.window_len == 3).await;
        assert_eq!(snapshot.pip_scale, 2);

        let connection = app.connection.clone().unwrap();
        let err = connection
            .send_request(request(json!({"privileged": 1})), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(err.is_session_fatal());

        let snapshot = wait_until(&app, |s| {
            s.window_len == 4 && s.connection == ConnectionState::Connected
        })
        .await;
        assert_eq!(snapshot.current_price, Some(dec!(1000.03)));
        assert!(eventually(|| server.received_with("ticks_history") == 2).await);
        assert_eq!(server.accepted(), 2);

        app.shutdown().await;
    }
}
