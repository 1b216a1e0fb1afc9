//! In-process WebSocket server for session tests.

use super::connection::{ConnectionManager, ConnectionState};
use crate::config::ConnectionConfig;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message};

/// Maps one decoded request to the frames sent back. A `Value::String`
/// reply goes out as raw text, which allows sending garbage.
pub type Handler = Arc<dyn Fn(&Value) -> Vec<Value> + Send + Sync>;

pub struct MockServer {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    received: Arc<Mutex<Vec<Value>>>,
    handle: JoinHandle<()>,
}

impl MockServer {
    /// Accept loop; the first `drop_first` connections are closed right away.
    pub async fn spawn(drop_first: usize, handler: Handler) -> Self {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let received = Arc::new(Mutex::new(Vec::new()));

        let accepted_clone = Arc::clone(&accepted);
        let received_clone = Arc::clone(&received);
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let n = accepted_clone.fetch_add(1, Ordering::SeqCst);
                let handler = Arc::clone(&handler);
                let received = Arc::clone(&received_clone);
                tokio::spawn(async move {
                    let Ok(mut ws) = accept_async(stream).await else {
                        return;
                    };
                    if n < drop_first {
                        let _ = ws.close(None).await;
                        return;
                    }
                    while let Some(Ok(msg)) = ws.next().await {
                        let Message::Text(text) = msg else { continue };
                        let Ok(value) = serde_json::from_str::<Value>(text.as_str()) else {
                            continue;
                        };
                        received.lock().unwrap().push(value.clone());
                        for reply in handler(&value) {
                            let text = match reply {
                                Value::String(raw) => raw,
                                frame => frame.to_string(),
                            };
                            if ws.send(Message::text(text)).await.is_err() {
                                return;
                            }
                        }
                    }
                });
            }
        });

        Self {
            addr,
            accepted,
            received,
            handle,
        }
    }

    pub fn config(&self) -> ConnectionConfig {
        ConnectionConfig {
            endpoint: format!("ws://{}/websockets/v3", self.addr),
            request_timeout_ms: 2_000,
            connect_timeout_ms: 2_000,
            reconnect_min_delay_ms: 10,
            reconnect_step_ms: 10,
            reconnect_max_delay_ms: 30,
            ..ConnectionConfig::default()
        }
    }

    /// Sockets accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn received_with(&self, key: &str) -> usize {
        self.received
            .lock()
            .unwrap()
            .iter()
            .filter(|v| v.get(key).is_some())
            .count()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Reply frame echoing `req`, with `body` merged in.
pub fn reply(req: &Value, msg_type: &str, body: Value) -> Value {
    let mut frame = json!({
        "msg_type": msg_type,
        "req_id": req["req_id"],
        "echo_req": req,
    });
    if let (Some(obj), Value::Object(extra)) = (frame.as_object_mut(), body) {
        obj.extend(extra);
    }
    frame
}

/// Error frame with a service code.
pub fn service_error(req: &Value, msg_type: &str, code: &str) -> Value {
    reply(req, msg_type, json!({"error": {"code": code, "message": code}}))
}

pub fn standard_handler() -> Handler {
    Arc::new(|req: &Value| {
        if req.get("authorize").is_some() {
            vec![reply(req, "authorize", json!({"authorize": {"loginid": "CR100"}}))]
        } else if req.get("ping").is_some() {
            vec![reply(req, "ping", json!({"ping": "pong"}))]
        } else if req.get("time").is_some() {
            // Answer twice to exercise late-duplicate handling.
            let frame = reply(req, "time", json!({"time": 1_700_000_000}));
            vec![frame.clone(), frame]
        } else if req.get("balance").is_some() {
            vec![reply(
                req,
                "balance",
                json!({"balance": {"balance": 100.5, "currency": "USD"}, "subscription": {"id": "bal-1"}}),
            )]
        } else if req.get("bogus").is_some() {
            vec![service_error(req, "error", "InputValidationFailed")]
        } else if req.get("privileged").is_some() {
            vec![service_error(req, "privileged", "InvalidToken")]
        } else {
            vec![]
        }
    })
}

pub async fn wait_for_state(manager: &ConnectionManager, target: ConnectionState) {
    let mut rx = manager.state_cell().watch();
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        rx.wait_for(|s| *s == target).await.is_ok()
    })
    .await;
    assert!(matches!(reached, Ok(true)), "state {target} not reached");
}

/// Poll `check` every few milliseconds for up to five seconds.
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .is_ok()
}
