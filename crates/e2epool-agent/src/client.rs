// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The agent's controller connection.
//!
//! One WebSocket at a time, reconnected with jittered exponential
//! backoff. Inbound frames are either controller-initiated requests
//! (`exec`, `ready_probe`, `ping`) or responses to agent-initiated
//! requests, matched to their waiter by correlation id. Local IPC
//! requests are forwarded over the same socket.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};

use e2epool_protocol::{
    AgentRequest, AgentResponse, CLOSE_CODE_UNAUTHORIZED, ExecPayload, RequestKind,
};

use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::exec::run_command;

/// Bound on waiting for in-flight requests during graceful shutdown.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
/// Timeout for forwarded IPC requests.
const FORWARD_TIMEOUT: Duration = Duration::from_secs(30);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct ConnOutcome {
    auth_rejected: bool,
    shutdown: bool,
}

/// The agent daemon's connection state machine.
pub struct AgentClient {
    config: AgentConfig,
    pending: Mutex<HashMap<String, oneshot::Sender<AgentResponse>>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    shutdown: Notify,
    shutting_down: AtomicBool,
}

impl AgentClient {
    pub fn new(config: AgentConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            pending: Mutex::new(HashMap::new()),
            outbound: Mutex::new(None),
            shutdown: Notify::new(),
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Begin graceful shutdown: stop taking new work, drain, disconnect.
    pub fn trigger_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }

    /// True while a controller connection is live.
    pub fn is_connected(&self) -> bool {
        self.outbound.lock().expect("outbound lock poisoned").is_some()
    }

    /// Run the connection loop until shutdown.
    pub async fn run(self: Arc<Self>) {
        let url = self.config.ws_url();
        let max_delay = Duration::from_secs(self.config.reconnect_max_delay);
        let mut delay = Duration::from_secs(1);

        while !self.shutting_down.load(Ordering::SeqCst) {
            info!(url = %self.config.controller_url, "Connecting to controller");
            match connect_async(url.as_str()).await {
                Ok((ws, _)) => {
                    info!("Connected to controller");
                    let outcome = Self::serve_connection(&self, ws).await;
                    if outcome.shutdown {
                        break;
                    }
                    // A credential rejection keeps the backoff growing.
                    if !outcome.auth_rejected {
                        delay = Duration::from_secs(1);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Connection to controller failed");
                }
            }

            self.clear_connection();
            self.fail_pending();

            if self.shutting_down.load(Ordering::SeqCst) {
                break;
            }

            let jitter = delay.mul_f64(rand::thread_rng().gen_range(0.0..0.1));
            let wait = delay + jitter;
            info!(delay_secs = wait.as_secs_f64(), "Reconnecting after backoff");
            tokio::select! {
                _ = self.shutdown.notified() => break,
                _ = tokio::time::sleep(wait) => {}
            }
            delay = (delay * 2).min(max_delay);
        }

        self.clear_connection();
        self.fail_pending();
        info!("Agent connection loop stopped");
    }

    async fn serve_connection(this: &Arc<Self>, ws: WsStream) -> ConnOutcome {
        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        *this.outbound.lock().expect("outbound lock poisoned") = Some(out_tx);

        let heartbeat_timeout = Duration::from_secs(this.config.heartbeat_timeout);
        let mut heartbeat =
            tokio::time::interval(Duration::from_secs(this.config.heartbeat_interval));
        let mut last_rx = tokio::time::Instant::now();
        let mut auth_rejected = false;
        let mut shutdown = false;

        loop {
            tokio::select! {
                incoming = stream.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            last_rx = tokio::time::Instant::now();
                            Self::handle_text(this, &text);
                        }
                        Some(Ok(Message::Ping(data))) => {
                            last_rx = tokio::time::Instant::now();
                            if sink.send(Message::Pong(data)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {
                            last_rx = tokio::time::Instant::now();
                        }
                        Some(Ok(Message::Close(frame))) => {
                            if let Some(frame) = frame {
                                if u16::from(frame.code) == CLOSE_CODE_UNAUTHORIZED {
                                    error!("Controller rejected credentials");
                                    auth_rejected = true;
                                }
                            }
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(error = %e, "WS connection lost");
                            break;
                        }
                        None => break,
                    }
                }
                outgoing = out_rx.recv() => {
                    match outgoing {
                        Some(text) => {
                            if sink.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = heartbeat.tick() => {
                    if last_rx.elapsed() > heartbeat_timeout {
                        warn!(
                            timeout_secs = heartbeat_timeout.as_secs(),
                            "No traffic from controller; reconnecting"
                        );
                        break;
                    }
                    let ping = AgentRequest::new(RequestKind::Ping, json!({}));
                    let text = serde_json::to_string(&ping)
                        .expect("envelope serialization cannot fail");
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                _ = this.shutdown.notified() => {
                    shutdown = true;
                    this.drain_in_flight().await;
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }

        this.clear_connection();
        ConnOutcome {
            auth_rejected,
            shutdown,
        }
    }

    /// Handle one inbound text frame.
    fn handle_text(this: &Arc<Self>, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(_) => {
                debug!("Ignoring malformed frame from controller");
                return;
            }
        };

        // Responses to agent-initiated requests carry `status`.
        if value.get("status").is_some() {
            if let Ok(response) = serde_json::from_value::<AgentResponse>(value) {
                let waiter = this
                    .pending
                    .lock()
                    .expect("pending lock poisoned")
                    .remove(&response.id);
                if let Some(waiter) = waiter {
                    let _ = waiter.send(response);
                }
            }
            return;
        }

        let request: AgentRequest = match serde_json::from_value(value.clone()) {
            Ok(request) => request,
            Err(e) => {
                let id = value.get("id").and_then(Value::as_str).unwrap_or("");
                this.send_response(AgentResponse::error(id, 400, e.to_string()));
                return;
            }
        };

        match request.kind {
            RequestKind::Exec => {
                let client = this.clone();
                tokio::spawn(async move {
                    client.handle_exec(request).await;
                });
            }
            RequestKind::ReadyProbe => {
                this.send_response(AgentResponse::ok(&request.id, json!({ "ready": true })));
            }
            RequestKind::Ping => {
                this.send_response(AgentResponse::ok(&request.id, json!({ "pong": true })));
            }
            _ => {
                this.send_response(AgentResponse::error(
                    &request.id,
                    400,
                    format!("'{}' is not a controller-initiated request type", request.kind),
                ));
            }
        }
    }

    /// Execute a controller-initiated command and report the result.
    async fn handle_exec(self: Arc<Self>, request: AgentRequest) {
        let payload: ExecPayload = match request.parse_payload() {
            Ok(payload) => payload,
            Err(e) => {
                self.send_response(AgentResponse::error(&request.id, 400, e.to_string()));
                return;
            }
        };

        let result = run_command(&payload.cmd, Duration::from_secs(payload.timeout)).await;
        let data = serde_json::to_value(&result).expect("exec result serialization cannot fail");
        let response = if result.exit_code == 0 {
            AgentResponse::ok(&request.id, data)
        } else {
            AgentResponse {
                data: Some(data),
                ..AgentResponse::error(&request.id, 500, "Command failed")
            }
        };
        self.send_response(response);
    }

    fn send_response(&self, response: AgentResponse) {
        let text = serde_json::to_string(&response).expect("envelope serialization cannot fail");
        let sender = self.outbound.lock().expect("outbound lock poisoned").clone();
        if let Some(sender) = sender {
            let _ = sender.send(text);
        }
    }

    /// Forward a local IPC request to the controller.
    pub async fn forward(&self, request: AgentRequest) -> AgentResponse {
        if self.shutting_down.load(Ordering::SeqCst) {
            return AgentResponse::error(&request.id, 503, "Agent shutting down");
        }
        let id = request.id.clone();
        match self.request(request, FORWARD_TIMEOUT).await {
            Ok(response) => response,
            Err(e @ (AgentError::NotConnected | AgentError::Timeout)) => {
                AgentResponse::error(id, 503, e.to_string())
            }
            Err(e) => AgentResponse::error(id, 500, e.to_string()),
        }
    }

    /// Send a request over the live connection and await its response.
    pub async fn request(
        &self,
        request: AgentRequest,
        timeout: Duration,
    ) -> Result<AgentResponse, AgentError> {
        let text = serde_json::to_string(&request)?;
        let id = request.id.clone();

        let sender = self
            .outbound
            .lock()
            .expect("outbound lock poisoned")
            .clone()
            .ok_or(AgentError::NotConnected)?;

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .insert(id.clone(), tx);

        if sender.send(text).is_err() {
            self.pending
                .lock()
                .expect("pending lock poisoned")
                .remove(&id);
            return Err(AgentError::NotConnected);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(AgentError::NotConnected),
            Err(_) => {
                self.pending
                    .lock()
                    .expect("pending lock poisoned")
                    .remove(&id);
                Err(AgentError::Timeout)
            }
        }
    }

    fn clear_connection(&self) {
        *self.outbound.lock().expect("outbound lock poisoned") = None;
    }

    /// Fail every parked waiter; their oneshot senders drop with the map
    /// entries.
    fn fail_pending(&self) {
        let count = {
            let mut pending = self.pending.lock().expect("pending lock poisoned");
            let count = pending.len();
            pending.clear();
            count
        };
        if count > 0 {
            warn!(count, "Failed pending requests after connection loss");
        }
    }

    async fn drain_in_flight(&self) {
        let deadline = tokio::time::Instant::now() + SHUTDOWN_DRAIN_TIMEOUT;
        while !self
            .pending
            .lock()
            .expect("pending lock poisoned")
            .is_empty()
        {
            if tokio::time::Instant::now() >= deadline {
                warn!("Shutdown drain timed out with requests still in flight");
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}
