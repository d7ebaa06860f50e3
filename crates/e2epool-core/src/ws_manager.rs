// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-replica registry of connected agents.
//!
//! Each replica tracks only the WebSocket connections it accepted; there
//! is no cross-replica sharing (the operator keeps agent traffic sticky
//! by runner id, and the internal dispatch endpoint covers the rest).
//! Controller-initiated RPCs are correlated by envelope id: the sender
//! parks a oneshot under the id, the socket task resolves it when the
//! matching response arrives.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use e2epool_protocol::{AgentRequest, AgentResponse};

/// Errors from controller-initiated agent RPCs.
#[derive(Debug, Error)]
pub enum WsManagerError {
    /// No connection for the runner on this replica.
    #[error("Agent {0} not connected")]
    NotConnected(String),

    /// The agent did not answer within the timeout.
    #[error("Agent {0} did not respond in time")]
    Timeout(String),

    /// The connection dropped while the request was in flight.
    #[error("Agent {0} disconnected")]
    Disconnected(String),
}

/// Token identifying one accepted connection; guards unregistration so a
/// superseded socket task cannot evict its replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionToken(u64);

struct Connection {
    outbound: mpsc::UnboundedSender<String>,
    token: ConnectionToken,
}

struct Pending {
    responder: oneshot::Sender<AgentResponse>,
    runner_id: String,
    /// Connection the request went out on; its death fails the request,
    /// a superseded predecessor's death does not.
    token: ConnectionToken,
}

#[derive(Default)]
struct Inner {
    connections: HashMap<String, Connection>,
    pending: HashMap<String, Pending>,
}

/// Registry of active agent connections keyed by runner id.
#[derive(Clone, Default)]
pub struct ConnectionManager {
    inner: Arc<Mutex<Inner>>,
    next_token: Arc<AtomicU64>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection's outbound channel. If the runner already
    /// had a connection, the older sender is dropped, which ends the old
    /// socket task's send loop and closes its socket.
    pub fn register(
        &self,
        runner_id: &str,
        outbound: mpsc::UnboundedSender<String>,
    ) -> ConnectionToken {
        let token = ConnectionToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let mut inner = self.inner.lock().expect("connection manager poisoned");
        if inner.connections.contains_key(runner_id) {
            debug!(runner_id = %runner_id, "Replacing existing agent connection");
        }
        inner.connections.insert(
            runner_id.to_string(),
            Connection { outbound, token },
        );
        token
    }

    /// Remove the connection identified by `token` and fail its pending
    /// RPCs. A stale token (connection already replaced) is a no-op for
    /// the map but still fails the old connection's pending requests.
    pub fn unregister(&self, runner_id: &str, token: ConnectionToken) {
        let mut inner = self.inner.lock().expect("connection manager poisoned");
        if inner
            .connections
            .get(runner_id)
            .map(|c| c.token == token)
            .unwrap_or(false)
        {
            inner.connections.remove(runner_id);
        }
        let stale: Vec<String> = inner
            .pending
            .iter()
            .filter(|(_, p)| p.runner_id == runner_id && p.token == token)
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            // Dropping the oneshot sender wakes the waiter with an error.
            inner.pending.remove(&id);
        }
    }

    /// True when this replica holds a connection for the runner.
    pub fn is_connected(&self, runner_id: &str) -> bool {
        self.inner
            .lock()
            .expect("connection manager poisoned")
            .connections
            .contains_key(runner_id)
    }

    /// Runner ids with a live connection on this replica.
    pub fn connected_runners(&self) -> Vec<String> {
        self.inner
            .lock()
            .expect("connection manager poisoned")
            .connections
            .keys()
            .cloned()
            .collect()
    }

    /// Send a controller-initiated request and await the correlated
    /// response.
    pub async fn send_request(
        &self,
        runner_id: &str,
        request: AgentRequest,
        timeout: Duration,
    ) -> Result<AgentResponse, WsManagerError> {
        let (responder, waiter) = oneshot::channel();
        let request_id = request.id.clone();
        let text = serde_json::to_string(&request)
            .expect("envelope serialization cannot fail");

        {
            let mut inner = self.inner.lock().expect("connection manager poisoned");
            let conn = inner
                .connections
                .get(runner_id)
                .ok_or_else(|| WsManagerError::NotConnected(runner_id.to_string()))?;
            if conn.outbound.send(text).is_err() {
                return Err(WsManagerError::Disconnected(runner_id.to_string()));
            }
            let token = conn.token;
            inner.pending.insert(
                request_id.clone(),
                Pending {
                    responder,
                    runner_id: runner_id.to_string(),
                    token,
                },
            );
        }

        match tokio::time::timeout(timeout, waiter).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(WsManagerError::Disconnected(runner_id.to_string())),
            Err(_) => {
                self.inner
                    .lock()
                    .expect("connection manager poisoned")
                    .pending
                    .remove(&request_id);
                Err(WsManagerError::Timeout(runner_id.to_string()))
            }
        }
    }

    /// Resolve a pending controller-initiated RPC with the agent's
    /// response. Returns false when nothing was waiting on the id.
    pub fn resolve(&self, response: AgentResponse) -> bool {
        let pending = self
            .inner
            .lock()
            .expect("connection manager poisoned")
            .pending
            .remove(&response.id);
        match pending {
            Some(p) => p.responder.send(response).is_ok(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use e2epool_protocol::RequestKind;
    use serde_json::json;

    #[tokio::test]
    async fn test_register_and_is_connected() {
        let manager = ConnectionManager::new();
        assert!(!manager.is_connected("r1"));

        let (tx, _rx) = mpsc::unbounded_channel();
        let token = manager.register("r1", tx);
        assert!(manager.is_connected("r1"));
        assert_eq!(manager.connected_runners(), vec!["r1".to_string()]);

        manager.unregister("r1", token);
        assert!(!manager.is_connected("r1"));
    }

    #[tokio::test]
    async fn test_stale_unregister_keeps_new_connection() {
        let manager = ConnectionManager::new();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let old = manager.register("r1", tx1);
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let _new = manager.register("r1", tx2);

        manager.unregister("r1", old);
        assert!(manager.is_connected("r1"));
    }

    #[tokio::test]
    async fn test_send_request_round_trip() {
        let manager = ConnectionManager::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        manager.register("r1", tx);

        let mgr = manager.clone();
        let echo = tokio::spawn(async move {
            let raw = rx.recv().await.unwrap();
            let req: AgentRequest = serde_json::from_str(&raw).unwrap();
            assert_eq!(req.kind, RequestKind::Exec);
            mgr.resolve(AgentResponse::ok(&req.id, json!({"exit_code": 0})));
        });

        let request = AgentRequest::new(RequestKind::Exec, json!({"cmd": "true"}));
        let response = manager
            .send_request("r1", request, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(response.is_ok());
        echo.await.unwrap();
    }

    #[tokio::test]
    async fn test_send_request_not_connected() {
        let manager = ConnectionManager::new();
        let request = AgentRequest::new(RequestKind::Ping, json!({}));
        let err = manager
            .send_request("ghost", request, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, WsManagerError::NotConnected(_)));
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending() {
        let manager = ConnectionManager::new();
        let (tx, _rx) = mpsc::unbounded_channel::<String>();
        let token = manager.register("r1", tx);

        let mgr = manager.clone();
        let request = AgentRequest::new(RequestKind::Exec, json!({"cmd": "sleep 60"}));
        let waiter = tokio::spawn(async move {
            mgr.send_request("r1", request, Duration::from_secs(5)).await
        });

        // Let the request park before dropping the connection.
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.unregister("r1", token);

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, WsManagerError::Disconnected(_)));
    }

    #[tokio::test]
    async fn test_resolve_unknown_id() {
        let manager = ConnectionManager::new();
        assert!(!manager.resolve(AgentResponse::ok("nobody-waits", json!({}))));
    }
}
