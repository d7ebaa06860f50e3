// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The WebSocket agent channel, server side.
//!
//! One socket per runner host, authenticated by `runner_id` + `token`
//! query parameters at upgrade time. Frames flow both ways:
//! agent-initiated `create`/`finalize`/`status`/`ping` requests are
//! dispatched to the checkpoint service with the connection's
//! authenticated runner; responses to controller-initiated `exec` and
//! `ready_probe` RPCs are routed back through the connection manager by
//! correlation id.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use e2epool_protocol::{
    AgentRequest, AgentResponse, CLOSE_CODE_UNAUTHORIZED, CreatePayload, FinalizePayload,
    RequestKind, StatusPayload,
};

use super::AppState;
use crate::db::{FinalizeSource, FinalizeStatus, RunnerRow};
use crate::error::Error;
use crate::service::{FinalizeOutcome, is_valid_checkpoint_name};

#[derive(Debug, Deserialize)]
pub struct AgentQuery {
    pub runner_id: String,
    pub token: String,
}

/// `GET /ws/agent?runner_id=&token=`
pub async fn ws_agent(
    State(state): State<AppState>,
    Query(query): Query<AgentQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let runner = match state.registry.lookup_by_token(&query.token).await {
        Ok(Some(runner)) if runner.runner_id == query.runner_id => Some(runner),
        Ok(_) => None,
        Err(e) => {
            warn!(runner_id = %query.runner_id, error = %e, "WS auth lookup failed");
            None
        }
    };

    match runner {
        Some(runner) => ws.on_upgrade(move |socket| handle_socket(socket, runner, state)),
        None => ws.on_upgrade(reject_socket),
    }
}

/// Close immediately with the application auth-failure code; agents key
/// their retry behavior off it.
async fn reject_socket(mut socket: WebSocket) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: CLOSE_CODE_UNAUTHORIZED,
            reason: "Invalid credentials".into(),
        })))
        .await;
}

async fn handle_socket(socket: WebSocket, runner: Arc<RunnerRow>, state: AppState) {
    let runner_id = runner.runner_id.clone();
    let (mut sink, mut stream) = socket.split();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let token = state.manager.register(&runner_id, out_tx);
    info!(runner_id = %runner_id, "Agent connected");

    let heartbeat_interval = Duration::from_secs(state.config.ws_heartbeat_interval);
    let heartbeat_timeout = Duration::from_secs(state.config.ws_heartbeat_timeout);
    let mut heartbeat = tokio::time::interval(heartbeat_interval);
    let mut last_rx = Instant::now();

    loop {
        tokio::select! {
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(message)) => {
                        last_rx = Instant::now();
                        match message {
                            Message::Text(text) => {
                                if let Some(reply) = process_text(&state, &runner, &text).await {
                                    if sink.send(Message::Text(reply)).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            Message::Ping(data) => {
                                if sink.send(Message::Pong(data)).await.is_err() {
                                    break;
                                }
                            }
                            Message::Pong(_) => {}
                            Message::Close(_) => break,
                            Message::Binary(_) => {
                                debug!(runner_id = %runner_id, "Ignoring binary frame");
                            }
                        }
                    }
                    Some(Err(e)) => {
                        debug!(runner_id = %runner_id, error = %e, "WS receive error");
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
                    // Sender dropped: a newer connection for the same
                    // runner replaced this one.
                    None => {
                        info!(runner_id = %runner_id, "Agent connection superseded");
                        break;
                    }
                }
            }
            _ = heartbeat.tick() => {
                if last_rx.elapsed() > heartbeat_timeout {
                    warn!(
                        runner_id = %runner_id,
                        timeout_secs = heartbeat_timeout.as_secs(),
                        "Agent heartbeat timed out"
                    );
                    break;
                }
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    state.manager.unregister(&runner_id, token);
    info!(runner_id = %runner_id, "Agent disconnected");
}

/// Handle one inbound text frame; returns the serialized reply, if any.
async fn process_text(state: &AppState, runner: &RunnerRow, text: &str) -> Option<String> {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(_) => {
            return serialize(AgentResponse::error("", 400, "Malformed message"));
        }
    };

    // A `status` field marks an agent response to a controller-initiated
    // RPC; route it to whoever is waiting on the correlation id.
    if value.get("status").is_some() {
        if let Ok(response) = serde_json::from_value::<AgentResponse>(value) {
            if !state.manager.resolve(response) {
                debug!(runner_id = %runner.runner_id, "Response with no pending request");
            }
        }
        return None;
    }

    let id = value
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let request: AgentRequest = match serde_json::from_value(value) {
        Ok(request) => request,
        Err(e) => {
            return serialize(AgentResponse::error(id, 400, e.to_string()));
        }
    };

    serialize(handle_agent_request(state, runner, request).await)
}

fn serialize(response: AgentResponse) -> Option<String> {
    Some(serde_json::to_string(&response).expect("envelope serialization cannot fail"))
}

fn error_response(id: &str, error: &Error) -> AgentResponse {
    let code = error.rpc_code();
    let detail = if code >= 500 && code != 502 && code != 503 && code != 504 {
        tracing::error!(error = %error, "Internal error on agent channel");
        "Internal server error".to_string()
    } else {
        error.to_string()
    };
    AgentResponse::error(id, code, detail)
}

/// Dispatch an agent-initiated request to the service layer.
async fn handle_agent_request(
    state: &AppState,
    runner: &RunnerRow,
    request: AgentRequest,
) -> AgentResponse {
    match request.kind {
        RequestKind::Ping => AgentResponse::ok(&request.id, json!({ "pong": true })),

        RequestKind::Create => {
            let payload: CreatePayload = match request.parse_payload() {
                Ok(payload) => payload,
                Err(e) => return AgentResponse::error(&request.id, 400, e.to_string()),
            };
            if payload.job_id.is_empty() {
                return AgentResponse::error(&request.id, 400, "job_id is required");
            }
            match state
                .service
                .create(runner, &payload.job_id, payload.caller.as_deref())
                .await
            {
                Ok(checkpoint) => match serde_json::to_value(checkpoint.to_view()) {
                    Ok(data) => AgentResponse::ok(&request.id, data),
                    Err(e) => error_response(&request.id, &e.into()),
                },
                Err(e) => error_response(&request.id, &e),
            }
        }

        RequestKind::Finalize => {
            let payload: FinalizePayload = match request.parse_payload() {
                Ok(payload) => payload,
                Err(e) => return AgentResponse::error(&request.id, 400, e.to_string()),
            };
            if !is_valid_checkpoint_name(&payload.checkpoint_name) {
                return AgentResponse::error(
                    &request.id,
                    400,
                    "checkpoint_name does not match the checkpoint name pattern",
                );
            }
            let Ok(status) = payload.status.parse::<FinalizeStatus>() else {
                return AgentResponse::error(
                    &request.id,
                    400,
                    format!("Invalid status '{}'", payload.status),
                );
            };
            let Ok(source) = payload.source.parse::<FinalizeSource>() else {
                return AgentResponse::error(
                    &request.id,
                    400,
                    format!("Invalid source '{}'", payload.source),
                );
            };
            match state
                .service
                .queue_finalize(&runner.runner_id, &payload.checkpoint_name, status, source)
                .await
            {
                Ok(FinalizeOutcome::Queued(cp)) => AgentResponse::ok(
                    &request.id,
                    json!({ "detail": "Finalize queued", "checkpoint_name": cp.name }),
                ),
                Ok(FinalizeOutcome::AlreadyQueued(cp)) => AgentResponse::ok(
                    &request.id,
                    json!({ "detail": "Already queued", "state": cp.state }),
                ),
                Ok(FinalizeOutcome::AlreadyFinalized(cp)) => AgentResponse::ok(
                    &request.id,
                    json!({ "detail": "Already finalized", "state": cp.state }),
                ),
                Err(e) => error_response(&request.id, &e),
            }
        }

        RequestKind::Status => {
            let payload: StatusPayload = match request.parse_payload() {
                Ok(payload) => payload,
                Err(e) => return AgentResponse::error(&request.id, 400, e.to_string()),
            };
            match state
                .service
                .get_status(&runner.runner_id, &payload.checkpoint_name)
                .await
            {
                Ok(checkpoint) => match serde_json::to_value(checkpoint.to_view()) {
                    Ok(data) => AgentResponse::ok(&request.id, data),
                    Err(e) => error_response(&request.id, &e.into()),
                },
                Err(e) => error_response(&request.id, &e),
            }
        }

        // Controller-initiated types arriving from the agent side.
        RequestKind::Exec | RequestKind::ReadyProbe => AgentResponse::error(
            &request.id,
            400,
            format!("'{}' is a controller-initiated request type", request.kind),
        ),
    }
}
