// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request/response envelope for the agent channel.
//!
//! Both sides multiplex many in-flight calls over one connection; the
//! `id` field correlates a response with its request. The envelope is
//! transport-agnostic and is carried as a WebSocket text frame between
//! controller and agent, and as an IPC frame between CLI and agent.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumString};
use thiserror::Error;
use uuid::Uuid;

/// Errors raised while interpreting an envelope.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// The message was not valid JSON or did not match the envelope shape.
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A typed payload was requested but the payload did not match.
    #[error("invalid payload for '{kind}': {detail}")]
    InvalidPayload {
        /// Request type the payload belonged to.
        kind: RequestKind,
        /// Human-readable mismatch description.
        detail: String,
    },
}

/// Request types carried on the agent channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RequestKind {
    /// Agent → controller: create a checkpoint for a starting job.
    Create,
    /// Agent → controller: queue finalization of a checkpoint.
    Finalize,
    /// Agent → controller: fetch the current checkpoint record.
    Status,
    /// Either direction: liveness probe, answered with `{"pong": true}`.
    Ping,
    /// Controller → agent: execute a shell command on the runner host.
    Exec,
    /// Controller → agent: lightweight readiness check, no command run.
    ReadyProbe,
}

/// A correlated request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    /// Correlation id, echoed verbatim in the response.
    pub id: String,
    /// Request type.
    #[serde(rename = "type")]
    pub kind: RequestKind,
    /// Type-specific payload; `{}` when the request carries none.
    #[serde(default = "empty_payload")]
    pub payload: Value,
}

fn empty_payload() -> Value {
    Value::Object(serde_json::Map::new())
}

impl AgentRequest {
    /// Build a request with a fresh correlation id.
    pub fn new(kind: RequestKind, payload: Value) -> Self {
        Self {
            id: request_id(),
            kind,
            payload,
        }
    }

    /// Deserialize the payload into a typed struct.
    pub fn parse_payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, EnvelopeError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| EnvelopeError::InvalidPayload {
            kind: self.kind,
            detail: e.to_string(),
        })
    }
}

/// Outcome marker on a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ResponseStatus {
    Ok,
    Error,
}

/// Structured error attached to an `error` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    /// HTTP-flavored numeric code (400, 404, 503, ...).
    pub code: u16,
    /// Short human-readable description.
    pub detail: String,
}

/// A correlated response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    /// Correlation id copied from the request.
    pub id: String,
    /// `ok` or `error`.
    pub status: ResponseStatus,
    /// Result data on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Error details on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl AgentResponse {
    /// Build a success response.
    pub fn ok(id: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            status: ResponseStatus::Ok,
            data: Some(data),
            error: None,
        }
    }

    /// Build an error response.
    pub fn error(id: impl Into<String>, code: u16, detail: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: ResponseStatus::Error,
            data: None,
            error: Some(RpcError {
                code,
                detail: detail.into(),
            }),
        }
    }

    /// True when the response carries `status: ok`.
    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }
}

/// Generate a fresh correlation id.
pub fn request_id() -> String {
    Uuid::new_v4().to_string()
}

/// Payload of a `create` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePayload {
    /// CI job identifier the checkpoint belongs to.
    pub job_id: String,
    /// Optional free-form caller tag recorded in the operation log.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller: Option<String>,
}

/// Payload of a `finalize` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizePayload {
    /// Checkpoint to finalize.
    pub checkpoint_name: String,
    /// Job outcome: `success`, `failure`, or `canceled`.
    pub status: String,
    /// Completion-detection source; defaults to `agent` for this path.
    #[serde(default = "default_finalize_source")]
    pub source: String,
}

fn default_finalize_source() -> String {
    "agent".to_string()
}

/// Payload of a `status` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusPayload {
    /// Checkpoint to look up.
    pub checkpoint_name: String,
}

/// Payload of a controller-initiated `exec` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecPayload {
    /// Shell command line, run through `sh -c`.
    pub cmd: String,
    /// Seconds before the command is killed.
    #[serde(default = "default_exec_timeout")]
    pub timeout: u64,
}

fn default_exec_timeout() -> u64 {
    120
}

/// Result of an `exec` request, carried in the response `data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecResult {
    /// Process exit code; -1 when the command never ran or timed out.
    pub exit_code: i32,
    /// Captured stdout, truncated to 64 KiB.
    pub stdout: String,
    /// Captured stderr, truncated to 64 KiB.
    pub stderr: String,
}
