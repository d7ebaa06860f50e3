// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! e2epool Protocol - agent channel envelope and IPC framing
//!
//! This crate provides the message formats shared between the controller,
//! the runner-host agent, and the local CLI:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    e2epool-protocol                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Envelope: correlated request/response (JSON)               │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Transports: WebSocket text frames (controller ⇄ agent)     │
//! │              length-prefixed Unix socket (CLI ⇄ agent)      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Envelope
//!
//! Every message on the agent channel is a JSON object. Requests carry a
//! correlation `id`, a `type`, and a free-form `payload`; responses echo
//! the `id` verbatim with either `data` or a structured `error`:
//!
//! ```json
//! { "id": "…", "type": "create", "payload": { "job_id": "100" } }
//! { "id": "…", "status": "ok", "data": { … } }
//! { "id": "…", "status": "error", "error": { "code": 404, "detail": "…" } }
//! ```
//!
//! `create`, `finalize`, and `status` are agent-initiated; `exec` and
//! `ready_probe` are controller-initiated; `ping` flows either way.
//!
//! # IPC framing
//!
//! The agent's Unix-domain-socket RPC uses one length-prefixed JSON
//! message per request and per response: a 4-byte big-endian length
//! header followed by the payload, capped at [`ipc::MAX_MSG_SIZE`].

pub mod envelope;
pub mod ipc;

pub use envelope::{
    AgentRequest, AgentResponse, CreatePayload, ExecPayload, ExecResult, FinalizePayload,
    RequestKind, ResponseStatus, RpcError, StatusPayload, request_id,
};
#[cfg(unix)]
pub use ipc::IpcClient;
pub use ipc::{IpcError, MAX_MSG_SIZE, read_message, write_message};

/// Application-defined WebSocket close code for rejected credentials.
///
/// Sent by the controller before closing when `runner_id`/`token` do not
/// match the registry; agents seeing it keep reconnecting on backoff only.
pub const CLOSE_CODE_UNAUTHORIZED: u16 = 4401;
