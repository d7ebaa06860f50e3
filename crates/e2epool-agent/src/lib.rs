// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! e2epool Agent - runner-host daemon for the checkpoint controller.
//!
//! The agent maintains the persistent WebSocket to the controller
//! (outbound-only connectivity: the runner host dials out, nothing dials
//! in), executes controller-initiated shell commands, and serves local
//! CI scripts over a Unix-socket IPC with the three verbs `create`,
//! `finalize`, and `status`.
//!
//! Connection lifecycle: exponential backoff from 1 s, jittered, capped;
//! heartbeat liveness both ways; a credential rejection (close code
//! 4401) keeps backing off instead of resetting the delay.

pub mod client;
pub mod config;
pub mod error;
pub mod exec;
pub mod ipc_server;

pub use client::AgentClient;
pub use config::AgentConfig;
pub use error::AgentError;
