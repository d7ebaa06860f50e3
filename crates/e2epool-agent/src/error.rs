// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the e2epool agent.

use thiserror::Error;

/// Agent errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AgentError {
    /// No live connection to the controller.
    #[error("Not connected to controller")]
    NotConnected,

    /// The controller did not answer in time.
    #[error("Controller did not respond in time")]
    Timeout,

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket transport failure.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}
