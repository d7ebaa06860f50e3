// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Agent configuration.
//!
//! Loaded from `E2EPOOL_AGENT_*` environment variables. Every field has
//! a default so the CLI verbs (which only need the socket path) work
//! without a full daemon configuration; the `agent` subcommand checks
//! that `runner_id` and `token` are actually set before connecting.

use std::path::PathBuf;

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Controller WebSocket endpoint.
    pub controller_url: String,
    /// This host's runner id.
    pub runner_id: String,
    /// This runner's bearer token.
    pub token: String,
    /// Unix socket the IPC server listens on.
    pub socket_path: PathBuf,
    /// Reconnect backoff cap in seconds.
    pub reconnect_max_delay: u64,
    /// Agent-side heartbeat cadence in seconds.
    pub heartbeat_interval: u64,
    /// Silence threshold after which the connection is recycled.
    pub heartbeat_timeout: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            controller_url: "ws://localhost:8080/ws/agent".to_string(),
            runner_id: String::new(),
            token: String::new(),
            socket_path: PathBuf::from("/var/run/e2epool-agent.sock"),
            reconnect_max_delay: 60,
            heartbeat_interval: 30,
            heartbeat_timeout: 90,
        }
    }
}

impl AgentConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            controller_url: std::env::var("E2EPOOL_AGENT_CONTROLLER_URL")
                .unwrap_or(defaults.controller_url),
            runner_id: std::env::var("E2EPOOL_AGENT_RUNNER_ID").unwrap_or_default(),
            token: std::env::var("E2EPOOL_AGENT_TOKEN").unwrap_or_default(),
            socket_path: std::env::var("E2EPOOL_AGENT_SOCKET_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.socket_path),
            reconnect_max_delay: env_u64(
                "E2EPOOL_AGENT_RECONNECT_MAX_DELAY",
                defaults.reconnect_max_delay,
            ),
            heartbeat_interval: env_u64(
                "E2EPOOL_AGENT_HEARTBEAT_INTERVAL",
                defaults.heartbeat_interval,
            ),
            heartbeat_timeout: env_u64(
                "E2EPOOL_AGENT_HEARTBEAT_TIMEOUT",
                defaults.heartbeat_timeout,
            ),
        }
    }

    /// Build the connect URL with credentials as query parameters.
    pub fn ws_url(&self) -> String {
        let base = self.controller_url.trim_end_matches('/');
        let separator = if base.contains('?') { '&' } else { '?' };
        format!(
            "{base}{separator}runner_id={}&token={}",
            self.runner_id, self.token
        )
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
