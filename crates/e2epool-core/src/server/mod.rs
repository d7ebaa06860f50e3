// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP/WS surface of the controller.
//!
//! Everything except `/healthz` and the webhooks requires a bearer
//! token: runner endpoints resolve the token through the registry,
//! admin and internal endpoints check the deployment's admin token.

pub mod handlers;
pub mod webhook;
pub mod ws;

use std::sync::Arc;

use axum::Router;
use axum::http::HeaderMap;
use axum::routing::{get, post};
use sqlx::PgPool;

use crate::backend::AgentRpc;
use crate::config::Config;
use crate::db::RunnerRow;
use crate::error::{Error, Result};
use crate::registry::RunnerRegistry;
use crate::service::CheckpointService;
use crate::ws_manager::ConnectionManager;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<Config>,
    pub registry: Arc<RunnerRegistry>,
    pub service: Arc<CheckpointService>,
    pub manager: ConnectionManager,
    pub agent_rpc: AgentRpc,
}

/// Build the controller router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/checkpoint/create", post(handlers::checkpoint_create))
        .route("/checkpoint/finalize", post(handlers::checkpoint_finalize))
        .route("/checkpoint/status/:name", get(handlers::checkpoint_status))
        .route("/runner/readiness", get(handlers::runner_readiness))
        .route(
            "/api/runners",
            post(handlers::admin_create_runner).get(handlers::admin_list_runners),
        )
        .route(
            "/api/runners/:runner_id",
            get(handlers::admin_get_runner).delete(handlers::admin_delete_runner),
        )
        .route("/webhooks/gitlab", post(webhook::gitlab_webhook))
        .route("/webhooks/github", post(webhook::github_webhook))
        .route("/internal/agent/:runner_id/exec", post(handlers::internal_agent_exec))
        .route(
            "/internal/agent/:runner_id/connected",
            get(handlers::internal_agent_connected),
        )
        .route("/ws/agent", get(ws::ws_agent))
        .with_state(state)
}

/// Extract the bearer token from the Authorization header.
pub(crate) fn bearer_token(headers: &HeaderMap) -> Result<&str> {
    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| Error::Auth("Missing authorization header".to_string()))?;
    header
        .strip_prefix("Bearer ")
        .ok_or_else(|| Error::Auth("Invalid authorization header".to_string()))
}

/// Resolve a runner bearer token to its runner row.
pub(crate) async fn authenticate_runner(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Arc<RunnerRow>> {
    let token = bearer_token(headers)?;
    state
        .registry
        .lookup_by_token(token)
        .await?
        .ok_or_else(|| Error::Forbidden("Invalid token".to_string()))
}

/// Check the admin bearer token.
pub(crate) fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<()> {
    let token = bearer_token(headers)?;
    if constant_time_eq(token.as_bytes(), state.config.admin_token.as_bytes()) {
        Ok(())
    } else {
        Err(Error::Forbidden("Invalid admin token".to_string()))
    }
}

/// Length-then-contents comparison that does not short-circuit on the
/// first differing byte.
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
