// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! REST handlers: checkpoint lifecycle, runner readiness, health,
//! admin runner CRUD, internal agent dispatch.

use std::time::Duration;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use e2epool_protocol::{AgentRequest, RequestKind};

use super::{AppState, authenticate_runner, require_admin};
use crate::backend::{BackendError, interpret_exec_response};
use crate::db::{self, FinalizeSource, FinalizeStatus, RunnerRow, RunnerSpec};
use crate::error::{Error, Result};
use crate::service::{FinalizeOutcome, is_valid_checkpoint_name};
use crate::ws_manager::WsManagerError;

// ============================================================================
// Checkpoint endpoints
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CheckpointCreateRequest {
    pub runner_id: String,
    pub job_id: String,
    #[serde(default)]
    pub caller: Option<String>,
}

pub async fn checkpoint_create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CheckpointCreateRequest>,
) -> Result<impl IntoResponse> {
    let runner = authenticate_runner(&state, &headers).await?;
    if runner.runner_id != body.runner_id {
        return Err(Error::Forbidden(
            "Token not authorized for this runner".to_string(),
        ));
    }

    let checkpoint = state
        .service
        .create(&runner, &body.job_id, body.caller.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(checkpoint.to_view())))
}

#[derive(Debug, Deserialize)]
pub struct CheckpointFinalizeRequest {
    pub checkpoint_name: String,
    pub status: String,
    #[serde(default = "default_source")]
    pub source: String,
}

fn default_source() -> String {
    "hook".to_string()
}

pub async fn checkpoint_finalize(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CheckpointFinalizeRequest>,
) -> Result<impl IntoResponse> {
    let runner = authenticate_runner(&state, &headers).await?;

    if !is_valid_checkpoint_name(&body.checkpoint_name) {
        return Err(Error::Validation(format!(
            "checkpoint_name '{}' does not match the checkpoint name pattern",
            body.checkpoint_name
        )));
    }
    let status: FinalizeStatus = body
        .status
        .parse()
        .map_err(|_| Error::Validation(format!("Invalid status '{}'", body.status)))?;
    let source: FinalizeSource = body
        .source
        .parse()
        .map_err(|_| Error::Validation(format!("Invalid source '{}'", body.source)))?;

    let outcome = state
        .service
        .queue_finalize(&runner.runner_id, &body.checkpoint_name, status, source)
        .await?;

    let body = match outcome {
        FinalizeOutcome::Queued(cp) => json!({
            "detail": "Finalize queued",
            "checkpoint_name": cp.name,
        }),
        FinalizeOutcome::AlreadyQueued(cp) => json!({
            "detail": "Already queued",
            "checkpoint_name": cp.name,
            "state": cp.state,
        }),
        FinalizeOutcome::AlreadyFinalized(cp) => json!({
            "detail": "Already finalized",
            "checkpoint_name": cp.name,
            "state": cp.state,
        }),
    };
    Ok((StatusCode::ACCEPTED, Json(body)))
}

pub async fn checkpoint_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<impl IntoResponse> {
    let runner = authenticate_runner(&state, &headers).await?;
    let checkpoint = state.service.get_status(&runner.runner_id, &name).await?;
    Ok(Json(checkpoint.to_view()))
}

// ============================================================================
// Runner readiness and health
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub runner_id: String,
    pub ready: bool,
}

pub async fn runner_readiness(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse> {
    let runner = authenticate_runner(&state, &headers).await?;
    let ready = state.agent_rpc.check_ready_once(&runner).await;
    Ok(Json(ReadinessResponse {
        runner_id: runner.runner_id.clone(),
        ready,
    }))
}

pub async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    match db::health_check(&state.pool).await {
        Ok(_) => (StatusCode::OK, Json(json!({ "status": "ok" }))),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unhealthy", "detail": e.to_string() })),
        ),
    }
}

// ============================================================================
// Admin runner CRUD
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct RunnerCreateRequest {
    pub runner_id: String,
    pub backend: String,
    #[serde(default)]
    pub proxmox_host: Option<String>,
    #[serde(default)]
    pub proxmox_token_name: Option<String>,
    #[serde(default)]
    pub proxmox_token_value: Option<String>,
    #[serde(default)]
    pub proxmox_node: Option<String>,
    #[serde(default)]
    pub proxmox_vmid: Option<i64>,
    #[serde(default)]
    pub reset_cmd: Option<String>,
    #[serde(default)]
    pub cleanup_cmd: Option<String>,
    #[serde(default)]
    pub readiness_cmd: Option<String>,
    #[serde(default = "default_ci_adapter")]
    pub ci_adapter: String,
    #[serde(default)]
    pub ci_url: Option<String>,
    #[serde(default)]
    pub ci_token: Option<String>,
    #[serde(default)]
    pub ci_runner_id: Option<i64>,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_ci_adapter() -> String {
    "gitlab".to_string()
}

/// Row as returned by runner creation: the only place the token is ever
/// exposed.
#[derive(Debug, Serialize)]
pub struct RunnerCreatedResponse {
    pub runner_id: String,
    pub backend: String,
    pub token: String,
    pub ci_adapter: String,
    pub ci_runner_id: Option<i64>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Row as returned by list/get: token and backend secret masked.
#[derive(Debug, Serialize)]
pub struct RunnerResponse {
    pub runner_id: String,
    pub backend: String,
    pub proxmox_host: Option<String>,
    pub proxmox_node: Option<String>,
    pub proxmox_vmid: Option<i64>,
    pub reset_cmd: Option<String>,
    pub cleanup_cmd: Option<String>,
    pub readiness_cmd: Option<String>,
    pub ci_adapter: String,
    pub ci_url: Option<String>,
    pub ci_runner_id: Option<i64>,
    pub tags: Vec<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunnerResponse {
    fn from_row(row: &RunnerRow) -> Self {
        Self {
            runner_id: row.runner_id.clone(),
            backend: row.backend.clone(),
            proxmox_host: row.proxmox_host.clone(),
            proxmox_node: row.proxmox_node.clone(),
            proxmox_vmid: row.proxmox_vmid,
            reset_cmd: row.reset_cmd.clone(),
            cleanup_cmd: row.cleanup_cmd.clone(),
            readiness_cmd: row.readiness_cmd.clone(),
            ci_adapter: row.ci_adapter.clone(),
            ci_url: row.ci_url.clone(),
            ci_runner_id: row.ci_runner_id,
            tags: row
                .tags
                .as_deref()
                .and_then(|raw| serde_json::from_str(raw).ok())
                .unwrap_or_default(),
            is_active: row.is_active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Validate backend-specific required fields.
fn validate_runner_spec(body: &RunnerCreateRequest) -> Result<()> {
    if body.runner_id.is_empty()
        || !body
            .runner_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
    {
        return Err(Error::Validation(
            "runner_id must match [A-Za-z0-9_.-]+".to_string(),
        ));
    }

    match body.backend.as_str() {
        "bare_metal" => {
            if body.reset_cmd.as_deref().unwrap_or("").is_empty() {
                return Err(Error::Validation(
                    "bare_metal backend requires 'reset_cmd'".to_string(),
                ));
            }
        }
        "proxmox" => {
            let missing: Vec<&str> = [
                ("proxmox_host", body.proxmox_host.is_none()),
                ("proxmox_token_name", body.proxmox_token_name.is_none()),
                ("proxmox_token_value", body.proxmox_token_value.is_none()),
                ("proxmox_node", body.proxmox_node.is_none()),
                ("proxmox_vmid", body.proxmox_vmid.is_none()),
            ]
            .iter()
            .filter(|(_, missing)| *missing)
            .map(|(name, _)| *name)
            .collect();
            if !missing.is_empty() {
                return Err(Error::Validation(format!(
                    "proxmox backend is missing required fields: {}",
                    missing.join(", ")
                )));
            }
        }
        other => {
            return Err(Error::Validation(format!(
                "Invalid backend '{other}'. Must be 'proxmox' or 'bare_metal'."
            )));
        }
    }
    Ok(())
}

/// Generate a fresh high-entropy runner token (32 random bytes, hex).
fn generate_token() -> String {
    let bytes: [u8; 32] = rand::random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub async fn admin_create_runner(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RunnerCreateRequest>,
) -> Result<impl IntoResponse> {
    require_admin(&state, &headers)?;
    validate_runner_spec(&body)?;

    let tags = if body.tags.is_empty() {
        None
    } else {
        Some(serde_json::to_string(&body.tags)?)
    };
    let spec = RunnerSpec {
        runner_id: body.runner_id.clone(),
        backend: body.backend.clone(),
        proxmox_host: body.proxmox_host.clone(),
        proxmox_token_name: body.proxmox_token_name.clone(),
        proxmox_token_value: body.proxmox_token_value.clone(),
        proxmox_node: body.proxmox_node.clone(),
        proxmox_vmid: body.proxmox_vmid,
        reset_cmd: body.reset_cmd.clone(),
        cleanup_cmd: body.cleanup_cmd.clone(),
        readiness_cmd: body.readiness_cmd.clone(),
        ci_adapter: body.ci_adapter.clone(),
        ci_url: body.ci_url.clone(),
        ci_token: body.ci_token.clone(),
        ci_runner_id: body.ci_runner_id,
        tags,
    };
    let token = generate_token();

    // Re-registering a soft-deleted runner reactivates it with a fresh
    // token; an active duplicate is a conflict.
    let row = match db::get_runner_any(&state.pool, &spec.runner_id).await? {
        Some(existing) if existing.is_active => {
            return Err(Error::Conflict(format!(
                "Runner '{}' already exists",
                spec.runner_id
            )));
        }
        Some(_) => db::reactivate_runner(&state.pool, &spec, &token).await?,
        None => db::insert_runner(&state.pool, &spec, &token)
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(d) if d.is_unique_violation() => Error::Conflict(format!(
                    "Runner '{}' already exists",
                    spec.runner_id
                )),
                _ => Error::Store(e),
            })?,
    };
    state.registry.invalidate(&row.runner_id).await;

    info!(runner_id = %row.runner_id, backend = %row.backend, "Runner registered");
    Ok((
        StatusCode::CREATED,
        Json(RunnerCreatedResponse {
            runner_id: row.runner_id,
            backend: row.backend,
            token: row.token,
            ci_adapter: row.ci_adapter,
            ci_runner_id: row.ci_runner_id,
            is_active: row.is_active,
            created_at: row.created_at,
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct ListRunnersQuery {
    #[serde(default)]
    pub include_inactive: bool,
}

pub async fn admin_list_runners(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListRunnersQuery>,
) -> Result<impl IntoResponse> {
    require_admin(&state, &headers)?;
    let rows = db::list_runners(&state.pool, query.include_inactive).await?;
    let response: Vec<RunnerResponse> = rows.iter().map(RunnerResponse::from_row).collect();
    Ok(Json(response))
}

pub async fn admin_get_runner(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(runner_id): Path<String>,
) -> Result<impl IntoResponse> {
    require_admin(&state, &headers)?;
    let row = db::get_runner(&state.pool, &runner_id)
        .await?
        .ok_or_else(|| Error::NotFound("Runner not found".to_string()))?;
    Ok(Json(RunnerResponse::from_row(&row)))
}

pub async fn admin_delete_runner(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(runner_id): Path<String>,
) -> Result<impl IntoResponse> {
    require_admin(&state, &headers)?;
    if !db::deactivate_runner(&state.pool, &runner_id).await? {
        return Err(Error::NotFound("Runner not found".to_string()));
    }
    state.registry.invalidate(&runner_id).await;
    info!(runner_id = %runner_id, "Runner deactivated");
    Ok(Json(json!({ "detail": format!("Runner '{runner_id}' deactivated") })))
}

// ============================================================================
// Internal agent dispatch
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ExecRequest {
    pub cmd: String,
    #[serde(default = "default_exec_timeout")]
    pub timeout: u64,
}

fn default_exec_timeout() -> u64 {
    120
}

pub async fn internal_agent_exec(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(runner_id): Path<String>,
    Json(body): Json<ExecRequest>,
) -> Result<impl IntoResponse> {
    require_admin(&state, &headers)?;

    if body.cmd.is_empty() {
        return Err(Error::Validation("cmd is required".to_string()));
    }

    let request = AgentRequest::new(
        RequestKind::Exec,
        json!({ "cmd": body.cmd, "timeout": body.timeout }),
    );
    let response = state
        .manager
        .send_request(
            &runner_id,
            request,
            Duration::from_secs(body.timeout) + Duration::from_secs(5),
        )
        .await
        .map_err(|e| match e {
            WsManagerError::NotConnected(id) | WsManagerError::Disconnected(id) => {
                Error::Backend(BackendError::AgentNotConnected(id))
            }
            WsManagerError::Timeout(id) => Error::Backend(BackendError::AgentTimeout(id)),
        })?;

    let result = interpret_exec_response(response).map_err(Error::Backend)?;
    Ok(Json(result))
}

pub async fn internal_agent_connected(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(runner_id): Path<String>,
) -> Result<impl IntoResponse> {
    require_admin(&state, &headers)?;
    Ok(Json(json!({ "connected": state.manager.is_connected(&runner_id) })))
}
