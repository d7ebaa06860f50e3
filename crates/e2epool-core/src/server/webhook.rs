// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Inbound CI webhooks: the real-time completion-detection path.
//!
//! Both endpoints are deliberately quiet: events for unknown jobs,
//! non-terminal states, or already-handled checkpoints return 200 so
//! the CI system does not retry. Only bad signatures are rejected.

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use serde_json::{Value, json};
use sha2::Sha256;
use tracing::{debug, info, warn};

use super::{AppState, constant_time_eq};
use crate::db::{self, CheckpointState, FinalizeSource, FinalizeStatus};
use crate::error::{Error, Result};
use crate::service::FinalizeOutcome;

type HmacSha256 = Hmac<Sha256>;

/// Map a GitLab build status to a finalize status; non-terminal states
/// map to `None`.
fn map_gitlab_status(status: &str) -> Option<FinalizeStatus> {
    match status {
        "success" => Some(FinalizeStatus::Success),
        "failed" => Some(FinalizeStatus::Failure),
        "canceled" => Some(FinalizeStatus::Canceled),
        _ => None,
    }
}

/// Map a GitHub workflow_job conclusion to a finalize status.
fn map_github_conclusion(conclusion: &str) -> Option<FinalizeStatus> {
    match conclusion {
        "success" => Some(FinalizeStatus::Success),
        "failure" => Some(FinalizeStatus::Failure),
        "cancelled" => Some(FinalizeStatus::Canceled),
        "timed_out" => Some(FinalizeStatus::Failure),
        _ => None,
    }
}

/// Verify the GitLab shared-secret header.
fn verify_gitlab_token(state: &AppState, headers: &HeaderMap) -> Result<()> {
    let secret = state
        .config
        .gitlab_webhook_secret
        .as_deref()
        .ok_or_else(|| Error::Forbidden("GitLab webhook secret not configured".to_string()))?;
    let token = headers
        .get("X-Gitlab-Token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if constant_time_eq(token.as_bytes(), secret.as_bytes()) {
        Ok(())
    } else {
        Err(Error::Forbidden("Invalid webhook token".to_string()))
    }
}

/// Verify a GitHub `X-Hub-Signature-256` HMAC-SHA256 signature.
fn verify_github_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    let Some(hex_sig) = signature.strip_prefix("sha256=") else {
        return false;
    };
    let Some(sig_bytes) = decode_hex(hex_sig) else {
        return false;
    };
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    mac.verify_slice(&sig_bytes).is_ok()
}

fn decode_hex(raw: &str) -> Option<Vec<u8>> {
    if raw.len() % 2 != 0 {
        return None;
    }
    (0..raw.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&raw[i..i + 2], 16).ok())
        .collect()
}

/// Land a terminal webhook event as a queue-finalize.
async fn land_event(state: &AppState, provider: &str, job_id: &str, status: FinalizeStatus) {
    let checkpoint = match db::get_checkpoint_by_job_id(&state.pool, job_id).await {
        Ok(Some(cp)) => cp,
        Ok(None) => {
            debug!(provider, job_id = %job_id, "Webhook: no checkpoint for job");
            return;
        }
        Err(e) => {
            warn!(provider, job_id = %job_id, error = %e, "Webhook: checkpoint lookup failed");
            return;
        }
    };

    if checkpoint.state() != Some(CheckpointState::Created) {
        debug!(
            provider,
            checkpoint = %checkpoint.name,
            state = %checkpoint.state,
            "Webhook: checkpoint not in created state"
        );
        return;
    }

    match state
        .service
        .queue_finalize(
            &checkpoint.runner_id,
            &checkpoint.name,
            status,
            FinalizeSource::Webhook,
        )
        .await
    {
        Ok(FinalizeOutcome::Queued(_)) => {
            info!(
                provider,
                checkpoint = %checkpoint.name,
                status = %status,
                "Webhook queued finalize"
            );
        }
        Ok(_) => {}
        Err(e) => {
            warn!(
                provider,
                checkpoint = %checkpoint.name,
                error = %e,
                "Webhook failed to queue finalize"
            );
        }
    }
}

/// GitLab build events (`object_kind: build`).
pub async fn gitlab_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<Value>> {
    verify_gitlab_token(&state, &headers)?;

    if body.get("object_kind").and_then(Value::as_str) != Some("build") {
        return Ok(Json(json!({ "ok": true })));
    }

    let build_id = body.get("build_id").and_then(|v| {
        v.as_i64()
            .map(|n| n.to_string())
            .or_else(|| v.as_str().map(str::to_string))
    });
    let build_status = body.get("build_status").and_then(Value::as_str);

    if let (Some(job_id), Some(status)) = (build_id, build_status.and_then(map_gitlab_status)) {
        land_event(&state, "gitlab", &job_id, status).await;
    }
    Ok(Json(json!({ "ok": true })))
}

/// GitHub `workflow_job` events.
pub async fn github_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>> {
    let secret = state
        .config
        .github_webhook_secret
        .as_deref()
        .ok_or_else(|| Error::Forbidden("GitHub webhook secret not configured".to_string()))?;
    let signature = headers
        .get("X-Hub-Signature-256")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !verify_github_signature(secret, &body, signature) {
        return Err(Error::Forbidden("Invalid webhook signature".to_string()));
    }

    if headers
        .get("X-GitHub-Event")
        .and_then(|v| v.to_str().ok())
        != Some("workflow_job")
    {
        return Ok(Json(json!({ "ok": true })));
    }

    let payload: Value = serde_json::from_slice(&body)?;
    if payload.get("action").and_then(Value::as_str) != Some("completed") {
        return Ok(Json(json!({ "ok": true })));
    }

    let workflow_job = payload.get("workflow_job").cloned().unwrap_or(Value::Null);
    let job_id = workflow_job.get("id").and_then(Value::as_i64);
    let conclusion = workflow_job
        .get("conclusion")
        .and_then(Value::as_str)
        .and_then(map_github_conclusion);

    if let (Some(job_id), Some(status)) = (job_id, conclusion) {
        land_event(&state, "github", &job_id.to_string(), status).await;
    }
    Ok(Json(json!({ "ok": true })))
}
