// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database rows and queries for the e2epool controller.
//!
//! States and statuses are stored as text; CHECK constraints in the
//! schema keep the column values inside the enums below.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnection;
use sqlx::PgPool;
use strum::{AsRefStr, Display, EnumString};

/// Checkpoint lifecycle states.
///
/// Permitted edges: `created → finalize_queued`, `created → gc_reset`,
/// `finalize_queued → reset`, `finalize_queued → deleted`. The last
/// three are terminal.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CheckpointState {
    Created,
    FinalizeQueued,
    Reset,
    Deleted,
    GcReset,
}

impl CheckpointState {
    /// True for `reset`, `deleted`, and `gc_reset`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CheckpointState::Reset | CheckpointState::Deleted | CheckpointState::GcReset
        )
    }
}

/// Job outcome attached when a finalize is queued.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FinalizeStatus {
    Success,
    Failure,
    Canceled,
}

/// Which completion-detection path landed the finalize.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FinalizeSource {
    Hook,
    Poller,
    Webhook,
    Agent,
    Gc,
}

/// Checkpoint record from the database.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CheckpointRow {
    /// Surrogate key.
    pub id: i64,
    /// Unique name: `job-{job_id}-{unix_ts}-{hex8}`.
    pub name: String,
    /// Runner the checkpoint belongs to.
    pub runner_id: String,
    /// Opaque CI job identifier.
    pub job_id: String,
    /// Lifecycle state (see [`CheckpointState`]).
    pub state: String,
    /// Outcome recorded when the finalize was queued.
    pub finalize_status: Option<String>,
    /// Completion source that queued the finalize.
    pub finalize_source: Option<String>,
    /// Insertion time.
    pub created_at: DateTime<Utc>,
    /// Set on the terminal transition.
    pub finalized_at: Option<DateTime<Utc>>,
}

impl CheckpointRow {
    /// Parsed state; the CHECK constraint makes failure unreachable.
    pub fn state(&self) -> Option<CheckpointState> {
        self.state.parse().ok()
    }

    /// Parsed finalize status, if one was recorded.
    pub fn finalize_status(&self) -> Option<FinalizeStatus> {
        self.finalize_status.as_deref().and_then(|s| s.parse().ok())
    }

    /// True when the row is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.state().map(CheckpointState::is_terminal).unwrap_or(false)
    }

    /// API representation of this row.
    pub fn to_view(&self) -> CheckpointView {
        CheckpointView {
            name: self.name.clone(),
            runner_id: self.runner_id.clone(),
            job_id: self.job_id.clone(),
            state: self.state.clone(),
            finalize_status: self.finalize_status.clone(),
            finalize_source: self.finalize_source.clone(),
            created_at: self.created_at,
            finalized_at: self.finalized_at,
        }
    }
}

/// Checkpoint record as exposed over HTTP and the agent channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointView {
    pub name: String,
    pub runner_id: String,
    pub job_id: String,
    pub state: String,
    pub finalize_status: Option<String>,
    pub finalize_source: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
}

/// Runner record from the database.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RunnerRow {
    /// Surrogate key.
    pub id: i64,
    /// Operator-chosen unique identifier.
    pub runner_id: String,
    /// Backend kind: `proxmox` or `bare_metal`.
    pub backend: String,
    /// Bearer token scoped to this runner.
    pub token: String,
    /// Hypervisor API host (host[:port]).
    pub proxmox_host: Option<String>,
    /// API token name, `user@realm!name`.
    pub proxmox_token_name: Option<String>,
    /// API token secret.
    pub proxmox_token_value: Option<String>,
    /// Cluster node carrying the VM.
    pub proxmox_node: Option<String>,
    /// VM identifier.
    pub proxmox_vmid: Option<i64>,
    /// Reset command; mandatory for bare-metal runners.
    pub reset_cmd: Option<String>,
    /// Optional success-path cleanup command.
    pub cleanup_cmd: Option<String>,
    /// Optional readiness probe command (exit 0 = ready).
    pub readiness_cmd: Option<String>,
    /// CI adapter key (`gitlab`).
    pub ci_adapter: String,
    /// Per-runner CI base URL; global config wins when set.
    pub ci_url: Option<String>,
    /// Per-runner CI management token.
    pub ci_token: Option<String>,
    /// CI-side runner id; enables pause/unpause when present.
    pub ci_runner_id: Option<i64>,
    /// JSON-encoded tag list.
    pub tags: Option<String>,
    /// Soft-delete flag.
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields of a runner row settable through the admin API.
#[derive(Debug, Clone, Default)]
pub struct RunnerSpec {
    pub runner_id: String,
    pub backend: String,
    pub proxmox_host: Option<String>,
    pub proxmox_token_name: Option<String>,
    pub proxmox_token_value: Option<String>,
    pub proxmox_node: Option<String>,
    pub proxmox_vmid: Option<i64>,
    pub reset_cmd: Option<String>,
    pub cleanup_cmd: Option<String>,
    pub readiness_cmd: Option<String>,
    pub ci_adapter: String,
    pub ci_url: Option<String>,
    pub ci_token: Option<String>,
    pub ci_runner_id: Option<i64>,
    pub tags: Option<String>,
}

const CHECKPOINT_COLUMNS: &str = "id, name, runner_id, job_id, state, finalize_status, \
     finalize_source, created_at, finalized_at";

const RUNNER_COLUMNS: &str = "id, runner_id, backend, token, proxmox_host, proxmox_token_name, \
     proxmox_token_value, proxmox_node, proxmox_vmid, reset_cmd, cleanup_cmd, readiness_cmd, \
     ci_adapter, ci_url, ci_token, ci_runner_id, tags, is_active, created_at, updated_at";

// ============================================================================
// Checkpoints
// ============================================================================

/// Insert a new checkpoint in state `created`.
///
/// The partial unique index rejects a second active row per runner with a
/// unique violation; callers map that to a conflict.
pub async fn insert_checkpoint(
    conn: &mut PgConnection,
    name: &str,
    runner_id: &str,
    job_id: &str,
) -> Result<CheckpointRow, sqlx::Error> {
    sqlx::query_as::<_, CheckpointRow>(&format!(
        r#"
        INSERT INTO checkpoints (name, runner_id, job_id, state, created_at)
        VALUES ($1, $2, $3, 'created', NOW())
        RETURNING {CHECKPOINT_COLUMNS}
        "#,
    ))
    .bind(name)
    .bind(runner_id)
    .bind(job_id)
    .fetch_one(conn)
    .await
}

/// Get a checkpoint by name.
pub async fn get_checkpoint_by_name(
    pool: &PgPool,
    name: &str,
) -> Result<Option<CheckpointRow>, sqlx::Error> {
    sqlx::query_as::<_, CheckpointRow>(&format!(
        "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE name = $1",
    ))
    .bind(name)
    .fetch_optional(pool)
    .await
}

/// Get a checkpoint by name with a row lock.
pub async fn get_checkpoint_by_name_for_update(
    conn: &mut PgConnection,
    name: &str,
) -> Result<Option<CheckpointRow>, sqlx::Error> {
    sqlx::query_as::<_, CheckpointRow>(&format!(
        "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE name = $1 FOR UPDATE",
    ))
    .bind(name)
    .fetch_optional(conn)
    .await
}

/// Get the runner's active (`created` or `finalize_queued`) checkpoint with
/// a row lock, serializing concurrent creates.
pub async fn get_active_checkpoint_for_update(
    conn: &mut PgConnection,
    runner_id: &str,
) -> Result<Option<CheckpointRow>, sqlx::Error> {
    sqlx::query_as::<_, CheckpointRow>(&format!(
        r#"
        SELECT {CHECKPOINT_COLUMNS} FROM checkpoints
        WHERE runner_id = $1 AND state IN ('created', 'finalize_queued')
        FOR UPDATE
        "#,
    ))
    .bind(runner_id)
    .fetch_optional(conn)
    .await
}

/// Most recent terminal transition time for a runner, for the create
/// cooldown check.
pub async fn latest_finalized_at(
    conn: &mut PgConnection,
    runner_id: &str,
) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
    sqlx::query_scalar::<_, DateTime<Utc>>(
        r#"
        SELECT finalized_at FROM checkpoints
        WHERE runner_id = $1 AND finalized_at IS NOT NULL
        ORDER BY finalized_at DESC
        LIMIT 1
        "#,
    )
    .bind(runner_id)
    .fetch_optional(conn)
    .await
}

/// Transition `created → finalize_queued`, recording outcome and source.
pub async fn mark_finalize_queued(
    conn: &mut PgConnection,
    id: i64,
    status: FinalizeStatus,
    source: FinalizeSource,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE checkpoints
        SET state = 'finalize_queued', finalize_status = $2, finalize_source = $3
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(status.as_ref())
    .bind(source.as_ref())
    .execute(conn)
    .await?;
    Ok(())
}

/// Write a terminal state and stamp `finalized_at`.
pub async fn mark_terminal(
    pool: &PgPool,
    id: i64,
    state: CheckpointState,
    source: Option<FinalizeSource>,
    status: Option<FinalizeStatus>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE checkpoints
        SET state = $2,
            finalize_source = COALESCE($3, finalize_source),
            finalize_status = COALESCE($4, finalize_status),
            finalized_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(state.as_ref())
    .bind(source.map(|s| s.as_ref().to_string()))
    .bind(status.map(|s| s.as_ref().to_string()))
    .execute(pool)
    .await?;
    Ok(())
}

/// Page of `created` checkpoints ordered by id, for the poller.
pub async fn list_created_page(
    pool: &PgPool,
    after_id: i64,
    limit: i64,
) -> Result<Vec<CheckpointRow>, sqlx::Error> {
    sqlx::query_as::<_, CheckpointRow>(&format!(
        r#"
        SELECT {CHECKPOINT_COLUMNS} FROM checkpoints
        WHERE state = 'created' AND id > $1
        ORDER BY id
        LIMIT $2
        "#,
    ))
    .bind(after_id)
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// Page of `created` checkpoints older than `cutoff`, for the GC.
pub async fn list_created_older_than_page(
    pool: &PgPool,
    cutoff: DateTime<Utc>,
    after_id: i64,
    limit: i64,
) -> Result<Vec<CheckpointRow>, sqlx::Error> {
    sqlx::query_as::<_, CheckpointRow>(&format!(
        r#"
        SELECT {CHECKPOINT_COLUMNS} FROM checkpoints
        WHERE state = 'created' AND created_at < $1 AND id > $2
        ORDER BY id
        LIMIT $3
        "#,
    ))
    .bind(cutoff)
    .bind(after_id)
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// Page of `finalize_queued` checkpoints, for the reconciler.
pub async fn list_finalize_queued_page(
    pool: &PgPool,
    after_id: i64,
    limit: i64,
) -> Result<Vec<CheckpointRow>, sqlx::Error> {
    sqlx::query_as::<_, CheckpointRow>(&format!(
        r#"
        SELECT {CHECKPOINT_COLUMNS} FROM checkpoints
        WHERE state = 'finalize_queued' AND id > $1
        ORDER BY id
        LIMIT $2
        "#,
    ))
    .bind(after_id)
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// Find the checkpoint for a CI job id, newest first (webhook path).
pub async fn get_checkpoint_by_job_id(
    pool: &PgPool,
    job_id: &str,
) -> Result<Option<CheckpointRow>, sqlx::Error> {
    sqlx::query_as::<_, CheckpointRow>(&format!(
        r#"
        SELECT {CHECKPOINT_COLUMNS} FROM checkpoints
        WHERE job_id = $1
        ORDER BY id DESC
        LIMIT 1
        "#,
    ))
    .bind(job_id)
    .fetch_optional(pool)
    .await
}

// ============================================================================
// Operation log
// ============================================================================

/// One append-only audit entry. Never updated after insert.
#[derive(Debug, Clone)]
pub struct OperationLogEntry<'a> {
    pub checkpoint_id: i64,
    pub runner_id: &'a str,
    pub operation: &'a str,
    pub backend: Option<&'a str>,
    pub detail: &'a str,
    pub result: &'a str,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Append an operation log entry.
pub async fn insert_operation_log(
    conn: &mut PgConnection,
    entry: &OperationLogEntry<'_>,
) -> Result<(), sqlx::Error> {
    let duration_ms = (entry.finished_at - entry.started_at).num_milliseconds();
    sqlx::query(
        r#"
        INSERT INTO operation_logs
            (checkpoint_id, runner_id, operation, backend, detail, result,
             started_at, finished_at, duration_ms)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(entry.checkpoint_id)
    .bind(entry.runner_id)
    .bind(entry.operation)
    .bind(entry.backend)
    .bind(entry.detail)
    .bind(entry.result)
    .bind(entry.started_at)
    .bind(entry.finished_at)
    .bind(duration_ms)
    .execute(conn)
    .await?;
    Ok(())
}

// ============================================================================
// Runners
// ============================================================================

/// Get an active runner by its id.
pub async fn get_runner(pool: &PgPool, runner_id: &str) -> Result<Option<RunnerRow>, sqlx::Error> {
    sqlx::query_as::<_, RunnerRow>(&format!(
        "SELECT {RUNNER_COLUMNS} FROM runners WHERE runner_id = $1 AND is_active",
    ))
    .bind(runner_id)
    .fetch_optional(pool)
    .await
}

/// Get an active runner by its token.
pub async fn get_runner_by_token(
    pool: &PgPool,
    token: &str,
) -> Result<Option<RunnerRow>, sqlx::Error> {
    sqlx::query_as::<_, RunnerRow>(&format!(
        "SELECT {RUNNER_COLUMNS} FROM runners WHERE token = $1 AND is_active",
    ))
    .bind(token)
    .fetch_optional(pool)
    .await
}

/// Get a runner row regardless of active flag.
pub async fn get_runner_any(
    pool: &PgPool,
    runner_id: &str,
) -> Result<Option<RunnerRow>, sqlx::Error> {
    sqlx::query_as::<_, RunnerRow>(&format!(
        "SELECT {RUNNER_COLUMNS} FROM runners WHERE runner_id = $1",
    ))
    .bind(runner_id)
    .fetch_optional(pool)
    .await
}

/// List runners ordered by id.
pub async fn list_runners(
    pool: &PgPool,
    include_inactive: bool,
) -> Result<Vec<RunnerRow>, sqlx::Error> {
    sqlx::query_as::<_, RunnerRow>(&format!(
        r#"
        SELECT {RUNNER_COLUMNS} FROM runners
        WHERE ($1 OR is_active)
        ORDER BY runner_id
        "#,
    ))
    .bind(include_inactive)
    .fetch_all(pool)
    .await
}

/// Insert a new runner row with a freshly generated token.
pub async fn insert_runner(
    pool: &PgPool,
    spec: &RunnerSpec,
    token: &str,
) -> Result<RunnerRow, sqlx::Error> {
    sqlx::query_as::<_, RunnerRow>(&format!(
        r#"
        INSERT INTO runners
            (runner_id, backend, token, proxmox_host, proxmox_token_name,
             proxmox_token_value, proxmox_node, proxmox_vmid, reset_cmd,
             cleanup_cmd, readiness_cmd, ci_adapter, ci_url, ci_token,
             ci_runner_id, tags, is_active, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                $15, $16, TRUE, NOW(), NOW())
        RETURNING {RUNNER_COLUMNS}
        "#,
    ))
    .bind(&spec.runner_id)
    .bind(&spec.backend)
    .bind(token)
    .bind(&spec.proxmox_host)
    .bind(&spec.proxmox_token_name)
    .bind(&spec.proxmox_token_value)
    .bind(&spec.proxmox_node)
    .bind(spec.proxmox_vmid)
    .bind(&spec.reset_cmd)
    .bind(&spec.cleanup_cmd)
    .bind(&spec.readiness_cmd)
    .bind(&spec.ci_adapter)
    .bind(&spec.ci_url)
    .bind(&spec.ci_token)
    .bind(spec.ci_runner_id)
    .bind(&spec.tags)
    .fetch_one(pool)
    .await
}

/// Reactivate a soft-deleted runner, replacing its fields and rotating
/// the token.
pub async fn reactivate_runner(
    pool: &PgPool,
    spec: &RunnerSpec,
    token: &str,
) -> Result<RunnerRow, sqlx::Error> {
    sqlx::query_as::<_, RunnerRow>(&format!(
        r#"
        UPDATE runners
        SET backend = $2, token = $3, proxmox_host = $4, proxmox_token_name = $5,
            proxmox_token_value = $6, proxmox_node = $7, proxmox_vmid = $8,
            reset_cmd = $9, cleanup_cmd = $10, readiness_cmd = $11,
            ci_adapter = $12, ci_url = $13, ci_token = $14, ci_runner_id = $15,
            tags = $16, is_active = TRUE, updated_at = NOW()
        WHERE runner_id = $1 AND NOT is_active
        RETURNING {RUNNER_COLUMNS}
        "#,
    ))
    .bind(&spec.runner_id)
    .bind(&spec.backend)
    .bind(token)
    .bind(&spec.proxmox_host)
    .bind(&spec.proxmox_token_name)
    .bind(&spec.proxmox_token_value)
    .bind(&spec.proxmox_node)
    .bind(spec.proxmox_vmid)
    .bind(&spec.reset_cmd)
    .bind(&spec.cleanup_cmd)
    .bind(&spec.readiness_cmd)
    .bind(&spec.ci_adapter)
    .bind(&spec.ci_url)
    .bind(&spec.ci_token)
    .bind(spec.ci_runner_id)
    .bind(&spec.tags)
    .fetch_one(pool)
    .await
}

/// Soft-delete a runner. Returns false when no active row matched.
pub async fn deactivate_runner(pool: &PgPool, runner_id: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE runners SET is_active = FALSE, updated_at = NOW() WHERE runner_id = $1 AND is_active",
    )
    .bind(runner_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Health check for database connectivity.
pub async fn health_check(pool: &PgPool) -> Result<bool, sqlx::Error> {
    sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(pool)
        .await
        .map(|_| true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trip() {
        for (state, name) in [
            (CheckpointState::Created, "created"),
            (CheckpointState::FinalizeQueued, "finalize_queued"),
            (CheckpointState::Reset, "reset"),
            (CheckpointState::Deleted, "deleted"),
            (CheckpointState::GcReset, "gc_reset"),
        ] {
            assert_eq!(state.as_ref(), name);
            assert_eq!(name.parse::<CheckpointState>().unwrap(), state);
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(!CheckpointState::Created.is_terminal());
        assert!(!CheckpointState::FinalizeQueued.is_terminal());
        assert!(CheckpointState::Reset.is_terminal());
        assert!(CheckpointState::Deleted.is_terminal());
        assert!(CheckpointState::GcReset.is_terminal());
    }

    #[test]
    fn test_finalize_enums_round_trip() {
        for (status, name) in [
            (FinalizeStatus::Success, "success"),
            (FinalizeStatus::Failure, "failure"),
            (FinalizeStatus::Canceled, "canceled"),
        ] {
            assert_eq!(status.as_ref(), name);
            assert_eq!(name.parse::<FinalizeStatus>().unwrap(), status);
        }
        for (source, name) in [
            (FinalizeSource::Hook, "hook"),
            (FinalizeSource::Poller, "poller"),
            (FinalizeSource::Webhook, "webhook"),
            (FinalizeSource::Agent, "agent"),
            (FinalizeSource::Gc, "gc"),
        ] {
            assert_eq!(source.as_ref(), name);
            assert_eq!(name.parse::<FinalizeSource>().unwrap(), source);
        }
    }

    #[test]
    fn test_unknown_state_rejected() {
        assert!("destroyed".parse::<CheckpointState>().is_err());
        assert!("ok".parse::<FinalizeStatus>().is_err());
    }
}
