// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Checkpoint service: create, queue-finalize, status.
//!
//! All state mutations run under the runner's advisory lock. The
//! single-active invariant is enforced twice: `SELECT ... FOR UPDATE`
//! under the lock, and the store's partial unique index as the last
//! line against races the lock cannot see (e.g. a replica with a
//! different lock implementation during a rollout).

use std::sync::Arc;

use chrono::Utc;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::backend::BackendSet;
use crate::config::Config;
use crate::db::{
    self, CheckpointRow, CheckpointState, FinalizeSource, FinalizeStatus, OperationLogEntry,
    RunnerRow,
};
use crate::error::{Error, Result};
use crate::locking::RunnerLock;
use crate::queue::TaskQueue;

/// Result of a queue-finalize call.
#[derive(Debug)]
pub enum FinalizeOutcome {
    /// The transition committed and a task was enqueued.
    Queued(CheckpointRow),
    /// Another source already queued the finalize; no-op.
    AlreadyQueued(CheckpointRow),
    /// The checkpoint is terminal; no-op.
    AlreadyFinalized(CheckpointRow),
}

/// Core business logic shared by the HTTP handlers, the agent channel,
/// the webhooks, and the poller.
pub struct CheckpointService {
    pool: PgPool,
    queue: TaskQueue,
    backends: BackendSet,
    config: Arc<Config>,
}

impl CheckpointService {
    pub fn new(pool: PgPool, queue: TaskQueue, backends: BackendSet, config: Arc<Config>) -> Self {
        Self {
            pool,
            queue,
            backends,
            config,
        }
    }

    /// Create a checkpoint for a starting job.
    ///
    /// Token scope (`token.runner_id == runner_id`) is the caller's
    /// responsibility. The lock, the single-active check, the cooldown
    /// check, the backend side effect, and the insert happen here.
    pub async fn create(
        &self,
        runner: &RunnerRow,
        job_id: &str,
        caller: Option<&str>,
    ) -> Result<CheckpointRow> {
        validate_job_id(job_id)?;

        let lock = RunnerLock::acquire(&self.pool, &runner.runner_id).await?;
        let result = self.create_locked(runner, job_id, caller).await;
        if let Err(e) = lock.release().await {
            warn!(runner_id = %runner.runner_id, error = %e, "Failed to release runner lock");
        }
        result
    }

    async fn create_locked(
        &self,
        runner: &RunnerRow,
        job_id: &str,
        caller: Option<&str>,
    ) -> Result<CheckpointRow> {
        let mut tx = self.pool.begin().await?;

        if let Some(active) = db::get_active_checkpoint_for_update(&mut tx, &runner.runner_id).await?
        {
            return Err(Error::Conflict(format!(
                "Active checkpoint '{}' already exists for runner '{}'",
                active.name, runner.runner_id
            )));
        }

        if let Some(finalized_at) = db::latest_finalized_at(&mut tx, &runner.runner_id).await? {
            let elapsed = (Utc::now() - finalized_at).num_seconds();
            if elapsed >= 0 && (elapsed as u64) < self.config.finalize_cooldown_seconds {
                return Err(Error::Cooldown(
                    "Cooldown period active, try again later".to_string(),
                ));
            }
        }

        // Release the row locks before the backend round-trip; the
        // advisory lock stays held and is the critical section.
        tx.commit().await?;

        let name = generate_checkpoint_name(job_id);
        let started = Utc::now();
        let backend = self.backends.for_runner(runner)?;
        backend.create_checkpoint(runner, &name).await?;
        let finished = Utc::now();

        let mut conn = self.pool.acquire().await?;
        let checkpoint = db::insert_checkpoint(&mut conn, &name, &runner.runner_id, job_id)
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(d) if d.is_unique_violation() => Error::Conflict(format!(
                    "Active checkpoint already exists for runner '{}' (concurrent create)",
                    runner.runner_id
                )),
                _ => Error::Store(e),
            })?;

        let mut detail = format!("Checkpoint created for job {job_id}");
        if let Some(caller) = caller {
            detail.push_str(&format!(", caller={caller}"));
        }
        db::insert_operation_log(
            &mut conn,
            &OperationLogEntry {
                checkpoint_id: checkpoint.id,
                runner_id: &runner.runner_id,
                operation: "create",
                backend: Some(&runner.backend),
                detail: &detail,
                result: "ok",
                started_at: started,
                finished_at: finished,
            },
        )
        .await?;

        info!(
            runner_id = %runner.runner_id,
            checkpoint = %checkpoint.name,
            job_id = %job_id,
            "Checkpoint created"
        );
        Ok(checkpoint)
    }

    /// Queue a checkpoint for finalization.
    ///
    /// `runner_id` is the caller's scope: a mismatch with the
    /// checkpoint's runner reports not-found so foreign tokens cannot
    /// probe for names. Idempotent per the landing rule: already-queued
    /// and terminal checkpoints are successful no-ops.
    pub async fn queue_finalize(
        &self,
        runner_id: &str,
        checkpoint_name: &str,
        status: FinalizeStatus,
        source: FinalizeSource,
    ) -> Result<FinalizeOutcome> {
        if source == FinalizeSource::Gc {
            return Err(Error::Validation(
                "source 'gc' is reserved for the garbage collector".to_string(),
            ));
        }

        let lock = RunnerLock::acquire(&self.pool, runner_id).await?;
        let result = self
            .queue_finalize_locked(runner_id, checkpoint_name, status, source)
            .await;
        if let Err(e) = lock.release().await {
            warn!(runner_id = %runner_id, error = %e, "Failed to release runner lock");
        }
        result
    }

    async fn queue_finalize_locked(
        &self,
        runner_id: &str,
        checkpoint_name: &str,
        status: FinalizeStatus,
        source: FinalizeSource,
    ) -> Result<FinalizeOutcome> {
        let mut tx = self.pool.begin().await?;

        let cp = db::get_checkpoint_by_name_for_update(&mut tx, checkpoint_name)
            .await?
            .filter(|cp| cp.runner_id == runner_id)
            .ok_or_else(|| {
                Error::NotFound(format!("Checkpoint '{checkpoint_name}' not found"))
            })?;

        match cp.state() {
            Some(CheckpointState::FinalizeQueued) => {
                return Ok(FinalizeOutcome::AlreadyQueued(cp));
            }
            Some(state) if state.is_terminal() => {
                return Ok(FinalizeOutcome::AlreadyFinalized(cp));
            }
            Some(CheckpointState::Created) => {}
            _ => {
                return Err(Error::Conflict(format!(
                    "Checkpoint '{}' in state '{}', cannot finalize",
                    cp.name, cp.state
                )));
            }
        }

        let now = Utc::now();
        db::mark_finalize_queued(&mut tx, cp.id, status, source).await?;
        db::insert_operation_log(
            &mut tx,
            &OperationLogEntry {
                checkpoint_id: cp.id,
                runner_id: &cp.runner_id,
                operation: "queue_finalize",
                backend: None,
                detail: &format!("Finalize queued: status={status}, source={source}"),
                result: "ok",
                started_at: now,
                finished_at: now,
            },
        )
        .await?;
        self.queue
            .enqueue(&mut tx, &cp.name)
            .await
            .map_err(|e| Error::Broker(e.to_string()))?;

        // An enqueue the broker cannot commit takes the state update
        // down with it.
        tx.commit()
            .await
            .map_err(|e| Error::Broker(e.to_string()))?;

        info!(
            checkpoint = %cp.name,
            runner_id = %cp.runner_id,
            status = %status,
            source = %source,
            "Finalize queued"
        );

        let mut cp = cp;
        cp.state = CheckpointState::FinalizeQueued.as_ref().to_string();
        cp.finalize_status = Some(status.as_ref().to_string());
        cp.finalize_source = Some(source.as_ref().to_string());
        Ok(FinalizeOutcome::Queued(cp))
    }

    /// Fetch a checkpoint record within the caller's token scope.
    pub async fn get_status(&self, runner_id: &str, checkpoint_name: &str) -> Result<CheckpointRow> {
        db::get_checkpoint_by_name(&self.pool, checkpoint_name)
            .await?
            .filter(|cp| cp.runner_id == runner_id)
            .ok_or_else(|| Error::NotFound(format!("Checkpoint '{checkpoint_name}' not found")))
    }
}

/// Characters allowed in job ids and checkpoint name segments.
fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-'
}

/// Validate a CI job id (`[A-Za-z0-9_.\-]+`, at most 255 chars).
pub fn validate_job_id(job_id: &str) -> Result<()> {
    if job_id.is_empty() || job_id.len() > 255 || !job_id.chars().all(is_name_char) {
        return Err(Error::Validation(format!(
            "job_id must match [A-Za-z0-9_.-]+, got '{job_id}'"
        )));
    }
    Ok(())
}

/// Build a checkpoint name: `job-{job_id}-{unix_seconds}-{hex8}`.
///
/// The 4 random bytes foreclose collisions when the same job retries
/// within one second.
pub fn generate_checkpoint_name(job_id: &str) -> String {
    format!(
        "job-{}-{}-{:08x}",
        job_id,
        Utc::now().timestamp(),
        rand::random::<u32>()
    )
}

/// Check a name against `^job-[A-Za-z0-9_.\-]+-[0-9]+-[0-9a-f]{8}$`.
pub fn is_valid_checkpoint_name(name: &str) -> bool {
    let Some(rest) = name.strip_prefix("job-") else {
        return false;
    };
    // job_id may itself contain '-', so parse from the right.
    let mut parts = rest.rsplitn(3, '-');
    let (Some(suffix), Some(timestamp), Some(job_part)) =
        (parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    suffix.len() == 8
        && suffix.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
        && !timestamp.is_empty()
        && timestamp.chars().all(|c| c.is_ascii_digit())
        && !job_part.is_empty()
        && job_part.chars().all(is_name_char)
}
