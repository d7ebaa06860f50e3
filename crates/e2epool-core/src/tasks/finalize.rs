// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Finalize worker: drains the task queue and resolves checkpoints.
//!
//! One task handles one checkpoint end to end. The worker re-validates
//! state under the runner's advisory lock before acting, so redeliveries
//! and duplicate enqueues are harmless: whatever it finds already
//! terminal it simply acks. A task that fails is nacked and redelivered;
//! the checkpoint stays in `finalize_queued` and the reconciler is the
//! secondary net.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::backend::BackendSet;
use crate::ci::CiAdapterFactory;
use crate::config::Config;
use crate::db::{self, CheckpointRow, CheckpointState, FinalizeStatus};
use crate::error::Result;
use crate::locking::RunnerLock;
use crate::queue::{FinalizeTask, TaskQueue};
use crate::registry::RunnerRegistry;
use crate::tasks::{PipelineRun, log_operation, resolve_pipeline_deps, run_reset_pipeline};

/// Delay while the queue is empty.
const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Redelivery delay for a failed task.
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Background worker consuming finalize tasks.
pub struct FinalizeWorker {
    pool: PgPool,
    queue: TaskQueue,
    registry: Arc<RunnerRegistry>,
    backends: BackendSet,
    ci_factory: Arc<CiAdapterFactory>,
    config: Arc<Config>,
    worker_id: String,
    shutdown: Arc<Notify>,
}

impl FinalizeWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: PgPool,
        queue: TaskQueue,
        registry: Arc<RunnerRegistry>,
        backends: BackendSet,
        ci_factory: Arc<CiAdapterFactory>,
        config: Arc<Config>,
        index: usize,
    ) -> Self {
        Self {
            pool,
            queue,
            registry,
            backends,
            ci_factory,
            config,
            worker_id: format!("finalize-{index}"),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the worker loop.
    pub async fn run(&self) {
        info!(worker = %self.worker_id, "Finalize worker started");

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!(worker = %self.worker_id, "Finalize worker shutting down");
                    break;
                }
                _ = self.step() => {}
            }
        }
    }

    async fn step(&self) {
        match self.queue.claim(&self.worker_id).await {
            Ok(Some(task)) => self.handle_task(task).await,
            Ok(None) => tokio::time::sleep(IDLE_POLL_INTERVAL).await,
            Err(e) => {
                error!(worker = %self.worker_id, error = %e, "Failed to claim task");
                tokio::time::sleep(IDLE_POLL_INTERVAL).await;
            }
        }
    }

    async fn handle_task(&self, task: FinalizeTask) {
        let hard_limit = Duration::from_secs(self.config.task_hard_time_limit);
        let soft_limit = Duration::from_secs(self.config.task_soft_time_limit);
        let t0 = std::time::Instant::now();

        let outcome = tokio::time::timeout(hard_limit, self.process(&task)).await;

        if t0.elapsed() > soft_limit {
            warn!(
                checkpoint = %task.checkpoint_name,
                elapsed_secs = t0.elapsed().as_secs(),
                soft_limit_secs = soft_limit.as_secs(),
                "Finalize task exceeded soft time limit"
            );
        }

        match outcome {
            Ok(Ok(())) => {
                if let Err(e) = self.queue.ack(task.id).await {
                    error!(task_id = task.id, error = %e, "Failed to ack finalize task");
                }
            }
            Ok(Err(e)) => {
                error!(
                    checkpoint = %task.checkpoint_name,
                    attempt = task.attempts,
                    error = %e,
                    "Finalize task failed; releasing for redelivery"
                );
                if let Err(e) = self.queue.nack(task.id, RETRY_DELAY).await {
                    error!(task_id = task.id, error = %e, "Failed to nack finalize task");
                }
            }
            Err(_) => {
                error!(
                    checkpoint = %task.checkpoint_name,
                    hard_limit_secs = hard_limit.as_secs(),
                    "Finalize task exceeded hard time limit; releasing for redelivery"
                );
                if let Err(e) = self.queue.nack(task.id, RETRY_DELAY).await {
                    error!(task_id = task.id, error = %e, "Failed to nack finalize task");
                }
            }
        }
    }

    async fn process(&self, task: &FinalizeTask) -> Result<()> {
        let Some(cp) = db::get_checkpoint_by_name(&self.pool, &task.checkpoint_name).await? else {
            warn!(checkpoint = %task.checkpoint_name, "Checkpoint not found, dropping task");
            return Ok(());
        };

        let lock = RunnerLock::acquire(&self.pool, &cp.runner_id).await?;
        let result = self.process_locked(&cp.name).await;
        if let Err(e) = lock.release().await {
            warn!(runner_id = %cp.runner_id, error = %e, "Failed to release runner lock");
        }
        result
    }

    async fn process_locked(&self, checkpoint_name: &str) -> Result<()> {
        // Re-read under the lock; another worker may have processed a
        // duplicate delivery already.
        let Some(cp) = db::get_checkpoint_by_name(&self.pool, checkpoint_name).await? else {
            return Ok(());
        };

        match cp.state() {
            Some(state) if state.is_terminal() => {
                info!(checkpoint = %cp.name, state = %cp.state, "Checkpoint already finalized");
                return Ok(());
            }
            Some(CheckpointState::Created) => {
                // Task visible before the queue_finalize transaction
                // committed; the redelivery or reconciler will get it.
                warn!(checkpoint = %cp.name, "Checkpoint not yet finalize_queued, dropping task");
                return Ok(());
            }
            Some(CheckpointState::FinalizeQueued) => {}
            _ => {
                warn!(checkpoint = %cp.name, state = %cp.state, "Unexpected checkpoint state");
                return Ok(());
            }
        }

        let Some(runner) = self.registry.lookup(&cp.runner_id).await? else {
            error!(
                checkpoint = %cp.name,
                runner_id = %cp.runner_id,
                "Runner not registered; cannot finalize"
            );
            let now = Utc::now();
            log_operation(
                &self.pool,
                cp.id,
                &cp.runner_id,
                "finalize",
                None,
                "Runner not registered",
                "error",
                now,
                now,
            )
            .await;
            return Ok(());
        };

        let status = cp.finalize_status().unwrap_or(FinalizeStatus::Failure);
        self.finalize_checkpoint(&cp, &runner, status).await
    }

    async fn finalize_checkpoint(
        &self,
        cp: &CheckpointRow,
        runner: &crate::db::RunnerRow,
        status: FinalizeStatus,
    ) -> Result<()> {
        let started = Utc::now();
        let run = match resolve_pipeline_deps(&self.backends, &self.ci_factory, runner) {
            Ok((backend, ci)) => {
                run_reset_pipeline(
                    backend,
                    ci,
                    runner,
                    &cp.name,
                    status,
                    Duration::from_secs(self.config.readiness_timeout_seconds),
                )
                .await
            }
            Err(e) => PipelineRun {
                result: Err(e),
                readiness_timed_out: false,
            },
        };
        let finished = Utc::now();

        match run.result {
            Ok(()) => {
                let terminal = if status == FinalizeStatus::Success {
                    CheckpointState::Deleted
                } else {
                    CheckpointState::Reset
                };
                db::mark_terminal(&self.pool, cp.id, terminal, None, None).await?;
                log_operation(
                    &self.pool,
                    cp.id,
                    &cp.runner_id,
                    "finalize",
                    Some(&runner.backend),
                    &format!("Finalized: status={status}, new_state={terminal}"),
                    "ok",
                    started,
                    finished,
                )
                .await;
                info!(
                    checkpoint = %cp.name,
                    state = %terminal,
                    readiness_timed_out = run.readiness_timed_out,
                    duration_ms = (finished - started).num_milliseconds(),
                    "Finalize complete"
                );
                Ok(())
            }
            Err(e) => {
                log_operation(
                    &self.pool,
                    cp.id,
                    &cp.runner_id,
                    "finalize",
                    Some(&runner.backend),
                    &format!("Finalize failed: {e}"),
                    "error",
                    started,
                    finished,
                )
                .await;
                Err(e)
            }
        }
    }
}
