// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Garbage collector for stale checkpoints.
//!
//! An idle dirty runner wastes capacity, so `created` checkpoints older
//! than the TTL are reset through the failure pipeline and written
//! straight to the terminal `gc_reset`. Checkpoints in `finalize_queued`
//! belong to the reconciler and are never touched here.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::backend::BackendSet;
use crate::ci::CiAdapterFactory;
use crate::config::Config;
use crate::db::{self, CheckpointRow, CheckpointState, FinalizeSource, FinalizeStatus};
use crate::error::Result;
use crate::locking::RunnerLock;
use crate::registry::RunnerRegistry;
use crate::tasks::{PipelineRun, log_operation, resolve_pipeline_deps, run_reset_pipeline};

/// Background worker sweeping over-age `created` checkpoints.
pub struct GcWorker {
    pool: PgPool,
    registry: Arc<RunnerRegistry>,
    backends: BackendSet,
    ci_factory: Arc<CiAdapterFactory>,
    config: Arc<Config>,
    shutdown: Arc<Notify>,
}

impl GcWorker {
    pub fn new(
        pool: PgPool,
        registry: Arc<RunnerRegistry>,
        backends: BackendSet,
        ci_factory: Arc<CiAdapterFactory>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            pool,
            registry,
            backends,
            ci_factory,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the GC loop.
    pub async fn run(&self) {
        info!(
            interval_secs = self.config.gc_interval_seconds,
            ttl_secs = self.config.checkpoint_ttl_seconds,
            "Garbage collector started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("Garbage collector shutting down");
                    break;
                }
                _ = tokio::time::sleep(Duration::from_secs(self.config.gc_interval_seconds)) => {
                    let hard_limit = Duration::from_secs(self.config.task_hard_time_limit);
                    match tokio::time::timeout(hard_limit, self.sweep()).await {
                        Ok(Err(e)) => error!(error = %e, "GC sweep failed"),
                        Err(_) => error!(
                            hard_limit_secs = hard_limit.as_secs(),
                            "GC sweep exceeded hard time limit"
                        ),
                        Ok(Ok(())) => {}
                    }
                }
            }
        }
    }

    /// One sweep over all stale `created` checkpoints.
    pub async fn sweep(&self) -> Result<()> {
        let cutoff = Utc::now() - chrono::Duration::seconds(self.config.checkpoint_ttl_seconds as i64);

        let mut last_id = 0;
        loop {
            let batch = db::list_created_older_than_page(
                &self.pool,
                cutoff,
                last_id,
                self.config.query_batch_size,
            )
            .await?;
            let Some(last) = batch.last() else { break };
            last_id = last.id;

            for cp in &batch {
                if let Err(e) = self.collect(cp).await {
                    error!(checkpoint = %cp.name, error = %e, "GC failed for checkpoint");
                }
            }
        }

        Ok(())
    }

    async fn collect(&self, cp: &CheckpointRow) -> Result<()> {
        let Some(runner) = self.registry.lookup(&cp.runner_id).await? else {
            warn!(
                checkpoint = %cp.name,
                runner_id = %cp.runner_id,
                "GC: runner not registered, skipping"
            );
            return Ok(());
        };

        // A finalize may be mid-flight; never wait behind it.
        let Some(lock) = RunnerLock::try_acquire(&self.pool, &cp.runner_id).await? else {
            warn!(
                checkpoint = %cp.name,
                runner_id = %cp.runner_id,
                "GC: runner locked, skipping this cycle"
            );
            return Ok(());
        };

        let result = self.collect_locked(cp, &runner).await;
        if let Err(e) = lock.release().await {
            warn!(runner_id = %cp.runner_id, error = %e, "Failed to release runner lock");
        }
        result
    }

    async fn collect_locked(&self, cp: &CheckpointRow, runner: &crate::db::RunnerRow) -> Result<()> {
        // Re-verify under the lock; a racing queue_finalize wins.
        let Some(current) = db::get_checkpoint_by_name(&self.pool, &cp.name).await? else {
            return Ok(());
        };
        if current.state() != Some(CheckpointState::Created) {
            debug!(
                checkpoint = %cp.name,
                state = %current.state,
                "GC: checkpoint state changed after lock, skipping"
            );
            return Ok(());
        }

        let started = Utc::now();
        let run = match resolve_pipeline_deps(&self.backends, &self.ci_factory, runner) {
            Ok((backend, ci)) => {
                run_reset_pipeline(
                    backend,
                    ci,
                    runner,
                    &cp.name,
                    FinalizeStatus::Failure,
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
                db::mark_terminal(
                    &self.pool,
                    cp.id,
                    CheckpointState::GcReset,
                    Some(FinalizeSource::Gc),
                    Some(FinalizeStatus::Failure),
                )
                .await?;
                log_operation(
                    &self.pool,
                    cp.id,
                    &cp.runner_id,
                    "gc",
                    Some(&runner.backend),
                    "Stale checkpoint reset by GC",
                    "ok",
                    started,
                    finished,
                )
                .await;
                info!(
                    checkpoint = %cp.name,
                    duration_ms = (finished - started).num_milliseconds(),
                    "GC reset checkpoint"
                );
                Ok(())
            }
            Err(e) => {
                // The row stays in `created`; the next cycle retries.
                log_operation(
                    &self.pool,
                    cp.id,
                    &cp.runner_id,
                    "gc",
                    Some(&runner.backend),
                    &format!("GC reset failed: {e}"),
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
