// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Completion poller: the controller-side completion-detection path.
//!
//! Bounds the delay between a CI job reaching a terminal state and its
//! finalize even when the runner crashed and the hook never fired. The
//! min-age filter avoids hammering the CI API for jobs that have barely
//! started; idempotent queue-finalize makes overlap with hooks and
//! webhooks safe.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::ci::CiAdapterFactory;
use crate::config::Config;
use crate::db::{self, FinalizeSource};
use crate::error::Result;
use crate::registry::RunnerRegistry;
use crate::service::{CheckpointService, FinalizeOutcome};

/// Background worker polling CI for terminal job states.
pub struct CompletionPoller {
    pool: PgPool,
    registry: Arc<RunnerRegistry>,
    ci_factory: Arc<CiAdapterFactory>,
    service: Arc<CheckpointService>,
    config: Arc<Config>,
    shutdown: Arc<Notify>,
}

impl CompletionPoller {
    pub fn new(
        pool: PgPool,
        registry: Arc<RunnerRegistry>,
        ci_factory: Arc<CiAdapterFactory>,
        service: Arc<CheckpointService>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            pool,
            registry,
            ci_factory,
            service,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the poller loop.
    pub async fn run(&self) {
        if !self.config.poller_enabled {
            info!("Completion poller disabled by configuration");
            return;
        }

        info!(
            interval_secs = self.config.poller_interval_seconds,
            min_age_secs = self.config.poller_min_age_seconds,
            "Completion poller started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("Completion poller shutting down");
                    break;
                }
                _ = tokio::time::sleep(Duration::from_secs(self.config.poller_interval_seconds)) => {
                    let hard_limit = Duration::from_secs(self.config.poller_hard_time_limit);
                    let soft_limit = Duration::from_secs(self.config.poller_soft_time_limit);
                    let t0 = std::time::Instant::now();
                    match tokio::time::timeout(hard_limit, self.sweep()).await {
                        Ok(Err(e)) => error!(error = %e, "Poller sweep failed"),
                        Err(_) => error!(
                            hard_limit_secs = hard_limit.as_secs(),
                            "Poller sweep exceeded hard time limit"
                        ),
                        Ok(Ok(())) => {}
                    }
                    if t0.elapsed() > soft_limit {
                        warn!(
                            elapsed_secs = t0.elapsed().as_secs(),
                            "Poller sweep exceeded soft time limit"
                        );
                    }
                }
            }
        }
    }

    /// One sweep over all `created` checkpoints.
    pub async fn sweep(&self) -> Result<()> {
        let mut last_id = 0;
        loop {
            let batch =
                db::list_created_page(&self.pool, last_id, self.config.query_batch_size).await?;
            let Some(last) = batch.last() else { break };
            last_id = last.id;

            for cp in &batch {
                self.poll_checkpoint(cp).await;
            }
        }
        Ok(())
    }

    async fn poll_checkpoint(&self, cp: &db::CheckpointRow) {
        let age = (Utc::now() - cp.created_at).num_seconds();
        if age < self.config.poller_min_age_seconds as i64 {
            return;
        }

        let runner = match self.registry.lookup(&cp.runner_id).await {
            Ok(Some(runner)) => runner,
            Ok(None) => return,
            Err(e) => {
                warn!(runner_id = %cp.runner_id, error = %e, "Poller: registry lookup failed");
                return;
            }
        };

        let ci = match self.ci_factory.for_runner(&runner) {
            Ok(ci) => ci,
            Err(e) => {
                warn!(runner_id = %cp.runner_id, error = %e, "Poller: no CI adapter for runner");
                return;
            }
        };

        let status = match ci.get_job_status(&cp.job_id).await {
            Ok(status) => status,
            Err(e) => {
                warn!(job_id = %cp.job_id, error = %e, "Poller: job status lookup failed");
                return;
            }
        };

        let Some(finalize_status) = status.as_finalize_status() else {
            return;
        };

        match self
            .service
            .queue_finalize(&cp.runner_id, &cp.name, finalize_status, FinalizeSource::Poller)
            .await
        {
            Ok(FinalizeOutcome::Queued(_)) => {
                info!(
                    checkpoint = %cp.name,
                    job_id = %cp.job_id,
                    status = %finalize_status,
                    "Poller queued finalize"
                );
            }
            Ok(_) => {
                // Another source landed first.
            }
            Err(e) => {
                warn!(checkpoint = %cp.name, error = %e, "Poller failed to queue finalize");
            }
        }
    }
}
