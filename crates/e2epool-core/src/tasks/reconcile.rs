// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reconciler: re-enqueues checkpoints stuck in `finalize_queued`.
//!
//! Covers the two holes the queue alone cannot: a worker that died
//! between the state change and its task being honored, and wholesale
//! queue loss. Runs once at startup and then periodically; re-enqueues
//! are idempotent because the finalize worker re-validates state under
//! the runner lock.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::db;
use crate::error::Result;
use crate::queue::TaskQueue;

/// Startup + periodic task requeuing stuck finalizes.
pub struct Reconciler {
    pool: PgPool,
    queue: TaskQueue,
    config: Arc<Config>,
    shutdown: Arc<Notify>,
}

impl Reconciler {
    pub fn new(pool: PgPool, queue: TaskQueue, config: Arc<Config>) -> Self {
        Self {
            pool,
            queue,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the startup pass, then the periodic loop.
    pub async fn run(&self) {
        info!(
            interval_secs = self.config.reconcile_interval_seconds,
            "Reconciler started"
        );

        match self.run_once().await {
            Ok(0) => info!("Startup reconcile: no stuck checkpoints found"),
            Ok(n) => info!(count = n, "Startup reconcile: re-enqueued stuck checkpoints"),
            Err(e) => error!(error = %e, "Startup reconcile failed"),
        }

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("Reconciler shutting down");
                    break;
                }
                _ = tokio::time::sleep(Duration::from_secs(self.config.reconcile_interval_seconds)) => {
                    match self.run_once().await {
                        Ok(n) if n > 0 => {
                            info!(count = n, "Periodic reconcile: re-enqueued stuck checkpoints");
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Periodic reconcile failed"),
                    }
                }
            }
        }
    }

    /// One reconcile pass. Returns how many tasks were re-enqueued.
    pub async fn run_once(&self) -> Result<u64> {
        let mut enqueued = 0;
        let mut last_id = 0;

        loop {
            let batch = db::list_finalize_queued_page(
                &self.pool,
                last_id,
                self.config.query_batch_size,
            )
            .await?;
            let Some(last) = batch.last() else { break };
            last_id = last.id;

            for cp in &batch {
                match self.queue.enqueue_if_absent(&cp.name).await {
                    Ok(true) => {
                        info!(
                            checkpoint = %cp.name,
                            runner_id = %cp.runner_id,
                            finalize_status = ?cp.finalize_status,
                            "Reconcile: re-enqueued stuck checkpoint"
                        );
                        enqueued += 1;
                    }
                    Ok(false) => {
                        // A live task already covers it.
                    }
                    Err(e) => {
                        warn!(checkpoint = %cp.name, error = %e, "Reconcile: enqueue failed");
                    }
                }
            }
        }

        Ok(enqueued)
    }
}
