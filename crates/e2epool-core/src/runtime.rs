// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Controller runtime: wires the store, registry, drivers, server, and
//! background workers together and owns their shutdown.

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::backend::{AgentRpc, BackendError, BackendSet, BareMetalBackend, ProxmoxBackend};
use crate::ci::CiAdapterFactory;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::migrations;
use crate::queue::TaskQueue;
use crate::registry::RunnerRegistry;
use crate::server::{AppState, build_router};
use crate::service::CheckpointService;
use crate::tasks::{CompletionPoller, FinalizeWorker, GcWorker, Reconciler};
use crate::ws_manager::ConnectionManager;

/// Registry cache TTL.
const REGISTRY_TTL: Duration = Duration::from_secs(300);

/// A started controller replica.
pub struct Runtime {
    server: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
    shutdowns: Vec<Arc<Notify>>,
    server_shutdown: Arc<Notify>,
}

impl Runtime {
    /// Connect, apply the schema, and start the server plus all
    /// background workers.
    pub async fn start(config: Config) -> Result<Self> {
        let config = Arc::new(config);

        let pool = PgPoolOptions::new()
            .max_connections(config.db_pool_size + config.db_max_overflow)
            .acquire_timeout(Duration::from_secs(30))
            .max_lifetime(Duration::from_secs(config.db_pool_recycle))
            .connect(&config.database_url)
            .await?;
        info!("Connected to database");

        migrations::run(&pool).await?;
        info!("Database schema verified");

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout))
            .build()
            .map_err(|e| Error::Backend(BackendError::Http(e)))?;

        let registry = Arc::new(RunnerRegistry::new(pool.clone(), REGISTRY_TTL));
        let manager = ConnectionManager::new();
        let agent_rpc = AgentRpc::new(
            manager.clone(),
            http.clone(),
            config.api_base_url.clone(),
            config.admin_token.clone(),
            Duration::from_secs(config.readiness_poll_interval_seconds),
        );

        let proxmox = Arc::new(ProxmoxBackend::new(
            agent_rpc.clone(),
            Duration::from_secs(config.http_timeout),
        )?);
        let bare_metal = Arc::new(BareMetalBackend::new(agent_rpc.clone()));
        let backends = BackendSet::new(proxmox, bare_metal);

        let ci_factory = Arc::new(CiAdapterFactory::new(http, &config));
        let queue = TaskQueue::new(
            pool.clone(),
            Duration::from_secs(config.task_hard_time_limit),
        );
        let service = Arc::new(CheckpointService::new(
            pool.clone(),
            queue.clone(),
            backends.clone(),
            config.clone(),
        ));

        let state = AppState {
            pool: pool.clone(),
            config: config.clone(),
            registry: registry.clone(),
            service: service.clone(),
            manager: manager.clone(),
            agent_rpc,
        };
        let app = build_router(state);
        let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
        info!(addr = %config.bind_addr, "HTTP server listening");

        let server_shutdown = Arc::new(Notify::new());
        let shutdown_signal = server_shutdown.clone();
        let server = tokio::spawn(async move {
            let shutdown = async move { shutdown_signal.notified().await };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!(error = %e, "HTTP server failed");
            }
        });

        let mut workers = Vec::new();
        let mut shutdowns = Vec::new();

        for index in 0..config.worker_concurrency {
            let worker = FinalizeWorker::new(
                pool.clone(),
                queue.clone(),
                registry.clone(),
                backends.clone(),
                ci_factory.clone(),
                config.clone(),
                index,
            );
            shutdowns.push(worker.shutdown_handle());
            workers.push(tokio::spawn(async move { worker.run().await }));
        }

        let poller = CompletionPoller::new(
            pool.clone(),
            registry.clone(),
            ci_factory.clone(),
            service.clone(),
            config.clone(),
        );
        shutdowns.push(poller.shutdown_handle());
        workers.push(tokio::spawn(async move { poller.run().await }));

        let gc = GcWorker::new(
            pool.clone(),
            registry.clone(),
            backends.clone(),
            ci_factory.clone(),
            config.clone(),
        );
        shutdowns.push(gc.shutdown_handle());
        workers.push(tokio::spawn(async move { gc.run().await }));

        let reconciler = Reconciler::new(pool, queue, config.clone());
        shutdowns.push(reconciler.shutdown_handle());
        workers.push(tokio::spawn(async move { reconciler.run().await }));

        info!(
            finalize_workers = config.worker_concurrency,
            "Controller runtime started"
        );

        Ok(Self {
            server,
            workers,
            shutdowns,
            server_shutdown,
        })
    }

    /// Stop the workers, then the server, waiting for both.
    pub async fn shutdown(self) {
        info!("Shutting down controller runtime");
        for shutdown in &self.shutdowns {
            shutdown.notify_one();
        }
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Worker task panicked");
            }
        }
        self.server_shutdown.notify_one();
        if let Err(e) = self.server.await {
            error!(error = %e, "Server task panicked");
        }
        info!("Controller runtime stopped");
    }
}
