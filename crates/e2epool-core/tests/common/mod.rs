// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for e2epool-core integration tests.
//!
//! All tests here need a Postgres database; set
//! `TEST_E2EPOOL_DATABASE_URL` to run them, they skip otherwise.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;

use e2epool_core::backend::{AgentRpc, BackendSet, BareMetalBackend, ProxmoxBackend};
use e2epool_core::config::Config;
use e2epool_core::db::{self, RunnerRow, RunnerSpec};
use e2epool_core::queue::TaskQueue;
use e2epool_core::service::CheckpointService;
use e2epool_core::ws_manager::ConnectionManager;
use e2epool_core::migrations;

/// Connect to the test database and apply the schema. Returns `None`
/// when `TEST_E2EPOOL_DATABASE_URL` is unset or unreachable.
pub async fn test_pool() -> Option<PgPool> {
    let database_url = std::env::var("TEST_E2EPOOL_DATABASE_URL").ok()?;
    let pool = PgPool::connect(&database_url).await.ok()?;
    migrations::run(&pool).await.ok()?;
    Some(pool)
}

/// A controller config pointing at the test database. Tests pass a zero
/// cooldown unless they exercise it.
pub fn test_config(finalize_cooldown_seconds: u64) -> Config {
    let database_url = std::env::var("TEST_E2EPOOL_DATABASE_URL")
        .unwrap_or_else(|_| "postgres://localhost/e2epool_test".to_string());
    Config {
        broker_url: database_url.clone(),
        database_url,
        admin_token: "test-admin-token".to_string(),
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        api_base_url: "http://127.0.0.1:1".to_string(),
        checkpoint_ttl_seconds: 1800,
        gc_interval_seconds: 60,
        reconcile_interval_seconds: 120,
        poller_interval_seconds: 20,
        poller_min_age_seconds: 120,
        poller_enabled: true,
        finalize_cooldown_seconds,
        readiness_timeout_seconds: 1,
        readiness_poll_interval_seconds: 1,
        task_soft_time_limit: 300,
        task_hard_time_limit: 330,
        poller_soft_time_limit: 120,
        poller_hard_time_limit: 150,
        ws_heartbeat_interval: 30,
        ws_heartbeat_timeout: 90,
        http_timeout: 5,
        query_batch_size: 200,
        db_pool_size: 5,
        db_max_overflow: 0,
        db_pool_recycle: 1800,
        worker_concurrency: 1,
        ci_provider: "gitlab".to_string(),
        ci_url: None,
        ci_token: None,
        gitlab_webhook_secret: None,
        github_webhook_secret: None,
    }
}

/// Drivers wired to a disconnected agent channel. Bare-metal create is a
/// no-op, so service-level tests run without any host side effects.
pub fn test_backends(config: &Config) -> BackendSet {
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(1))
        .build()
        .unwrap();
    let agent_rpc = AgentRpc::new(
        ConnectionManager::new(),
        http,
        config.api_base_url.clone(),
        config.admin_token.clone(),
        Duration::from_millis(100),
    );
    BackendSet::new(
        Arc::new(ProxmoxBackend::new(agent_rpc.clone(), Duration::from_secs(1)).unwrap()),
        Arc::new(BareMetalBackend::new(agent_rpc)),
    )
}

/// Service + queue pair over the test database.
pub fn build_service(pool: &PgPool, config: Config) -> (Arc<CheckpointService>, TaskQueue) {
    let config = Arc::new(config);
    let queue = TaskQueue::new(
        pool.clone(),
        Duration::from_secs(config.task_hard_time_limit),
    );
    let service = Arc::new(CheckpointService::new(
        pool.clone(),
        queue.clone(),
        test_backends(&config),
        config,
    ));
    (service, queue)
}

/// Random id so tests sharing one database cannot collide.
pub fn unique_id(prefix: &str) -> String {
    format!("{prefix}-{:08x}", rand::random::<u32>())
}

/// Register a bare-metal runner row for tests.
pub async fn insert_bare_metal_runner(pool: &PgPool, runner_id: &str) -> RunnerRow {
    let spec = RunnerSpec {
        runner_id: runner_id.to_string(),
        backend: "bare_metal".to_string(),
        reset_cmd: Some("echo reset".to_string()),
        ci_adapter: "gitlab".to_string(),
        ..RunnerSpec::default()
    };
    let token = unique_id("token");
    db::insert_runner(pool, &spec, &token).await.unwrap()
}

/// Remove everything a test created for a runner.
pub async fn cleanup_runner(pool: &PgPool, runner_id: &str) {
    let _ = sqlx::query(
        "DELETE FROM finalize_tasks WHERE checkpoint_name IN \
         (SELECT name FROM checkpoints WHERE runner_id = $1)",
    )
    .bind(runner_id)
    .execute(pool)
    .await;
    let _ = sqlx::query(
        "DELETE FROM operation_logs WHERE checkpoint_id IN \
         (SELECT id FROM checkpoints WHERE runner_id = $1)",
    )
    .bind(runner_id)
    .execute(pool)
    .await;
    let _ = sqlx::query("DELETE FROM checkpoints WHERE runner_id = $1")
        .bind(runner_id)
        .execute(pool)
        .await;
    let _ = sqlx::query("DELETE FROM runners WHERE runner_id = $1")
        .bind(runner_id)
        .execute(pool)
        .await;
}
