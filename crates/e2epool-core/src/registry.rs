// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runner registry with a short-TTL cache.
//!
//! Runner rows change rarely (operator actions only), so lookups by id
//! and by token are served from an in-memory cache for up to the TTL.
//! Admin mutations invalidate eagerly; other replicas converge within
//! one TTL.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sqlx::PgPool;
use tokio::sync::RwLock;

use crate::db::{self, RunnerRow};

struct CacheEntry {
    runner: Arc<RunnerRow>,
    fetched_at: Instant,
}

/// Cached, DB-backed lookup of active runners.
pub struct RunnerRegistry {
    pool: PgPool,
    ttl: Duration,
    by_id: RwLock<HashMap<String, CacheEntry>>,
    /// token → runner_id reverse index for bearer auth.
    by_token: RwLock<HashMap<String, String>>,
}

impl RunnerRegistry {
    /// Create a registry with the given cache TTL.
    pub fn new(pool: PgPool, ttl: Duration) -> Self {
        Self {
            pool,
            ttl,
            by_id: RwLock::new(HashMap::new()),
            by_token: RwLock::new(HashMap::new()),
        }
    }

    /// Look up an active runner by id.
    pub async fn lookup(&self, runner_id: &str) -> Result<Option<Arc<RunnerRow>>, sqlx::Error> {
        if let Some(runner) = self.cached(runner_id).await {
            return Ok(Some(runner));
        }

        match db::get_runner(&self.pool, runner_id).await? {
            Some(row) => Ok(Some(self.store(row).await)),
            None => {
                // A stale positive entry for a now-deleted runner would
                // outlive the row; drop whatever is cached.
                self.invalidate(runner_id).await;
                Ok(None)
            }
        }
    }

    /// Look up an active runner by bearer token.
    pub async fn lookup_by_token(&self, token: &str) -> Result<Option<Arc<RunnerRow>>, sqlx::Error> {
        let cached_id = self.by_token.read().await.get(token).cloned();
        if let Some(runner_id) = cached_id {
            if let Some(runner) = self.cached(&runner_id).await {
                // Token rotation leaves the old reverse entry pointing at
                // a runner whose row now carries a different token.
                if runner.token == token {
                    return Ok(Some(runner));
                }
            }
        }

        match db::get_runner_by_token(&self.pool, token).await? {
            Some(row) => Ok(Some(self.store(row).await)),
            None => Ok(None),
        }
    }

    /// Drop a runner from the cache (admin mutations).
    pub async fn invalidate(&self, runner_id: &str) {
        let removed = self.by_id.write().await.remove(runner_id);
        if let Some(entry) = removed {
            self.by_token.write().await.remove(&entry.runner.token);
        }
    }

    async fn cached(&self, runner_id: &str) -> Option<Arc<RunnerRow>> {
        let guard = self.by_id.read().await;
        let entry = guard.get(runner_id)?;
        if entry.fetched_at.elapsed() < self.ttl {
            Some(entry.runner.clone())
        } else {
            None
        }
    }

    async fn store(&self, row: RunnerRow) -> Arc<RunnerRow> {
        let runner = Arc::new(row);
        self.by_token
            .write()
            .await
            .insert(runner.token.clone(), runner.runner_id.clone());
        self.by_id.write().await.insert(
            runner.runner_id.clone(),
            CacheEntry {
                runner: runner.clone(),
                fetched_at: Instant::now(),
            },
        );
        runner
    }
}
