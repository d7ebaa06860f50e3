// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable finalize task queue backed by the shared store.
//!
//! At-least-once with late ack: a claim takes a lease (sized to the hard
//! task time limit) and only a completed pipeline deletes the row. A
//! worker that dies mid-task leaves the lease to expire, after which the
//! task is claimable again. `enqueue` composes with the caller's
//! transaction so the `finalize_queued` state change and its task commit
//! or roll back together.

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgConnection;

/// A claimed finalize task.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FinalizeTask {
    /// Queue row id, used for ack/nack.
    pub id: i64,
    /// Checkpoint to finalize.
    pub checkpoint_name: String,
    /// Delivery count including this one.
    pub attempts: i32,
}

/// Postgres-backed task queue.
#[derive(Clone)]
pub struct TaskQueue {
    pool: PgPool,
    lease: Duration,
}

impl TaskQueue {
    /// Create a queue whose claims hold a lease of `lease`.
    pub fn new(pool: PgPool, lease: Duration) -> Self {
        Self { pool, lease }
    }

    /// Enqueue a finalize task on the caller's connection/transaction.
    pub async fn enqueue(
        &self,
        conn: &mut PgConnection,
        checkpoint_name: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("INSERT INTO finalize_tasks (checkpoint_name) VALUES ($1)")
            .bind(checkpoint_name)
            .execute(conn)
            .await?;
        Ok(())
    }

    /// Enqueue unless an undelivered task for the checkpoint already
    /// exists. Returns true when a row was inserted. Used by the
    /// reconciler to keep re-enqueues idempotent.
    pub async fn enqueue_if_absent(&self, checkpoint_name: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO finalize_tasks (checkpoint_name)
            SELECT $1
            WHERE NOT EXISTS (
                SELECT 1 FROM finalize_tasks
                WHERE checkpoint_name = $1
                  AND (claimed_by IS NULL OR lease_expires_at >= NOW())
            )
            "#,
        )
        .bind(checkpoint_name)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Claim the next available task for `worker_id`, if any.
    ///
    /// Available means never claimed, released, or holding an expired
    /// lease. `SKIP LOCKED` keeps concurrent workers from serializing on
    /// the head of the queue.
    pub async fn claim(&self, worker_id: &str) -> Result<Option<FinalizeTask>, sqlx::Error> {
        sqlx::query_as::<_, FinalizeTask>(
            r#"
            WITH next AS (
                SELECT id FROM finalize_tasks
                WHERE available_at <= NOW()
                  AND (claimed_by IS NULL OR lease_expires_at < NOW())
                ORDER BY id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE finalize_tasks t
            SET claimed_by = $1,
                lease_expires_at = NOW() + make_interval(secs => $2),
                attempts = t.attempts + 1
            FROM next
            WHERE t.id = next.id
            RETURNING t.id, t.checkpoint_name, t.attempts
            "#,
        )
        .bind(worker_id)
        .bind(self.lease.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
    }

    /// Acknowledge a finished task, deleting it.
    pub async fn ack(&self, task_id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM finalize_tasks WHERE id = $1")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Release a failed task for redelivery after `delay`.
    pub async fn nack(&self, task_id: i64, delay: Duration) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE finalize_tasks
            SET claimed_by = NULL,
                lease_expires_at = NULL,
                available_at = NOW() + make_interval(secs => $2)
            WHERE id = $1
            "#,
        )
        .bind(task_id)
        .bind(delay.as_secs_f64())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
