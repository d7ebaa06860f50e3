// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task queue tests: claims, leases, redelivery, and reconciliation.

mod common;

use std::time::Duration;

use e2epool_core::db::{self, FinalizeSource, FinalizeStatus};
use e2epool_core::queue::TaskQueue;
use e2epool_core::tasks::Reconciler;

/// Skip test if database URL is not set
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_E2EPOOL_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_E2EPOOL_DATABASE_URL not set");
            return;
        }
    };
}

// These tests claim from the shared finalize_tasks table; running them
// concurrently would lease each other's rows away mid-assertion.
static QUEUE_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

fn unique_name() -> String {
    format!("job-queue-{}-{:08x}", chrono::Utc::now().timestamp(), rand::random::<u32>())
}

async fn count_tasks(pool: &sqlx::PgPool, name: &str) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM finalize_tasks WHERE checkpoint_name = $1")
        .bind(name)
        .fetch_one(pool)
        .await
        .unwrap()
}

async fn delete_tasks(pool: &sqlx::PgPool, name: &str) {
    let _ = sqlx::query("DELETE FROM finalize_tasks WHERE checkpoint_name = $1")
        .bind(name)
        .execute(pool)
        .await;
}

#[tokio::test]
async fn test_claim_ack_cycle() {
    skip_if_no_db!();
    let _guard = QUEUE_LOCK.lock().await;
    let pool = common::test_pool().await.expect("Failed to connect to database");
    let queue = TaskQueue::new(pool.clone(), Duration::from_secs(300));
    let name = unique_name();

    assert!(queue.enqueue_if_absent(&name).await.unwrap());

    // Claim until our task comes up; other tests may share the queue.
    let task = loop {
        match queue.claim("test-worker").await.unwrap() {
            Some(task) if task.checkpoint_name == name => break task,
            Some(_) => continue,
            None => panic!("enqueued task never became claimable"),
        }
    };
    assert_eq!(task.attempts, 1);

    // Leased: no second delivery.
    assert_eq!(count_tasks(&pool, &name).await, 1);
    loop {
        match queue.claim("second-worker").await.unwrap() {
            Some(other) => assert_ne!(other.checkpoint_name, name),
            None => break,
        }
    }

    queue.ack(task.id).await.unwrap();
    assert_eq!(count_tasks(&pool, &name).await, 0);
}

#[tokio::test]
async fn test_enqueue_if_absent_suppresses_duplicates() {
    skip_if_no_db!();
    let _guard = QUEUE_LOCK.lock().await;
    let pool = common::test_pool().await.expect("Failed to connect to database");
    let queue = TaskQueue::new(pool.clone(), Duration::from_secs(300));
    let name = unique_name();

    assert!(queue.enqueue_if_absent(&name).await.unwrap());
    assert!(!queue.enqueue_if_absent(&name).await.unwrap());
    assert_eq!(count_tasks(&pool, &name).await, 1);

    delete_tasks(&pool, &name).await;
}

#[tokio::test]
async fn test_nack_redelivers() {
    skip_if_no_db!();
    let _guard = QUEUE_LOCK.lock().await;
    let pool = common::test_pool().await.expect("Failed to connect to database");
    let queue = TaskQueue::new(pool.clone(), Duration::from_secs(300));
    let name = unique_name();

    queue.enqueue_if_absent(&name).await.unwrap();
    let task = loop {
        match queue.claim("worker-a").await.unwrap() {
            Some(task) if task.checkpoint_name == name => break task,
            Some(_) => continue,
            None => panic!("task never claimable"),
        }
    };

    queue.nack(task.id, Duration::from_secs(0)).await.unwrap();

    let redelivered = loop {
        match queue.claim("worker-b").await.unwrap() {
            Some(task) if task.checkpoint_name == name => break task,
            Some(_) => continue,
            None => panic!("nacked task never redelivered"),
        }
    };
    assert_eq!(redelivered.id, task.id);
    assert_eq!(redelivered.attempts, 2);

    queue.ack(redelivered.id).await.unwrap();
}

#[tokio::test]
async fn test_lease_expiry_redelivers() {
    skip_if_no_db!();
    let _guard = QUEUE_LOCK.lock().await;
    let pool = common::test_pool().await.expect("Failed to connect to database");
    // A dead worker's lease runs out almost immediately.
    let queue = TaskQueue::new(pool.clone(), Duration::from_millis(50));
    let name = unique_name();

    queue.enqueue_if_absent(&name).await.unwrap();
    let task = loop {
        match queue.claim("dying-worker").await.unwrap() {
            Some(task) if task.checkpoint_name == name => break task,
            Some(_) => continue,
            None => panic!("task never claimable"),
        }
    };

    tokio::time::sleep(Duration::from_millis(200)).await;

    let redelivered = loop {
        match queue.claim("surviving-worker").await.unwrap() {
            Some(task) if task.checkpoint_name == name => break task,
            Some(_) => continue,
            None => panic!("expired lease never redelivered"),
        }
    };
    assert_eq!(redelivered.id, task.id);
    assert_eq!(redelivered.attempts, 2);

    queue.ack(redelivered.id).await.unwrap();
}

#[tokio::test]
async fn test_reconciler_requeues_stuck_finalize() {
    skip_if_no_db!();
    let _guard = QUEUE_LOCK.lock().await;
    let pool = common::test_pool().await.expect("Failed to connect to database");
    let runner_id = common::unique_id("runner");
    let runner = common::insert_bare_metal_runner(&pool, &runner_id).await;
    let config = std::sync::Arc::new(common::test_config(0));
    let (service, queue) = common::build_service(&pool, common::test_config(0));

    // A checkpoint whose finalize task was lost: queue it, then delete
    // the task row out from under the queue.
    let checkpoint = service.create(&runner, "800", None).await.unwrap();
    service
        .queue_finalize(&runner_id, &checkpoint.name, FinalizeStatus::Failure, FinalizeSource::Hook)
        .await
        .unwrap();
    delete_tasks(&pool, &checkpoint.name).await;
    assert_eq!(count_tasks(&pool, &checkpoint.name).await, 0);

    let reconciler = Reconciler::new(pool.clone(), queue.clone(), config);
    let requeued = reconciler.run_once().await.unwrap();
    assert!(requeued >= 1);
    assert_eq!(count_tasks(&pool, &checkpoint.name).await, 1);

    // A live task suppresses further re-enqueues for this checkpoint.
    reconciler.run_once().await.unwrap();
    assert_eq!(count_tasks(&pool, &checkpoint.name).await, 1);

    // Terminal checkpoints are out of the reconciler's domain.
    let row = db::get_checkpoint_by_name(&pool, &checkpoint.name)
        .await
        .unwrap()
        .unwrap();
    db::mark_terminal(&pool, row.id, e2epool_core::db::CheckpointState::Reset, None, None)
        .await
        .unwrap();
    delete_tasks(&pool, &checkpoint.name).await;
    reconciler.run_once().await.unwrap();
    assert_eq!(count_tasks(&pool, &checkpoint.name).await, 0);

    common::cleanup_runner(&pool, &runner_id).await;
}
