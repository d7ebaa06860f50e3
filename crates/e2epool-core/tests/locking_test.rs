// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Advisory lock tests against a real Postgres store.

mod common;

use std::time::Duration;

use e2epool_core::locking::RunnerLock;

/// Skip test if database URL is not set
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_E2EPOOL_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_E2EPOOL_DATABASE_URL not set");
            return;
        }
    };
}

#[tokio::test]
async fn test_lock_excludes_second_holder() {
    skip_if_no_db!();
    let pool = common::test_pool().await.expect("Failed to connect to database");
    let runner_id = common::unique_id("lock");

    let lock = RunnerLock::acquire(&pool, &runner_id).await.unwrap();
    assert!(RunnerLock::try_acquire(&pool, &runner_id).await.unwrap().is_none());

    lock.release().await.unwrap();
    let relock = RunnerLock::try_acquire(&pool, &runner_id).await.unwrap();
    assert!(relock.is_some());
    relock.unwrap().release().await.unwrap();
}

#[tokio::test]
async fn test_distinct_runners_do_not_contend() {
    skip_if_no_db!();
    let pool = common::test_pool().await.expect("Failed to connect to database");
    let runner_a = common::unique_id("lock");
    let runner_b = common::unique_id("lock");

    let lock_a = RunnerLock::acquire(&pool, &runner_a).await.unwrap();
    let lock_b = RunnerLock::try_acquire(&pool, &runner_b).await.unwrap();
    assert!(lock_b.is_some());

    lock_a.release().await.unwrap();
    lock_b.unwrap().release().await.unwrap();
}

#[tokio::test]
async fn test_dropped_guard_frees_lock() {
    skip_if_no_db!();
    let pool = common::test_pool().await.expect("Failed to connect to database");
    let runner_id = common::unique_id("lock");

    {
        let _lock = RunnerLock::acquire(&pool, &runner_id).await.unwrap();
        // Dropped without release: the guard closes its connection and
        // the server frees the lock with the dying session.
    }

    // Connection teardown is asynchronous; poll briefly.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(lock) = RunnerLock::try_acquire(&pool, &runner_id).await.unwrap() {
            lock.release().await.unwrap();
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "lock was never freed after guard drop"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
