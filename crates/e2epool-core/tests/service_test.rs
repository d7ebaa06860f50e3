// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Checkpoint service tests: lifecycle, idempotency, and the
//! single-active invariant against a real Postgres store.

mod common;

use e2epool_core::db::{self, CheckpointState, FinalizeSource, FinalizeStatus};
use e2epool_core::error::Error;
use e2epool_core::service::{FinalizeOutcome, is_valid_checkpoint_name};

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
async fn test_create_and_status() {
    skip_if_no_db!();
    let pool = common::test_pool().await.expect("Failed to connect to database");
    let runner_id = common::unique_id("runner");
    let runner = common::insert_bare_metal_runner(&pool, &runner_id).await;
    let (service, _queue) = common::build_service(&pool, common::test_config(0));

    let checkpoint = service.create(&runner, "100", Some("ci")).await.unwrap();
    assert!(is_valid_checkpoint_name(&checkpoint.name));
    assert_eq!(checkpoint.state().unwrap(), CheckpointState::Created);
    assert_eq!(checkpoint.runner_id, runner_id);
    assert_eq!(checkpoint.job_id, "100");
    assert!(checkpoint.finalized_at.is_none());

    let fetched = service.get_status(&runner_id, &checkpoint.name).await.unwrap();
    assert_eq!(fetched.id, checkpoint.id);

    // A foreign token scope sees not-found, not forbidden.
    let err = service.get_status("other-runner", &checkpoint.name).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    common::cleanup_runner(&pool, &runner_id).await;
}

#[tokio::test]
async fn test_create_rejects_bad_job_id() {
    skip_if_no_db!();
    let pool = common::test_pool().await.expect("Failed to connect to database");
    let runner_id = common::unique_id("runner");
    let runner = common::insert_bare_metal_runner(&pool, &runner_id).await;
    let (service, _queue) = common::build_service(&pool, common::test_config(0));

    let err = service.create(&runner, "job 100", None).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    common::cleanup_runner(&pool, &runner_id).await;
}

#[tokio::test]
async fn test_second_create_conflicts_with_active() {
    skip_if_no_db!();
    let pool = common::test_pool().await.expect("Failed to connect to database");
    let runner_id = common::unique_id("runner");
    let runner = common::insert_bare_metal_runner(&pool, &runner_id).await;
    let (service, _queue) = common::build_service(&pool, common::test_config(0));

    let first = service.create(&runner, "200", None).await.unwrap();
    let err = service.create(&runner, "201", None).await.unwrap_err();
    match err {
        Error::Conflict(detail) => assert!(detail.contains(&first.name)),
        other => panic!("expected conflict, got {other}"),
    }

    common::cleanup_runner(&pool, &runner_id).await;
}

#[tokio::test]
async fn test_partial_index_enforces_single_active() {
    skip_if_no_db!();
    let pool = common::test_pool().await.expect("Failed to connect to database");
    let runner_id = common::unique_id("runner");
    common::insert_bare_metal_runner(&pool, &runner_id).await;

    let mut conn = pool.acquire().await.unwrap();
    db::insert_checkpoint(&mut conn, &format!("job-1-1000-{:08x}", rand::random::<u32>()), &runner_id, "1")
        .await
        .unwrap();
    let err = db::insert_checkpoint(
        &mut conn,
        &format!("job-2-1000-{:08x}", rand::random::<u32>()),
        &runner_id,
        "2",
    )
    .await
    .unwrap_err();
    match err {
        sqlx::Error::Database(db_err) => assert!(db_err.is_unique_violation()),
        other => panic!("expected unique violation, got {other}"),
    }

    common::cleanup_runner(&pool, &runner_id).await;
}

#[tokio::test]
async fn test_queue_finalize_is_idempotent() {
    skip_if_no_db!();
    let pool = common::test_pool().await.expect("Failed to connect to database");
    let runner_id = common::unique_id("runner");
    let runner = common::insert_bare_metal_runner(&pool, &runner_id).await;
    let (service, _queue) = common::build_service(&pool, common::test_config(0));

    let checkpoint = service.create(&runner, "300", None).await.unwrap();

    let outcome = service
        .queue_finalize(&runner_id, &checkpoint.name, FinalizeStatus::Failure, FinalizeSource::Hook)
        .await
        .unwrap();
    let queued = match outcome {
        FinalizeOutcome::Queued(cp) => cp,
        other => panic!("expected Queued, got {other:?}"),
    };
    assert_eq!(queued.state().unwrap(), CheckpointState::FinalizeQueued);

    // Second source lands as a no-op.
    let outcome = service
        .queue_finalize(&runner_id, &checkpoint.name, FinalizeStatus::Failure, FinalizeSource::Poller)
        .await
        .unwrap();
    assert!(matches!(outcome, FinalizeOutcome::AlreadyQueued(_)));

    // Exactly one task row for the checkpoint.
    let tasks: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM finalize_tasks WHERE checkpoint_name = $1")
            .bind(&checkpoint.name)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(tasks, 1);

    // Terminal checkpoints answer Already finalized.
    db::mark_terminal(&pool, checkpoint.id, CheckpointState::Reset, None, None)
        .await
        .unwrap();
    let outcome = service
        .queue_finalize(&runner_id, &checkpoint.name, FinalizeStatus::Failure, FinalizeSource::Webhook)
        .await
        .unwrap();
    assert!(matches!(outcome, FinalizeOutcome::AlreadyFinalized(_)));

    common::cleanup_runner(&pool, &runner_id).await;
}

#[tokio::test]
async fn test_queue_finalize_unknown_checkpoint() {
    skip_if_no_db!();
    let pool = common::test_pool().await.expect("Failed to connect to database");
    let runner_id = common::unique_id("runner");
    common::insert_bare_metal_runner(&pool, &runner_id).await;
    let (service, _queue) = common::build_service(&pool, common::test_config(0));

    let err = service
        .queue_finalize(
            &runner_id,
            "job-999-1000-deadbeef",
            FinalizeStatus::Success,
            FinalizeSource::Hook,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    common::cleanup_runner(&pool, &runner_id).await;
}

#[tokio::test]
async fn test_queue_finalize_hides_foreign_checkpoints() {
    skip_if_no_db!();
    let pool = common::test_pool().await.expect("Failed to connect to database");
    let runner_id = common::unique_id("runner");
    let other_id = common::unique_id("runner");
    let runner = common::insert_bare_metal_runner(&pool, &runner_id).await;
    common::insert_bare_metal_runner(&pool, &other_id).await;
    let (service, _queue) = common::build_service(&pool, common::test_config(0));

    let checkpoint = service.create(&runner, "400", None).await.unwrap();
    let err = service
        .queue_finalize(&other_id, &checkpoint.name, FinalizeStatus::Success, FinalizeSource::Hook)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    common::cleanup_runner(&pool, &runner_id).await;
    common::cleanup_runner(&pool, &other_id).await;
}

#[tokio::test]
async fn test_create_within_cooldown_rejected() {
    skip_if_no_db!();
    let pool = common::test_pool().await.expect("Failed to connect to database");
    let runner_id = common::unique_id("runner");
    let runner = common::insert_bare_metal_runner(&pool, &runner_id).await;
    let (service, _queue) = common::build_service(&pool, common::test_config(30));

    let checkpoint = service.create(&runner, "500", None).await.unwrap();
    service
        .queue_finalize(&runner_id, &checkpoint.name, FinalizeStatus::Success, FinalizeSource::Hook)
        .await
        .unwrap();
    db::mark_terminal(&pool, checkpoint.id, CheckpointState::Deleted, None, None)
        .await
        .unwrap();

    let err = service.create(&runner, "501", None).await.unwrap_err();
    assert!(matches!(err, Error::Cooldown(_)));

    common::cleanup_runner(&pool, &runner_id).await;
}

#[tokio::test]
async fn test_terminal_transition_sets_finalized_at() {
    skip_if_no_db!();
    let pool = common::test_pool().await.expect("Failed to connect to database");
    let runner_id = common::unique_id("runner");
    let runner = common::insert_bare_metal_runner(&pool, &runner_id).await;
    let (service, _queue) = common::build_service(&pool, common::test_config(0));

    let checkpoint = service.create(&runner, "600", None).await.unwrap();
    db::mark_terminal(
        &pool,
        checkpoint.id,
        CheckpointState::GcReset,
        Some(FinalizeSource::Gc),
        Some(FinalizeStatus::Failure),
    )
    .await
    .unwrap();

    let row = db::get_checkpoint_by_name(&pool, &checkpoint.name)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.state().unwrap(), CheckpointState::GcReset);
    assert!(row.finalized_at.is_some());
    assert_eq!(row.finalize_source.as_deref(), Some("gc"));

    common::cleanup_runner(&pool, &runner_id).await;
}

#[tokio::test]
async fn test_gc_scan_selects_only_stale_created() {
    skip_if_no_db!();
    let pool = common::test_pool().await.expect("Failed to connect to database");
    let runner_id = common::unique_id("runner");
    let fresh_runner_id = common::unique_id("runner");
    let runner = common::insert_bare_metal_runner(&pool, &runner_id).await;
    let fresh_runner = common::insert_bare_metal_runner(&pool, &fresh_runner_id).await;
    let (service, _queue) = common::build_service(&pool, common::test_config(0));

    let stale = service.create(&runner, "700", None).await.unwrap();
    let fresh = service.create(&fresh_runner, "701", None).await.unwrap();

    // Age the first checkpoint past the TTL.
    sqlx::query("UPDATE checkpoints SET created_at = NOW() - INTERVAL '1 hour' WHERE id = $1")
        .bind(stale.id)
        .execute(&pool)
        .await
        .unwrap();

    let cutoff = chrono::Utc::now() - chrono::Duration::seconds(1800);
    let mut found_stale = false;
    let mut found_fresh = false;
    let mut last_id = 0;
    loop {
        let batch = db::list_created_older_than_page(&pool, cutoff, last_id, 200)
            .await
            .unwrap();
        let Some(last) = batch.last() else { break };
        last_id = last.id;
        for cp in &batch {
            found_stale |= cp.id == stale.id;
            found_fresh |= cp.id == fresh.id;
        }
    }
    assert!(found_stale);
    assert!(!found_fresh);

    common::cleanup_runner(&pool, &runner_id).await;
    common::cleanup_runner(&pool, &fresh_runner_id).await;
}
