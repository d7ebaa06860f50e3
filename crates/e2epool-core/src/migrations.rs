// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database schema bootstrap.
//!
//! The schema is a single idempotent SQL file applied on startup; every
//! replica can run it concurrently. Rollout of incompatible changes is
//! handled operationally (spec keeps migration tooling out of scope).

use sqlx::PgPool;

/// Apply the controller schema.
///
/// Safe to call multiple times; every statement is `IF NOT EXISTS`.
pub async fn run(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(include_str!("../migrations/schema.sql"))
        .execute(pool)
        .await?;
    Ok(())
}
