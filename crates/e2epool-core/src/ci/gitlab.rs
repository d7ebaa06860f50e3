// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! GitLab CI adapter.
//!
//! Job status via `GET /api/v4/jobs/{id}` (scope: read-api); pause and
//! unpause via `PUT /api/v4/runners/{id}` with `paused` (scope:
//! manage-runner or admin).

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::{CiAdapter, CiError, JobStatus};

/// Map a GitLab job status string to the canonical set. Anything not in
/// the table counts as still running (manual, pending, created, ...).
fn map_status(gitlab_status: &str) -> JobStatus {
    match gitlab_status {
        "success" => JobStatus::Success,
        "failed" => JobStatus::Failed,
        "canceled" => JobStatus::Canceled,
        _ => JobStatus::Running,
    }
}

#[derive(Debug, Deserialize)]
struct JobResponse {
    status: String,
}

/// Reference CI adapter.
pub struct GitLabAdapter {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl GitLabAdapter {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, token: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }
}

#[async_trait]
impl CiAdapter for GitLabAdapter {
    async fn get_job_status(&self, job_id: &str) -> Result<JobStatus, CiError> {
        let url = format!("{}/api/v4/jobs/{}", self.base_url, job_id);
        let response = match self
            .http
            .get(&url)
            .header("PRIVATE-TOKEN", &self.token)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                // Transport failures are retryable and non-terminal.
                warn!(job_id = %job_id, error = %e, "GitLab job lookup failed");
                return Ok(JobStatus::Unknown);
            }
        };

        if response.status().as_u16() == 404 {
            return Err(CiError::NotFound(format!("Job {job_id} not found")));
        }
        if !response.status().is_success() {
            return Err(CiError::Api(format!(
                "GET jobs/{job_id} returned {}",
                response.status()
            )));
        }

        let job: JobResponse = response.json().await?;
        let status = map_status(&job.status);
        debug!(job_id = %job_id, gitlab = %job.status, normalized = %status, "Job status");
        Ok(status)
    }

    async fn pause_runner(&self, ci_runner_id: i64) -> Result<(), CiError> {
        let url = format!("{}/api/v4/runners/{}", self.base_url, ci_runner_id);
        let response = self
            .http
            .put(&url)
            .header("PRIVATE-TOKEN", &self.token)
            .json(&json!({ "paused": true }))
            .send()
            .await?;

        if response.status().as_u16() == 404 {
            return Err(CiError::NotFound(format!("Runner {ci_runner_id} not found")));
        }
        if !response.status().is_success() {
            return Err(CiError::Api(format!(
                "pause runner {ci_runner_id} returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn unpause_runner(&self, ci_runner_id: i64) -> Result<(), CiError> {
        let url = format!("{}/api/v4/runners/{}", self.base_url, ci_runner_id);
        let response = self
            .http
            .put(&url)
            .header("PRIVATE-TOKEN", &self.token)
            .json(&json!({ "paused": false }))
            .send()
            .await?;

        // 400 means the runner is already unpaused.
        if response.status().as_u16() == 400 {
            debug!(ci_runner_id, "Unpause returned 400 (already unpaused)");
            return Ok(());
        }
        if response.status().as_u16() == 404 {
            return Err(CiError::NotFound(format!("Runner {ci_runner_id} not found")));
        }
        if !response.status().is_success() {
            return Err(CiError::Api(format!(
                "unpause runner {ci_runner_id} returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}
