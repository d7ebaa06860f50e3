// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! CI system adapters: job-status lookup and runner pause/unpause.
//!
//! The finalize pipeline and the completion poller only see this trait;
//! GitLab is the reference adapter. Transport failures on status lookup
//! surface as [`JobStatus::Unknown`] so pollers treat them as retryable.

mod gitlab;

pub use gitlab::GitLabAdapter;

use std::sync::Arc;

use async_trait::async_trait;
use strum::{AsRefStr, Display, EnumString};
use thiserror::Error;

use crate::config::Config;
use crate::db::{FinalizeStatus, RunnerRow};

/// Errors from CI adapter calls.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CiError {
    /// The CI API rejected or could not serve the call.
    #[error("CI API error: {0}")]
    Api(String),

    /// The job or runner does not exist on the CI side.
    #[error("{0}")]
    NotFound(String),

    /// HTTP transport failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The runner names an adapter this deployment does not provide.
    #[error("Unknown CI adapter: {0}")]
    UnknownAdapter(String),

    /// The adapter is missing its base URL or token.
    #[error("CI adapter not configured: {0}")]
    NotConfigured(String),
}

/// Canonical job status, normalized across CI systems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Running,
    Success,
    Failed,
    Canceled,
    Unknown,
}

impl JobStatus {
    /// The finalize status this job outcome maps to; `None` while the
    /// job is non-terminal.
    pub fn as_finalize_status(self) -> Option<FinalizeStatus> {
        match self {
            JobStatus::Success => Some(FinalizeStatus::Success),
            JobStatus::Failed => Some(FinalizeStatus::Failure),
            JobStatus::Canceled => Some(FinalizeStatus::Canceled),
            JobStatus::Running | JobStatus::Unknown => None,
        }
    }
}

/// Capability set every CI adapter implements.
#[async_trait]
pub trait CiAdapter: Send + Sync {
    /// Normalized status of a CI job.
    async fn get_job_status(&self, job_id: &str) -> Result<JobStatus, CiError>;

    /// Stop the CI system from dispatching new jobs to the runner.
    async fn pause_runner(&self, ci_runner_id: i64) -> Result<(), CiError>;

    /// Allow job dispatch to the runner again. Idempotent against the CI
    /// API: unpausing an unpaused runner is accepted.
    async fn unpause_runner(&self, ci_runner_id: i64) -> Result<(), CiError>;
}

/// Builds the adapter for a runner row.
///
/// Deployment-global CI credentials take priority; per-runner fields are
/// the fallback for mixed fleets.
pub struct CiAdapterFactory {
    http: reqwest::Client,
    provider: String,
    global_url: Option<String>,
    global_token: Option<String>,
}

impl CiAdapterFactory {
    pub fn new(http: reqwest::Client, config: &Config) -> Self {
        Self {
            http,
            provider: config.ci_provider.clone(),
            global_url: config.ci_url.clone(),
            global_token: config.ci_token.clone(),
        }
    }

    /// Adapter for the given runner.
    pub fn for_runner(&self, runner: &RunnerRow) -> Result<Arc<dyn CiAdapter>, CiError> {
        let (url, token) = match (&self.global_url, &self.global_token) {
            (Some(url), Some(token)) => (url.clone(), token.clone()),
            _ => {
                let url = runner.ci_url.clone().ok_or_else(|| {
                    CiError::NotConfigured(format!("runner '{}' has no ci_url", runner.runner_id))
                })?;
                let token = runner.ci_token.clone().ok_or_else(|| {
                    CiError::NotConfigured(format!("runner '{}' has no ci_token", runner.runner_id))
                })?;
                (url, token)
            }
        };

        let adapter = if runner.ci_adapter.is_empty() {
            self.provider.as_str()
        } else {
            runner.ci_adapter.as_str()
        };

        match adapter {
            "gitlab" => Ok(Arc::new(GitLabAdapter::new(self.http.clone(), url, token))),
            other => Err(CiError::UnknownAdapter(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_to_finalize_status() {
        assert_eq!(
            JobStatus::Success.as_finalize_status(),
            Some(FinalizeStatus::Success)
        );
        assert_eq!(
            JobStatus::Failed.as_finalize_status(),
            Some(FinalizeStatus::Failure)
        );
        assert_eq!(
            JobStatus::Canceled.as_finalize_status(),
            Some(FinalizeStatus::Canceled)
        );
        assert_eq!(JobStatus::Running.as_finalize_status(), None);
        assert_eq!(JobStatus::Unknown.as_finalize_status(), None);
    }
}
