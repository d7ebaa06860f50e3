// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background workers: finalize, garbage collection, completion polling,
//! reconciliation.
//!
//! The reset pipeline (pause → reset → readiness → unpause) is shared
//! between the finalize worker and the GC; only the terminal state they
//! write differs.

pub mod finalize;
pub mod gc;
pub mod poller;
pub mod reconcile;

pub use finalize::FinalizeWorker;
pub use gc::GcWorker;
pub use poller::CompletionPoller;
pub use reconcile::Reconciler;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{error, warn};

use crate::backend::{Backend, BackendError, BackendSet};
use crate::ci::{CiAdapter, CiAdapterFactory};
use crate::db::{self, FinalizeStatus, OperationLogEntry, RunnerRow};
use crate::error::Error;

/// Resolve the driver and (when pause/unpause applies) the CI adapter
/// for a runner, so configuration problems surface before side effects.
pub(crate) fn resolve_pipeline_deps(
    backends: &BackendSet,
    ci_factory: &CiAdapterFactory,
    runner: &RunnerRow,
) -> Result<(Arc<dyn Backend>, Option<Arc<dyn CiAdapter>>), Error> {
    let backend = backends.for_runner(runner)?;
    let ci = match runner.ci_runner_id {
        Some(_) => Some(ci_factory.for_runner(runner)?),
        None => None,
    };
    Ok((backend, ci))
}

/// What a pipeline run left behind.
pub(crate) struct PipelineRun {
    /// Side-effect outcome. `Ok` means the terminal state may be written.
    pub result: Result<(), Error>,
    /// The runner never came back within the readiness window. The
    /// terminal state is still written, but the CI runner stays paused
    /// until an operator intervenes.
    pub readiness_timed_out: bool,
}

/// Run pause → reset → readiness-probe → unpause for one checkpoint.
///
/// `ci` must be supplied whenever the runner carries a `ci_runner_id`;
/// the caller resolves the adapter so its configuration errors surface
/// before any side effect.
///
/// Unpause rules:
/// - pause is only attempted when the runner has a CI-side id and the
///   job failed/canceled or a cleanup command will run;
/// - a pause failure short-circuits (no reset attempted) after a
///   best-effort unpause;
/// - unpause runs on both the success and the error path; its own
///   failure is logged and never blocks the terminal transition;
/// - a readiness timeout skips the unpause on purpose.
pub(crate) async fn run_reset_pipeline(
    backend: Arc<dyn Backend>,
    ci: Option<Arc<dyn CiAdapter>>,
    runner: &RunnerRow,
    checkpoint_name: &str,
    status: FinalizeStatus,
    readiness_timeout: Duration,
) -> PipelineRun {
    let need_pause = runner.ci_runner_id.is_some()
        && (status != FinalizeStatus::Success || runner.cleanup_cmd.is_some());

    let mut paused = false;
    if need_pause {
        let (Some(ci), Some(ci_runner_id)) = (&ci, runner.ci_runner_id) else {
            return PipelineRun {
                result: Err(Error::Other(format!(
                    "runner '{}' needs a CI adapter for pause but none was resolved",
                    runner.runner_id
                ))),
                readiness_timed_out: false,
            };
        };
        if let Err(e) = ci.pause_runner(ci_runner_id).await {
            // No reset against a runner that may still receive jobs.
            if let Err(ue) = ci.unpause_runner(ci_runner_id).await {
                error!(
                    runner_id = %runner.runner_id,
                    ci_runner_id,
                    error = %ue,
                    "Unpause after failed pause also failed"
                );
            }
            return PipelineRun {
                result: Err(e.into()),
                readiness_timed_out: false,
            };
        }
        paused = true;
    }

    let mut result: Result<(), Error> = backend
        .reset(runner, checkpoint_name, status)
        .await
        .map_err(Error::from);

    // The success path never mutates the runner's boot state, so only
    // failure/cancellation resets are probed.
    let mut readiness_timed_out = false;
    if result.is_ok() && status != FinalizeStatus::Success {
        match backend.readiness_wait(runner, readiness_timeout).await {
            Ok(()) => {}
            Err(BackendError::ReadinessTimeout(secs)) => {
                readiness_timed_out = true;
                error!(
                    runner_id = %runner.runner_id,
                    checkpoint = %checkpoint_name,
                    timeout_secs = secs,
                    "ALERT: runner not ready after reset; leaving CI runner paused"
                );
            }
            Err(e) => result = Err(e.into()),
        }
    }

    if !readiness_timed_out {
        unpause_best_effort(&ci, runner, &mut paused).await;
    }

    PipelineRun {
        result,
        readiness_timed_out,
    }
}

async fn unpause_best_effort(ci: &Option<Arc<dyn CiAdapter>>, runner: &RunnerRow, paused: &mut bool) {
    if !*paused {
        return;
    }
    if let (Some(ci), Some(ci_runner_id)) = (ci, runner.ci_runner_id) {
        if let Err(e) = ci.unpause_runner(ci_runner_id).await {
            error!(
                runner_id = %runner.runner_id,
                ci_runner_id,
                error = %e,
                "ALERT: failed to unpause CI runner; operator intervention required"
            );
        }
    }
    *paused = false;
}

/// Append an operation log entry from a worker, never failing the
/// caller: on the pipeline's error path the original error must win.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn log_operation(
    pool: &PgPool,
    checkpoint_id: i64,
    runner_id: &str,
    operation: &str,
    backend: Option<&str>,
    detail: &str,
    result: &str,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
) {
    let entry = OperationLogEntry {
        checkpoint_id,
        runner_id,
        operation,
        backend,
        detail,
        result,
        started_at,
        finished_at,
    };
    let log = async {
        let mut conn = pool.acquire().await?;
        db::insert_operation_log(&mut conn, &entry).await
    };
    if let Err(e) = log.await {
        warn!(
            checkpoint_id,
            runner_id = %runner_id,
            operation = %operation,
            error = %e,
            "Failed to write operation log entry"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;

    use crate::ci::{CiError, JobStatus};

    fn runner(ci_runner_id: Option<i64>, cleanup_cmd: Option<&str>) -> RunnerRow {
        RunnerRow {
            id: 1,
            runner_id: "r1".to_string(),
            backend: "bare_metal".to_string(),
            token: "tok".to_string(),
            proxmox_host: None,
            proxmox_token_name: None,
            proxmox_token_value: None,
            proxmox_node: None,
            proxmox_vmid: None,
            reset_cmd: Some("reset.sh".to_string()),
            cleanup_cmd: cleanup_cmd.map(str::to_string),
            readiness_cmd: None,
            ci_adapter: "gitlab".to_string(),
            ci_url: None,
            ci_token: None,
            ci_runner_id,
            tags: None,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[derive(Default)]
    struct MockBackend {
        calls: Mutex<Vec<&'static str>>,
        fail_reset: bool,
        readiness_times_out: bool,
    }

    #[async_trait]
    impl Backend for MockBackend {
        fn kind(&self) -> &'static str {
            "mock"
        }

        async fn create_checkpoint(
            &self,
            _runner: &RunnerRow,
            _name: &str,
        ) -> Result<(), BackendError> {
            self.calls.lock().unwrap().push("create");
            Ok(())
        }

        async fn reset(
            &self,
            _runner: &RunnerRow,
            _checkpoint_name: &str,
            _status: FinalizeStatus,
        ) -> Result<(), BackendError> {
            self.calls.lock().unwrap().push("reset");
            if self.fail_reset {
                Err(BackendError::ResetFailed("mock reset failure".to_string()))
            } else {
                Ok(())
            }
        }

        async fn readiness_wait(
            &self,
            _runner: &RunnerRow,
            timeout: Duration,
        ) -> Result<(), BackendError> {
            self.calls.lock().unwrap().push("readiness");
            if self.readiness_times_out {
                Err(BackendError::ReadinessTimeout(timeout.as_secs()))
            } else {
                Ok(())
            }
        }
    }

    #[derive(Default)]
    struct MockCi {
        calls: Mutex<Vec<&'static str>>,
        fail_pause: bool,
        fail_unpause: bool,
    }

    #[async_trait]
    impl CiAdapter for MockCi {
        async fn get_job_status(&self, _job_id: &str) -> Result<JobStatus, CiError> {
            Ok(JobStatus::Unknown)
        }

        async fn pause_runner(&self, _ci_runner_id: i64) -> Result<(), CiError> {
            self.calls.lock().unwrap().push("pause");
            if self.fail_pause {
                Err(CiError::Api("mock pause failure".to_string()))
            } else {
                Ok(())
            }
        }

        async fn unpause_runner(&self, _ci_runner_id: i64) -> Result<(), CiError> {
            self.calls.lock().unwrap().push("unpause");
            if self.fail_unpause {
                Err(CiError::Api("mock unpause failure".to_string()))
            } else {
                Ok(())
            }
        }
    }

    async fn run(
        backend: Arc<MockBackend>,
        ci: Option<Arc<MockCi>>,
        runner: &RunnerRow,
        status: FinalizeStatus,
    ) -> PipelineRun {
        run_reset_pipeline(
            backend as Arc<dyn Backend>,
            ci.map(|ci| ci as Arc<dyn CiAdapter>),
            runner,
            "job-1-1000-aaaaaaaa",
            status,
            Duration::from_secs(1),
        )
        .await
    }

    #[tokio::test]
    async fn test_success_without_cleanup_skips_pause_and_readiness() {
        let backend = Arc::new(MockBackend::default());
        let ci = Arc::new(MockCi::default());
        let runner = runner(Some(42), None);

        let run = run(backend.clone(), Some(ci.clone()), &runner, FinalizeStatus::Success).await;

        assert!(run.result.is_ok());
        assert!(!run.readiness_timed_out);
        assert_eq!(*backend.calls.lock().unwrap(), vec!["reset"]);
        assert!(ci.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_success_with_cleanup_pauses_but_skips_readiness() {
        let backend = Arc::new(MockBackend::default());
        let ci = Arc::new(MockCi::default());
        let runner = runner(Some(42), Some("cleanup.sh"));

        let run = run(backend.clone(), Some(ci.clone()), &runner, FinalizeStatus::Success).await;

        assert!(run.result.is_ok());
        assert_eq!(*backend.calls.lock().unwrap(), vec!["reset"]);
        assert_eq!(*ci.calls.lock().unwrap(), vec!["pause", "unpause"]);
    }

    #[tokio::test]
    async fn test_failure_path_runs_full_pipeline() {
        let backend = Arc::new(MockBackend::default());
        let ci = Arc::new(MockCi::default());
        let runner = runner(Some(42), None);

        let run = run(backend.clone(), Some(ci.clone()), &runner, FinalizeStatus::Failure).await;

        assert!(run.result.is_ok());
        assert!(!run.readiness_timed_out);
        assert_eq!(*backend.calls.lock().unwrap(), vec!["reset", "readiness"]);
        assert_eq!(*ci.calls.lock().unwrap(), vec!["pause", "unpause"]);
    }

    #[tokio::test]
    async fn test_failure_without_ci_runner_id_skips_pause() {
        let backend = Arc::new(MockBackend::default());
        let runner = runner(None, None);

        let run = run(backend.clone(), None, &runner, FinalizeStatus::Canceled).await;

        assert!(run.result.is_ok());
        assert_eq!(*backend.calls.lock().unwrap(), vec!["reset", "readiness"]);
    }

    #[tokio::test]
    async fn test_pause_failure_short_circuits() {
        let backend = Arc::new(MockBackend::default());
        let ci = Arc::new(MockCi {
            fail_pause: true,
            ..MockCi::default()
        });
        let runner = runner(Some(42), None);

        let run = run(backend.clone(), Some(ci.clone()), &runner, FinalizeStatus::Failure).await;

        assert!(run.result.is_err());
        assert!(backend.calls.lock().unwrap().is_empty());
        assert_eq!(*ci.calls.lock().unwrap(), vec!["pause", "unpause"]);
    }

    #[tokio::test]
    async fn test_reset_failure_still_unpauses() {
        let backend = Arc::new(MockBackend {
            fail_reset: true,
            ..MockBackend::default()
        });
        let ci = Arc::new(MockCi::default());
        let runner = runner(Some(42), None);

        let run = run(backend.clone(), Some(ci.clone()), &runner, FinalizeStatus::Failure).await;

        assert!(run.result.is_err());
        assert_eq!(*backend.calls.lock().unwrap(), vec!["reset"]);
        assert_eq!(*ci.calls.lock().unwrap(), vec!["pause", "unpause"]);
    }

    #[tokio::test]
    async fn test_readiness_timeout_leaves_runner_paused() {
        let backend = Arc::new(MockBackend {
            readiness_times_out: true,
            ..MockBackend::default()
        });
        let ci = Arc::new(MockCi::default());
        let runner = runner(Some(42), None);

        let run = run(backend.clone(), Some(ci.clone()), &runner, FinalizeStatus::Failure).await;

        // Terminal state may still be written, but no unpause happened.
        assert!(run.result.is_ok());
        assert!(run.readiness_timed_out);
        assert_eq!(*ci.calls.lock().unwrap(), vec!["pause"]);
    }

    #[tokio::test]
    async fn test_unpause_failure_does_not_block_terminal() {
        let backend = Arc::new(MockBackend::default());
        let ci = Arc::new(MockCi {
            fail_unpause: true,
            ..MockCi::default()
        });
        let runner = runner(Some(42), None);

        let run = run(backend.clone(), Some(ci.clone()), &runner, FinalizeStatus::Failure).await;

        assert!(run.result.is_ok());
        assert_eq!(*ci.calls.lock().unwrap(), vec!["pause", "unpause"]);
    }
}
