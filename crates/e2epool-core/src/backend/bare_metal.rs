// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bare-metal backend: script-based reset over the agent channel.
//!
//! There is no snapshot capability; the checkpoint row itself is the
//! checkpoint, and reverting means running the operator-supplied
//! `reset_cmd` on the host.

use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use super::{AgentRpc, Backend, BackendError};
use crate::db::{FinalizeStatus, RunnerRow};

const RESET_CMD_TIMEOUT_SECS: u64 = 120;

/// Script-based driver for `backend = bare_metal` runners.
pub struct BareMetalBackend {
    agent: AgentRpc,
}

impl BareMetalBackend {
    pub fn new(agent: AgentRpc) -> Self {
        Self { agent }
    }
}

#[async_trait]
impl Backend for BareMetalBackend {
    fn kind(&self) -> &'static str {
        "bare_metal"
    }

    async fn create_checkpoint(
        &self,
        _runner: &RunnerRow,
        _name: &str,
    ) -> Result<(), BackendError> {
        // No host-side action; the store row is the restore point.
        Ok(())
    }

    async fn reset(
        &self,
        runner: &RunnerRow,
        checkpoint_name: &str,
        status: FinalizeStatus,
    ) -> Result<(), BackendError> {
        match status {
            FinalizeStatus::Success => {
                if let Some(cmd) = runner.cleanup_cmd.as_deref() {
                    self.agent
                        .exec(&runner.runner_id, cmd, RESET_CMD_TIMEOUT_SECS)
                        .await?;
                }
            }
            FinalizeStatus::Failure | FinalizeStatus::Canceled => {
                let cmd = runner.reset_cmd.as_deref().ok_or_else(|| {
                    BackendError::ResetFailed(format!(
                        "runner '{}' has no reset_cmd configured",
                        runner.runner_id
                    ))
                })?;
                self.agent
                    .exec(&runner.runner_id, cmd, RESET_CMD_TIMEOUT_SECS)
                    .await
                    .map_err(|e| match e {
                        BackendError::AgentCommand { exit_code, stderr } => {
                            BackendError::ResetFailed(format!(
                                "reset_cmd exited {exit_code}: {stderr}"
                            ))
                        }
                        other => other,
                    })?;
            }
        }

        info!(
            runner_id = %runner.runner_id,
            checkpoint = %checkpoint_name,
            status = %status,
            "Bare-metal reset resolved"
        );
        Ok(())
    }

    async fn readiness_wait(
        &self,
        runner: &RunnerRow,
        timeout: Duration,
    ) -> Result<(), BackendError> {
        self.agent.readiness_wait(runner, timeout).await
    }
}
