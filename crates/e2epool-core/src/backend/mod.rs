// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Backend drivers: the per-runner-class checkpoint/reset capability.
//!
//! Two variants share one trait: hypervisor-backed VMs (snapshot and
//! rollback through the Proxmox REST API) and bare-metal hosts
//! (script-based reset over the agent channel). Callers never branch on
//! the variant; [`BackendSet::for_runner`] picks the driver from the
//! runner row.

mod agent_rpc;
mod bare_metal;
mod proxmox;

pub use agent_rpc::AgentRpc;
pub(crate) use agent_rpc::interpret_exec_response;
pub use bare_metal::BareMetalBackend;
pub use proxmox::ProxmoxBackend;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::db::{FinalizeStatus, RunnerRow};

/// Errors from backend operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BackendError {
    /// Hypervisor API call failed.
    #[error("Hypervisor error: {0}")]
    Hypervisor(String),

    /// A hypervisor task finished with a non-OK exit status.
    #[error("Hypervisor task failed: {0}")]
    TaskFailed(String),

    /// A hypervisor task or VM status wait ran out of time.
    #[error("Hypervisor task timed out: {0}")]
    TaskTimeout(String),

    /// The reset command is missing or exited non-zero.
    #[error("Reset failed: {0}")]
    ResetFailed(String),

    /// The runner never became ready within the readiness window.
    #[error("Runner not ready after {0}s")]
    ReadinessTimeout(u64),

    /// No agent connection for the runner, locally or via dispatch.
    #[error("Agent {0} not connected")]
    AgentNotConnected(String),

    /// The agent did not answer an RPC in time.
    #[error("Agent {0} timed out")]
    AgentTimeout(String),

    /// A command executed on the agent exited non-zero.
    #[error("Agent command failed (exit {exit_code}): {stderr}")]
    AgentCommand {
        /// Exit code reported by the agent.
        exit_code: i32,
        /// Captured stderr (truncated agent-side).
        stderr: String,
    },

    /// HTTP transport failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The runner row names a backend no driver exists for.
    #[error("Unknown backend kind: {0}")]
    UnknownKind(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Capability set both runner classes expose.
///
/// Drivers are pure side-effect engines: they never touch checkpoint
/// rows, which belong to the service and workers.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Backend kind identifier (`proxmox`, `bare_metal`).
    fn kind(&self) -> &'static str;

    /// Create a restore point named `name` on the runner host.
    async fn create_checkpoint(&self, runner: &RunnerRow, name: &str)
        -> Result<(), BackendError>;

    /// Resolve the checkpoint: discard it on success, revert the runner
    /// to it otherwise.
    async fn reset(
        &self,
        runner: &RunnerRow,
        checkpoint_name: &str,
        status: FinalizeStatus,
    ) -> Result<(), BackendError>;

    /// Block until the runner can accept the next job, polling up to
    /// `timeout`.
    async fn readiness_wait(
        &self,
        runner: &RunnerRow,
        timeout: Duration,
    ) -> Result<(), BackendError>;
}

/// The installed drivers, selected per runner row.
#[derive(Clone)]
pub struct BackendSet {
    proxmox: Arc<dyn Backend>,
    bare_metal: Arc<dyn Backend>,
}

impl BackendSet {
    pub fn new(proxmox: Arc<dyn Backend>, bare_metal: Arc<dyn Backend>) -> Self {
        Self { proxmox, bare_metal }
    }

    /// Driver for the runner's backend kind.
    pub fn for_runner(&self, runner: &RunnerRow) -> Result<Arc<dyn Backend>, BackendError> {
        match runner.backend.as_str() {
            "proxmox" => Ok(self.proxmox.clone()),
            "bare_metal" => Ok(self.bare_metal.clone()),
            other => Err(BackendError::UnknownKind(other.to_string())),
        }
    }
}
