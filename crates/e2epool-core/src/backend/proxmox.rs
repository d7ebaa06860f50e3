// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Proxmox VE backend: VM snapshot create/rollback/delete.
//!
//! Every mutating call returns a UPID; the driver polls the node's task
//! endpoint until the task stops and checks its exit status. The
//! single-active invariant keeps at most one snapshot under the VM, so
//! the snapshot tree stays linear and rollback discards exactly the
//! state written since the checkpoint.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use super::{AgentRpc, Backend, BackendError};
use crate::db::{FinalizeStatus, RunnerRow};

const TASK_POLL_INTERVAL: Duration = Duration::from_secs(2);
const TASK_TIMEOUT: Duration = Duration::from_secs(120);
const STOP_TIMEOUT: Duration = Duration::from_secs(60);
const START_TIMEOUT: Duration = Duration::from_secs(180);
const CLEANUP_CMD_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Deserialize)]
struct PveResponse<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct TaskStatus {
    status: String,
    exitstatus: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VmStatus {
    status: String,
}

/// Hypervisor-backed driver for `backend = proxmox` runners.
pub struct ProxmoxBackend {
    http: reqwest::Client,
    agent: AgentRpc,
}

impl ProxmoxBackend {
    /// Build the driver.
    ///
    /// Hypervisors in the pools this controller manages routinely run
    /// self-signed certificates, so certificate verification is off for
    /// the hypervisor client only.
    pub fn new(agent: AgentRpc, http_timeout: Duration) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .timeout(http_timeout)
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self { http, agent })
    }

    fn base_url(runner: &RunnerRow) -> Result<String, BackendError> {
        let host = runner
            .proxmox_host
            .as_deref()
            .ok_or_else(|| missing_field(runner, "proxmox_host"))?;
        if host.contains(':') {
            Ok(format!("https://{host}/api2/json"))
        } else {
            Ok(format!("https://{host}:8006/api2/json"))
        }
    }

    fn auth_header(runner: &RunnerRow) -> Result<String, BackendError> {
        let name = runner
            .proxmox_token_name
            .as_deref()
            .ok_or_else(|| missing_field(runner, "proxmox_token_name"))?;
        let value = runner
            .proxmox_token_value
            .as_deref()
            .ok_or_else(|| missing_field(runner, "proxmox_token_value"))?;
        Ok(format!("PVEAPIToken={name}={value}"))
    }

    fn vm_path(runner: &RunnerRow) -> Result<String, BackendError> {
        let node = runner
            .proxmox_node
            .as_deref()
            .ok_or_else(|| missing_field(runner, "proxmox_node"))?;
        let vmid = runner
            .proxmox_vmid
            .ok_or_else(|| missing_field(runner, "proxmox_vmid"))?;
        Ok(format!("nodes/{node}/qemu/{vmid}"))
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        runner: &RunnerRow,
        path: &str,
    ) -> Result<T, BackendError> {
        let url = format!("{}/{}", Self::base_url(runner)?, path);
        let response = self
            .http
            .get(&url)
            .header("Authorization", Self::auth_header(runner)?)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(BackendError::Hypervisor(format!(
                "GET {path} returned {}",
                response.status()
            )));
        }
        Ok(response.json::<PveResponse<T>>().await?.data)
    }

    async fn post(
        &self,
        runner: &RunnerRow,
        path: &str,
        form: &[(&str, &str)],
    ) -> Result<Option<String>, BackendError> {
        let url = format!("{}/{}", Self::base_url(runner)?, path);
        let response = self
            .http
            .post(&url)
            .header("Authorization", Self::auth_header(runner)?)
            .form(form)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(BackendError::Hypervisor(format!(
                "POST {path} returned {}",
                response.status()
            )));
        }
        Ok(response.json::<PveResponse<Option<String>>>().await?.data)
    }

    async fn delete(&self, runner: &RunnerRow, path: &str) -> Result<Option<String>, BackendError> {
        let url = format!("{}/{}", Self::base_url(runner)?, path);
        let response = self
            .http
            .delete(&url)
            .header("Authorization", Self::auth_header(runner)?)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(BackendError::Hypervisor(format!(
                "DELETE {path} returned {}",
                response.status()
            )));
        }
        Ok(response.json::<PveResponse<Option<String>>>().await?.data)
    }

    /// Poll a task UPID until it stops; non-OK exit status is an error.
    async fn wait_for_task(&self, runner: &RunnerRow, upid: &str) -> Result<(), BackendError> {
        let node = runner
            .proxmox_node
            .as_deref()
            .ok_or_else(|| missing_field(runner, "proxmox_node"))?;
        let path = format!("nodes/{node}/tasks/{upid}/status");
        let deadline = tokio::time::Instant::now() + TASK_TIMEOUT;

        loop {
            let task: TaskStatus = self.get(runner, &path).await?;
            if task.status == "stopped" {
                return match task.exitstatus.as_deref() {
                    Some("OK") => Ok(()),
                    other => Err(BackendError::TaskFailed(format!(
                        "{upid}: {}",
                        other.unwrap_or("unknown")
                    ))),
                };
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(BackendError::TaskTimeout(upid.to_string()));
            }
            tokio::time::sleep(TASK_POLL_INTERVAL).await;
        }
    }

    /// Wait after a task completes until the VM reports `target`.
    async fn wait_for_vm_status(
        &self,
        runner: &RunnerRow,
        target: &str,
        timeout: Duration,
    ) -> Result<(), BackendError> {
        let path = format!("{}/status/current", Self::vm_path(runner)?);
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let status: VmStatus = self.get(runner, &path).await?;
            if status.status == target {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(BackendError::TaskTimeout(format!(
                    "VM did not reach '{target}' within {}s",
                    timeout.as_secs()
                )));
            }
            tokio::time::sleep(TASK_POLL_INTERVAL).await;
        }
    }

    async fn run_task(
        &self,
        runner: &RunnerRow,
        upid: Option<String>,
    ) -> Result<(), BackendError> {
        match upid {
            Some(upid) => self.wait_for_task(runner, &upid).await,
            None => Ok(()),
        }
    }

    /// Full failure-path rollback: stop, roll back, start.
    async fn rollback(&self, runner: &RunnerRow, name: &str) -> Result<(), BackendError> {
        let vm = Self::vm_path(runner)?;

        // Tolerate an already-stopped VM: the stop/rollback/start
        // sequence is idempotent at this boundary.
        let status: VmStatus = self.get(runner, &format!("{vm}/status/current")).await?;
        if status.status != "stopped" {
            let upid = self
                .post(runner, &format!("{vm}/status/stop"), &[("forceStop", "1")])
                .await?;
            self.run_task(runner, upid).await?;
            self.wait_for_vm_status(runner, "stopped", STOP_TIMEOUT).await?;
        } else {
            debug!(runner_id = %runner.runner_id, "VM already stopped, skipping stop");
        }

        let upid = self
            .post(runner, &format!("{vm}/snapshot/{name}/rollback"), &[])
            .await?;
        self.run_task(runner, upid).await?;

        let upid = self.post(runner, &format!("{vm}/status/start"), &[]).await?;
        self.run_task(runner, upid).await?;
        self.wait_for_vm_status(runner, "running", START_TIMEOUT).await?;

        Ok(())
    }

    async fn delete_snapshot(&self, runner: &RunnerRow, name: &str) -> Result<(), BackendError> {
        let vm = Self::vm_path(runner)?;
        let upid = self.delete(runner, &format!("{vm}/snapshot/{name}")).await?;
        self.run_task(runner, upid).await
    }
}

fn missing_field(runner: &RunnerRow, field: &str) -> BackendError {
    BackendError::Other(format!(
        "runner '{}' is missing required field '{field}'",
        runner.runner_id
    ))
}

#[async_trait]
impl Backend for ProxmoxBackend {
    fn kind(&self) -> &'static str {
        "proxmox"
    }

    async fn create_checkpoint(
        &self,
        runner: &RunnerRow,
        name: &str,
    ) -> Result<(), BackendError> {
        let vm = Self::vm_path(runner)?;
        let description = format!("e2epool checkpoint {name}");
        let upid = self
            .post(
                runner,
                &format!("{vm}/snapshot"),
                &[("snapname", name), ("description", description.as_str())],
            )
            .await?;
        self.run_task(runner, upid).await?;
        info!(runner_id = %runner.runner_id, checkpoint = %name, "Snapshot created");
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
                        .exec(&runner.runner_id, cmd, CLEANUP_CMD_TIMEOUT_SECS)
                        .await?;
                }
            }
            FinalizeStatus::Failure | FinalizeStatus::Canceled => {
                self.rollback(runner, checkpoint_name).await?;
            }
        }

        self.delete_snapshot(runner, checkpoint_name).await?;
        info!(
            runner_id = %runner.runner_id,
            checkpoint = %checkpoint_name,
            status = %status,
            "Snapshot resolved"
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
