// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Command execution and readiness probing over the agent channel.
//!
//! Local-first dispatch: when this replica holds the runner's WebSocket,
//! the RPC goes straight through the connection manager. Otherwise it
//! takes the internal HTTP hop, which the operator routes to the replica
//! holding the connection (sticky-by-runner load balancing).

use std::time::Duration;

use serde_json::json;
use tracing::debug;

use e2epool_protocol::{AgentRequest, AgentResponse, ExecResult, RequestKind};

use super::BackendError;
use crate::db::RunnerRow;
use crate::ws_manager::{ConnectionManager, WsManagerError};

/// Extra slack granted on top of a command's own timeout so the agent
/// can report the timeout itself before the RPC gives up.
const RPC_SLACK: Duration = Duration::from_secs(5);

/// Agent RPC dispatcher shared by the backend drivers, the readiness
/// endpoint, and the finalize pipeline.
#[derive(Clone)]
pub struct AgentRpc {
    manager: ConnectionManager,
    http: reqwest::Client,
    api_base_url: String,
    admin_token: String,
    poll_interval: Duration,
}

impl AgentRpc {
    pub fn new(
        manager: ConnectionManager,
        http: reqwest::Client,
        api_base_url: impl Into<String>,
        admin_token: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            manager,
            http,
            api_base_url: api_base_url.into(),
            admin_token: admin_token.into(),
            poll_interval,
        }
    }

    /// Execute a shell command on the runner host.
    ///
    /// Returns the captured output on exit 0; a non-zero exit surfaces
    /// as [`BackendError::AgentCommand`].
    pub async fn exec(
        &self,
        runner_id: &str,
        cmd: &str,
        timeout_secs: u64,
    ) -> Result<ExecResult, BackendError> {
        if self.manager.is_connected(runner_id) {
            self.exec_local(runner_id, cmd, timeout_secs).await
        } else {
            self.exec_dispatch(runner_id, cmd, timeout_secs).await
        }
    }

    async fn exec_local(
        &self,
        runner_id: &str,
        cmd: &str,
        timeout_secs: u64,
    ) -> Result<ExecResult, BackendError> {
        debug!(runner_id = %runner_id, cmd = %cmd, "Executing command on local agent");
        let request = AgentRequest::new(
            RequestKind::Exec,
            json!({ "cmd": cmd, "timeout": timeout_secs }),
        );
        let response = self
            .manager
            .send_request(
                runner_id,
                request,
                Duration::from_secs(timeout_secs) + RPC_SLACK,
            )
            .await
            .map_err(|e| match e {
                WsManagerError::NotConnected(id) => BackendError::AgentNotConnected(id),
                WsManagerError::Timeout(id) => BackendError::AgentTimeout(id),
                WsManagerError::Disconnected(id) => BackendError::AgentNotConnected(id),
            })?;

        interpret_exec_response(response)
    }

    async fn exec_dispatch(
        &self,
        runner_id: &str,
        cmd: &str,
        timeout_secs: u64,
    ) -> Result<ExecResult, BackendError> {
        debug!(runner_id = %runner_id, cmd = %cmd, "Dispatching command via internal endpoint");
        let url = format!("{}/internal/agent/{}/exec", self.api_base_url, runner_id);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.admin_token)
            .json(&json!({ "cmd": cmd, "timeout": timeout_secs }))
            .timeout(Duration::from_secs(timeout_secs) + RPC_SLACK + RPC_SLACK)
            .send()
            .await?;

        match response.status().as_u16() {
            200 => Ok(response.json::<ExecResult>().await?),
            404 | 503 => Err(BackendError::AgentNotConnected(runner_id.to_string())),
            504 => Err(BackendError::AgentTimeout(runner_id.to_string())),
            status => {
                let detail = response.text().await.unwrap_or_default();
                Err(BackendError::AgentCommand {
                    exit_code: -1,
                    stderr: format!("dispatch failed (HTTP {status}): {detail}"),
                })
            }
        }
    }

    /// Whether the runner's agent is reachable, locally or via dispatch.
    pub async fn is_connected(&self, runner_id: &str) -> bool {
        if self.manager.is_connected(runner_id) {
            return true;
        }
        let url = format!("{}/internal/agent/{}/connected", self.api_base_url, runner_id);
        match self
            .http
            .get(&url)
            .bearer_auth(&self.admin_token)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => resp
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|v| v.get("connected").and_then(|c| c.as_bool()))
                .unwrap_or(false),
            _ => false,
        }
    }

    /// One readiness probe: run `readiness_cmd` when configured (ready on
    /// exit 0), otherwise check channel connectivity.
    pub async fn check_ready_once(&self, runner: &RunnerRow) -> bool {
        match runner.readiness_cmd.as_deref() {
            Some(cmd) => self.exec(&runner.runner_id, cmd, 30).await.is_ok(),
            None => self.is_connected(&runner.runner_id).await,
        }
    }

    /// Poll readiness until it succeeds or `timeout` elapses.
    pub async fn readiness_wait(
        &self,
        runner: &RunnerRow,
        timeout: Duration,
    ) -> Result<(), BackendError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.check_ready_once(runner).await {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(BackendError::ReadinessTimeout(timeout.as_secs()));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

pub(crate) fn interpret_exec_response(response: AgentResponse) -> Result<ExecResult, BackendError> {
    let result: Option<ExecResult> = response
        .data
        .clone()
        .and_then(|data| serde_json::from_value(data).ok());

    if response.is_ok() {
        return result.ok_or_else(|| {
            BackendError::Other("agent returned ok without exec result".to_string())
        });
    }

    match result {
        Some(result) => Err(BackendError::AgentCommand {
            exit_code: result.exit_code,
            stderr: result.stderr,
        }),
        None => Err(BackendError::AgentCommand {
            exit_code: -1,
            stderr: response
                .error
                .map(|e| e.detail)
                .unwrap_or_else(|| "unknown agent error".to_string()),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_interpret_ok_response() {
        let resp = AgentResponse::ok(
            "1",
            json!({"exit_code": 0, "stdout": "done\n", "stderr": ""}),
        );
        let result = interpret_exec_response(resp).unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "done\n");
    }

    #[test]
    fn test_interpret_nonzero_exit() {
        let mut resp = AgentResponse::error("1", 500, "command failed");
        resp.data = Some(json!({"exit_code": 2, "stdout": "", "stderr": "boom"}));
        let err = interpret_exec_response(resp).unwrap_err();
        match err {
            BackendError::AgentCommand { exit_code, stderr } => {
                assert_eq!(exit_code, 2);
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_interpret_bare_error() {
        let resp = AgentResponse::error("1", 503, "not connected");
        let err = interpret_exec_response(resp).unwrap_err();
        match err {
            BackendError::AgentCommand { exit_code, stderr } => {
                assert_eq!(exit_code, -1);
                assert_eq!(stderr, "not connected");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
