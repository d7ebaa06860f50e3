// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shell command execution for controller-initiated `exec` requests.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::warn;

use e2epool_protocol::ExecResult;

/// Per-stream output cap (64 KiB).
pub const MAX_OUTPUT_BYTES: usize = 64 * 1024;

/// Run a shell command line with a timeout, capturing truncated output.
///
/// Never returns an error: failures to spawn, a timeout, or a kill all
/// land in the `ExecResult` with exit code -1 so the controller sees a
/// uniform shape.
pub async fn run_command(cmd: &str, timeout: Duration) -> ExecResult {
    if cmd.is_empty() {
        return ExecResult {
            exit_code: -1,
            stdout: String::new(),
            stderr: "Empty command".to_string(),
        };
    }

    let child = Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let child = match child {
        Ok(child) => child,
        Err(e) => {
            warn!(cmd = %cmd, error = %e, "Failed to spawn command");
            return ExecResult {
                exit_code: -1,
                stdout: String::new(),
                stderr: e.to_string(),
            };
        }
    };

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        // The dropped future kills the process (kill_on_drop).
        Err(_) => ExecResult {
            exit_code: -1,
            stdout: String::new(),
            stderr: format!("Command timed out after {}s", timeout.as_secs()),
        },
        Ok(Err(e)) => ExecResult {
            exit_code: -1,
            stdout: String::new(),
            stderr: e.to_string(),
        },
        Ok(Ok(output)) => ExecResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: truncate_output(&output.stdout),
            stderr: truncate_output(&output.stderr),
        },
    }
}

fn truncate_output(bytes: &[u8]) -> String {
    let end = bytes.len().min(MAX_OUTPUT_BYTES);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}
