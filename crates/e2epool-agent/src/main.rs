// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! e2epool agent CLI
//!
//! Usage:
//!   e2epool <command> [options]
//!
//! Commands:
//!   agent                         Run the agent daemon (foreground)
//!   create --job-id <id>          Create a checkpoint via the local agent
//!   finalize --checkpoint <name> --status <success|failure|canceled>
//!   status --checkpoint <name>    Query a checkpoint record
//!
//! Exit codes: 0 ok, 1 remote error, 2 agent not reachable.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use e2epool_agent::client::AgentClient;
use e2epool_agent::config::AgentConfig;
use e2epool_agent::ipc_server::IpcServer;
use e2epool_protocol::{AgentRequest, AgentResponse, IpcClient, IpcError, RequestKind};

const IPC_TIMEOUT: Duration = Duration::from_secs(35);

fn print_usage() {
    eprintln!(
        r#"Usage: e2epool <command> [options]

Checkpoint agent and CLI for e2epool runners.

COMMANDS:
    agent                           Run the agent daemon (foreground)
    create                          Create a checkpoint for a starting job
    finalize                        Queue finalization of a checkpoint
    status                          Query a checkpoint record

CREATE OPTIONS:
    --job-id <id>                   CI job identifier (required)
    --socket <path>                 Agent IPC socket path

FINALIZE OPTIONS:
    --checkpoint <name>             Checkpoint name (required)
    --status <status>               success | failure | canceled (required)
    --socket <path>                 Agent IPC socket path

STATUS OPTIONS:
    --checkpoint <name>             Checkpoint name (required)
    --socket <path>                 Agent IPC socket path

ENVIRONMENT:
    E2EPOOL_AGENT_CONTROLLER_URL    Controller WS endpoint (default: ws://localhost:8080/ws/agent)
    E2EPOOL_AGENT_RUNNER_ID         Runner id (agent daemon)
    E2EPOOL_AGENT_TOKEN             Runner token (agent daemon)
    E2EPOOL_AGENT_SOCKET_PATH       IPC socket (default: /var/run/e2epool-agent.sock)

EXAMPLES:
    # In the CI pre-job step
    CHECKPOINT=$(e2epool create --job-id "$CI_JOB_ID")

    # In the CI post-job step
    e2epool finalize --checkpoint "$CHECKPOINT" --status success
"#
    );
}

#[derive(Debug)]
enum Command {
    Agent,
    Create {
        job_id: String,
        socket: Option<String>,
    },
    Finalize {
        checkpoint: String,
        status: String,
        socket: Option<String>,
    },
    Status {
        checkpoint: String,
        socket: Option<String>,
    },
}

fn parse_args() -> Result<Command, String> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        return Err("missing command".to_string());
    }

    let mut job_id = None;
    let mut checkpoint = None;
    let mut status = None;
    let mut socket = None;

    let mut i = 2;
    while i < args.len() {
        let take_value = |i: &mut usize| -> Result<String, String> {
            *i += 1;
            args.get(*i)
                .cloned()
                .ok_or_else(|| format!("{} requires a value", args[*i - 1]))
        };
        match args[i].as_str() {
            "--job-id" => job_id = Some(take_value(&mut i)?),
            "--checkpoint" => checkpoint = Some(take_value(&mut i)?),
            "--status" => status = Some(take_value(&mut i)?),
            "--socket" => socket = Some(take_value(&mut i)?),
            other => return Err(format!("unknown option '{other}'")),
        }
        i += 1;
    }

    match args[1].as_str() {
        "agent" => Ok(Command::Agent),
        "create" => Ok(Command::Create {
            job_id: job_id.ok_or("create requires --job-id")?,
            socket,
        }),
        "finalize" => {
            let status = status.ok_or("finalize requires --status")?;
            if !matches!(status.as_str(), "success" | "failure" | "canceled") {
                return Err(format!(
                    "invalid --status '{status}' (expected success, failure, or canceled)"
                ));
            }
            Ok(Command::Finalize {
                checkpoint: checkpoint.ok_or("finalize requires --checkpoint")?,
                status,
                socket,
            })
        }
        "status" => Ok(Command::Status {
            checkpoint: checkpoint.ok_or("status requires --checkpoint")?,
            socket,
        }),
        other => Err(format!("unknown command '{other}'")),
    }
}

fn main() -> ExitCode {
    let command = match parse_args() {
        Ok(command) => command,
        Err(e) => {
            eprintln!("Error: {e}\n");
            print_usage();
            return ExitCode::from(1);
        }
    };

    match command {
        Command::Agent => run_agent(),
        Command::Create { job_id, socket } => {
            let request = AgentRequest::new(RequestKind::Create, json!({ "job_id": job_id }));
            run_verb(socket, request, |data| {
                println!("{}", data.get("name").and_then(|v| v.as_str()).unwrap_or(""));
            })
        }
        Command::Finalize {
            checkpoint,
            status,
            socket,
        } => {
            let request = AgentRequest::new(
                RequestKind::Finalize,
                json!({
                    "checkpoint_name": checkpoint,
                    "status": status,
                    "source": "agent",
                }),
            );
            run_verb(socket, request, |data| {
                println!(
                    "{}",
                    data.get("detail").and_then(|v| v.as_str()).unwrap_or("OK")
                );
            })
        }
        Command::Status { checkpoint, socket } => {
            let request = AgentRequest::new(
                RequestKind::Status,
                json!({ "checkpoint_name": checkpoint }),
            );
            run_verb(socket, request, |data| {
                println!(
                    "name:   {}",
                    data.get("name").and_then(|v| v.as_str()).unwrap_or("")
                );
                println!(
                    "state:  {}",
                    data.get("state").and_then(|v| v.as_str()).unwrap_or("")
                );
                if let Some(result) = data.get("finalize_status").and_then(|v| v.as_str()) {
                    println!("result: {result}");
                }
            })
        }
    }
}

/// Run one IPC verb against the local agent.
fn run_verb(
    socket: Option<String>,
    request: AgentRequest,
    on_ok: impl FnOnce(&serde_json::Value),
) -> ExitCode {
    let config = AgentConfig::from_env();
    let socket_path = socket
        .map(std::path::PathBuf::from)
        .unwrap_or(config.socket_path);

    let client = IpcClient::new(socket_path, IPC_TIMEOUT);
    let response: AgentResponse = match client.request(&request) {
        Ok(response) => response,
        Err(IpcError::Io(e))
            if matches!(
                e.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
            ) =>
        {
            eprintln!("Error: agent is not running ({e})");
            return ExitCode::from(2);
        }
        Err(IpcError::ConnectionClosed) => {
            eprintln!("Error: agent closed connection");
            return ExitCode::from(2);
        }
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::from(1);
        }
    };

    if response.is_ok() {
        on_ok(response.data.as_ref().unwrap_or(&serde_json::Value::Null));
        ExitCode::SUCCESS
    } else {
        let detail = response
            .error
            .map(|e| e.detail)
            .unwrap_or_else(|| "Unknown error".to_string());
        eprintln!("Error: {detail}");
        ExitCode::from(1)
    }
}

/// Run the agent daemon on a single-threaded runtime.
fn run_agent() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "e2epool_agent=info".into()),
        )
        .init();

    let config = AgentConfig::from_env();
    if config.runner_id.is_empty() || config.token.is_empty() {
        eprintln!("Error: E2EPOOL_AGENT_RUNNER_ID and E2EPOOL_AGENT_TOKEN must be set");
        return ExitCode::from(1);
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {e}");
            return ExitCode::from(1);
        }
    };

    runtime.block_on(async {
        let socket_path = config.socket_path.clone();
        let client = AgentClient::new(config);
        let ipc = Arc::new(IpcServer::new(socket_path, client.clone()));
        let ipc_shutdown = ipc.shutdown_handle();

        let ipc_task = {
            let ipc = ipc.clone();
            tokio::spawn(async move {
                if let Err(e) = ipc.run().await {
                    tracing::error!(error = %e, "IPC server failed");
                }
            })
        };

        let signal_client = client.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received");
            // New IPC requests stop first, then the connection drains.
            ipc_shutdown.notify_one();
            signal_client.trigger_shutdown();
        });

        client.run().await;
        let _ = ipc_task.await;
        tracing::info!("Agent stopped");
    });

    ExitCode::SUCCESS
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
