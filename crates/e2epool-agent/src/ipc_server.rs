// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Unix-socket IPC server for local CI scripts.
//!
//! One length-prefixed request and one response per connection; every
//! request is forwarded to the controller over the live WebSocket.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use e2epool_protocol::{AgentRequest, AgentResponse, IpcError, read_message, write_message};

use crate::client::AgentClient;

/// IPC server bound to the agent's Unix socket.
pub struct IpcServer {
    socket_path: PathBuf,
    client: Arc<AgentClient>,
    shutdown: Arc<Notify>,
}

impl IpcServer {
    pub fn new(socket_path: PathBuf, client: Arc<AgentClient>) -> Self {
        Self {
            socket_path,
            client,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Bind the socket and serve until shutdown.
    pub async fn run(&self) -> std::io::Result<()> {
        // A previous run may have left its socket file behind.
        let _ = std::fs::remove_file(&self.socket_path);
        let listener = UnixListener::bind(&self.socket_path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(
                &self.socket_path,
                std::fs::Permissions::from_mode(0o660),
            )?;
        }

        info!(socket = %self.socket_path.display(), "IPC server listening");

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("IPC server shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let client = self.client.clone();
                            tokio::spawn(async move {
                                handle_connection(stream, client).await;
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "IPC accept failed");
                        }
                    }
                }
            }
        }

        let _ = std::fs::remove_file(&self.socket_path);
        Ok(())
    }
}

async fn handle_connection(mut stream: UnixStream, client: Arc<AgentClient>) {
    let request: AgentRequest = match read_message(&mut stream).await {
        Ok(request) => request,
        Err(IpcError::ConnectionClosed) => return,
        Err(e) => {
            debug!(error = %e, "Bad IPC request");
            let response = AgentResponse::error("", 400, e.to_string());
            let _ = write_message(&mut stream, &response).await;
            return;
        }
    };

    let response = client.forward(request).await;
    if let Err(e) = write_message(&mut stream, &response).await {
        debug!(error = %e, "Failed to write IPC response");
    }
}
