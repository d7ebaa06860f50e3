// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Length-prefixed JSON framing for the agent's Unix-socket IPC.
//!
//! Each message is a 4-byte big-endian length header followed by a JSON
//! payload. One request and one response per connection; the CLI side is
//! blocking, the agent side async.

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum IPC message size (1 MiB).
pub const MAX_MSG_SIZE: usize = 1024 * 1024;

/// Length header size in bytes.
pub const HEADER_SIZE: usize = 4;

/// Errors raised by the IPC codec.
#[derive(Debug, Error)]
pub enum IpcError {
    #[error("message too large: {0} bytes (max: {MAX_MSG_SIZE})")]
    MessageTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("connection closed")]
    ConnectionClosed,
}

/// Write a length-prefixed JSON message to an async writer.
pub async fn write_message<W, T>(writer: &mut W, msg: &T) -> Result<(), IpcError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(msg)?;
    if payload.len() > MAX_MSG_SIZE {
        return Err(IpcError::MessageTooLarge(payload.len()));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a length-prefixed JSON message from an async reader.
pub async fn read_message<R, T>(reader: &mut R) -> Result<T, IpcError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut header = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(IpcError::ConnectionClosed);
        }
        Err(e) => return Err(e.into()),
    }

    let length = u32::from_be_bytes(header) as usize;
    if length > MAX_MSG_SIZE {
        return Err(IpcError::MessageTooLarge(length));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;
    Ok(serde_json::from_slice(&payload)?)
}

/// Blocking Unix-socket IPC client used by the CLI verbs.
#[cfg(unix)]
pub struct IpcClient {
    socket_path: std::path::PathBuf,
    timeout: std::time::Duration,
}

#[cfg(unix)]
impl IpcClient {
    /// Create a client for the given socket path with a per-request timeout.
    pub fn new(socket_path: impl Into<std::path::PathBuf>, timeout: std::time::Duration) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout,
        }
    }

    /// Send one request and wait for the response.
    pub fn request<Req, Resp>(&self, msg: &Req) -> Result<Resp, IpcError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        use std::io::{Read, Write};

        let mut stream = std::os::unix::net::UnixStream::connect(&self.socket_path)?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;

        let payload = serde_json::to_vec(msg)?;
        if payload.len() > MAX_MSG_SIZE {
            return Err(IpcError::MessageTooLarge(payload.len()));
        }
        stream.write_all(&(payload.len() as u32).to_be_bytes())?;
        stream.write_all(&payload)?;

        let mut header = [0u8; HEADER_SIZE];
        stream.read_exact(&mut header).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                IpcError::ConnectionClosed
            } else {
                IpcError::Io(e)
            }
        })?;
        let length = u32::from_be_bytes(header) as usize;
        if length > MAX_MSG_SIZE {
            return Err(IpcError::MessageTooLarge(length));
        }
        let mut body = vec![0u8; length];
        stream.read_exact(&mut body)?;
        Ok(serde_json::from_slice(&body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{AgentRequest, RequestKind};
    use serde_json::json;

    #[tokio::test]
    async fn round_trip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        let req = AgentRequest::new(RequestKind::Status, json!({"checkpoint_name": "x"}));
        write_message(&mut a, &req).await.unwrap();

        let got: AgentRequest = read_message(&mut b).await.unwrap();
        assert_eq!(got.id, req.id);
        assert_eq!(got.kind, RequestKind::Status);
    }

    #[tokio::test]
    async fn eof_reports_connection_closed() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        let err = read_message::<_, AgentRequest>(&mut b).await.unwrap_err();
        assert!(matches!(err, IpcError::ConnectionClosed));
    }

    #[tokio::test]
    async fn oversized_header_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let bogus = ((MAX_MSG_SIZE + 1) as u32).to_be_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut a, &bogus).await.unwrap();
        let err = read_message::<_, AgentRequest>(&mut b).await.unwrap_err();
        assert!(matches!(err, IpcError::MessageTooLarge(_)));
    }
}
