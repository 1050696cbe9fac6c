// ABOUTME: Duplex byte channel over stdio, a Unix domain socket, or a Windows named pipe
// ABOUTME: Opens exactly one connection per process and releases pipe resources on drop
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 dravr.ai

use std::fmt;
use std::path::PathBuf;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use crate::types::BridgeError;

/// Boxed input half of a transport
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed output half of a transport
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Where the protocol bytes flow
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TransportKind {
    /// Process stdin/stdout
    #[default]
    Stdio,
    /// Named pipe (Windows) or Unix domain socket path
    Pipe(PathBuf),
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdio => write!(f, "stdio"),
            Self::Pipe(path) => write!(f, "pipe:{}", path.display()),
        }
    }
}

/// Removes a socket file when the connection is released
#[derive(Debug, Default)]
pub struct TransportGuard {
    socket_path: Option<PathBuf>,
}

impl Drop for TransportGuard {
    fn drop(&mut self) {
        if let Some(path) = self.socket_path.take() {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "Removed socket file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => debug!(path = %path.display(), error = %e, "Failed to remove socket file"),
            }
        }
    }
}

/// An open duplex connection
pub struct TransportChannel {
    reader: BoxedReader,
    writer: BoxedWriter,
    guard: TransportGuard,
}

impl TransportChannel {
    /// Wrap an arbitrary duplex pair (used for stdio and in tests)
    pub fn from_io(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            guard: TransportGuard::default(),
        }
    }

    /// Open the transport and wait for the single client connection
    pub async fn open(kind: &TransportKind) -> Result<Self, BridgeError> {
        match kind {
            TransportKind::Stdio => {
                debug!("Using stdio transport");
                Ok(Self::from_io(tokio::io::stdin(), tokio::io::stdout()))
            }
            TransportKind::Pipe(path) => open_pipe(path.clone()).await,
        }
    }

    /// Split into the input half, output half, and release guard
    pub fn into_parts(self) -> (BoxedReader, BoxedWriter, TransportGuard) {
        (self.reader, self.writer, self.guard)
    }
}

#[cfg(unix)]
async fn open_pipe(path: PathBuf) -> Result<TransportChannel, BridgeError> {
    use tokio::net::UnixListener;

    if path.exists() {
        std::fs::remove_file(&path).map_err(|e| {
            BridgeError::transport(format!(
                "Failed to remove stale socket {}: {e}",
                path.display()
            ))
        })?;
    }

    let listener = UnixListener::bind(&path).map_err(|e| {
        BridgeError::transport(format!("Failed to bind socket {}: {e}", path.display()))
    })?;
    let guard = TransportGuard {
        socket_path: Some(path.clone()),
    };

    info!(path = %path.display(), "Waiting for client on Unix socket");
    let (stream, _addr) = listener
        .accept()
        .await
        .map_err(|e| BridgeError::transport(format!("Failed to accept connection: {e}")))?;

    let (reader, writer) = stream.into_split();
    Ok(TransportChannel {
        reader: Box::new(reader),
        writer: Box::new(writer),
        guard,
    })
}

#[cfg(windows)]
async fn open_pipe(path: PathBuf) -> Result<TransportChannel, BridgeError> {
    use tokio::net::windows::named_pipe::ServerOptions;

    let name = path.to_string_lossy().into_owned();
    let server = ServerOptions::new()
        .first_pipe_instance(true)
        .create(&name)
        .map_err(|e| BridgeError::transport(format!("Failed to create pipe {name}: {e}")))?;

    info!(pipe = %name, "Waiting for client on named pipe");
    server
        .connect()
        .await
        .map_err(|e| BridgeError::transport(format!("Failed to accept pipe client: {e}")))?;

    let (reader, writer) = tokio::io::split(server);
    Ok(TransportChannel {
        reader: Box::new(reader),
        writer: Box::new(writer),
        guard: TransportGuard::default(),
    })
}

#[cfg(not(any(unix, windows)))]
async fn open_pipe(path: PathBuf) -> Result<TransportChannel, BridgeError> {
    Err(BridgeError::config(format!(
        "Pipe transport is not supported on this platform: {}",
        path.display()
    )))
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[test]
    fn transport_kind_display() {
        assert_eq!(TransportKind::Stdio.to_string(), "stdio");
        assert_eq!(
            TransportKind::Pipe(PathBuf::from("/tmp/ps.sock")).to_string(),
            "pipe:/tmp/ps.sock"
        );
    }

    #[tokio::test]
    async fn from_io_passes_bytes_through() {
        let (client, server) = tokio::io::duplex(1024);
        let (server_read, server_write) = tokio::io::split(server);
        let channel = TransportChannel::from_io(server_read, server_write);
        let (mut reader, mut writer, _guard) = channel.into_parts();

        let (mut client_read, mut client_write) = tokio::io::split(client);
        client_write.write_all(b"ping").await.expect("write");
        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf).await.expect("read");
        assert_eq!(&buf, b"ping");

        writer.write_all(b"pong").await.expect("write back");
        client_read.read_exact(&mut buf).await.expect("read back");
        assert_eq!(&buf, b"pong");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unix_socket_accepts_one_client_and_removes_file_on_drop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bridge.sock");
        let kind = TransportKind::Pipe(path.clone());

        let server = tokio::spawn(async move { TransportChannel::open(&kind).await });

        let mut client = loop {
            if let Ok(stream) = tokio::net::UnixStream::connect(&path).await {
                break stream;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        };
        let channel = server.await.expect("join").expect("open");
        let (mut reader, _writer, guard) = channel.into_parts();

        client.write_all(b"hi").await.expect("write");
        let mut buf = [0u8; 2];
        reader.read_exact(&mut buf).await.expect("read");
        assert_eq!(&buf, b"hi");

        assert!(path.exists());
        drop(guard);
        assert!(!path.exists());
    }
}
