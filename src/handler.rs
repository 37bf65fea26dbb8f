//! Connection handler.
//!
//! Reads a bounded chunk, hands it to the configured [`Protocol`] and writes
//! the reply back, one reply per read, until the peer closes or I/O fails.

use bytes::BytesMut;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::info;

use crate::config::Config;
use crate::protocol::Protocol;

/// Settings shared by every connection handler.
#[derive(Debug, Clone)]
pub struct HandlerSettings {
    pub protocol: Protocol,
    /// Upper bound on the bytes taken by a single read.
    pub buffer_size: usize,
    pub idle_timeout: Option<Duration>,
}

impl HandlerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            protocol: Protocol::from_config(config),
            buffer_size: config.buffer_size,
            idle_timeout: config.idle_timeout,
        }
    }
}

/// Why a connection ended without an I/O error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
    /// The peer closed its side (read returned zero bytes).
    PeerClosed,
    /// Nothing arrived within the idle timeout.
    IdleTimeout,
}

/// I/O failure that terminated a connection.
#[derive(Debug)]
pub enum HandlerError {
    Read(io::Error),
    Write(io::Error),
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerError::Read(e) => write!(f, "read failed: {e}"),
            HandlerError::Write(e) => write!(f, "write failed: {e}"),
        }
    }
}

impl std::error::Error for HandlerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HandlerError::Read(e) | HandlerError::Write(e) => Some(e),
        }
    }
}

/// Serve a single client connection.
///
/// The stream is consumed and dropped when this returns.
pub async fn handle_connection<S>(
    mut stream: S,
    peer: SocketAddr,
    settings: &HandlerSettings,
) -> Result<Disconnect, HandlerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buffer = BytesMut::zeroed(settings.buffer_size);
    let mut reply = BytesMut::with_capacity(settings.buffer_size);

    loop {
        let n = match read_chunk(&mut stream, &mut buffer, settings.idle_timeout).await {
            Ok(Some(n)) => n,
            Ok(None) => return Ok(Disconnect::IdleTimeout),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(HandlerError::Read(e)),
        };

        if n == 0 {
            return Ok(Disconnect::PeerClosed);
        }

        let chunk = &buffer[..n];
        info!(
            peer = %peer,
            bytes = n,
            data = %String::from_utf8_lossy(chunk).trim_end(),
            "Message received"
        );

        reply.clear();
        settings.protocol.respond(chunk, &mut reply);
        stream
            .write_all(&reply)
            .await
            .map_err(HandlerError::Write)?;
    }
}

/// Read once, returning `None` if the idle timeout elapsed first.
async fn read_chunk<S>(
    stream: &mut S,
    buffer: &mut [u8],
    idle_timeout: Option<Duration>,
) -> io::Result<Option<usize>>
where
    S: AsyncRead + Unpin,
{
    match idle_timeout {
        Some(limit) => match tokio::time::timeout(limit, stream.read(buffer)).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        },
        None => stream.read(buffer).await.map(Some),
    }
}
