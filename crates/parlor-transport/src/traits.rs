//! Connection handles and the outbound delivery seam.
//!
//! Everything above the transport writes to clients through [`Outbound`],
//! so registries and dispatch never touch a socket directly.

use async_trait::async_trait;
use parlor_protocol::Frame;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

static HANDLE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Opaque identifier for one live connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a unique connection ID.
    #[must_use]
    pub fn generate() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let counter = HANDLE_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}{:04x}", timestamp, counter & 0xffff))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// No live connection with this handle.
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// The connection's outbound buffer stayed full.
    #[error("Send timed out")]
    Timeout,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] parlor_protocol::ProtocolError),
}

/// Writes frames to live connections.
#[async_trait]
pub trait Outbound: Send + Sync {
    /// Send a frame to one connection.
    async fn send(&self, to: &ConnectionId, frame: Frame) -> Result<(), TransportError>;

    /// Send a frame to every live connection except `except`.
    ///
    /// Returns the number of connections the frame was queued for.
    async fn broadcast(
        &self,
        frame: Frame,
        except: Option<&ConnectionId>,
    ) -> Result<usize, TransportError>;

    /// Forcibly close a connection.
    async fn close(&self, id: &ConnectionId) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_generation() {
        let id1 = ConnectionId::generate();
        let id2 = ConnectionId::generate();
        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("conn_"));
    }

    #[test]
    fn test_connection_id_from_string() {
        let id: ConnectionId = "test-id".into();
        assert_eq!(id.as_str(), "test-id");
        assert_eq!(id.to_string(), "test-id");
    }
}
