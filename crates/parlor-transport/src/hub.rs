//! In-process connection hub.
//!
//! Each live connection registers a bounded mpsc queue. The socket task
//! drains the receiving half; everything else writes through [`Outbound`].

use async_trait::async_trait;
use dashmap::DashMap;
use parlor_protocol::Frame;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::SendTimeoutError, error::TrySendError};
use tracing::{debug, trace, warn};

use crate::traits::{ConnectionId, Outbound, TransportError};

/// Something the socket task should do.
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    /// Write a frame.
    Frame(Frame),
    /// Close the socket.
    Close,
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Per-connection outbound queue size.
    pub buffer: usize,
    /// How long a directed send waits for queue space.
    pub send_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            buffer: 256,
            send_timeout: Duration::from_secs(1),
        }
    }
}

/// Registry of outbound queues, one per live connection.
pub struct ConnectionHub {
    peers: DashMap<ConnectionId, mpsc::Sender<Outgoing>>,
    config: HubConfig,
}

impl ConnectionHub {
    /// Create a hub with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(HubConfig::default())
    }

    /// Create a hub with custom configuration.
    #[must_use]
    pub fn with_config(config: HubConfig) -> Self {
        Self {
            peers: DashMap::new(),
            config,
        }
    }

    /// Register a connection and get the receiver its socket task drains.
    ///
    /// Registering an id twice replaces the previous queue.
    pub fn register(&self, id: &ConnectionId) -> mpsc::Receiver<Outgoing> {
        let (tx, rx) = mpsc::channel(self.config.buffer.max(1));
        if self.peers.insert(id.clone(), tx).is_some() {
            warn!(connection = %id, "Replaced existing outbound queue");
        }
        debug!(connection = %id, "Registered outbound queue");
        rx
    }

    /// Remove a connection's queue.
    pub fn unregister(&self, id: &ConnectionId) -> bool {
        self.peers.remove(id).is_some()
    }

    /// Check if a connection is registered.
    #[must_use]
    pub fn is_registered(&self, id: &ConnectionId) -> bool {
        self.peers.contains_key(id)
    }

    /// Number of registered connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Check if the hub is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    fn sender(&self, id: &ConnectionId) -> Option<mpsc::Sender<Outgoing>> {
        self.peers.get(id).map(|entry| entry.value().clone())
    }
}

impl Default for ConnectionHub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Outbound for ConnectionHub {
    async fn send(&self, to: &ConnectionId, frame: Frame) -> Result<(), TransportError> {
        let tx = self
            .sender(to)
            .ok_or_else(|| TransportError::UnknownConnection(to.clone()))?;

        trace!(connection = %to, frame_type = frame.frame_type().as_str(), "Queueing frame");
        tx.send_timeout(Outgoing::Frame(frame), self.config.send_timeout)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => TransportError::Timeout,
                SendTimeoutError::Closed(_) => TransportError::ConnectionClosed,
            })
    }

    async fn broadcast(
        &self,
        frame: Frame,
        except: Option<&ConnectionId>,
    ) -> Result<usize, TransportError> {
        let targets: Vec<(ConnectionId, mpsc::Sender<Outgoing>)> = self
            .peers
            .iter()
            .filter(|entry| Some(entry.key()) != except)
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut delivered = 0;
        for (id, tx) in targets {
            match tx.try_send(Outgoing::Frame(frame.clone())) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(connection = %id, "Outbound queue full, broadcast frame dropped");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(connection = %id, "Outbound queue closed during broadcast");
                }
            }
        }

        Ok(delivered)
    }

    async fn close(&self, id: &ConnectionId) -> Result<(), TransportError> {
        let (_, tx) = self
            .peers
            .remove(id)
            .ok_or_else(|| TransportError::UnknownConnection(id.clone()))?;

        debug!(connection = %id, "Closing connection");
        match tx.try_send(Outgoing::Close) {
            Ok(()) | Err(TrySendError::Closed(_)) => Ok(()),
            Err(TrySendError::Full(_)) => Err(TransportError::SendFailed(
                "outbound queue full on close".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hub_send() {
        let hub = ConnectionHub::new();
        let id = ConnectionId::new("conn-1");
        let mut rx = hub.register(&id);

        hub.send(&id, Frame::ping()).await.unwrap();
        assert_eq!(rx.recv().await, Some(Outgoing::Frame(Frame::ping())));
    }

    #[tokio::test]
    async fn test_hub_send_unknown() {
        let hub = ConnectionHub::new();
        let result = hub.send(&ConnectionId::new("ghost"), Frame::ping()).await;
        assert!(matches!(result, Err(TransportError::UnknownConnection(_))));
    }

    #[tokio::test]
    async fn test_hub_send_closed_receiver() {
        let hub = ConnectionHub::new();
        let id = ConnectionId::new("conn-1");
        drop(hub.register(&id));

        let result = hub.send(&id, Frame::ping()).await;
        assert!(matches!(result, Err(TransportError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_hub_broadcast_except() {
        let hub = ConnectionHub::new();
        let a = ConnectionId::new("a");
        let b = ConnectionId::new("b");
        let mut rx_a = hub.register(&a);
        let mut rx_b = hub.register(&b);

        let count = hub.broadcast(Frame::ping(), Some(&a)).await.unwrap();
        assert_eq!(count, 1);
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_hub_close() {
        let hub = ConnectionHub::new();
        let id = ConnectionId::new("conn-1");
        let mut rx = hub.register(&id);

        hub.close(&id).await.unwrap();
        assert!(!hub.is_registered(&id));
        assert_eq!(rx.recv().await, Some(Outgoing::Close));
        assert!(hub.close(&id).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hub_send_times_out_when_full() {
        let hub = ConnectionHub::with_config(HubConfig {
            buffer: 1,
            send_timeout: Duration::from_millis(50),
        });
        let id = ConnectionId::new("slow");
        let _rx = hub.register(&id);

        hub.send(&id, Frame::ping()).await.unwrap();
        let result = hub.send(&id, Frame::ping()).await;
        assert!(matches!(result, Err(TransportError::Timeout)));
    }
}
