//! Connection Registry
//!
//! Tracks the open WebSocket connections. A connection is present exactly
//! while its channel is open; removal is idempotent so close, error and
//! eviction paths may all unregister the same id.

use super::RelayError;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};

/// Identity assigned to a connection when it is accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Dispatcher-side handle to one open connection.
///
/// Dropping the handle fires its close signal, so a connection leaves the
/// registry and loses its socket together.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    pub connected_at: Instant,
    outbound: mpsc::Sender<String>,
    close: oneshot::Sender<()>,
}

/// Connection-task side of a [`ConnectionHandle`]
#[derive(Debug)]
pub struct Outbound {
    /// Frames queued by the dispatcher.
    pub frames: mpsc::Receiver<String>,
    /// Resolves once the dispatcher drops the connection. Queued frames are abandoned.
    pub closed: oneshot::Receiver<()>,
}

impl ConnectionHandle {
    /// Create a handle with an outbound queue of `capacity` frames.
    pub fn new(id: ConnectionId, peer: SocketAddr, capacity: usize) -> (Self, Outbound) {
        let (outbound, frames) = mpsc::channel(capacity);
        let (close, closed) = oneshot::channel();
        let handle = Self {
            id,
            peer,
            connected_at: Instant::now(),
            outbound,
            close,
        };
        (handle, Outbound { frames, closed })
    }

    pub fn connected_for(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Tell the connection task to drop its socket now.
    pub fn close(self) {
        // The task may already be gone.
        let _ = self.close.send(());
    }

    /// Queue a text frame without waiting. A full or closed queue is a delivery failure.
    pub fn deliver(&self, text: String) -> Result<(), RelayError> {
        self.outbound.try_send(text).map_err(|e| match e {
            TrySendError::Full(_) => RelayError::QueueFull,
            TrySendError::Closed(_) => RelayError::ConnectionClosed,
        })
    }
}

/// Set of currently open connections
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, ConnectionHandle>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handle: ConnectionHandle) {
        self.connections.insert(handle.id, handle);
    }

    /// Remove a connection. Dropping the returned handle closes its outbound queue.
    pub fn unregister(&mut self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.connections.remove(&id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&ConnectionHandle> {
        self.connections.get(&id)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Iterate in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &ConnectionHandle> {
        self.connections.values()
    }

    /// Drop every connection, closing all outbound queues.
    pub fn clear(&mut self) -> usize {
        let count = self.connections.len();
        self.connections.clear();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(id: u64, capacity: usize) -> (ConnectionHandle, mpsc::Receiver<String>) {
        let (handle, outbound) = watched(id, capacity);
        (handle, outbound.frames)
    }

    fn watched(id: u64, capacity: usize) -> (ConnectionHandle, Outbound) {
        let peer = "127.0.0.1:40000".parse().unwrap();
        ConnectionHandle::new(ConnectionId(id), peer, capacity)
    }

    #[test]
    fn test_register_and_unregister() {
        let mut registry = ConnectionRegistry::new();
        let (a, _rx_a) = handle(1, 4);
        let (b, _rx_b) = handle(2, 4);
        registry.register(a);
        registry.register(b);
        assert_eq!(registry.len(), 2);
        assert!(registry.contains(ConnectionId(1)));

        assert!(registry.unregister(ConnectionId(1)).is_some());
        assert_eq!(registry.len(), 1);

        // Second removal is a no-op
        assert!(registry.unregister(ConnectionId(1)).is_none());
        assert!(registry.unregister(ConnectionId(99)).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_unregister_closes_queue() {
        let mut registry = ConnectionRegistry::new();
        let (a, mut rx) = handle(1, 4);
        registry.register(a);

        drop(registry.unregister(ConnectionId(1)));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_close_signal_fires_with_frames_pending() {
        let (a, mut outbound) = watched(1, 4);
        a.deliver("stale".to_string()).unwrap();
        a.close();

        assert!(outbound.closed.await.is_ok());
        // Undelivered frames are still queued; the task must not wait for them
        assert_eq!(outbound.frames.try_recv().unwrap(), "stale");
    }

    #[tokio::test]
    async fn test_unregister_fires_close_signal() {
        let mut registry = ConnectionRegistry::new();
        let (a, outbound) = watched(1, 4);
        registry.register(a);

        let removed = registry.unregister(ConnectionId(1)).unwrap();
        assert!(removed.connected_for() < Duration::from_secs(5));
        drop(removed);
        assert!(outbound.closed.await.is_err());
    }

    #[test]
    fn test_deliver_failures() {
        let (full, _rx) = handle(1, 1);
        assert!(full.deliver("one".to_string()).is_ok());
        assert_eq!(full.deliver("two".to_string()), Err(RelayError::QueueFull));

        let (closed, rx) = handle(2, 1);
        drop(rx);
        assert_eq!(
            closed.deliver("one".to_string()),
            Err(RelayError::ConnectionClosed)
        );
    }

    #[test]
    fn test_clear() {
        let mut registry = ConnectionRegistry::new();
        let (a, _rx_a) = handle(1, 1);
        registry.register(a);
        assert_eq!(registry.clear(), 1);
        assert!(registry.is_empty());
    }
}
