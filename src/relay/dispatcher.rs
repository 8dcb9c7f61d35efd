//! Relay Dispatcher
//!
//! A single task owns the connection registry and the latest-payload cache
//! and processes connection events strictly one at a time. Connection tasks
//! talk to it only through [`RelayHandle`].

use super::cache::{LatestPayload, PayloadCache, PayloadMirror};
use super::message::{self, ErrorReply};
use super::registry::{ConnectionHandle, ConnectionId, ConnectionRegistry};
use super::RelayError;
use crate::config::BroadcastPolicy;
use crate::metrics::Metrics;
use crate::Result;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capacity of the dispatcher's event queue.
const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Events processed by the dispatcher
#[derive(Debug)]
pub enum RelayEvent {
    Connected(ConnectionHandle),
    MessageReceived { id: ConnectionId, raw: Vec<u8> },
    Closed(ConnectionId),
    LivenessTimeout(ConnectionId),
    Snapshot(oneshot::Sender<RelaySnapshot>),
    Shutdown,
}

/// Point-in-time view for status queries
#[derive(Debug, Clone)]
pub struct RelaySnapshot {
    pub connections: usize,
    pub latest: Option<LatestPayload>,
}

/// Settings the dispatcher needs from configuration
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub policy: BroadcastPolicy,
    pub max_payload_bytes: usize,
    pub mirror: Option<PayloadMirror>,
}

/// Cloneable sender side used by connection tasks and HTTP handlers
#[derive(Clone)]
pub struct RelayHandle {
    events: mpsc::Sender<RelayEvent>,
    next_id: Arc<AtomicU64>,
}

impl RelayHandle {
    /// Allocate a fresh connection id.
    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a connection. The cached payload, if any, is queued to it first.
    pub async fn connect(&self, handle: ConnectionHandle) -> Result<()> {
        self.send(RelayEvent::Connected(handle)).await
    }

    pub async fn message(&self, id: ConnectionId, raw: Vec<u8>) -> Result<()> {
        self.send(RelayEvent::MessageReceived { id, raw }).await
    }

    pub async fn closed(&self, id: ConnectionId) -> Result<()> {
        self.send(RelayEvent::Closed(id)).await
    }

    pub async fn liveness_timeout(&self, id: ConnectionId) -> Result<()> {
        self.send(RelayEvent::LivenessTimeout(id)).await
    }

    pub async fn snapshot(&self) -> Result<RelaySnapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(RelayEvent::Snapshot(tx)).await?;
        rx.await
            .map_err(|_| anyhow::anyhow!("Relay dispatcher dropped snapshot request"))
    }

    /// Ask the dispatcher to drop every connection and exit.
    pub async fn shutdown(&self) -> Result<()> {
        self.send(RelayEvent::Shutdown).await
    }

    async fn send(&self, event: RelayEvent) -> Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| anyhow::anyhow!("Relay dispatcher is not running"))
    }
}

/// Owner of the registry and cache
pub struct Dispatcher {
    registry: ConnectionRegistry,
    cache: PayloadCache,
    settings: DispatcherSettings,
    metrics: Arc<Metrics>,
}

impl Dispatcher {
    pub fn new(settings: DispatcherSettings, cache: PayloadCache, metrics: Arc<Metrics>) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            cache,
            settings,
            metrics,
        }
    }

    /// Spawn the dispatcher task and return a handle to it.
    pub fn spawn(self) -> (RelayHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let handle = RelayHandle {
            events: tx,
            next_id: Arc::new(AtomicU64::new(1)),
        };
        let task = tokio::spawn(self.run(rx));
        (handle, task)
    }

    async fn run(mut self, mut events: mpsc::Receiver<RelayEvent>) {
        info!(policy = %self.settings.policy, "Relay dispatcher started");

        while let Some(event) = events.recv().await {
            if !self.handle_event(event).await {
                break;
            }
        }

        let dropped = self.registry.clear();
        for _ in 0..dropped {
            self.metrics.connection_closed();
        }
        info!(dropped, "Relay dispatcher stopped");
    }

    /// Process one event. Returns false once the dispatcher should stop.
    pub async fn handle_event(&mut self, event: RelayEvent) -> bool {
        match event {
            RelayEvent::Connected(handle) => self.on_connected(handle),
            RelayEvent::MessageReceived { id, raw } => self.on_message(id, raw).await,
            RelayEvent::Closed(id) => {
                if let Some(handle) = self.registry.unregister(id) {
                    self.metrics.connection_closed();
                    debug!(conn_id = %id, peer = %handle.peer, duration = ?handle.connected_for(), "Connection unregistered");
                }
            }
            RelayEvent::LivenessTimeout(id) => {
                if let Some(handle) = self.registry.unregister(id) {
                    self.metrics.connection_closed();
                    self.metrics.liveness_timeout();
                    warn!(conn_id = %id, peer = %handle.peer, duration = ?handle.connected_for(), "Connection terminated after missed heartbeat");
                }
            }
            RelayEvent::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            RelayEvent::Shutdown => return false,
        }
        true
    }

    pub fn snapshot(&self) -> RelaySnapshot {
        RelaySnapshot {
            connections: self.registry.len(),
            latest: self.cache.get().cloned(),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &PayloadCache {
        &self.cache
    }

    fn on_connected(&mut self, handle: ConnectionHandle) {
        let id = handle.id;
        let peer = handle.peer;

        // Greet before registering so the cached value precedes any broadcast.
        if let Some(latest) = self.cache.get() {
            if let Err(e) = handle.deliver(latest.as_json().to_string()) {
                warn!(conn_id = %id, peer = %peer, error = %e, "Failed to send cached payload to new connection");
                self.metrics.delivery_failed(e.reason());
                handle.close();
                return;
            }
        }

        self.registry.register(handle);
        self.metrics.connection_opened();
        info!(conn_id = %id, peer = %peer, connections = self.registry.len(), "Connection registered");
    }

    async fn on_message(&mut self, sender: ConnectionId, raw: Vec<u8>) {
        let Some(peer) = self.registry.get(sender).map(|h| h.peer) else {
            debug!(conn_id = %sender, "Dropping message from unregistered connection");
            return;
        };

        let received_at = SystemTime::now();
        let payload = match message::parse_payload(&raw, self.settings.max_payload_bytes) {
            Ok(payload) => payload,
            Err(e) => {
                self.reject(sender, peer, &e, received_at);
                return;
            }
        };

        let latest = LatestPayload::new(message::stamp(payload, received_at), received_at);

        if let Some(mirror) = &self.settings.mirror {
            if let Err(e) = mirror.write(&latest).await {
                warn!(path = %mirror.path().display(), error = %e, "Failed to mirror latest payload");
                self.metrics.mirror_failed();
            }
        }

        let text = latest.as_json().to_string();
        self.cache.set(latest);

        let recipients = self.broadcast(sender, &text);
        self.metrics.message_relayed(recipients);
        debug!(conn_id = %sender, peer = %peer, bytes = raw.len(), recipients, "Relayed payload");
    }

    fn reject(&mut self, sender: ConnectionId, peer: SocketAddr, err: &RelayError, now: SystemTime) {
        warn!(conn_id = %sender, peer = %peer, reason = err.reason(), error = %err, "Rejected message");
        self.metrics.message_rejected(err.reason());

        let reply = ErrorReply::from_error(err, now).to_json();
        let delivered = self
            .registry
            .get(sender)
            .map(|handle| handle.deliver(reply))
            .unwrap_or(Err(RelayError::ConnectionClosed));

        if let Err(e) = delivered {
            self.evict(sender, &e);
        }
    }

    /// Queue `text` to every target. Failing connections are evicted after the pass.
    fn broadcast(&mut self, sender: ConnectionId, text: &str) -> usize {
        let include_sender = self.settings.policy.includes_sender();
        let mut delivered = 0;
        let mut failed = Vec::new();

        for handle in self.registry.iter() {
            if handle.id == sender && !include_sender {
                continue;
            }
            match handle.deliver(text.to_string()) {
                Ok(()) => delivered += 1,
                Err(e) => failed.push((handle.id, e)),
            }
        }

        for (id, e) in failed {
            self.evict(id, &e);
        }
        delivered
    }

    fn evict(&mut self, id: ConnectionId, err: &RelayError) {
        if let Some(handle) = self.registry.unregister(id) {
            self.metrics.connection_closed();
            self.metrics.delivery_failed(err.reason());
            warn!(conn_id = %id, peer = %handle.peer, duration = ?handle.connected_for(), error = %err, "Closing connection after failed delivery");
            handle.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::Outbound;
    use serde_json::{json, Value};
    use tempfile::TempDir;

    fn dispatcher(policy: BroadcastPolicy) -> Dispatcher {
        dispatcher_with(policy, None)
    }

    fn dispatcher_with(policy: BroadcastPolicy, mirror: Option<PayloadMirror>) -> Dispatcher {
        let settings = DispatcherSettings {
            policy,
            max_payload_bytes: 64,
            mirror,
        };
        Dispatcher::new(settings, PayloadCache::new(), Arc::new(Metrics::new()))
    }

    async fn connect(d: &mut Dispatcher, id: u64, capacity: usize) -> mpsc::Receiver<String> {
        connect_watched(d, id, capacity).await.frames
    }

    async fn connect_watched(d: &mut Dispatcher, id: u64, capacity: usize) -> Outbound {
        let peer = "127.0.0.1:50000".parse().unwrap();
        let (handle, outbound) = ConnectionHandle::new(ConnectionId(id), peer, capacity);
        d.handle_event(RelayEvent::Connected(handle)).await;
        outbound
    }

    async fn send(d: &mut Dispatcher, id: u64, raw: &str) {
        d.handle_event(RelayEvent::MessageReceived {
            id: ConnectionId(id),
            raw: raw.as_bytes().to_vec(),
        })
        .await;
    }

    fn parse(text: &str) -> Value {
        serde_json::from_str(text).unwrap()
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender() {
        let mut d = dispatcher(BroadcastPolicy::Others);
        let mut a = connect(&mut d, 1, 8).await;
        let mut b = connect(&mut d, 2, 8).await;
        let mut c = connect(&mut d, 3, 8).await;

        send(&mut d, 1, r#"{"x":1}"#).await;

        for rx in [&mut b, &mut c] {
            let received = parse(&rx.try_recv().unwrap());
            assert_eq!(received["x"], json!(1));
            assert!(received["_meta"]["receivedAt"].is_string());
        }
        assert!(a.try_recv().is_err());

        let cached = d.cache().get().unwrap();
        assert_eq!(cached.value()["x"], json!(1));
        assert!(cached.value().contains_key("_meta"));
    }

    #[tokio::test]
    async fn test_broadcast_all_echoes_sender() {
        let mut d = dispatcher(BroadcastPolicy::All);
        let mut a = connect(&mut d, 1, 8).await;
        let mut b = connect(&mut d, 2, 8).await;

        send(&mut d, 1, r#"{"x":1}"#).await;

        assert_eq!(parse(&a.try_recv().unwrap())["x"], json!(1));
        assert_eq!(parse(&b.try_recv().unwrap())["x"], json!(1));
    }

    #[tokio::test]
    async fn test_invalid_payload_only_answers_sender() {
        let mut d = dispatcher(BroadcastPolicy::Others);
        let mut a = connect(&mut d, 1, 8).await;
        let mut b = connect(&mut d, 2, 8).await;

        send(&mut d, 1, r#"{"x":1}"#).await;
        let _ = b.try_recv();

        send(&mut d, 1, "not json").await;
        send(&mut d, 1, "[1,2]").await;

        for _ in 0..2 {
            let reply = parse(&a.try_recv().unwrap());
            assert_eq!(reply["error"], "Invalid message format");
        }
        assert!(b.try_recv().is_err());

        // Cache still holds the earlier value
        assert_eq!(d.cache().get().unwrap().value()["x"], json!(1));
        assert_eq!(d.registry().len(), 2);
    }

    #[tokio::test]
    async fn test_oversize_payload_rejected() {
        let mut d = dispatcher(BroadcastPolicy::Others);
        let mut a = connect(&mut d, 1, 8).await;
        let mut b = connect(&mut d, 2, 8).await;

        let big = format!(r#"{{"blob":"{}"}}"#, "x".repeat(100));
        send(&mut d, 1, &big).await;

        let reply = parse(&a.try_recv().unwrap());
        assert_eq!(reply["error"], "Message too large");
        assert_eq!(reply["maxSize"], 64);
        assert!(b.try_recv().is_err());
        assert!(d.cache().is_empty());
    }

    #[tokio::test]
    async fn test_new_connection_receives_cached_payload() {
        let mut d = dispatcher(BroadcastPolicy::Others);
        let _a = connect(&mut d, 1, 8).await;
        send(&mut d, 1, r#"{"x":1}"#).await;

        let mut late = connect(&mut d, 2, 8).await;
        send(&mut d, 1, r#"{"x":2}"#).await;

        assert_eq!(parse(&late.try_recv().unwrap())["x"], json!(1));
        assert_eq!(parse(&late.try_recv().unwrap())["x"], json!(2));
    }

    #[tokio::test]
    async fn test_empty_cache_sends_no_greeting() {
        let mut d = dispatcher(BroadcastPolicy::Others);
        let mut a = connect(&mut d, 1, 8).await;
        assert!(a.try_recv().is_err());
        assert_eq!(d.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_delivery_evicts_only_that_connection() {
        let mut d = dispatcher(BroadcastPolicy::Others);
        let _a = connect(&mut d, 1, 8).await;
        let b = connect(&mut d, 2, 8).await;
        let mut c = connect(&mut d, 3, 1).await;
        let mut e = connect(&mut d, 4, 8).await;
        drop(b);

        send(&mut d, 1, r#"{"x":1}"#).await;
        send(&mut d, 1, r#"{"x":2}"#).await;

        // b was closed, c overflowed on the second message
        assert!(!d.registry().contains(ConnectionId(2)));
        assert!(!d.registry().contains(ConnectionId(3)));
        assert_eq!(d.registry().len(), 2);

        assert_eq!(parse(&c.try_recv().unwrap())["x"], json!(1));
        assert_eq!(parse(&e.try_recv().unwrap())["x"], json!(1));
        assert_eq!(parse(&e.try_recv().unwrap())["x"], json!(2));
    }

    #[tokio::test]
    async fn test_overflowing_connection_is_told_to_close() {
        let mut d = dispatcher(BroadcastPolicy::Others);
        let _a = connect(&mut d, 1, 8).await;
        let mut slow = connect_watched(&mut d, 3, 1).await;
        let mut b = connect(&mut d, 2, 8).await;

        send(&mut d, 1, r#"{"x":1}"#).await;
        assert!(slow.closed.try_recv().is_err());

        send(&mut d, 1, r#"{"x":2}"#).await;

        // The close signal fires even though a stale frame is still queued
        assert!(slow.closed.try_recv().is_ok());
        assert_eq!(parse(&slow.frames.try_recv().unwrap())["x"], json!(1));
        assert_eq!(d.metrics.get_active_connections(), 2);

        // The other clients keep receiving
        send(&mut d, 1, r#"{"x":3}"#).await;
        let xs: Vec<Value> = std::iter::from_fn(|| b.try_recv().ok())
            .map(|text| parse(&text)["x"].clone())
            .collect();
        assert_eq!(xs, vec![json!(1), json!(2), json!(3)]);
    }

    #[tokio::test]
    async fn test_failed_greeting_closes_connection() {
        let mut d = dispatcher(BroadcastPolicy::Others);
        let _a = connect(&mut d, 1, 8).await;
        send(&mut d, 1, r#"{"x":1}"#).await;

        let peer = "127.0.0.1:50000".parse().unwrap();
        let (handle, mut outbound) = ConnectionHandle::new(ConnectionId(2), peer, 1);
        handle.deliver("occupied".to_string()).unwrap();
        d.handle_event(RelayEvent::Connected(handle)).await;

        assert!(!d.registry().contains(ConnectionId(2)));
        assert!(outbound.closed.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_close_and_timeout_are_idempotent() {
        let mut d = dispatcher(BroadcastPolicy::Others);
        let _a = connect(&mut d, 1, 8).await;
        let _b = connect(&mut d, 2, 8).await;

        d.handle_event(RelayEvent::LivenessTimeout(ConnectionId(1))).await;
        d.handle_event(RelayEvent::Closed(ConnectionId(1))).await;
        d.handle_event(RelayEvent::Closed(ConnectionId(1))).await;

        assert_eq!(d.registry().len(), 1);
        assert_eq!(d.metrics.get_liveness_timeouts(), 1);
        assert_eq!(d.metrics.get_active_connections(), 1);
    }

    #[tokio::test]
    async fn test_messages_from_unregistered_connection_ignored() {
        let mut d = dispatcher(BroadcastPolicy::Others);
        let mut a = connect(&mut d, 1, 8).await;
        send(&mut d, 9, r#"{"x":1}"#).await;

        assert!(a.try_recv().is_err());
        assert!(d.cache().is_empty());
    }

    #[tokio::test]
    async fn test_mirror_written_on_accept() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("latest.json");
        let mut d = dispatcher_with(BroadcastPolicy::Others, Some(PayloadMirror::new(&path)));
        let _a = connect(&mut d, 1, 8).await;

        send(&mut d, 1, r#"{"x":1}"#).await;

        let on_disk = parse(&std::fs::read_to_string(&path).unwrap());
        assert_eq!(on_disk["x"], json!(1));
        assert!(on_disk["_meta"]["receivedAt"].is_string());
    }

    #[tokio::test]
    async fn test_mirror_failure_is_not_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("no-such-dir").join("latest.json");
        let mut d = dispatcher_with(BroadcastPolicy::Others, Some(PayloadMirror::new(path)));
        let _a = connect(&mut d, 1, 8).await;
        let mut b = connect(&mut d, 2, 8).await;

        send(&mut d, 1, r#"{"x":1}"#).await;

        assert_eq!(parse(&b.try_recv().unwrap())["x"], json!(1));
        assert_eq!(d.cache().get().unwrap().value()["x"], json!(1));
    }

    #[tokio::test]
    async fn test_spawned_dispatcher_snapshot_and_shutdown() {
        let (relay, task) = dispatcher(BroadcastPolicy::Others).spawn();

        let id = relay.next_id();
        let peer = "127.0.0.1:50001".parse().unwrap();
        let (handle, mut outbound) = ConnectionHandle::new(id, peer, 8);
        relay.connect(handle).await.unwrap();
        relay.message(id, br#"{"y":"z"}"#.to_vec()).await.unwrap();

        let snapshot = relay.snapshot().await.unwrap();
        assert_eq!(snapshot.connections, 1);
        assert_eq!(snapshot.latest.unwrap().value()["y"], json!("z"));

        relay.shutdown().await.unwrap();
        task.await.unwrap();

        // Shutdown dropped the registry, closing every connection
        assert!(outbound.closed.await.is_err());
        assert!(outbound.frames.recv().await.is_none());
        assert!(relay.snapshot().await.is_err());
    }
}
