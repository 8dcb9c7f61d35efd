//! Per-connection handler: register, pump frames, drive the heartbeat.

use crate::metrics::Metrics;
use crate::relay::{ConnectionHandle, ConnectionId, Liveness, Outbound, Probe, RelayHandle};
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Per-connection settings taken from the server configuration
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub heartbeat_interval: Duration,
    pub outbound_queue: usize,
}

/// Why a connection task ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Close frame or end of stream from the peer.
    PeerClosed,
    /// Protocol or transport error while reading.
    ReadError,
    /// Writing to the socket failed.
    WriteError,
    /// The dispatcher dropped this connection.
    Evicted,
    /// A heartbeat went unanswered.
    LivenessTimeout,
    /// The dispatcher is gone.
    RelayStopped,
}

impl CloseReason {
    /// Metric label
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::PeerClosed => "peer_closed",
            CloseReason::ReadError => "read_error",
            CloseReason::WriteError => "write_error",
            CloseReason::Evicted => "evicted",
            CloseReason::LivenessTimeout => "liveness_timeout",
            CloseReason::RelayStopped => "relay_stopped",
        }
    }
}

/// Serve one upgraded WebSocket until it closes.
pub async fn handle_socket(
    socket: WebSocket,
    peer: SocketAddr,
    relay: RelayHandle,
    metrics: Arc<Metrics>,
    settings: ConnectionSettings,
) -> CloseReason {
    let id = relay.next_id();
    let (handle, outbound) = ConnectionHandle::new(id, peer, settings.outbound_queue);
    let Outbound {
        frames: mut rx,
        mut closed,
    } = outbound;

    if let Err(e) = relay.connect(handle).await {
        warn!(conn_id = %id, peer = %peer, error = %e, "Could not register connection");
        metrics.socket_closed(CloseReason::RelayStopped.as_str());
        return CloseReason::RelayStopped;
    }

    info!(conn_id = %id, peer = %peer, "Client connected");

    let (mut sink, mut stream) = socket.split();
    let mut liveness = Liveness::new();
    let period = settings.heartbeat_interval;
    let mut heartbeat = interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let reason = loop {
        tokio::select! {
            biased;

            // Frames still queued are abandoned.
            _ = &mut closed => break CloseReason::Evicted,

            outbound = rx.recv() => match outbound {
                Some(text) => {
                    // Eviction interrupts a write blocked on a peer that stopped reading.
                    tokio::select! {
                        biased;
                        _ = &mut closed => break CloseReason::Evicted,
                        sent = sink.send(Message::Text(text)) => {
                            if let Err(e) = sent {
                                debug!(conn_id = %id, error = %e, "WS write failed");
                                break CloseReason::WriteError;
                            }
                        }
                    }
                }
                None => break CloseReason::Evicted,
            },

            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if forward(&relay, id, text.into_bytes()).await.is_err() {
                        break CloseReason::RelayStopped;
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    if forward(&relay, id, data).await.is_err() {
                        break CloseReason::RelayStopped;
                    }
                }
                Some(Ok(Message::Pong(_))) => liveness.acknowledge(),
                // Pings are answered by the WebSocket layer.
                Some(Ok(Message::Ping(_))) => {}
                Some(Ok(Message::Close(_))) | None => break CloseReason::PeerClosed,
                Some(Err(e)) => {
                    debug!(conn_id = %id, peer = %peer, error = %e, "WS error");
                    break CloseReason::ReadError;
                }
            },

            _ = heartbeat.tick() => match liveness.tick() {
                Probe::Send => {
                    tokio::select! {
                        biased;
                        _ = &mut closed => break CloseReason::Evicted,
                        sent = sink.send(Message::Ping(Vec::new())) => {
                            if let Err(e) = sent {
                                debug!(conn_id = %id, error = %e, "Heartbeat ping failed");
                                break CloseReason::WriteError;
                            }
                        }
                    }
                }
                Probe::Terminate => break CloseReason::LivenessTimeout,
            },
        }
    };

    // Dropping both halves closes the socket without a close handshake.
    drop(sink);
    drop(stream);
    metrics.socket_closed(reason.as_str());

    let notified = match reason {
        CloseReason::LivenessTimeout => relay.liveness_timeout(id).await,
        CloseReason::RelayStopped => Ok(()),
        _ => relay.closed(id).await,
    };
    if let Err(e) = notified {
        debug!(conn_id = %id, error = %e, "Relay unavailable during disconnect");
    }

    info!(conn_id = %id, peer = %peer, reason = ?reason, "Client disconnected");
    reason
}

async fn forward(relay: &RelayHandle, id: ConnectionId, raw: Vec<u8>) -> crate::Result<()> {
    relay.message(id, raw).await.map_err(|e| {
        warn!(conn_id = %id, error = %e, "Dropping message, relay is not running");
        e
    })
}
