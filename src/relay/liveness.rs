//! Liveness Monitor
//!
//! Per-connection heartbeat. Every interval the connection is probed with a
//! WebSocket ping; if the previous probe was never answered the connection
//! is terminated instead. A peer that stops answering is therefore closed
//! within two intervals.

/// Heartbeat state of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessState {
    /// The last probe was answered (or none has been sent yet).
    Acknowledged,
    /// A probe is outstanding.
    AwaitingAck,
    /// A probe went unanswered for a full interval.
    Expired,
}

/// Action the connection task must take on a timer tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// Send a ping frame.
    Send,
    /// Terminate the connection without a close handshake.
    Terminate,
}

#[derive(Debug)]
pub struct Liveness {
    state: LivenessState,
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

impl Liveness {
    pub fn new() -> Self {
        Self {
            state: LivenessState::Acknowledged,
        }
    }

    pub fn state(&self) -> LivenessState {
        self.state
    }

    /// Advance on a timer tick. Once expired every further tick terminates.
    pub fn tick(&mut self) -> Probe {
        match self.state {
            LivenessState::Acknowledged => {
                self.state = LivenessState::AwaitingAck;
                Probe::Send
            }
            LivenessState::AwaitingAck | LivenessState::Expired => {
                self.state = LivenessState::Expired;
                Probe::Terminate
            }
        }
    }

    /// Record a pong from the peer.
    pub fn acknowledge(&mut self) {
        if self.state != LivenessState::Expired {
            self.state = LivenessState::Acknowledged;
        }
    }
}
