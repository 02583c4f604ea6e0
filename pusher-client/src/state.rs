//! Connection lifecycle states and the bounded state history.

use std::fmt;

/// Lifecycle state of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Client constructed, `connect()` not yet called.
    Initialized,
    /// Transport dial or protocol handshake in progress.
    Connecting,
    /// `pusher:connection_established` received; sends are allowed.
    Connected,
    /// Connection lost or refused; a reconnect is pending.
    Unavailable,
    /// Liveness timer fired or the server reported a fatal condition.
    Failed,
    /// The caller asked for a disconnect.
    Disconnected,
    /// Transport closed with no reconnect pending.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Initialized => "initialized",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Unavailable => "unavailable",
            ConnectionState::Failed => "failed",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// How many past states are retained for diagnostics.
const HISTORY_LEN: usize = 3;

/// The current state plus a fixed window of its predecessors, newest first.
#[derive(Debug)]
pub(crate) struct StateHistory {
    ring: [ConnectionState; HISTORY_LEN],
    len: usize,
}

impl StateHistory {
    pub(crate) fn new() -> Self {
        StateHistory {
            ring: [ConnectionState::Initialized; HISTORY_LEN],
            len: 1,
        }
    }

    /// The most recent state.
    pub(crate) fn current(&self) -> ConnectionState {
        let [cur, _, _] = self.ring;
        cur
    }

    /// Record a transition, evicting the oldest retained state when full.
    pub(crate) fn push(&mut self, next: ConnectionState) {
        let [a, b, _] = self.ring;
        tracing::debug!(from = %a, to = %next, "connection state transition");
        self.ring = [next, a, b];
        self.len = (self.len + 1).min(HISTORY_LEN);
    }

    /// True only when the connection can carry traffic.
    pub(crate) fn is_available(&self) -> bool {
        self.current() == ConnectionState::Connected
    }

    /// Retained states, newest first.
    pub(crate) fn history(&self) -> &[ConnectionState] {
        self.ring.get(..self.len).unwrap_or(&self.ring)
    }
}
