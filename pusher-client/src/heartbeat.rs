//! Heartbeat scheduling: ping cadence, pong grace period, liveness window.
//!
//! Rather than spawning timer tasks, the event loop polls a single deadline
//! from this tracker inside its `select!`. Re-arming on inbound traffic is a
//! plain field update, and cancelling timers that never armed is a no-op.

use std::time::Duration;

use tokio::time::Instant;

use crate::types::TimingConfig;

/// What a fired deadline asks the event loop to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Beat {
    /// Quiet for `ping_interval`: send a `pusher:ping` and arm the pong wait.
    SendPing,
    /// Pong grace period or liveness window expired: the connection is dead.
    LivenessLost,
}

#[derive(Debug)]
pub(crate) struct Heartbeat {
    ping_interval: Duration,
    pong_timeout: Duration,
    connection_timeout: Duration,
    /// When the next ping goes out.
    ping_at: Instant,
    /// When inbound silence becomes fatal.
    idle_at: Instant,
    /// Armed after a ping is sent; cleared by any inbound traffic.
    pong_wait: Option<Instant>,
}

impl Heartbeat {
    pub(crate) fn new(timing: &TimingConfig, now: Instant) -> Self {
        Heartbeat {
            ping_interval: timing.ping_interval,
            pong_timeout: timing.pong_timeout,
            connection_timeout: timing.connection_timeout,
            ping_at: now + timing.ping_interval,
            idle_at: now + timing.connection_timeout,
            pong_wait: None,
        }
    }

    /// Re-arm everything. Called after every inbound frame is processed: any
    /// traffic proves liveness, so a pending pong wait is cancelled too.
    pub(crate) fn restart(&mut self, now: Instant) {
        self.ping_at = now + self.ping_interval;
        self.idle_at = now + self.connection_timeout;
        self.pong_wait = None;
    }

    /// Record that a ping went out and start the pong grace period.
    pub(crate) fn ping_sent(&mut self, now: Instant) {
        self.pong_wait = Some(now + self.pong_timeout);
    }

    /// The nearest armed deadline, for `tokio::time::sleep_until`.
    pub(crate) fn next_deadline(&self) -> Instant {
        let mut d = self.ping_at.min(self.idle_at);
        if let Some(pw) = self.pong_wait {
            d = d.min(pw);
        }
        d
    }

    /// Resolve which deadline fired. Returns `None` on a spurious wake.
    pub(crate) fn fire(&mut self, now: Instant) -> Option<Beat> {
        if self.pong_wait.is_some_and(|pw| pw <= now) {
            self.pong_wait = None;
            return Some(Beat::LivenessLost);
        }
        if self.idle_at <= now {
            return Some(Beat::LivenessLost);
        }
        if self.ping_at <= now {
            self.ping_at = now + self.ping_interval;
            return Some(Beat::SendPing);
        }
        None
    }
}
