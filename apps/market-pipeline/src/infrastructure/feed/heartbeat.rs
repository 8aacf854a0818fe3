//! Heartbeat
//!
//! Connection liveness for the feed socket. A probe goes out every
//! `ping_interval`; once a probe is outstanding, any inbound frame counts as
//! the answer. No answer within `pong_timeout` means the connection is dead.

use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior};

/// Configuration for heartbeat behavior.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval between liveness probes.
    pub ping_interval: Duration,
    /// Time to wait for any inbound frame after a probe.
    pub pong_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
        }
    }
}

impl HeartbeatConfig {
    /// Create a new configuration with custom values.
    #[must_use]
    pub const fn new(ping_interval: Duration, pong_timeout: Duration) -> Self {
        Self {
            ping_interval,
            pong_timeout,
        }
    }
}

/// What the connection should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Send a liveness probe.
    SendPing,
    /// The outstanding probe went unanswered.
    Timeout,
}

/// Per-connection heartbeat state.
///
/// Poll [`Heartbeat::next`] inside the connection's `select!` loop and call
/// [`Heartbeat::record_activity`] for every inbound frame. `next` is cancel
/// safe.
#[derive(Debug)]
pub struct Heartbeat {
    config: HeartbeatConfig,
    interval: Interval,
    probe_sent: Option<Instant>,
}

impl Heartbeat {
    /// Start a heartbeat; the first probe is due one interval from now.
    #[must_use]
    pub fn new(config: HeartbeatConfig) -> Self {
        let period = config.ping_interval.max(Duration::from_millis(1));
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            config,
            interval,
            probe_sent: None,
        }
    }

    /// An inbound frame arrived.
    pub const fn record_activity(&mut self) {
        self.probe_sent = None;
    }

    /// Whether a probe is awaiting an answer.
    #[must_use]
    pub const fn is_waiting(&self) -> bool {
        self.probe_sent.is_some()
    }

    /// Wait for the next heartbeat action.
    pub async fn next(&mut self) -> HeartbeatEvent {
        if let Some(sent) = self.probe_sent {
            tokio::time::sleep_until(sent + self.config.pong_timeout).await;
            tracing::warn!(
                timeout_ms = u64::try_from(self.config.pong_timeout.as_millis()).unwrap_or(u64::MAX),
                "Heartbeat timeout detected"
            );
            return HeartbeatEvent::Timeout;
        }
        self.interval.tick().await;
        self.probe_sent = Some(Instant::now());
        HeartbeatEvent::SendPing
    }
}
