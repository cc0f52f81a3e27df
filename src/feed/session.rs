//! Feed connection session state.
//!
//! State machine with well-defined transitions, exponential reconnect
//! backoff, and message-recency liveness. Liveness is judged on application
//! messages, not the transport: a TCP connection can sit open while the
//! provider has silently stopped sending, so the stale check compares
//! `now - last_message_at_ms` against a threshold and forces a reconnect.
//!
//! Everything here is pure state + arithmetic so reconnection logic is
//! testable without real timers; callers inject the current time.

use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

/// Connection state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedState {
    /// Initial state, and where every transport failure lands.
    Disconnected,
    /// TCP + TLS + WebSocket upgrade in progress.
    Connecting,
    /// Transport up; auth sent, waiting for the subscribe handshake.
    Authenticating,
    /// Actively receiving the stream.
    Subscribed,
    /// Terminal. Entered only on process shutdown; no reconnect follows.
    ShuttingDown,
}

impl Default for FeedState {
    fn default() -> Self {
        FeedState::Disconnected
    }
}

impl FeedState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Subscribed => "subscribed",
            Self::ShuttingDown => "shutting_down",
        }
    }
}

impl std::fmt::Display for FeedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reconnect delay: `min(base × 1.5^attempts, max)`.
///
/// `attempts` is the number of failures since the last successful subscribe.
pub fn reconnect_delay(base: Duration, max: Duration, attempts: u32) -> Duration {
    let factor = 1.5_f64.powi(attempts.min(64) as i32);
    let delay = base.as_secs_f64() * factor;
    Duration::from_secs_f64(delay.min(max.as_secs_f64()))
}

#[derive(Debug, Default)]
struct HealthInner {
    state: FeedState,
    last_message_at_ms: i64,
    reconnect_attempts: u32,
    total_records_seen: u64,
    records_rejected: u64,
}

/// Point-in-time copy of the connection health, safe to hand to API readers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub state: FeedState,
    pub last_message_at_ms: i64,
    pub reconnect_attempts: u32,
    pub total_records_seen: u64,
    pub records_rejected: u64,
}

impl HealthSnapshot {
    pub fn is_connected(&self) -> bool {
        self.state == FeedState::Subscribed
    }
}

/// Shared connection health. Mutated only by the feed manager's run loop,
/// read by any number of API callers.
pub struct FeedHealth {
    inner: RwLock<HealthInner>,
}

impl Default for FeedHealth {
    fn default() -> Self {
        Self::new()
    }
}

impl FeedHealth {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HealthInner::default()),
        }
    }

    pub fn state(&self) -> FeedState {
        self.inner.read().state
    }

    /// Transition the state machine. A successful subscribe resets the
    /// reconnect attempt counter; the terminal state is sticky.
    pub fn set_state(&self, next: FeedState) {
        let mut inner = self.inner.write();
        let prev = inner.state;
        if prev == FeedState::ShuttingDown {
            return;
        }
        if prev != next {
            debug!(from = %prev, to = %next, "feed state transition");
        }
        if next == FeedState::Subscribed && inner.reconnect_attempts > 0 {
            info!(
                attempts = inner.reconnect_attempts,
                "feed resubscribed, resetting reconnect attempts"
            );
            inner.reconnect_attempts = 0;
        }
        inner.state = next;
    }

    /// Record one inbound application message (any type).
    pub fn record_message(&self, now_ms: i64) {
        self.inner.write().last_message_at_ms = now_ms;
    }

    pub fn record_records(&self, accepted: u64, rejected: u64) {
        let mut inner = self.inner.write();
        inner.total_records_seen += accepted;
        inner.records_rejected += rejected;
    }

    /// Count a disconnect and return the attempt number to use for backoff.
    pub fn record_disconnect(&self) -> u32 {
        let mut inner = self.inner.write();
        if inner.state != FeedState::ShuttingDown {
            inner.state = FeedState::Disconnected;
        }
        let attempts = inner.reconnect_attempts;
        inner.reconnect_attempts = inner.reconnect_attempts.saturating_add(1);
        attempts
    }

    /// Stale means: nominally subscribed, but no application message within
    /// the threshold.
    pub fn is_stale(&self, now_ms: i64, threshold: Duration) -> bool {
        let inner = self.inner.read();
        inner.state == FeedState::Subscribed
            && inner.last_message_at_ms > 0
            && now_ms - inner.last_message_at_ms > threshold.as_millis() as i64
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let inner = self.inner.read();
        HealthSnapshot {
            state: inner.state,
            last_message_at_ms: inner.last_message_at_ms,
            reconnect_attempts: inner.reconnect_attempts,
            total_records_seen: inner.total_records_seen,
            records_rejected: inner.records_rejected,
        }
    }
}

/// Decides when the stale check may force a reconnect. Fires at most once per
/// stale period: after firing, it stays quiet until a fresh message moves
/// `last_message_at_ms` forward.
#[derive(Debug, Default)]
pub struct StaleMonitor {
    fired_for_ms: i64,
}

impl StaleMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn should_force_reconnect(
        &mut self,
        health: &FeedHealth,
        now_ms: i64,
        threshold: Duration,
    ) -> bool {
        if !health.is_stale(now_ms, threshold) {
            return false;
        }
        let last = health.snapshot().last_message_at_ms;
        if last == self.fired_for_ms {
            return false;
        }
        self.fired_for_ms = last;
        true
    }
}
