// Relay health — per-relay circuit breaker
//
//   Healthy ──error──▶ Degraded ──max_error_count errors──▶ CircuitOpen
//      ▲                 │  ▲                                   │
//      └────success──────┘  └──── reconnect_delay elapsed ──────┘
//
// A relay leaving CircuitOpen keeps its error count, so one more failure
// re-opens the circuit immediately (half-open probe).

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelayState {
    Healthy,
    /// At least one recent error, still used
    Degraded,
    /// Excluded from selection until the retry timer elapses
    CircuitOpen,
}

/// Health bookkeeping for one relay. Owned by the coordinator.
#[derive(Debug, Clone)]
pub struct RelayRecord {
    pub url: String,
    pub state: RelayState,
    pub consecutive_errors: u32,
    /// Unix seconds of the last success, for reporting
    pub last_success_at: Option<u64>,
    last_success: Option<Instant>,
    last_attempt: Option<Instant>,
    next_retry: Option<Instant>,
    pub total_errors: u64,
    pub total_successes: u64,
}

/// Point-in-time view of a relay, safe to hand out
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayStatus {
    pub url: String,
    pub state: RelayState,
    pub consecutive_errors: u32,
    pub last_success_at: Option<u64>,
    /// Milliseconds until an open circuit may be retried
    pub retry_in_ms: Option<u64>,
    pub total_errors: u64,
    pub total_successes: u64,
}

impl RelayRecord {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            state: RelayState::Healthy,
            consecutive_errors: 0,
            last_success_at: None,
            last_success: None,
            last_attempt: None,
            next_retry: None,
            total_errors: 0,
            total_successes: 0,
        }
    }

    pub fn record_success(&mut self, now: Instant) {
        if self.state != RelayState::Healthy {
            info!("Relay {} recovered ({:?} -> Healthy)", self.url, self.state);
        }
        self.state = RelayState::Healthy;
        self.consecutive_errors = 0;
        self.last_success = Some(now);
        self.last_success_at = Some(crate::now_unix());
        self.last_attempt = Some(now);
        self.next_retry = None;
        self.total_successes += 1;
    }

    /// Returns true if this failure opened the circuit
    pub fn record_failure(&mut self, now: Instant, max_error_count: u32, reconnect_delay: Duration) -> bool {
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        self.total_errors += 1;
        self.last_attempt = Some(now);

        if self.consecutive_errors >= max_error_count {
            let was_open = self.state == RelayState::CircuitOpen;
            self.state = RelayState::CircuitOpen;
            self.next_retry = Some(now + reconnect_delay);
            if !was_open {
                warn!(
                    "Relay {} circuit open after {} consecutive errors, retry in {:?}",
                    self.url, self.consecutive_errors, reconnect_delay
                );
            }
            !was_open
        } else {
            self.state = RelayState::Degraded;
            false
        }
    }

    /// Whether the relay may be used at `now`, without changing state
    pub fn is_eligible(&self, now: Instant) -> bool {
        match self.state {
            RelayState::Healthy | RelayState::Degraded => true,
            RelayState::CircuitOpen => self.retry_due(now),
        }
    }

    /// Open circuit whose cooldown has passed
    pub fn retry_due(&self, now: Instant) -> bool {
        self.state == RelayState::CircuitOpen && self.next_retry.map_or(true, |at| now >= at)
    }

    /// Claim the relay for an operation at `now`.
    ///
    /// An open circuit whose cooldown has passed moves to Degraded here, so
    /// the check and the transition happen under one lock.
    pub fn try_select(&mut self, now: Instant) -> bool {
        match self.state {
            RelayState::Healthy | RelayState::Degraded => true,
            RelayState::CircuitOpen if self.retry_due(now) => {
                info!("Relay {} half-open, retrying", self.url);
                self.state = RelayState::Degraded;
                self.next_retry = None;
                true
            }
            RelayState::CircuitOpen => false,
        }
    }

    /// Ordering key for best-relay selection: newest success, then fewest errors
    pub(crate) fn selection_key(&self) -> (Option<Instant>, std::cmp::Reverse<u32>) {
        (self.last_success, std::cmp::Reverse(self.consecutive_errors))
    }

    pub fn status(&self, now: Instant) -> RelayStatus {
        RelayStatus {
            url: self.url.clone(),
            state: self.state,
            consecutive_errors: self.consecutive_errors,
            last_success_at: self.last_success_at,
            retry_in_ms: match (self.state, self.next_retry) {
                (RelayState::CircuitOpen, Some(at)) => {
                    Some(at.saturating_duration_since(now).as_millis() as u64)
                }
                _ => None,
            },
            total_errors: self.total_errors,
            total_successes: self.total_successes,
        }
    }
}
