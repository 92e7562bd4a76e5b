//! Per-endpoint circuit breaker
//!
//! ```text
//! CLOSED --(failure_threshold consecutive failures)--> OPEN
//! OPEN --(recovery timeout elapsed, next request)--> HALF_OPEN
//! HALF_OPEN --(trial succeeds)--> CLOSED
//! HALF_OPEN --(trial fails)--> OPEN
//! ```
//!
//! The state lives in an `AtomicU8` and every transition is a
//! compare-and-swap, so two concurrent requests can never both own the
//! half-open trial and the request path never waits on a lock.

use metrics::counter;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use waypoint_core::{telemetry, CircuitBreakerConfig, CircuitState};

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const HALF_OPEN: u8 = 2;

fn decode(raw: u8) -> CircuitState {
    match raw {
        OPEN => CircuitState::Open,
        HALF_OPEN => CircuitState::HalfOpen,
        _ => CircuitState::Closed,
    }
}

fn note_transition(to: CircuitState) {
    counter!(telemetry::CIRCUIT_TRANSITIONS_TOTAL, "state" => to.to_string()).increment(1);
}

/// Proof that the breaker admitted a request.
///
/// The outcome must be reported back with [`CircuitBreaker::record_success`]
/// or [`CircuitBreaker::record_failure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitPermit {
    trial: bool,
}

impl CircuitPermit {
    /// Whether this request is the single half-open trial
    pub fn is_trial(&self) -> bool {
        self.trial
    }
}

/// Circuit breaker guarding one endpoint
#[derive(Debug)]
pub struct CircuitBreaker {
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    /// Milliseconds since `epoch` at which the circuit last opened
    opened_at_ms: AtomicU64,
    failure_threshold: u32,
    recovery_timeout: Duration,
    epoch: Instant,
}

impl CircuitBreaker {
    /// Create a new breaker in the closed state
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: AtomicU8::new(CLOSED),
            consecutive_failures: AtomicU32::new(0),
            opened_at_ms: AtomicU64::new(0),
            failure_threshold: config.failure_threshold.max(1),
            recovery_timeout: config.recovery_timeout(),
            epoch: Instant::now(),
        }
    }

    /// Current state
    pub fn state(&self) -> CircuitState {
        decode(self.state.load(Ordering::Acquire))
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    pub fn recovery_timeout(&self) -> Duration {
        self.recovery_timeout
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn recovery_elapsed(&self) -> bool {
        let opened_at = self.opened_at_ms.load(Ordering::Acquire);
        self.now_ms().saturating_sub(opened_at) >= self.recovery_timeout.as_millis() as u64
    }

    /// Whether [`try_acquire`](Self::try_acquire) would currently admit a
    /// request. Does not change state.
    pub fn would_admit(&self) -> bool {
        match self.state.load(Ordering::Acquire) {
            CLOSED => true,
            OPEN => self.recovery_elapsed(),
            _ => false,
        }
    }

    /// Ask to send a request through the breaker.
    ///
    /// Returns `None` when the request must fail fast without touching the
    /// network.
    pub fn try_acquire(&self) -> Option<CircuitPermit> {
        match self.state.load(Ordering::Acquire) {
            CLOSED => Some(CircuitPermit { trial: false }),
            OPEN => {
                if !self.recovery_elapsed() {
                    return None;
                }
                match self.state.compare_exchange(
                    OPEN,
                    HALF_OPEN,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        note_transition(CircuitState::HalfOpen);
                        debug!("Circuit half-open, admitting trial request");
                        Some(CircuitPermit { trial: true })
                    }
                    Err(_) => None,
                }
            }
            _ => None,
        }
    }

    /// Report a successful request
    pub fn record_success(&self, permit: CircuitPermit) {
        if permit.trial {
            if self
                .state
                .compare_exchange(HALF_OPEN, CLOSED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.consecutive_failures.store(0, Ordering::Release);
                note_transition(CircuitState::Closed);
                info!("Circuit closed after successful trial");
            }
        } else if self.state.load(Ordering::Acquire) == CLOSED {
            self.consecutive_failures.store(0, Ordering::Release);
        }
    }

    /// Report a failed request. Returns `true` if this failure opened the circuit.
    pub fn record_failure(&self, permit: CircuitPermit) -> bool {
        if permit.trial {
            self.opened_at_ms.store(self.now_ms(), Ordering::Release);
            let reopened = self
                .state
                .compare_exchange(HALF_OPEN, OPEN, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();
            if reopened {
                note_transition(CircuitState::Open);
                warn!("Circuit re-opened after failed trial");
            }
            return reopened;
        }

        if self.state.load(Ordering::Acquire) != CLOSED {
            return false;
        }

        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures < self.failure_threshold {
            return false;
        }

        // opened_at must be visible before OPEN is, or a reader could judge
        // the recovery window against a stale timestamp.
        self.opened_at_ms.store(self.now_ms(), Ordering::Release);
        let opened = self
            .state
            .compare_exchange(CLOSED, OPEN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if opened {
            note_transition(CircuitState::Open);
            warn!(
                consecutive_failures = failures,
                recovery_timeout_ms = self.recovery_timeout.as_millis() as u64,
                "Circuit opened"
            );
        }
        opened
    }
}
