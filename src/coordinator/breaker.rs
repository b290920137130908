//! Circuit breaker around shared-store calls, lock-free on atomics.

use crate::clock::Clock;
use crate::config::BreakerConfig;
use crate::metrics;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Store calls go through.
    Closed,
    /// Store calls are short-circuited until the recovery timeout elapses.
    Open,
    /// A limited number of trial calls test whether the store recovered.
    HalfOpen,
}

impl CircuitState {
    fn to_u8(self) -> u8 {
        match self {
            CircuitState::Closed => STATE_CLOSED,
            CircuitState::Open => STATE_OPEN,
            CircuitState::HalfOpen => STATE_HALF_OPEN,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: AtomicU8,
    failure_count: AtomicUsize,
    opened_at_millis: AtomicU64,
    half_open_calls: AtomicUsize,
}

/// Clones share the same state.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: Arc<BreakerState>,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        metrics::set_breaker_state(STATE_CLOSED as i64);
        Self {
            state: Arc::new(BreakerState {
                state: AtomicU8::new(STATE_CLOSED),
                failure_count: AtomicUsize::new(0),
                opened_at_millis: AtomicU64::new(0),
                half_open_calls: AtomicUsize::new(0),
            }),
            config,
            clock,
        }
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.state.load(Ordering::Acquire))
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Open and still inside the recovery timeout, so no trial call would be let through.
    pub fn short_circuits(&self) -> bool {
        if self.state() != CircuitState::Open {
            return false;
        }
        let opened_at = self.state.opened_at_millis.load(Ordering::Acquire);
        self.clock.now_millis().saturating_sub(opened_at) < self.config.recovery_timeout_ms
    }

    /// Permit for a store call, if one may go out now. Moves Open to
    /// HalfOpen once the recovery timeout elapsed.
    pub fn try_acquire(&self) -> Option<BreakerPermit<'_>> {
        loop {
            match self.state() {
                CircuitState::Closed => return Some(BreakerPermit::new(self, false)),
                CircuitState::Open => {
                    let opened_at = self.state.opened_at_millis.load(Ordering::Acquire);
                    let elapsed = self.clock.now_millis().saturating_sub(opened_at);
                    if elapsed < self.config.recovery_timeout_ms {
                        return None;
                    }

                    match self.state.state.compare_exchange(
                        STATE_OPEN,
                        STATE_HALF_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            tracing::info!("Circuit breaker → half-open");
                            metrics::set_breaker_state(STATE_HALF_OPEN as i64);
                            self.state.half_open_calls.store(1, Ordering::Release);
                            return Some(BreakerPermit::new(self, true));
                        }
                        // Someone else moved it; look again
                        Err(_) => continue,
                    }
                }
                CircuitState::HalfOpen => {
                    let current = self.state.half_open_calls.fetch_add(1, Ordering::AcqRel);
                    if current >= self.config.half_open_max_calls {
                        self.state.half_open_calls.fetch_sub(1, Ordering::Release);
                        return None;
                    }
                    return Some(BreakerPermit::new(self, true));
                }
            }
        }
    }

    /// Permit for a call the breaker does not gate but whose outcome still
    /// feeds its failure count.
    pub fn observe(&self) -> BreakerPermit<'_> {
        BreakerPermit::new(self, false)
    }

    /// Give back a half-open trial slot whose call never reported back.
    fn release_trial(&self, opened_at_millis: u64) {
        if self.state() != CircuitState::HalfOpen
            || self.state.opened_at_millis.load(Ordering::Acquire) != opened_at_millis
        {
            return;
        }
        let _ = self
            .state
            .half_open_calls
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        tracing::debug!("Half-open trial abandoned; slot released");
    }

    /// Consecutive failures only: any success in Closed resets the count.
    pub fn record_success(&self) {
        match self.state() {
            CircuitState::HalfOpen => {
                if self
                    .state
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_CLOSED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.state.half_open_calls.store(0, Ordering::Release);
                    self.state.failure_count.store(0, Ordering::Release);
                    self.state.opened_at_millis.store(0, Ordering::Release);
                    metrics::set_breaker_state(STATE_CLOSED as i64);
                    tracing::info!("Circuit breaker → closed");
                }
            }
            CircuitState::Closed => {
                self.state.failure_count.store(0, Ordering::Release);
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let failures = self.state.failure_count.fetch_add(1, Ordering::AcqRel) + 1;

        match self.state() {
            CircuitState::HalfOpen => {
                if self
                    .state
                    .state
                    .compare_exchange(STATE_HALF_OPEN, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.open();
                    tracing::warn!("Circuit breaker → open (half-open trial failed)");
                }
            }
            CircuitState::Closed if failures >= self.config.failure_threshold => {
                if self
                    .state
                    .state
                    .compare_exchange(STATE_CLOSED, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.open();
                    tracing::warn!(failures, "Circuit breaker → open");
                }
            }
            _ => {}
        }
    }

    fn open(&self) {
        self.state
            .opened_at_millis
            .store(self.clock.now_millis(), Ordering::Release);
        self.state.half_open_calls.store(0, Ordering::Release);
        metrics::set_breaker_state(STATE_OPEN as i64);
    }
}

/// One admitted store call. Report the outcome with `record_success` or
/// `record_failure`; a permit dropped without either (the call was
/// cancelled) frees its half-open trial slot.
#[must_use]
#[derive(Debug)]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    opened_at_millis: u64,
    settled: bool,
}

impl<'a> BreakerPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            opened_at_millis: breaker.state.opened_at_millis.load(Ordering::Acquire),
            settled: false,
        }
    }

    pub fn record_success(mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    pub fn record_failure(mut self) {
        self.settled = true;
        self.breaker.record_failure();
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.breaker.release_trial(self.opened_at_millis);
        }
    }
}
