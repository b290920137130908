pub mod fixed_window;
pub mod hybrid;
pub mod sliding_window;
pub mod state;
pub mod token_bucket;

use crate::config::{AlgorithmKind, RateLimitConfig};
use async_trait::async_trait;
use std::fmt;

pub use fixed_window::{FixedWindow, FixedWindowState};
pub use hybrid::HybridLimiter;
pub use sliding_window::{SlidingWindow, SlidingWindowState};
pub use state::StateMap;
pub use token_bucket::{TokenBucket, TokenBucketState};

/// One independent limiting domain: caller identity plus resolved model.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    pub tenant: String,
    pub model: String,
}

impl RateLimitKey {
    pub fn new(tenant: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            model: model.into(),
        }
    }

    /// Shared-store key prefix. The braces form a cluster hash tag so every
    /// key of one limiting domain lands in the same slot.
    pub fn store_prefix(&self) -> String {
        format!("rl:{{{}:{}}}", self.model, self.tenant)
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant, self.model)
    }
}

/// Result of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,

    /// Effective limit (capacity plus burst)
    pub limit: u64,

    /// Remaining quota after this decision
    pub remaining: u64,

    /// Time until a retry could succeed; zero when allowed
    pub retry_after_ms: u64,

    /// Time until the window resets or the bucket is full again
    pub reset_after_ms: u64,
}

impl Decision {
    pub fn allow(limit: u64, remaining: u64, reset_after_ms: u64) -> Self {
        Self {
            allowed: true,
            limit,
            remaining,
            retry_after_ms: 0,
            reset_after_ms,
        }
    }

    pub fn deny(limit: u64, remaining: u64, retry_after_ms: u64, reset_after_ms: u64) -> Self {
        Self {
            allowed: false,
            limit,
            remaining,
            retry_after_ms: retry_after_ms.max(1),
            reset_after_ms,
        }
    }
}

/// Admitted cost not yet pushed to the shared store, tagged with the
/// counter slot it was admitted in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotDelta {
    pub slot: u64,
    pub cost: u64,
}

impl SlotDelta {
    pub fn new(slot: u64, cost: u64) -> Self {
        Self { slot, cost }
    }
}

/// Global counter view returned by the shared store
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RemoteState {
    Window {
        window_start: u64,
        current: u64,
        previous: u64,
        exceeded: bool,
    },
    Bucket {
        tokens: f64,
        last_refill_ms: u64,
        exceeded: bool,
    },
}

impl RemoteState {
    /// True when the global view shows more admitted than the limit allows.
    pub fn exceeded(&self) -> bool {
        match self {
            RemoteState::Window { exceeded, .. } | RemoteState::Bucket { exceeded, .. } => *exceeded,
        }
    }
}

/// Per-key mutable algorithm state
#[derive(Debug, Clone, PartialEq)]
pub enum AlgorithmState {
    FixedWindow(FixedWindowState),
    SlidingWindow(SlidingWindowState),
    TokenBucket(TokenBucketState),
}

/// A limiting algorithm over its own state type.
pub trait LimitAlgorithm {
    type State;

    fn initial_state(&self, now_ms: u64) -> Self::State;

    /// Consume `cost` if allowed.
    fn check(&self, state: &mut Self::State, cost: u64, now_ms: u64) -> Decision;

    /// What `check` would answer, without consuming.
    fn peek(&self, state: &mut Self::State, cost: u64, now_ms: u64) -> Decision;

    /// Merge the global view into local state. Counts only ever grow and
    /// tokens only ever shrink through reconciliation.
    fn reconcile(&self, state: &mut Self::State, remote: &RemoteState, now_ms: u64);
}

/// Algorithm selected per model, dispatched once per request.
#[derive(Debug, Clone, PartialEq)]
pub enum Algorithm {
    FixedWindow(FixedWindow),
    SlidingWindow(SlidingWindow),
    TokenBucket(TokenBucket),
}

impl Algorithm {
    pub fn from_config(config: &RateLimitConfig) -> Self {
        match config.algorithm {
            AlgorithmKind::FixedWindow => {
                Algorithm::FixedWindow(FixedWindow::new(config.limit(), config.window_ms))
            }
            AlgorithmKind::SlidingWindow => {
                Algorithm::SlidingWindow(SlidingWindow::new(config.limit(), config.window_ms))
            }
            AlgorithmKind::TokenBucket => {
                Algorithm::TokenBucket(TokenBucket::new(config.limit(), config.refill_per_ms()))
            }
        }
    }

    pub fn kind(&self) -> AlgorithmKind {
        match self {
            Algorithm::FixedWindow(_) => AlgorithmKind::FixedWindow,
            Algorithm::SlidingWindow(_) => AlgorithmKind::SlidingWindow,
            Algorithm::TokenBucket(_) => AlgorithmKind::TokenBucket,
        }
    }

    pub fn limit(&self) -> u64 {
        match self {
            Algorithm::FixedWindow(a) => a.limit(),
            Algorithm::SlidingWindow(a) => a.limit(),
            Algorithm::TokenBucket(a) => a.capacity(),
        }
    }

    /// Store counter a cost admitted at `now_ms` is charged to: the window
    /// start for the window algorithms. Buckets have a single counter.
    pub fn slot(&self, now_ms: u64) -> u64 {
        match self {
            Algorithm::FixedWindow(a) => window_start(now_ms, a.window_ms()),
            Algorithm::SlidingWindow(a) => window_start(now_ms, a.window_ms()),
            Algorithm::TokenBucket(_) => 0,
        }
    }

    pub fn initial_state(&self, now_ms: u64) -> AlgorithmState {
        match self {
            Algorithm::FixedWindow(a) => AlgorithmState::FixedWindow(a.initial_state(now_ms)),
            Algorithm::SlidingWindow(a) => AlgorithmState::SlidingWindow(a.initial_state(now_ms)),
            Algorithm::TokenBucket(a) => AlgorithmState::TokenBucket(a.initial_state(now_ms)),
        }
    }

    pub fn check(&self, state: &mut AlgorithmState, cost: u64, now_ms: u64) -> Decision {
        self.ensure_state(state, now_ms);
        match (self, state) {
            (Algorithm::FixedWindow(a), AlgorithmState::FixedWindow(s)) => a.check(s, cost, now_ms),
            (Algorithm::SlidingWindow(a), AlgorithmState::SlidingWindow(s)) => a.check(s, cost, now_ms),
            (Algorithm::TokenBucket(a), AlgorithmState::TokenBucket(s)) => a.check(s, cost, now_ms),
            _ => unreachable!("state variant matched by ensure_state"),
        }
    }

    pub fn peek(&self, state: &mut AlgorithmState, cost: u64, now_ms: u64) -> Decision {
        self.ensure_state(state, now_ms);
        match (self, state) {
            (Algorithm::FixedWindow(a), AlgorithmState::FixedWindow(s)) => a.peek(s, cost, now_ms),
            (Algorithm::SlidingWindow(a), AlgorithmState::SlidingWindow(s)) => a.peek(s, cost, now_ms),
            (Algorithm::TokenBucket(a), AlgorithmState::TokenBucket(s)) => a.peek(s, cost, now_ms),
            _ => unreachable!("state variant matched by ensure_state"),
        }
    }

    pub fn reconcile(&self, state: &mut AlgorithmState, remote: &RemoteState, now_ms: u64) {
        self.ensure_state(state, now_ms);
        match (self, state) {
            (Algorithm::FixedWindow(a), AlgorithmState::FixedWindow(s)) => a.reconcile(s, remote, now_ms),
            (Algorithm::SlidingWindow(a), AlgorithmState::SlidingWindow(s)) => {
                a.reconcile(s, remote, now_ms)
            }
            (Algorithm::TokenBucket(a), AlgorithmState::TokenBucket(s)) => a.reconcile(s, remote, now_ms),
            _ => unreachable!("state variant matched by ensure_state"),
        }
    }

    /// A hot reload may switch a model to another algorithm; its old state
    /// is discarded.
    fn ensure_state(&self, state: &mut AlgorithmState, now_ms: u64) {
        let matches = matches!(
            (self, &*state),
            (Algorithm::FixedWindow(_), AlgorithmState::FixedWindow(_))
                | (Algorithm::SlidingWindow(_), AlgorithmState::SlidingWindow(_))
                | (Algorithm::TokenBucket(_), AlgorithmState::TokenBucket(_))
        );
        if !matches {
            *state = self.initial_state(now_ms);
        }
    }
}

/// Start of the wall-clock-aligned window containing `now_ms`.
pub(crate) fn window_start(now_ms: u64, window_ms: u64) -> u64 {
    now_ms - now_ms % window_ms.max(1)
}

/// Admission engine contract
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Check if a request is allowed and consume `cost` if so
    async fn check(&self, key: &RateLimitKey, cost: u64) -> Decision;

    /// Current status without consuming
    async fn status(&self, key: &RateLimitKey) -> Decision;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_resets_state_on_algorithm_change() {
        let fixed = Algorithm::from_config(&RateLimitConfig {
            algorithm: AlgorithmKind::FixedWindow,
            capacity: 2,
            window_ms: 1_000,
            ..RateLimitConfig::default()
        });
        let bucket = Algorithm::from_config(&RateLimitConfig {
            algorithm: AlgorithmKind::TokenBucket,
            capacity: 3,
            refill_rate: Some(1.0),
            ..RateLimitConfig::default()
        });

        let mut state = fixed.initial_state(0);
        assert!(fixed.check(&mut state, 2, 0).allowed);
        assert!(!fixed.check(&mut state, 1, 0).allowed);

        let decision = bucket.check(&mut state, 1, 0);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 2);
        assert!(matches!(state, AlgorithmState::TokenBucket(_)));
    }

    #[test]
    fn test_store_prefix_uses_hash_tag() {
        let key = RateLimitKey::new("acme", "gpt-4");
        assert_eq!(key.store_prefix(), "rl:{gpt-4:acme}");
    }
}
