use crate::limiter::{Decision, LimitAlgorithm, RemoteState};

/// Bucket of `capacity` tokens refilled continuously at `refill_per_ms`.
/// A capacity above the steady rate is what allows bursts.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenBucket {
    capacity: u64,
    refill_per_ms: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TokenBucketState {
    pub tokens: f64,
    pub last_refill_ms: u64,
}

impl TokenBucket {
    pub fn new(capacity: u64, refill_per_ms: f64) -> Self {
        Self {
            capacity,
            refill_per_ms: refill_per_ms.max(f64::MIN_POSITIVE),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// `tokens = min(capacity, tokens + elapsed * rate)`. Time never runs
    /// backwards for the bucket.
    fn refill(&self, state: &mut TokenBucketState, now_ms: u64) {
        if now_ms <= state.last_refill_ms {
            return;
        }
        let elapsed = (now_ms - state.last_refill_ms) as f64;
        state.tokens = (state.tokens + elapsed * self.refill_per_ms).min(self.capacity as f64);
        state.last_refill_ms = now_ms;
    }

    fn ms_until(&self, tokens: f64, wanted: f64) -> u64 {
        if tokens >= wanted {
            return 0;
        }
        ((wanted - tokens) / self.refill_per_ms).ceil() as u64
    }

    fn decide(&self, state: &TokenBucketState, cost: u64) -> Decision {
        let cost_f = cost as f64;
        let reset_after = self.ms_until(state.tokens, self.capacity as f64);

        if state.tokens >= cost_f {
            let after = state.tokens - cost_f;
            Decision::allow(
                self.capacity,
                after.floor() as u64,
                self.ms_until(after, self.capacity as f64),
            )
        } else {
            let retry_after = if cost > self.capacity {
                // Never satisfiable; point at a full bucket.
                reset_after
            } else {
                self.ms_until(state.tokens, cost_f)
            };
            Decision::deny(self.capacity, state.tokens.floor() as u64, retry_after, reset_after)
        }
    }
}

impl LimitAlgorithm for TokenBucket {
    type State = TokenBucketState;

    fn initial_state(&self, now_ms: u64) -> TokenBucketState {
        TokenBucketState {
            tokens: self.capacity as f64,
            last_refill_ms: now_ms,
        }
    }

    fn check(&self, state: &mut TokenBucketState, cost: u64, now_ms: u64) -> Decision {
        self.refill(state, now_ms);
        let decision = self.decide(state, cost);
        if decision.allowed {
            state.tokens = (state.tokens - cost as f64).max(0.0);
        }
        decision
    }

    fn peek(&self, state: &mut TokenBucketState, cost: u64, now_ms: u64) -> Decision {
        self.refill(state, now_ms);
        self.decide(state, cost)
    }

    fn reconcile(&self, state: &mut TokenBucketState, remote: &RemoteState, now_ms: u64) {
        self.refill(state, now_ms);
        if let RemoteState::Bucket { tokens, .. } = *remote {
            state.tokens = state.tokens.min(tokens.clamp(0.0, self.capacity as f64));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_then_refill() {
        // capacity 10, one token per 100ms
        let bucket = TokenBucket::new(10, 0.01);
        let mut state = bucket.initial_state(0);

        for _ in 0..10 {
            assert!(bucket.check(&mut state, 1, 0).allowed);
        }
        let denied = bucket.check(&mut state, 1, 0);
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after_ms, 100);

        let allowed_after_idle = (0..6).filter(|_| bucket.check(&mut state, 1, 500).allowed).count();
        assert_eq!(allowed_after_idle, 5);
    }

    #[test]
    fn test_refill_never_exceeds_capacity() {
        let bucket = TokenBucket::new(10, 0.01);
        let mut state = bucket.initial_state(0);
        bucket.check(&mut state, 4, 0);

        bucket.peek(&mut state, 0, 200);
        assert!((state.tokens - 8.0).abs() < 1e-9);

        bucket.peek(&mut state, 0, 1_000_000);
        assert_eq!(state.tokens, 10.0);
    }

    #[test]
    fn test_tokens_never_negative() {
        let bucket = TokenBucket::new(5, 0.001);
        let mut state = bucket.initial_state(0);
        assert!(!bucket.check(&mut state, 6, 0).allowed);
        assert!(bucket.check(&mut state, 5, 0).allowed);
        assert!(!bucket.check(&mut state, 1, 0).allowed);
        assert!(state.tokens >= 0.0);
    }

    #[test]
    fn test_reconcile_takes_lower_tokens() {
        let bucket = TokenBucket::new(10, 0.01);
        let mut state = bucket.initial_state(0);

        let remote = RemoteState::Bucket {
            tokens: 3.0,
            last_refill_ms: 0,
            exceeded: false,
        };
        bucket.reconcile(&mut state, &remote, 0);
        assert_eq!(state.tokens, 3.0);

        let overfull = RemoteState::Bucket {
            tokens: 50.0,
            last_refill_ms: 0,
            exceeded: false,
        };
        bucket.reconcile(&mut state, &overfull, 0);
        assert_eq!(state.tokens, 3.0);
    }
}
