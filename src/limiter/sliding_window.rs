//! Weighted two-window approximation of a sliding window.
//!
//! The previous window's count is weighted by the share of it that still
//! overlaps a window-length lookback ending now. This is an approximation
//! (it assumes the previous window's requests were evenly spread), not an
//! exact sliding log.

use crate::limiter::{window_start, Decision, LimitAlgorithm, RemoteState};

#[derive(Debug, Clone, PartialEq)]
pub struct SlidingWindow {
    limit: u64,
    window_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlidingWindowState {
    pub window_start: u64,
    pub current: u64,
    pub previous: u64,
}

impl SlidingWindow {
    pub fn new(limit: u64, window_ms: u64) -> Self {
        Self {
            limit,
            window_ms: window_ms.max(1),
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    fn roll(&self, state: &mut SlidingWindowState, now_ms: u64) {
        let start = window_start(now_ms, self.window_ms);
        if start <= state.window_start {
            return;
        }

        if start == state.window_start + self.window_ms {
            state.previous = state.current;
        } else {
            state.previous = 0;
        }
        state.current = 0;
        state.window_start = start;
    }

    /// Share of the previous window still inside the lookback, in [0, 1].
    fn previous_weight(&self, state: &SlidingWindowState, now_ms: u64) -> f64 {
        let elapsed = now_ms.saturating_sub(state.window_start).min(self.window_ms);
        1.0 - elapsed as f64 / self.window_ms as f64
    }

    /// Blended count used for admission.
    pub fn effective_count(&self, state: &SlidingWindowState, now_ms: u64) -> f64 {
        state.previous as f64 * self.previous_weight(state, now_ms) + state.current as f64
    }

    /// How long until `cost` more would fit, assuming no further traffic.
    fn retry_after(&self, state: &SlidingWindowState, cost: u64, now_ms: u64) -> u64 {
        let elapsed = now_ms.saturating_sub(state.window_start);
        let to_boundary = self.window_ms.saturating_sub(elapsed);
        let headroom = self.limit as f64 - state.current as f64 - cost as f64;

        if headroom >= 0.0 && state.previous > 0 {
            // previous * (1 - t / W) <= headroom
            let needed = self.window_ms as f64 * (1.0 - headroom / state.previous as f64);
            let wait = (needed.ceil() as u64).saturating_sub(elapsed);
            return wait.min(to_boundary).max(1);
        }

        // The current window alone is too full; after the boundary it
        // becomes the previous window and decays from there.
        let current = state.current as f64;
        let spare = self.limit as f64 - cost as f64;
        if current > 0.0 && spare >= 0.0 && spare < current {
            let into_next = self.window_ms as f64 * (1.0 - spare / current);
            return to_boundary + into_next.ceil() as u64;
        }
        to_boundary.max(1)
    }

    fn decide(&self, state: &SlidingWindowState, cost: u64, now_ms: u64) -> Decision {
        let effective = self.effective_count(state, now_ms);
        let remaining = (self.limit as f64 - effective).max(0.0).floor() as u64;
        let reset_after = (state.window_start + self.window_ms).saturating_sub(now_ms);

        if effective + cost as f64 <= self.limit as f64 {
            Decision::allow(self.limit, remaining.saturating_sub(cost), reset_after)
        } else {
            Decision::deny(
                self.limit,
                remaining,
                self.retry_after(state, cost, now_ms),
                reset_after,
            )
        }
    }
}

impl LimitAlgorithm for SlidingWindow {
    type State = SlidingWindowState;

    fn initial_state(&self, now_ms: u64) -> SlidingWindowState {
        SlidingWindowState {
            window_start: window_start(now_ms, self.window_ms),
            current: 0,
            previous: 0,
        }
    }

    fn check(&self, state: &mut SlidingWindowState, cost: u64, now_ms: u64) -> Decision {
        self.roll(state, now_ms);
        let decision = self.decide(state, cost, now_ms);
        if decision.allowed {
            state.current += cost;
        }
        decision
    }

    fn peek(&self, state: &mut SlidingWindowState, cost: u64, now_ms: u64) -> Decision {
        self.roll(state, now_ms);
        self.decide(state, cost, now_ms)
    }

    fn reconcile(&self, state: &mut SlidingWindowState, remote: &RemoteState, now_ms: u64) {
        self.roll(state, now_ms);
        if let RemoteState::Window {
            window_start,
            current,
            previous,
            ..
        } = *remote
        {
            if window_start > state.window_start {
                state.window_start = window_start;
                state.current = current;
                state.previous = previous;
            } else if window_start == state.window_start {
                state.current = state.current.max(current);
                state.previous = state.previous.max(previous);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_count_is_continuous_across_boundary() {
        let limiter = SlidingWindow::new(100, 1_000);
        let mut state = limiter.initial_state(0);
        for t in 0..40 {
            limiter.check(&mut state, 1, t * 20);
        }

        let before = limiter.effective_count(&state, 999);
        limiter.peek(&mut state, 0, 1_000);
        let after = limiter.effective_count(&state, 1_000);

        assert_eq!(state.previous, 40);
        assert!((before - after).abs() <= 1.0, "jump from {} to {}", before, after);
    }

    #[test]
    fn test_effective_count_decays_smoothly() {
        let limiter = SlidingWindow::new(100, 1_000);
        let mut state = SlidingWindowState {
            window_start: 1_000,
            current: 0,
            previous: 50,
        };

        let mut last = f64::MAX;
        for now in (1_000..2_000).step_by(100) {
            let effective = limiter.effective_count(&state, now);
            assert!(effective < last);
            assert!(last == f64::MAX || last - effective <= 5.0 + 1e-9);
            last = effective;
        }
        limiter.peek(&mut state, 0, 1_500);
        assert!((limiter.effective_count(&state, 1_500) - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_previous_window_limits_new_window() {
        let limiter = SlidingWindow::new(10, 1_000);
        let mut state = limiter.initial_state(0);
        for _ in 0..10 {
            assert!(limiter.check(&mut state, 1, 900).allowed);
        }

        // At 1_100 the previous window still weighs 0.9 * 10 = 9.
        assert!(limiter.check(&mut state, 1, 1_100).allowed);
        let denied = limiter.check(&mut state, 1, 1_100);
        assert!(!denied.allowed);
        assert!(denied.retry_after_ms > 0);

        // By 1_600 the weight is 0.4, leaving room for the second request.
        assert!(limiter.check(&mut state, 1, 1_600).allowed);
    }

    #[test]
    fn test_skipped_window_clears_previous() {
        let limiter = SlidingWindow::new(5, 1_000);
        let mut state = limiter.initial_state(0);
        limiter.check(&mut state, 5, 0);

        limiter.peek(&mut state, 0, 3_500);
        assert_eq!(state.previous, 0);
        assert_eq!(state.current, 0);
    }
}
