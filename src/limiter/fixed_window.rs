use crate::limiter::{window_start, Decision, LimitAlgorithm, RemoteState};

/// Counter per wall-clock-aligned window.
#[derive(Debug, Clone, PartialEq)]
pub struct FixedWindow {
    limit: u64,
    window_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedWindowState {
    pub window_start: u64,
    pub count: u64,
}

impl FixedWindow {
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

    /// Move to the window containing `now_ms`. Boundaries never move back,
    /// so a clock step backwards keeps counting in the newer window.
    fn roll(&self, state: &mut FixedWindowState, now_ms: u64) {
        let start = window_start(now_ms, self.window_ms);
        if start > state.window_start {
            state.window_start = start;
            state.count = 0;
        }
    }

    fn reset_after(&self, state: &FixedWindowState, now_ms: u64) -> u64 {
        (state.window_start + self.window_ms).saturating_sub(now_ms)
    }

    fn decide(&self, state: &FixedWindowState, cost: u64, now_ms: u64) -> Decision {
        let reset_after = self.reset_after(state, now_ms);
        let remaining = self.limit.saturating_sub(state.count);

        if state.count.saturating_add(cost) <= self.limit {
            Decision::allow(self.limit, remaining - cost, reset_after)
        } else {
            Decision::deny(self.limit, remaining, reset_after, reset_after)
        }
    }
}

impl LimitAlgorithm for FixedWindow {
    type State = FixedWindowState;

    fn initial_state(&self, now_ms: u64) -> FixedWindowState {
        FixedWindowState {
            window_start: window_start(now_ms, self.window_ms),
            count: 0,
        }
    }

    fn check(&self, state: &mut FixedWindowState, cost: u64, now_ms: u64) -> Decision {
        self.roll(state, now_ms);
        let decision = self.decide(state, cost, now_ms);
        if decision.allowed {
            state.count += cost;
        }
        decision
    }

    fn peek(&self, state: &mut FixedWindowState, cost: u64, now_ms: u64) -> Decision {
        self.roll(state, now_ms);
        self.decide(state, cost, now_ms)
    }

    fn reconcile(&self, state: &mut FixedWindowState, remote: &RemoteState, now_ms: u64) {
        self.roll(state, now_ms);
        if let RemoteState::Window {
            window_start,
            current,
            ..
        } = *remote
        {
            if window_start > state.window_start {
                state.window_start = window_start;
                state.count = current;
            } else if window_start == state.window_start {
                state.count = state.count.max(current);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_five_of_seven_instantaneous_requests() {
        let limiter = FixedWindow::new(5, 1_000);
        let now = 10_250;
        let mut state = limiter.initial_state(now);

        let decisions: Vec<Decision> = (0..7).map(|_| limiter.check(&mut state, 1, now)).collect();

        assert!(decisions[..5].iter().all(|d| d.allowed));
        assert!(decisions[5..].iter().all(|d| !d.allowed));
        assert_eq!(decisions[4].remaining, 0);
        // Window [10_000, 11_000) has 750ms left.
        assert_eq!(decisions[5].retry_after_ms, 750);
    }

    #[test]
    fn test_at_most_capacity_per_window() {
        let limiter = FixedWindow::new(3, 100);
        let mut state = limiter.initial_state(0);

        let mut allowed_per_window = std::collections::HashMap::new();
        for now in (0..1_000).step_by(7) {
            if limiter.check(&mut state, 1, now).allowed {
                *allowed_per_window.entry(now / 100).or_insert(0u64) += 1;
            }
        }

        assert!(allowed_per_window.values().all(|&n| n <= 3));
        assert_eq!(allowed_per_window.len(), 10);
    }

    #[test]
    fn test_window_boundary_resets() {
        let limiter = FixedWindow::new(1, 1_000);
        let mut state = limiter.initial_state(500);

        assert!(limiter.check(&mut state, 1, 500).allowed);
        assert!(!limiter.check(&mut state, 1, 999).allowed);
        assert!(limiter.check(&mut state, 1, 1_000).allowed);
    }

    #[test]
    fn test_boundary_never_moves_back() {
        let limiter = FixedWindow::new(2, 1_000);
        let mut state = limiter.initial_state(2_000);
        limiter.check(&mut state, 2, 2_000);

        assert!(!limiter.check(&mut state, 1, 1_500).allowed);
        assert_eq!(state.window_start, 2_000);
    }

    #[test]
    fn test_reconcile_takes_larger_count() {
        let limiter = FixedWindow::new(10, 1_000);
        let mut state = limiter.initial_state(0);
        limiter.check(&mut state, 2, 0);

        let remote = RemoteState::Window {
            window_start: 0,
            current: 7,
            previous: 0,
            exceeded: false,
        };
        limiter.reconcile(&mut state, &remote, 10);
        assert_eq!(state.count, 7);

        let stale = RemoteState::Window {
            window_start: 0,
            current: 3,
            previous: 0,
            exceeded: false,
        };
        limiter.reconcile(&mut state, &stale, 20);
        assert_eq!(state.count, 7);
    }
}
