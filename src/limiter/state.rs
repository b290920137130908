use crate::limiter::{Algorithm, AlgorithmState, Decision, RateLimitKey, RemoteState};
use dashmap::DashMap;

#[derive(Debug)]
struct KeyState {
    state: AlgorithmState,
    last_seen_ms: u64,
}

/// Process-wide algorithm state, sharded by key hash.
///
/// Every operation runs under the owning shard's lock through the entry
/// API, so concurrent checks against one key are serialized while other
/// shards proceed. Nothing here awaits.
#[derive(Debug, Default)]
pub struct StateMap {
    entries: DashMap<RateLimitKey, KeyState>,
}

impl StateMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically check and consume for one key, creating state lazily.
    pub fn check(&self, key: &RateLimitKey, algorithm: &Algorithm, cost: u64, now_ms: u64) -> Decision {
        let mut entry = self.entry(key, algorithm, now_ms);
        entry.last_seen_ms = now_ms;
        algorithm.check(&mut entry.state, cost, now_ms)
    }

    pub fn peek(&self, key: &RateLimitKey, algorithm: &Algorithm, cost: u64, now_ms: u64) -> Decision {
        let mut entry = self.entry(key, algorithm, now_ms);
        algorithm.peek(&mut entry.state, cost, now_ms)
    }

    /// Merge a global view and return the resulting status.
    pub fn reconcile(
        &self,
        key: &RateLimitKey,
        algorithm: &Algorithm,
        remote: &RemoteState,
        now_ms: u64,
    ) -> Decision {
        let mut entry = self.entry(key, algorithm, now_ms);
        algorithm.reconcile(&mut entry.state, remote, now_ms);
        algorithm.peek(&mut entry.state, 1, now_ms)
    }

    /// Drop state idle for longer than `retention_ms`. Returns how many
    /// entries were removed.
    pub fn evict_idle(&self, now_ms: u64, retention_ms: u64) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now_ms.saturating_sub(entry.last_seen_ms) <= retention_ms);
        before.saturating_sub(self.entries.len())
    }

    pub fn contains(&self, key: &RateLimitKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry(
        &self,
        key: &RateLimitKey,
        algorithm: &Algorithm,
        now_ms: u64,
    ) -> dashmap::mapref::one::RefMut<'_, RateLimitKey, KeyState> {
        // get_mut first to avoid cloning the key on the hot path
        if let Some(entry) = self.entries.get_mut(key) {
            return entry;
        }
        self.entries.entry(key.clone()).or_insert_with(|| KeyState {
            state: algorithm.initial_state(now_ms),
            last_seen_ms: now_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AlgorithmKind, RateLimitConfig};
    use std::sync::Arc;

    fn fixed(capacity: u64) -> Algorithm {
        Algorithm::from_config(&RateLimitConfig {
            algorithm: AlgorithmKind::FixedWindow,
            capacity,
            window_ms: 60_000,
            ..RateLimitConfig::default()
        })
    }

    #[test]
    fn test_concurrent_checks_never_double_spend() {
        let states = Arc::new(StateMap::new());
        let algorithm = fixed(1_000);
        let key = RateLimitKey::new("tenant", "gpt-4");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let states = Arc::clone(&states);
                let algorithm = algorithm.clone();
                let key = key.clone();
                std::thread::spawn(move || {
                    (0..500)
                        .filter(|_| states.check(&key, &algorithm, 1, 10).allowed)
                        .count()
                })
            })
            .collect();

        let allowed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(allowed, 1_000);
    }

    #[test]
    fn test_keys_are_independent() {
        let states = StateMap::new();
        let algorithm = fixed(1);

        assert!(states.check(&RateLimitKey::new("a", "m"), &algorithm, 1, 0).allowed);
        assert!(states.check(&RateLimitKey::new("b", "m"), &algorithm, 1, 0).allowed);
        assert!(states.check(&RateLimitKey::new("a", "n"), &algorithm, 1, 0).allowed);
        assert!(!states.check(&RateLimitKey::new("a", "m"), &algorithm, 1, 0).allowed);
    }

    #[test]
    fn test_evict_idle() {
        let states = StateMap::new();
        let algorithm = fixed(5);
        states.check(&RateLimitKey::new("old", "m"), &algorithm, 1, 0);
        states.check(&RateLimitKey::new("new", "m"), &algorithm, 1, 9_000);

        assert_eq!(states.evict_idle(10_000, 5_000), 1);
        assert!(states.contains(&RateLimitKey::new("new", "m")));
        assert!(!states.contains(&RateLimitKey::new("old", "m")));
    }
}
