//! LLM key pool: per-key failure counters and cooldown, used to spread
//! load across multiple API keys for the script-generation collaborator
//! and to ride out HTTP 429s without surfacing a stage failure.
//!
//! Built the same way as `circuit_breaker.rs`: atomics for counters, a
//! `parking_lot::RwLock` for the cooldown clock, one state per key
//! instead of one state for the whole collaborator.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::debug;

struct KeyState {
    key: String,
    failure_count: AtomicU32,
    last_failure: RwLock<Option<Instant>>,
}

/// Selects the key with the lowest failure count whose cooldown has
/// elapsed; falls back to the key that has been cooling down longest if
/// every key is still within its cooldown window.
pub struct LlmKeyPool {
    keys: Vec<KeyState>,
    cooldown: Duration,
}

impl LlmKeyPool {
    pub fn new(keys: Vec<String>, cooldown: Duration) -> Self {
        Self {
            keys: keys
                .into_iter()
                .map(|key| KeyState {
                    key,
                    failure_count: AtomicU32::new(0),
                    last_failure: RwLock::new(None),
                })
                .collect(),
            cooldown,
        }
    }

    pub fn with_default_cooldown(keys: Vec<String>) -> Self {
        Self::new(keys, Duration::from_secs(600))
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Picks the best available key, or `None` if every key is cooling
    /// down and has a nonzero failure count (the caller should surface a
    /// `CircuitBreakerOpen` error in that case).
    pub fn select(&self) -> Option<String> {
        let now = Instant::now();
        let available = self.keys.iter().filter(|k| {
            let failures = k.failure_count.load(Ordering::Relaxed);
            if failures == 0 {
                return true;
            }
            match *k.last_failure.read() {
                Some(last) => now.duration_since(last) >= self.cooldown,
                None => true,
            }
        });

        if let Some(best) = available.min_by_key(|k| k.failure_count.load(Ordering::Relaxed)) {
            return Some(best.key.clone());
        }

        // All keys cooling down: fall back to whichever failed longest ago.
        self.keys
            .iter()
            .min_by_key(|k| k.last_failure.read().map(|i| now.duration_since(i)).unwrap_or_default())
            .map(|k| k.key.clone())
    }

    /// Records the outcome of a call made with `key`.
    pub fn report(&self, key: &str, success: bool) {
        let Some(state) = self.keys.iter().find(|k| k.key == key) else {
            return;
        };

        if success {
            state.failure_count.store(0, Ordering::Relaxed);
        } else {
            let failures = state.failure_count.fetch_add(1, Ordering::Relaxed) + 1;
            *state.last_failure.write() = Some(Instant::now());
            debug!(failures, "llm key failure recorded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_key_with_fewest_failures() {
        let pool = LlmKeyPool::new(vec!["a".into(), "b".into()], Duration::from_secs(60));
        pool.report("a", false);
        assert_eq!(pool.select().as_deref(), Some("b"));
    }

    #[test]
    fn falls_back_when_all_cooling_down() {
        let pool = LlmKeyPool::new(vec!["a".into()], Duration::from_secs(600));
        pool.report("a", false);
        // still cooling down, but it's the only key
        assert_eq!(pool.select().as_deref(), Some("a"));
    }

    #[test]
    fn success_resets_failure_count() {
        let pool = LlmKeyPool::new(vec!["a".into(), "b".into()], Duration::from_secs(60));
        pool.report("a", false);
        pool.report("a", true);
        // both have zero failures now; "a" sorts first since it's stable min
        assert_eq!(pool.select().as_deref(), Some("a"));
    }
}
