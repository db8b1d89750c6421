//! Time-boxed deduplication of processed message ids.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// Dedup window configuration.
#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// How long a key suppresses repeats.
    pub window: Duration,
    /// Maximum remembered keys; the oldest is evicted beyond this.
    pub capacity: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(300),
            capacity: 10_000,
        }
    }
}

#[derive(Debug, Default)]
struct DedupState {
    seen: HashMap<String, Instant>,
    order: VecDeque<(String, Instant)>,
}

impl DedupState {
    fn forget_front(&mut self) {
        if let Some((key, at)) = self.order.pop_front() {
            // A re-inserted key has a newer timestamp and must survive.
            if self.seen.get(&key) == Some(&at) {
                self.seen.remove(&key);
            }
        }
    }
}

/// Remembers keys for a bounded time and count.
pub struct DedupWindow {
    config: DedupConfig,
    state: Mutex<DedupState>,
}

impl DedupWindow {
    /// Create a window.
    #[must_use]
    pub fn new(config: DedupConfig) -> Self {
        Self {
            config,
            state: Mutex::new(DedupState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, DedupState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record `key`.
    ///
    /// Returns `true` the first time a key is seen within the window.
    pub fn first_sighting(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut state = self.state();

        while state
            .order
            .front()
            .is_some_and(|(_, at)| now.duration_since(*at) >= self.config.window)
        {
            state.forget_front();
        }

        if state.seen.contains_key(key) {
            trace!(key = %key, "Duplicate suppressed");
            return false;
        }

        state.seen.insert(key.to_string(), now);
        state.order.push_back((key.to_string(), now));
        while state.seen.len() > self.config.capacity {
            state.forget_front();
        }
        true
    }

    /// Number of remembered keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state().seen.len()
    }

    /// Check if nothing is remembered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget everything.
    pub fn clear(&self) {
        let mut state = self.state();
        state.seen.clear();
        state.order.clear();
    }
}

impl Default for DedupWindow {
    fn default() -> Self {
        Self::new(DedupConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_dedup_within_window() {
        let dedup = DedupWindow::new(DedupConfig {
            window: Duration::from_secs(10),
            capacity: 100,
        });

        assert!(dedup.first_sighting("pm_1"));
        assert!(!dedup.first_sighting("pm_1"));
        assert!(dedup.first_sighting("pm_2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dedup_expires() {
        let dedup = DedupWindow::new(DedupConfig {
            window: Duration::from_secs(10),
            capacity: 100,
        });

        assert!(dedup.first_sighting("pm_1"));
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(dedup.first_sighting("pm_1"));
        assert_eq!(dedup.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dedup_capacity_evicts_oldest() {
        let dedup = DedupWindow::new(DedupConfig {
            window: Duration::from_secs(60),
            capacity: 2,
        });

        assert!(dedup.first_sighting("a"));
        assert!(dedup.first_sighting("b"));
        assert!(dedup.first_sighting("c"));
        assert_eq!(dedup.len(), 2);
        // "a" was evicted, so it counts as new again.
        assert!(dedup.first_sighting("a"));
        assert!(!dedup.first_sighting("c"));
    }
}
