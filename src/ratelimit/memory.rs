//! In-process counter store.
//!
//! Counters live in a `DashMap`; the shard lock held by `entry()` makes each
//! increment atomic within the process. Nothing is shared across processes, so
//! with several instances each one enforces its own ceiling.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

use super::clock::{Clock, SystemClock};
use super::key::RateLimitKey;
use super::store::{CounterSnapshot, CounterStore};
use crate::error::StoreError;

/// A fixed-window counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterEntry {
    /// Requests seen in the window
    pub count: u64,
    /// Epoch milliseconds at which the window closes
    pub reset_at_ms: u64,
}

impl CounterEntry {
    fn fresh(now_ms: u64, window: Duration) -> Self {
        Self {
            count: 1,
            reset_at_ms: now_ms.saturating_add(window.as_millis() as u64),
        }
    }

    /// Expired strictly after `reset_at_ms`.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms > self.reset_at_ms
    }
}

/// A key to counter map with lazy window expiry.
#[derive(Debug)]
pub struct MemoryStore {
    entries: DashMap<RateLimitKey, CounterEntry>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create a store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Increment the counter for `key`, opening a new window if the previous
    /// one has expired.
    pub fn increment_local(&self, key: &RateLimitKey, window: Duration) -> CounterSnapshot {
        let now = self.clock.now_ms();

        let mut entry = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| CounterEntry {
                count: 0,
                reset_at_ms: now.saturating_add(window.as_millis() as u64),
            });

        if entry.is_expired(now) {
            *entry = CounterEntry::fresh(now, window);
        } else {
            entry.count += 1;
        }

        let snapshot = CounterSnapshot {
            count: entry.count,
            ttl_remaining: Duration::from_millis(entry.reset_at_ms.saturating_sub(now)),
        };

        trace!(
            key = %key,
            count = snapshot.count,
            ttl_ms = snapshot.ttl_remaining.as_millis() as u64,
            "Incremented local counter"
        );

        snapshot
    }

    /// The live counter for a key, if any.
    pub fn get(&self, key: &RateLimitKey) -> Option<CounterEntry> {
        let now = self.clock.now_ms();
        self.entries
            .get(key)
            .map(|entry| *entry)
            .filter(|entry| !entry.is_expired(now))
    }

    /// Remove every entry whose window closed before `now_ms`.
    ///
    /// Returns the number of entries removed.
    pub fn sweep_expired(&self, now_ms: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now_ms));
        before.saturating_sub(self.entries.len())
    }

    /// Sweep against the store's own clock.
    pub fn sweep(&self) -> usize {
        self.sweep_expired(self.clock.now_ms())
    }

    /// Number of entries, expired or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop all counters.
    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment(
        &self,
        key: &RateLimitKey,
        window: Duration,
    ) -> Result<CounterSnapshot, StoreError> {
        Ok(self.increment_local(key, window))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::identity::ClientId;

    const WINDOW: Duration = Duration::from_secs(60);

    fn store_at(start_ms: u64) -> (Arc<ManualClock>, MemoryStore) {
        let clock = Arc::new(ManualClock::new(start_ms));
        let store = MemoryStore::with_clock(clock.clone());
        (clock, store)
    }

    fn key(client: &str) -> RateLimitKey {
        RateLimitKey::new("/api/upload", &ClientId::new(client))
    }

    #[test]
    fn test_first_increment_opens_window() {
        let (_clock, store) = store_at(1_000);

        let snapshot = store.increment_local(&key("a"), WINDOW);
        assert_eq!(snapshot.count, 1);
        assert_eq!(snapshot.ttl_remaining, WINDOW);

        let entry = store.get(&key("a")).unwrap();
        assert_eq!(entry.reset_at_ms, 61_000);
    }

    #[test]
    fn test_increments_do_not_slide_window() {
        let (clock, store) = store_at(0);

        store.increment_local(&key("a"), WINDOW);
        clock.advance(Duration::from_secs(20));
        let snapshot = store.increment_local(&key("a"), WINDOW);

        assert_eq!(snapshot.count, 2);
        assert_eq!(snapshot.ttl_remaining, Duration::from_secs(40));
        assert_eq!(store.get(&key("a")).unwrap().reset_at_ms, 60_000);
    }

    #[test]
    fn test_expired_window_restarts() {
        let (clock, store) = store_at(0);

        for _ in 0..7 {
            store.increment_local(&key("a"), WINDOW);
        }

        // still live exactly at reset_at
        clock.set(60_000);
        assert_eq!(store.increment_local(&key("a"), WINDOW).count, 8);

        clock.set(60_001);
        let snapshot = store.increment_local(&key("a"), WINDOW);
        assert_eq!(snapshot.count, 1);
        assert_eq!(snapshot.ttl_remaining, WINDOW);
    }

    #[test]
    fn test_colon_in_endpoint_does_not_share_counter() {
        let (_clock, store) = store_at(0);

        let a = RateLimitKey::new("/a:b", &ClientId::new("c"));
        let b = RateLimitKey::new("/a", &ClientId::new("b:c"));
        store.increment_local(&a, WINDOW);
        let snapshot = store.increment_local(&b, WINDOW);

        assert_eq!(snapshot.count, 1);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_keys_are_independent() {
        let (_clock, store) = store_at(0);

        store.increment_local(&key("a"), WINDOW);
        store.increment_local(&key("a"), WINDOW);
        let b = store.increment_local(&key("b"), WINDOW);

        assert_eq!(b.count, 1);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let (clock, store) = store_at(0);

        store.increment_local(&key("old"), Duration::from_secs(1));
        store.increment_local(&key("new"), WINDOW);

        clock.advance(Duration::from_secs(2));
        assert_eq!(store.sweep(), 1);
        assert_eq!(store.len(), 1);
        assert!(store.get(&key("old")).is_none());
        assert!(store.get(&key("new")).is_some());
    }

    #[test]
    fn test_trait_increment_never_fails() {
        let (_clock, store) = store_at(0);
        let snapshot = tokio_test::block_on(store.increment(&key("a"), WINDOW)).unwrap();
        assert_eq!(snapshot.count, 1);
        assert_eq!(store.name(), "memory");
    }

    #[tokio::test]
    async fn test_parallel_increments_are_exact() {
        let (_clock, store) = store_at(0);
        let store = Arc::new(store);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::task::spawn_blocking(move || {
                    for _ in 0..250 {
                        store.increment_local(&key("shared"), WINDOW);
                    }
                })
            })
            .collect();

        for result in futures::future::join_all(handles).await {
            result.unwrap();
        }

        assert_eq!(store.get(&key("shared")).unwrap().count, 2_000);
    }
}
