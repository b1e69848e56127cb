//! Periodic sweep of expired in-process counters.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::memory::MemoryStore;

/// Handle to the background sweep task.
#[derive(Debug)]
pub struct Janitor {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Janitor {
    /// Sweep `store` every `interval` until stopped.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(store: Arc<MemoryStore>, interval: Duration) -> Self {
        let (stop_tx, mut stop_rx) = watch::channel(false);

        info!(interval_ms = interval.as_millis() as u64, "Starting counter janitor");

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // the first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = store.sweep();
                        if removed > 0 {
                            debug!(removed, remaining = store.len(), "Swept expired counters");
                        }
                    }
                    _ = stop_rx.changed() => break,
                }
            }
        });

        Self { stop_tx, handle }
    }

    /// Whether the sweep task has exited, normally or not.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop the sweep task and wait for it to finish.
    ///
    /// A task that panicked is reported at warn rather than propagated.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        match self.handle.await {
            Ok(()) => info!("Counter janitor stopped"),
            Err(e) => warn!(error = %e, "Counter janitor task failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::{Clock, ManualClock};
    use crate::ratelimit::identity::ClientId;
    use crate::ratelimit::key::RateLimitKey;

    #[tokio::test]
    async fn test_janitor_sweeps_expired_entries() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));

        let stale = RateLimitKey::new("/x", &ClientId::new("stale"));
        let live = RateLimitKey::new("/x", &ClientId::new("live"));
        store.increment_local(&stale, Duration::from_secs(1));
        store.increment_local(&live, Duration::from_secs(600));
        clock.advance(Duration::from_secs(2));

        let janitor = Janitor::spawn(Arc::clone(&store), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(100)).await;
        janitor.stop().await;

        assert_eq!(store.len(), 1);
        assert!(store.get(&live).is_some());
    }

    #[derive(Debug)]
    struct BrokenClock;

    impl Clock for BrokenClock {
        fn now_ms(&self) -> u64 {
            panic!("clock unavailable");
        }
    }

    #[tokio::test]
    async fn test_janitor_panic_is_contained_on_stop() {
        let store = Arc::new(MemoryStore::with_clock(Arc::new(BrokenClock)));
        let janitor = Janitor::spawn(store, Duration::from_millis(10));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(janitor.is_finished());

        tokio::time::timeout(Duration::from_secs(1), janitor.stop())
            .await
            .expect("janitor did not stop");
    }

    #[tokio::test]
    async fn test_janitor_stops_promptly() {
        let store = Arc::new(MemoryStore::new());
        let janitor = Janitor::spawn(store, Duration::from_secs(3600));

        tokio::time::timeout(Duration::from_secs(1), janitor.stop())
            .await
            .expect("janitor did not stop");
    }
}
