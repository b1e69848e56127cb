//! Core rate limiter implementation.

use http::HeaderMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use super::clock::Clock;
use super::identity::ClientId;
use super::key::RateLimitKey;
use super::memory::MemoryStore;
use super::policy::{PolicyRegistry, RateLimitPolicy};
use super::redis_store::{RedisStore, RedisStoreConfig};
use super::store::{CounterSnapshot, CounterStore};
use crate::config::StoreConfig;

/// Which store produced the count behind a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// The shared store; the count is global across instances
    Shared,
    /// The in-process store; the count covers this process only
    Local,
}

/// The outcome of one admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    /// Ceiling of the policy that applied
    pub limit: u64,
    pub remaining: u64,
    /// Epoch milliseconds at which the window closes
    pub reset_at_ms: u64,
    /// Whole seconds to wait, only set on denial
    pub retry_after_secs: Option<u64>,
    pub backend: Backend,
}

impl Decision {
    /// Increment-then-compare: the request that pushes the count past the
    /// ceiling has been counted and is the one rejected.
    fn evaluate(
        policy: RateLimitPolicy,
        snapshot: CounterSnapshot,
        now_ms: u64,
        backend: Backend,
    ) -> Self {
        let ttl_ms = snapshot.ttl_remaining.as_millis() as u64;
        let reset_at_ms = now_ms.saturating_add(ttl_ms);

        if snapshot.count <= policy.max_requests {
            Self {
                allowed: true,
                limit: policy.max_requests,
                remaining: policy.max_requests - snapshot.count,
                reset_at_ms,
                retry_after_secs: None,
                backend,
            }
        } else {
            Self {
                allowed: false,
                limit: policy.max_requests,
                remaining: 0,
                reset_at_ms,
                retry_after_secs: Some(ttl_ms.div_ceil(1000).max(1)),
                backend,
            }
        }
    }
}

/// Counters of limiter activity since startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LimiterStats {
    pub shared_decisions: u64,
    pub fallback_decisions: u64,
    pub store_errors: u64,
    pub denied: u64,
}

#[derive(Debug, Default)]
struct AtomicStats {
    shared_decisions: AtomicU64,
    fallback_decisions: AtomicU64,
    store_errors: AtomicU64,
    denied: AtomicU64,
}

/// The rate limiter: resolves identity and policy, counts, decides.
///
/// Counts go to the primary (shared) store when one is configured. Any error
/// from it is logged and the same request is counted in the in-process store
/// instead, so callers always get a decision.
pub struct RateLimiter {
    /// Shared store, if configured
    primary: Option<Arc<dyn CounterStore>>,
    /// In-process store used when the primary is absent or failing
    fallback: Arc<MemoryStore>,
    policies: RwLock<PolicyRegistry>,
    clock: Arc<dyn Clock>,
    /// Skip the primary for this long after it fails
    outage_backoff: Option<Duration>,
    /// Epoch ms before which the primary is skipped; 0 when healthy
    primary_down_until: AtomicU64,
    stats: AtomicStats,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("primary", &self.primary.as_ref().map(|s| s.name()))
            .field("fallback_entries", &self.fallback.len())
            .field("outage_backoff", &self.outage_backoff)
            .finish()
    }
}

impl RateLimiter {
    /// Create a local-only limiter. Time is read from the fallback store's clock.
    pub fn new(policies: PolicyRegistry, fallback: Arc<MemoryStore>) -> Self {
        let clock = Arc::clone(fallback.clock());
        Self {
            primary: None,
            fallback,
            policies: RwLock::new(policies),
            clock,
            outage_backoff: None,
            primary_down_until: AtomicU64::new(0),
            stats: AtomicStats::default(),
        }
    }

    /// Use `store` as the primary (shared) counter store.
    pub fn with_primary(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.primary = Some(store);
        self
    }

    /// After a primary failure, go straight to the fallback for `backoff`.
    pub fn with_outage_backoff(mut self, backoff: Duration) -> Self {
        self.outage_backoff = Some(backoff);
        self
    }

    /// Build a limiter from service configuration.
    ///
    /// A missing or placeholder URL gives a permanently local limiter; so does
    /// a URL Redis cannot parse.
    pub fn from_config(
        store: &StoreConfig,
        policies: PolicyRegistry,
        fallback: Arc<MemoryStore>,
    ) -> Self {
        let mut limiter = Self::new(policies, fallback);
        if let Some(backoff) = store.outage_backoff() {
            limiter = limiter.with_outage_backoff(backoff);
        }

        let Some(redis_config) = RedisStoreConfig::from_store_config(store) else {
            info!("No shared store configured; rate limits are enforced per process");
            return limiter;
        };

        match RedisStore::open(redis_config) {
            Ok(redis) => {
                info!("Using Redis as the shared counter store");
                limiter.with_primary(Arc::new(redis))
            }
            Err(e) => {
                warn!(error = %e, "Shared store misconfigured; rate limits are enforced per process");
                limiter
            }
        }
    }

    /// Check the rate limit for a request to `endpoint`.
    pub async fn check_limit(&self, headers: &HeaderMap, endpoint: &str) -> Decision {
        let client = ClientId::from_headers(headers);
        self.decide(&client, endpoint).await
    }

    /// Count one request from `client` to `endpoint` and decide on it.
    pub async fn decide(&self, client: &ClientId, endpoint: &str) -> Decision {
        let policy = self.policies.read().resolve(endpoint);
        let key = RateLimitKey::new(endpoint, client);

        trace!(
            key = %key,
            max_requests = policy.max_requests,
            window_ms = policy.window.as_millis() as u64,
            "Checking rate limit"
        );

        let (snapshot, backend) = self.increment(&key, policy.window).await;
        let decision = Decision::evaluate(policy, snapshot, self.clock.now_ms(), backend);

        if !decision.allowed {
            self.stats.denied.fetch_add(1, Ordering::Relaxed);
            debug!(
                key = %key,
                count = snapshot.count,
                limit = policy.max_requests,
                backend = ?backend,
                "Rate limit exceeded"
            );
        }

        decision
    }

    async fn increment(&self, key: &RateLimitKey, window: Duration) -> (CounterSnapshot, Backend) {
        if let Some(primary) = self.available_primary() {
            match primary.increment(key, window).await {
                Ok(snapshot) => {
                    self.primary_down_until.store(0, Ordering::Relaxed);
                    self.stats.shared_decisions.fetch_add(1, Ordering::Relaxed);
                    return (snapshot, Backend::Shared);
                }
                Err(e) => {
                    self.stats.store_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        store = primary.name(),
                        key = %key,
                        error = %e,
                        "Shared counter store failed; counting in process memory"
                    );
                    self.note_primary_failure();
                }
            }
        }

        self.stats.fallback_decisions.fetch_add(1, Ordering::Relaxed);
        (self.fallback.increment_local(key, window), Backend::Local)
    }

    fn available_primary(&self) -> Option<&Arc<dyn CounterStore>> {
        let primary = self.primary.as_ref()?;
        let down_until = self.primary_down_until.load(Ordering::Relaxed);
        if down_until != 0 && self.clock.now_ms() < down_until {
            return None;
        }
        Some(primary)
    }

    fn note_primary_failure(&self) {
        if let Some(backoff) = self.outage_backoff {
            let until = self
                .clock
                .now_ms()
                .saturating_add(backoff.as_millis() as u64);
            self.primary_down_until.store(until, Ordering::Relaxed);
        }
    }

    /// Replace the policy table.
    pub fn set_policies(&self, policies: PolicyRegistry) {
        *self.policies.write() = policies;
    }

    /// The policy that applies to `endpoint`.
    pub fn policy_for(&self, endpoint: &str) -> RateLimitPolicy {
        self.policies.read().resolve(endpoint)
    }

    /// The in-process store, for sweeping.
    pub fn fallback(&self) -> &Arc<MemoryStore> {
        &self.fallback
    }

    pub fn has_shared_store(&self) -> bool {
        self.primary.is_some()
    }

    pub fn stats(&self) -> LimiterStats {
        LimiterStats {
            shared_decisions: self.stats.shared_decisions.load(Ordering::Relaxed),
            fallback_decisions: self.stats.fallback_decisions.load(Ordering::Relaxed),
            store_errors: self.stats.store_errors.load(Ordering::Relaxed),
            denied: self.stats.denied.load(Ordering::Relaxed),
        }
    }

    /// Release the shared store connection. Safe to call more than once.
    pub async fn close(&self) {
        if let Some(primary) = &self.primary {
            primary.close().await;
        }
    }
}
