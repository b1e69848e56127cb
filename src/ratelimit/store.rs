//! Counter store trait for abstracting shared and in-process implementations.

use async_trait::async_trait;
use std::time::Duration;

use super::key::RateLimitKey;
use crate::error::StoreError;

/// State of a counter right after it was incremented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    /// Requests counted in the current window, including this one
    pub count: u64,
    /// Time until the window closes
    pub ttl_remaining: Duration,
}

/// Trait for counter store implementations.
///
/// `increment` must be atomic with respect to concurrent callers on the same
/// key. The first increment of a key opens a window of length `window`; later
/// increments in that window leave its end untouched.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment the counter for `key` and report the new count.
    async fn increment(
        &self,
        key: &RateLimitKey,
        window: Duration,
    ) -> Result<CounterSnapshot, StoreError>;

    /// Release any connection held by the store. Safe to call repeatedly.
    async fn close(&self) {}

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}

/// A store that fails every call.
///
/// Stands in for an unreachable shared store when exercising the fallback path.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableStore;

#[async_trait]
impl CounterStore for UnavailableStore {
    async fn increment(
        &self,
        _key: &RateLimitKey,
        _window: Duration,
    ) -> Result<CounterSnapshot, StoreError> {
        Err(StoreError::Unavailable("store is always down".to_string()))
    }

    fn name(&self) -> &'static str {
        "unavailable"
    }
}
