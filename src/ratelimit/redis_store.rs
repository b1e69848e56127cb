//! Shared counter store backed by Redis.
//!
//! Counters are shared by every instance pointed at the same Redis. The
//! connection is opened on first use and cached; a connection-class failure
//! drops the cached handle so the next call dials again.

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::{Client, RedisError, Script};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use super::key::RateLimitKey;
use super::store::{CounterSnapshot, CounterStore};
use crate::config::StoreConfig;
use crate::error::StoreError;

/// INCR, and on the 0 -> 1 transition attach the window as expiry, in one
/// atomic step. Returns `{count, pttl}`.
const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return {count, redis.call('PTTL', KEYS[1])}
"#;

/// Settings for a Redis store.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Connection URL, e.g. `redis://127.0.0.1:6379/0`
    pub url: String,
    /// Namespace prepended to every key
    pub key_prefix: String,
    /// Bound on the connection handshake
    pub connect_timeout: Duration,
    /// Bound on each increment round trip
    pub command_timeout: Duration,
}

impl RedisStoreConfig {
    pub fn new(url: impl Into<String>) -> Self {
        let defaults = StoreConfig::default();
        Self {
            url: url.into(),
            key_prefix: defaults.key_prefix.clone(),
            connect_timeout: defaults.connect_timeout(),
            command_timeout: defaults.command_timeout(),
        }
    }

    /// Build from service configuration. `None` when no shared store is configured.
    pub fn from_store_config(config: &StoreConfig) -> Option<Self> {
        let url = config.shared_store_url()?;
        Some(Self {
            url: url.to_string(),
            key_prefix: config.key_prefix.clone(),
            connect_timeout: config.connect_timeout(),
            command_timeout: config.command_timeout(),
        })
    }
}

/// The Redis-backed counter store.
pub struct RedisStore {
    client: Client,
    config: RedisStoreConfig,
    script: Script,
    /// Lazily opened, shared by all callers.
    connection: Mutex<Option<MultiplexedConnection>>,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("key_prefix", &self.config.key_prefix)
            .field("connect_timeout", &self.config.connect_timeout)
            .field("command_timeout", &self.config.command_timeout)
            .finish()
    }
}

impl RedisStore {
    /// Create a store. Only the URL is checked here; no connection is made.
    pub fn open(config: RedisStoreConfig) -> Result<Self, StoreError> {
        let client = Client::open(config.url.as_str())
            .map_err(|e| StoreError::Connection(format!("invalid Redis URL: {}", e)))?;

        debug!(
            key_prefix = %config.key_prefix,
            connect_timeout_ms = config.connect_timeout.as_millis() as u64,
            command_timeout_ms = config.command_timeout.as_millis() as u64,
            "Redis counter store created"
        );

        Ok(Self {
            client,
            script: Script::new(INCREMENT_SCRIPT),
            config,
            connection: Mutex::new(None),
        })
    }

    /// Whether a connection handle is currently cached.
    pub fn is_connected(&self) -> bool {
        self.connection.lock().is_some()
    }

    /// The cached connection, opening one if needed.
    ///
    /// The slot is never locked across the handshake, so each caller waits at
    /// most one `connect_timeout`. Callers racing on an empty slot each dial;
    /// the first handle stored wins and the others are dropped.
    async fn connection(&self) -> Result<MultiplexedConnection, StoreError> {
        let cached = self.connection.lock().clone();
        if let Some(conn) = cached {
            return Ok(conn);
        }

        let conn = with_timeout(
            self.config.connect_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await?
        .map_err(|e| StoreError::Connection(e.to_string()))?;

        let mut slot = self.connection.lock();
        if let Some(existing) = slot.as_ref() {
            return Ok(existing.clone());
        }
        info!("Connected to Redis counter store");
        *slot = Some(conn.clone());
        Ok(conn)
    }

    /// Drop the cached handle so the next call reconnects.
    fn discard_connection(&self) {
        if self.connection.lock().take().is_some() {
            debug!("Discarded Redis connection handle");
        }
    }

    async fn run_increment(
        &self,
        key: &str,
        window: Duration,
    ) -> Result<CounterSnapshot, StoreError> {
        let mut conn = self.connection().await?;
        let window_ms = window.as_millis().max(1) as u64;

        let (count, pttl): (u64, i64) = with_timeout(
            self.config.command_timeout,
            self.script.key(key).arg(window_ms).invoke_async(&mut conn),
        )
        .await??;

        // -1/-2 cannot follow the script above; report the full window if they do.
        let ttl_remaining = if pttl >= 0 {
            Duration::from_millis(pttl as u64)
        } else {
            window
        };

        Ok(CounterSnapshot {
            count,
            ttl_remaining,
        })
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn increment(
        &self,
        key: &RateLimitKey,
        window: Duration,
    ) -> Result<CounterSnapshot, StoreError> {
        let store_key = key.to_store_key(&self.config.key_prefix);

        match self.run_increment(&store_key, window).await {
            Ok(snapshot) => {
                trace!(
                    key = %store_key,
                    count = snapshot.count,
                    ttl_ms = snapshot.ttl_remaining.as_millis() as u64,
                    "Incremented shared counter"
                );
                Ok(snapshot)
            }
            Err(e) => {
                if drops_connection(&e) {
                    self.discard_connection();
                }
                Err(e)
            }
        }
    }

    async fn close(&self) {
        if self.connection.lock().take().is_some() {
            info!("Closed Redis counter store connection");
        }
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

/// Whether an error means the cached connection should not be reused.
fn drops_connection(err: &StoreError) -> bool {
    match err {
        StoreError::Connection(_) | StoreError::Timeout(_) => true,
        StoreError::Command(e) => is_connection_error(e),
        StoreError::Unavailable(_) => false,
    }
}

fn is_connection_error(err: &RedisError) -> bool {
    err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout()
}

async fn with_timeout<F, T>(limit: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(limit, fut).await.map_err(|_| {
        warn!(timeout_ms = limit.as_millis() as u64, "Redis operation timed out");
        StoreError::Timeout(limit)
    })
}
