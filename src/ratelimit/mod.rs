//! Rate limiting logic and counter stores.

mod clock;
mod identity;
mod janitor;
mod key;
mod limiter;
mod memory;
mod policy;
mod redis_store;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use identity::{ClientId, FORWARDED_FOR, REAL_IP, UNKNOWN_CLIENT};
pub use janitor::Janitor;
pub use key::RateLimitKey;
pub use limiter::{Backend, Decision, LimiterStats, RateLimiter};
pub use memory::{CounterEntry, MemoryStore};
pub use policy::{PolicyRegistry, PolicyRule, PolicyTable, RateLimitPolicy};
pub use redis_store::{RedisStore, RedisStoreConfig};
pub use store::{CounterSnapshot, CounterStore, UnavailableStore};
