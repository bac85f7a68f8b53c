//! Admission control logic and window storage.

mod backend;
mod clock;
mod key;
mod limiter;
mod memory;
mod remote;
mod rules;
mod stats;
mod sweep;
mod whitelist;

pub use backend::{build_storage, Storage, StorageKind, StorageOptions};
pub use clock::{Clock, ManualClock, SystemClock};
pub use key::{normalize_path, KeyExtractor, KeyStrategy, RequestInfo, UNKNOWN_CLIENT};
pub use limiter::{
    Decision, DenyBody, FailurePolicy, LimiterConfig, RateLimiter, RateLimiterBuilder,
    DEFAULT_DENY_MESSAGE, DEFAULT_DENY_STATUS,
};
pub use memory::{MemoryStore, DEFAULT_SWEEP_WORKERS};
pub use remote::{RedisStore, DEFAULT_KEY_PREFIX};
pub use rules::{LimitRule, RuleSet, WhitelistPredicate, WILDCARD};
pub use stats::{Stats, StatsSnapshot};
pub use sweep::SweepReport;
pub use whitelist::Whitelist;
