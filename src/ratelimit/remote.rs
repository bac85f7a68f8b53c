//! Redis sorted-set sliding window store.
//!
//! Each limiter key maps to one sorted set whose scores are admission times in
//! epoch milliseconds. Every check runs one server-side script so trimming,
//! insertion, expiry and counting happen atomically for that key.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::{ConnectionLike, MultiplexedConnection};
use redis::{Client, RedisResult, Script};
use tracing::{trace, warn};
use uuid::Uuid;

use super::backend::{Storage, StorageKind};
use super::clock::{Clock, SystemClock};
use super::memory::window_millis;
use crate::error::Result;

/// Default prefix for every key written to Redis.
pub const DEFAULT_KEY_PREFIX: &str = "turnstile:";

// KEYS[1] = window set
// ARGV[1] = now (ms), ARGV[2] = exclusive trim bound or "" for lifetime
// ARGV[3] = expiry (ms) or 0, ARGV[4] = limit, ARGV[5] = member
//
// The new member is inserted before counting, so the count includes the
// current request. It is removed again when that puts the set over the limit.
const ADMIT_SCRIPT: &str = r#"
local key = KEYS[1]
if ARGV[2] ~= "" then
  redis.call('ZREMRANGEBYSCORE', key, '-inf', ARGV[2])
end
redis.call('ZADD', key, ARGV[1], ARGV[5])
if tonumber(ARGV[3]) > 0 then
  redis.call('PEXPIRE', key, ARGV[3])
end
local count = redis.call('ZCARD', key)
if count > tonumber(ARGV[4]) then
  redis.call('ZREM', key, ARGV[5])
end
return count
"#;

/// Sliding window store on Redis sorted sets.
///
/// Sets expire after twice their window in case trimming is ever skipped.
/// Operational failures surface as errors; the caller decides whether that
/// admits or rejects.
pub struct RedisStore {
    client: Client,
    connection: Mutex<Option<MultiplexedConnection>>,
    script: Script,
    clock: Arc<dyn Clock>,
    key_prefix: String,
    /// Random per-store tag so members from different nodes never collide.
    instance: String,
    /// Disambiguates members this store writes in the same millisecond.
    sequence: AtomicU64,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("key_prefix", &self.key_prefix)
            .field("instance", &self.instance)
            .finish()
    }
}

impl RedisStore {
    /// Create a store on `client` using the wall clock.
    pub fn new(client: Client) -> Self {
        Self::with_clock(client, Arc::new(SystemClock))
    }

    /// Create a store reading time from `clock`.
    pub fn with_clock(client: Client, clock: Arc<dyn Clock>) -> Self {
        Self {
            client,
            connection: Mutex::new(None),
            script: Script::new(ADMIT_SCRIPT),
            clock,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            instance: Uuid::new_v4().simple().to_string(),
            sequence: AtomicU64::new(0),
        }
    }

    /// Open a client for `url` and wrap it.
    pub fn open(url: &str) -> Result<Self> {
        Ok(Self::new(Client::open(url)?))
    }

    /// Use a different key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// The Redis key backing limiter key `key`.
    pub fn redis_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        let cached = self.connection.lock().clone();
        if let Some(conn) = cached {
            return Ok(conn);
        }
        let conn = self.client.get_multiplexed_async_connection().await?;
        *self.connection.lock() = Some(conn.clone());
        Ok(conn)
    }

    fn drop_connection(&self) {
        self.connection.lock().take();
    }

    fn next_member(&self, now: u64) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}-{}", now, self.instance, seq)
    }

    /// Run the admission script for a positive `limit` on `conn`.
    async fn admit<C>(
        &self,
        conn: &mut C,
        key: &str,
        limit: i64,
        window: Duration,
    ) -> RedisResult<bool>
    where
        C: ConnectionLike + Send,
    {
        let window_ms = window_millis(window);
        let now = self.clock.now_millis();
        let redis_key = self.redis_key(key);
        let member = self.next_member(now);

        let count: u64 = self
            .script
            .key(&redis_key)
            .arg(now)
            .arg(trim_bound(now, window_ms))
            .arg(expiry_millis(window_ms))
            .arg(limit)
            .arg(&member)
            .invoke_async(conn)
            .await?;

        let admitted = count <= limit.unsigned_abs();
        trace!(key = %redis_key, count, limit, admitted, "Checked remote window");
        Ok(admitted)
    }
}

/// Exclusive lower trim bound in Redis range syntax, empty for lifetime windows.
fn trim_bound(now: u64, window_ms: u64) -> String {
    if window_ms == 0 {
        String::new()
    } else {
        format!("({}", now.saturating_sub(window_ms))
    }
}

/// Key expiry for a window, capped at the largest value `PEXPIRE` accepts.
fn expiry_millis(window_ms: u64) -> u64 {
    window_ms.saturating_mul(2).min(i64::MAX as u64)
}

#[async_trait]
impl Storage for RedisStore {
    async fn allow(&self, key: &str, limit: i64, window: Duration) -> Result<bool> {
        if limit < 0 {
            return Ok(true);
        }
        if limit == 0 {
            return Ok(false);
        }

        let mut conn = self.connection().await?;
        match self.admit(&mut conn, key, limit, window).await {
            Ok(admitted) => Ok(admitted),
            Err(e) => {
                warn!(key = %self.redis_key(key), error = %e, "Remote window check failed");
                self.drop_connection();
                Err(e.into())
            }
        }
    }

    fn kind(&self) -> StorageKind {
        StorageKind::Remote
    }
}
