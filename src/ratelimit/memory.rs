//! Sharded in-process sliding window store.
//!
//! Keys are spread over a power-of-two number of shards by FNV-1a hash. Each
//! shard owns its own lock and its own key to timestamp-list map, so unrelated
//! keys rarely contend. Expired keys are removed by a background sweep (see
//! [`super::sweep`]), never on the request path.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::trace;

use super::backend::{Storage, StorageKind};
use super::clock::{Clock, SystemClock};
use super::sweep::{SweepReport, Sweeper};
use crate::error::Result;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Default number of sweep workers, independent of shard count.
pub const DEFAULT_SWEEP_WORKERS: usize = 4;

/// 64-bit FNV-1a.
fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, &b| {
        (hash ^ u64::from(b)).wrapping_mul(FNV_PRIME)
    })
}

/// Window length in milliseconds; zero means "never expires".
pub(crate) fn window_millis(window: Duration) -> u64 {
    if window.is_zero() {
        return 0;
    }
    u64::try_from(window.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Oldest timestamp still inside the window, or `None` for lifetime quotas.
fn cutoff(now: u64, window_ms: u64) -> Option<u64> {
    (window_ms > 0).then(|| now.saturating_sub(window_ms))
}

fn is_valid(ts: u64, cutoff: Option<u64>) -> bool {
    cutoff.map_or(true, |c| ts >= c)
}

/// Admitted timestamps for one key.
#[derive(Debug, Default)]
pub(crate) struct WindowEntry {
    /// Non-decreasing admission times in epoch millis.
    timestamps: VecDeque<u64>,
    /// Window last used with this key, so the sweep knows what "expired" means.
    window_ms: u64,
}

impl WindowEntry {
    fn new(window_ms: u64) -> Self {
        Self {
            timestamps: VecDeque::new(),
            window_ms,
        }
    }

    fn push(&mut self, now: u64) {
        let ts = self.timestamps.back().map_or(now, |&last| last.max(now));
        self.timestamps.push_back(ts);
    }

    /// Drop timestamps that fell out of the window. Returns how many went.
    pub(crate) fn compact(&mut self, now: u64) -> usize {
        let Some(cutoff) = cutoff(now, self.window_ms) else {
            return 0;
        };
        let stale = self.timestamps.partition_point(|&ts| ts < cutoff);
        self.timestamps.drain(..stale);
        stale
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

/// One lock-protected partition of the key space.
#[derive(Debug, Default)]
pub(crate) struct Shard {
    pub(crate) entries: RwLock<HashMap<String, WindowEntry>>,
}

/// Sharded memory store.
///
/// Operations on the same key are serialized by its shard's write lock, so
/// concurrent callers can never admit more than `limit` requests per window.
pub struct MemoryStore {
    shards: Arc<Vec<Shard>>,
    mask: usize,
    clock: Arc<dyn Clock>,
    /// Epoch millis of the last sweep dispatch.
    last_cleanup: AtomicU64,
    sweeper: Sweeper,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("shards", &self.shards.len())
            .field("last_cleanup", &self.last_cleanup.load(Ordering::Relaxed))
            .finish()
    }
}

impl MemoryStore {
    /// Create a store with `shard_count` shards (rounded up to a power of two).
    pub fn new(shard_count: usize) -> Self {
        Self::with_clock(shard_count, Arc::new(SystemClock))
    }

    /// Create a store reading time from `clock`.
    pub fn with_clock(shard_count: usize, clock: Arc<dyn Clock>) -> Self {
        let count = shard_count.max(1).next_power_of_two();
        let shards: Arc<Vec<Shard>> = Arc::new((0..count).map(|_| Shard::default()).collect());
        let now = clock.now_millis();

        Self {
            sweeper: Sweeper::new(shards.clone(), clock.clone(), DEFAULT_SWEEP_WORKERS),
            shards,
            mask: count - 1,
            clock,
            last_cleanup: AtomicU64::new(now),
        }
    }

    /// Override the sweep worker pool size.
    pub fn with_sweep_workers(mut self, workers: usize) -> Self {
        self.sweeper = Sweeper::new(self.shards.clone(), self.clock.clone(), workers);
        self
    }

    /// Number of shards actually allocated.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Number of keys currently tracked across all shards.
    pub fn key_count(&self) -> usize {
        self.shards.iter().map(|s| s.entries.read().len()).sum()
    }

    /// Run a full sweep now and wait for it.
    pub async fn sweep_now(&self) -> Result<SweepReport> {
        self.last_cleanup
            .store(self.clock.now_millis(), Ordering::Release);
        self.sweeper.run().await
    }

    fn shard_index(&self, key: &str) -> usize {
        (fnv1a(key.as_bytes()) as usize) & self.mask
    }

    /// Synchronous admission check, see [`Storage::allow`].
    pub fn check(&self, key: &str, limit: i64, window: Duration) -> bool {
        if limit < 0 {
            return true;
        }
        if limit == 0 {
            return false;
        }
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);
        let window_ms = window_millis(window);
        let now = self.clock.now_millis();

        self.maybe_schedule_sweep(now, window_ms);

        let index = self.shard_index(key);
        let shard = &self.shards[index];

        // Only the newest `limit` timestamps can matter for the decision.
        let recent: Option<Vec<u64>> = {
            let entries = shard.entries.read();
            entries
                .get(key)
                .map(|e| e.timestamps.iter().rev().take(limit).copied().collect())
        };

        if let Some(recent) = recent {
            let cutoff = cutoff(now, window_ms);
            let valid = recent.iter().filter(|&&ts| is_valid(ts, cutoff)).count();
            if valid >= limit {
                trace!(key = %key, shard = index, valid, limit, "Rejected on read path");
                return false;
            }
        }

        // The write-locked pass is authoritative.
        let mut entries = shard.entries.write();
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| WindowEntry::new(window_ms));
        entry.window_ms = window_ms;
        entry.compact(now);

        let admitted = entry.timestamps.len() < limit;
        if admitted {
            entry.push(now);
        }

        trace!(
            key = %key,
            shard = index,
            count = entry.timestamps.len(),
            limit,
            admitted,
            "Checked memory window"
        );
        admitted
    }

    /// Dispatch a background sweep once more than half a window has passed
    /// since the last one. Exactly one caller wins the race, and nothing is
    /// dispatched while an earlier sweep is still running.
    fn maybe_schedule_sweep(&self, now: u64, window_ms: u64) -> bool {
        if window_ms == 0 {
            return false;
        }
        let last = self.last_cleanup.load(Ordering::Acquire);
        if now.saturating_sub(last) <= window_ms / 2 {
            return false;
        }
        self.last_cleanup
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
            && self.sweeper.trigger()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(16)
    }
}

#[async_trait]
impl Storage for MemoryStore {
    async fn allow(&self, key: &str, limit: i64, window: Duration) -> Result<bool> {
        Ok(self.check(key, limit, window))
    }

    fn kind(&self) -> StorageKind {
        StorageKind::Memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use std::sync::atomic::AtomicUsize;

    const SECOND: Duration = Duration::from_secs(1);

    fn store_at(shards: usize, start: u64) -> (MemoryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start));
        (MemoryStore::with_clock(shards, clock.clone()), clock)
    }

    #[test]
    fn test_fnv1a_known_vectors() {
        assert_eq!(fnv1a(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a(b"a"), 0xaf63_dc4c_8601_ec8c);
    }

    #[test]
    fn test_shard_count_rounds_to_power_of_two() {
        assert_eq!(MemoryStore::new(0).shard_count(), 1);
        assert_eq!(MemoryStore::new(1).shard_count(), 1);
        assert_eq!(MemoryStore::new(5).shard_count(), 8);
        assert_eq!(MemoryStore::new(16).shard_count(), 16);
    }

    #[test]
    fn test_window_millis() {
        assert_eq!(window_millis(Duration::ZERO), 0);
        assert_eq!(window_millis(Duration::from_micros(10)), 1);
        assert_eq!(window_millis(SECOND), 1_000);
    }

    #[test]
    fn test_first_n_admitted_then_rejected() {
        let (store, _clock) = store_at(4, 10_000);

        for i in 0..5 {
            assert!(store.check("k", 5, SECOND), "request {} should pass", i + 1);
        }
        assert!(!store.check("k", 5, SECOND));
        assert!(!store.check("k", 5, SECOND));
    }

    #[test]
    fn test_unlimited_always_admits() {
        let (store, _clock) = store_at(1, 0);
        for _ in 0..1_000 {
            assert!(store.check("k", -1, SECOND));
        }
        assert_eq!(store.key_count(), 0);
    }

    #[test]
    fn test_closed_always_rejects() {
        let (store, _clock) = store_at(1, 0);
        assert!(!store.check("k", 0, SECOND));
        assert!(!store.check("k", 0, Duration::ZERO));
    }

    #[test]
    fn test_zero_window_is_lifetime_quota() {
        let (store, clock) = store_at(1, 0);

        assert!(store.check("k", 2, Duration::ZERO));
        assert!(store.check("k", 2, Duration::ZERO));
        assert!(!store.check("k", 2, Duration::ZERO));

        clock.advance_millis(365 * 24 * 3_600 * 1_000);
        assert!(!store.check("k", 2, Duration::ZERO));
    }

    #[test]
    fn test_sliding_window_scenario() {
        let (store, clock) = store_at(1, 0);

        assert!(store.check("k", 3, SECOND));
        clock.set_millis(50);
        assert!(store.check("k", 3, SECOND));
        clock.set_millis(100);
        assert!(store.check("k", 3, SECOND));
        clock.set_millis(200);
        assert!(!store.check("k", 3, SECOND));
        clock.set_millis(1_100);
        assert!(store.check("k", 3, SECOND));
    }

    #[test]
    fn test_window_resets_after_idle() {
        let (store, clock) = store_at(8, 5_000);

        for _ in 0..3 {
            assert!(store.check("k", 3, SECOND));
        }
        assert!(!store.check("k", 3, SECOND));

        clock.advance_millis(1_001);
        assert!(store.check("k", 3, SECOND));
    }

    #[test]
    fn test_rejections_do_not_consume_quota() {
        let (store, clock) = store_at(1, 0);

        assert!(store.check("k", 1, SECOND));
        for _ in 0..10 {
            clock.advance_millis(10);
            assert!(!store.check("k", 1, SECOND));
        }

        // Only the admitted request at t=0 counts.
        clock.set_millis(1_001);
        assert!(store.check("k", 1, SECOND));
    }

    #[test]
    fn test_keys_are_independent() {
        let (store, _clock) = store_at(2, 0);

        assert!(store.check("a", 1, SECOND));
        assert!(!store.check("a", 1, SECOND));
        assert!(store.check("b", 1, SECOND));
        assert_eq!(store.key_count(), 2);
    }

    #[test]
    fn test_compact_keeps_boundary_timestamp() {
        let mut entry = WindowEntry::new(1_000);
        for ts in [0, 100, 200] {
            entry.push(ts);
        }
        assert_eq!(entry.compact(1_100), 1);
        assert_eq!(entry.timestamps, VecDeque::from(vec![100, 200]));
    }

    #[test]
    fn test_push_keeps_order_under_clock_skew() {
        let mut entry = WindowEntry::new(1_000);
        entry.push(500);
        entry.push(400);
        assert_eq!(entry.timestamps, VecDeque::from(vec![500, 500]));
    }

    #[test]
    fn test_concurrent_threads_never_over_admit() {
        let store = Arc::new(MemoryStore::new(4));
        let admitted = Arc::new(AtomicUsize::new(0));

        std::thread::scope(|scope| {
            for _ in 0..16 {
                let store = store.clone();
                let admitted = admitted.clone();
                scope.spawn(move || {
                    for _ in 0..50 {
                        if store.check("hot", 25, Duration::from_secs(60)) {
                            admitted.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                });
            }
        });

        assert_eq!(admitted.load(Ordering::SeqCst), 25);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_tasks_never_over_admit() {
        let store = Arc::new(MemoryStore::new(1));

        let handles: Vec<_> = (0..200)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.allow("k", 10, Duration::from_secs(60)).await })
            })
            .collect();

        let mut admitted = 0;
        for handle in futures::future::join_all(handles).await {
            if handle.unwrap().unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
    }

    #[tokio::test]
    async fn test_expired_key_removed_by_background_sweep() {
        let (store, clock) = store_at(4, 0);

        assert!(store.check("old", 5, SECOND));
        assert_eq!(store.key_count(), 1);

        // Past half a window: this call dispatches the sweep.
        clock.set_millis(1_500);
        assert!(store.check("new", 5, SECOND));

        let mut remaining = store.key_count();
        for _ in 0..100 {
            if remaining == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            remaining = store.key_count();
        }
        assert_eq!(remaining, 1);

        // A request right after removal starts from an empty window.
        assert!(store.check("old", 5, SECOND));
    }

    #[tokio::test]
    async fn test_slow_sweep_is_not_redispatched() {
        let (store, clock) = store_at(2, 0);

        // Hold one shard so the first sweep cannot finish.
        let stall = store.shards[0].entries.write();

        clock.advance_millis(1_000);
        assert!(store.maybe_schedule_sweep(clock.now_millis(), 1_000));
        for _ in 0..20 {
            clock.advance_millis(1_000);
            assert!(!store.maybe_schedule_sweep(clock.now_millis(), 1_000));
        }

        drop(stall);
        for _ in 0..100 {
            if !store.sweeper.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        clock.advance_millis(1_000);
        assert!(store.maybe_schedule_sweep(clock.now_millis(), 1_000));
    }

    #[tokio::test]
    async fn test_sweep_now_keeps_live_and_lifetime_entries() {
        let (store, clock) = store_at(2, 0);

        store.check("expiring", 5, SECOND);
        store.check("lifetime", 5, Duration::ZERO);
        clock.set_millis(500);
        store.check("live", 5, SECOND);

        clock.set_millis(1_200);
        let report = store.sweep_now().await.unwrap();

        assert_eq!(report.keys_removed, 1);
        assert_eq!(store.key_count(), 2);
    }
}
