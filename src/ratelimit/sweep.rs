//! Background cleanup for the memory store.
//!
//! A sweep walks every shard with a small fixed pool of blocking workers,
//! compacting windows and deleting keys whose timestamps have all expired.
//! Sweeps only touch in-memory maps while holding a shard lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use super::clock::Clock;
use super::memory::Shard;
use crate::error::{Result, TurnstileError};

/// Outcome of one sweep across all shards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Shards visited
    pub shards: usize,
    /// Keys deleted because every timestamp had expired
    pub keys_removed: usize,
    /// Stale timestamps dropped from keys that survived
    pub timestamps_removed: usize,
}

impl SweepReport {
    fn merge(mut self, other: SweepReport) -> Self {
        self.shards += other.shards;
        self.keys_removed += other.keys_removed;
        self.timestamps_removed += other.timestamps_removed;
        self
    }
}

/// Dispatches sweeps over a shared set of shards.
///
/// At most one background sweep runs at a time.
#[derive(Debug, Clone)]
pub(crate) struct Sweeper {
    shards: Arc<Vec<Shard>>,
    clock: Arc<dyn Clock>,
    workers: usize,
    in_flight: Arc<AtomicBool>,
}

/// Clears the in-flight flag when the sweep task ends, however it ends.
struct InFlight(Arc<AtomicBool>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Sweeper {
    pub(crate) fn new(shards: Arc<Vec<Shard>>, clock: Arc<dyn Clock>, workers: usize) -> Self {
        let workers = workers.clamp(1, shards.len().max(1));
        Self {
            shards,
            clock,
            workers,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start a sweep in the background and return whether one was dispatched.
    ///
    /// Skipped when a previous sweep is still running or there is no Tokio
    /// runtime.
    pub(crate) fn trigger(&self) -> bool {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                warn!(error = %e, "No async runtime available, skipping cleanup sweep");
                return false;
            }
        };

        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Previous cleanup sweep still running, skipping");
            return false;
        }

        let guard = InFlight(self.in_flight.clone());
        let sweeper = self.clone();
        handle.spawn(async move {
            let _guard = guard;
            if let Err(e) = sweeper.run().await {
                warn!(error = %e, "Cleanup sweep skipped");
            }
        });
        true
    }

    pub(crate) fn is_running(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Sweep every shard once and wait for all workers.
    pub(crate) async fn run(&self) -> Result<SweepReport> {
        let now = self.clock.now_millis();

        let handles: Vec<_> = (0..self.workers)
            .map(|worker| {
                let shards = self.shards.clone();
                let stride = self.workers;
                tokio::task::spawn_blocking(move || {
                    shards
                        .iter()
                        .skip(worker)
                        .step_by(stride)
                        .map(|shard| sweep_shard(shard, now))
                        .fold(SweepReport::default(), SweepReport::merge)
                })
            })
            .collect();

        let mut report = SweepReport::default();
        for joined in futures::future::join_all(handles).await {
            let partial = joined
                .map_err(|e| TurnstileError::Maintenance(format!("sweep worker failed: {}", e)))?;
            report = report.merge(partial);
        }

        debug!(
            shards = report.shards,
            keys_removed = report.keys_removed,
            timestamps_removed = report.timestamps_removed,
            "Cleanup sweep finished"
        );
        Ok(report)
    }
}

/// Compact one shard under its write lock.
fn sweep_shard(shard: &Shard, now: u64) -> SweepReport {
    let mut report = SweepReport {
        shards: 1,
        ..Default::default()
    };

    let mut entries = shard.entries.write();
    entries.retain(|_, entry| {
        report.timestamps_removed += entry.compact(now);
        if entry.is_empty() {
            report.keys_removed += 1;
            false
        } else {
            true
        }
    });

    report
}
