//! Request counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Monotonic totals, updated lock-free.
///
/// The two counters are independently consistent; a snapshot may observe one
/// update without the other.
#[derive(Debug, Default)]
pub struct Stats {
    total: AtomicU64,
    rejected: AtomicU64,
}

/// Point-in-time copy of [`Stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub rejected_requests: u64,
}

impl Stats {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one request entering the limiter.
    pub fn record_request(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one rejected request.
    pub fn record_rejection(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy both counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_requests: self.total.load(Ordering::Relaxed),
            rejected_requests: self.rejected.load(Ordering::Relaxed),
        }
    }
}
