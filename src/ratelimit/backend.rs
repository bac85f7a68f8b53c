//! Storage trait for abstracting the in-process and remote window stores.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::clock::{Clock, SystemClock};
use super::memory::{MemoryStore, DEFAULT_SWEEP_WORKERS};
use super::remote::RedisStore;
use crate::error::Result;

/// Trait for window storage implementations.
///
/// `allow` admits a request for `key` when fewer than `limit` previously
/// admitted events are still inside `window`, recording the admission.
///
/// - `limit < 0` always admits.
/// - `limit == 0` always rejects.
/// - `window == Duration::ZERO` means events never expire.
///
/// Rejected requests never consume quota.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Check and record one request against `key`.
    async fn allow(&self, key: &str, limit: i64, window: Duration) -> Result<bool>;

    /// Which backend this is.
    fn kind(&self) -> StorageKind;
}

/// Storage backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// Sharded in-process counters (node-local)
    #[default]
    Memory,
    /// Redis sorted sets (shared across nodes)
    Remote,
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageKind::Memory => write!(f, "memory"),
            StorageKind::Remote => write!(f, "remote"),
        }
    }
}

/// Everything needed to pick and build a storage backend once.
#[derive(Debug, Clone)]
pub struct StorageOptions {
    pub kind: StorageKind,
    pub shard_count: usize,
    pub sweep_workers: usize,
    pub redis_client: Option<redis::Client>,
    pub clock: Arc<dyn Clock>,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            kind: StorageKind::Memory,
            shard_count: 16,
            sweep_workers: DEFAULT_SWEEP_WORKERS,
            redis_client: None,
            clock: Arc::new(SystemClock),
        }
    }
}

/// Build the storage backend described by `options`.
///
/// Selecting the remote store without a client is recovered by falling
/// back to the memory store.
pub fn build_storage(options: StorageOptions) -> Arc<dyn Storage> {
    match (options.kind, options.redis_client) {
        (StorageKind::Remote, Some(client)) => {
            info!("Using remote sorted-set storage");
            Arc::new(RedisStore::with_clock(client, options.clock))
        }
        (kind, _) => {
            if kind == StorageKind::Remote {
                warn!("Remote storage selected without a client, falling back to memory storage");
            }
            info!(
                shards = options.shard_count,
                sweep_workers = options.sweep_workers,
                "Using sharded memory storage"
            );
            Arc::new(
                MemoryStore::with_clock(options.shard_count, options.clock)
                    .with_sweep_workers(options.sweep_workers),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_builds_memory() {
        let storage = build_storage(StorageOptions::default());
        assert_eq!(storage.kind(), StorageKind::Memory);
    }

    #[test]
    fn test_remote_without_client_falls_back() {
        let storage = build_storage(StorageOptions {
            kind: StorageKind::Remote,
            ..Default::default()
        });
        assert_eq!(storage.kind(), StorageKind::Memory);
    }

    #[test]
    fn test_remote_with_client() {
        let client = redis::Client::open("redis://127.0.0.1:6379").unwrap();
        let storage = build_storage(StorageOptions {
            kind: StorageKind::Remote,
            redis_client: Some(client),
            ..Default::default()
        });
        assert_eq!(storage.kind(), StorageKind::Remote);
    }

    #[test]
    fn test_storage_kind_serde() {
        let kind: StorageKind = serde_yaml::from_str("remote").unwrap();
        assert_eq!(kind, StorageKind::Remote);
        assert_eq!(StorageKind::Memory.to_string(), "memory");
    }
}
