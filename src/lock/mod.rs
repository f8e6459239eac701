//! Lock Service
//!
//! Keyed reader/writer locks for the server, bucket and object scopes.
//!
//! # Ordering
//!
//! Object operations take the object lock first and the bucket lock second,
//! and release them in reverse order. Guards are owned (`Arc` based) so a
//! handler keeps them as locals and they drop on every exit path.
//!
//! # Sweeper
//!
//! Object locks are created on demand, one per `bucketId:objectName`. A
//! background sweep evicts entries nobody holds or references, at most
//! `max_to_purge()` per pass. The pause between passes shrinks as the
//! registry grows:
//!
//! ```text
//! sleep = min + delta / (1 + size / delta)      delta = max - min
//! ```

use dashmap::DashMap;
use lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// Shared guard on an object, bucket or server lock
pub type ReadGuard = ArcRwLockReadGuard<RawRwLock, ()>;

/// Exclusive guard on an object, bucket or server lock
pub type WriteGuard = ArcRwLockWriteGuard<RawRwLock, ()>;

type SharedLock = Arc<RwLock<()>>;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the lock sweeper
#[derive(Debug, Clone)]
pub struct LockServiceConfig {
    /// Expected lock creation rate per millisecond
    pub rate_millisecs: u64,
    /// Shortest pause between sweeps
    pub min_sleep: Duration,
    /// Longest pause between sweeps
    pub max_sleep: Duration,
}

impl Default for LockServiceConfig {
    fn default() -> Self {
        Self {
            rate_millisecs: 2,
            min_sleep: Duration::from_secs(5),
            max_sleep: Duration::from_secs(120),
        }
    }
}

// =============================================================================
// Lock Service
// =============================================================================

/// Registry of server, bucket and object locks
pub struct LockService {
    config: LockServiceConfig,
    object_locks: DashMap<String, SharedLock>,
    bucket_locks: DashMap<u64, SharedLock>,
    server_lock: SharedLock,
}

impl LockService {
    pub fn new(config: LockServiceConfig) -> Self {
        Self {
            config,
            object_locks: DashMap::new(),
            bucket_locks: DashMap::new(),
            server_lock: Arc::new(RwLock::new(())),
        }
    }

    fn object_key(bucket_id: u64, object: &str) -> String {
        format!("{}:{}", bucket_id, object)
    }

    /// Lock for one object, created once under concurrent first access
    pub fn object_lock(&self, bucket_id: u64, object: &str) -> SharedLock {
        self.object_locks
            .entry(Self::object_key(bucket_id, object))
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    pub fn bucket_lock(&self, bucket_id: u64) -> SharedLock {
        self.bucket_locks
            .entry(bucket_id)
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    pub fn server_lock(&self) -> SharedLock {
        self.server_lock.clone()
    }

    // =========================================================================
    // Guards
    // =========================================================================

    pub fn read_object(&self, bucket_id: u64, object: &str) -> ReadGuard {
        self.object_lock(bucket_id, object).read_arc()
    }

    pub fn write_object(&self, bucket_id: u64, object: &str) -> WriteGuard {
        self.object_lock(bucket_id, object).write_arc()
    }

    pub fn read_bucket(&self, bucket_id: u64) -> ReadGuard {
        self.bucket_lock(bucket_id).read_arc()
    }

    pub fn write_bucket(&self, bucket_id: u64) -> WriteGuard {
        self.bucket_lock(bucket_id).write_arc()
    }

    pub fn read_server(&self) -> ReadGuard {
        self.server_lock.read_arc()
    }

    pub fn write_server(&self) -> WriteGuard {
        self.server_lock.write_arc()
    }

    /// Bounded wait for a shared object guard
    pub fn try_read_object_for(&self, bucket_id: u64, object: &str, timeout: Duration) -> Option<ReadGuard> {
        self.object_lock(bucket_id, object).try_read_arc_for(timeout)
    }

    pub fn try_write_object_for(&self, bucket_id: u64, object: &str, timeout: Duration) -> Option<WriteGuard> {
        self.object_lock(bucket_id, object).try_write_arc_for(timeout)
    }

    pub fn try_read_bucket_for(&self, bucket_id: u64, timeout: Duration) -> Option<ReadGuard> {
        self.bucket_lock(bucket_id).try_read_arc_for(timeout)
    }

    // =========================================================================
    // Sweeper
    // =========================================================================

    /// Number of cached object locks
    pub fn object_lock_count(&self) -> usize {
        self.object_locks.len()
    }

    pub fn contains_object_lock(&self, bucket_id: u64, object: &str) -> bool {
        self.object_locks
            .contains_key(&Self::object_key(bucket_id, object))
    }

    /// Upper bound of evictions per sweep
    pub fn max_to_purge(&self) -> usize {
        let rate = self.config.rate_millisecs as f64;
        let max_ms = self.config.max_sleep.as_millis() as f64;
        ((rate * max_ms).round() + rate * 1000.0) as usize
    }

    /// Pause before the next sweep for the current registry size
    pub fn sweep_interval(&self) -> Duration {
        let min = self.config.min_sleep.as_millis() as u64;
        let max = self.config.max_sleep.as_millis() as u64;
        let delta = max.saturating_sub(min).max(1);
        let size = self.object_locks.len() as u64;
        Duration::from_millis(min + delta / (1 + size / delta))
    }

    /// Evict idle object locks; returns the number evicted
    ///
    /// An entry is idle when the registry holds the only reference and a
    /// non-blocking write lock succeeds. The check runs under the map shard
    /// lock so a concurrent `object_lock` cannot hand out an evicted lock.
    pub fn sweep(&self) -> usize {
        let max = self.max_to_purge();
        let keys: Vec<String> = self
            .object_locks
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        let mut purged = 0;
        for key in keys {
            if purged >= max {
                break;
            }
            let removed = self.object_locks.remove_if(&key, |_, lock| {
                Arc::strong_count(lock) == 1 && lock.try_write().is_some()
            });
            if removed.is_some() {
                purged += 1;
            }
        }
        if purged > 0 {
            debug!(
                "Lock sweep evicted {} object locks, {} remain",
                purged,
                self.object_locks.len()
            );
        }
        purged
    }

    /// Run the sweeper until the token is cancelled
    #[instrument(skip(self, shutdown))]
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!("Starting lock sweeper with {:?}", self.config);
        loop {
            let pause = self.sweep_interval();
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Lock sweeper shutting down");
                    break;
                }
                _ = tokio::time::sleep(pause) => {
                    self.sweep();
                }
            }
        }
    }
}

impl Default for LockService {
    fn default() -> Self {
        Self::new(LockServiceConfig::default())
    }
}

// =============================================================================
// Tests
// =============================================================================
