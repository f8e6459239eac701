//! Object metadata cache
//!
//! Best-effort `(bucketId, objectName)` → head metadata cache shared by the
//! drivers. Every mutation invalidates its key before touching files, so a
//! stale entry can only be observed between invalidation and the next
//! successful write. The drive files stay authoritative: the cache can be
//! cleared at any time.

use crate::model::ObjectMetadata;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

type CacheKey = (u64, String);

pub struct ObjectMetadataCache {
    entries: DashMap<CacheKey, ObjectMetadata>,
    enabled: bool,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl ObjectMetadataCache {
    pub fn new(enabled: bool, capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            enabled: enabled && capacity > 0,
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn get(&self, bucket_id: u64, object: &str) -> Option<ObjectMetadata> {
        if !self.enabled {
            return None;
        }
        match self.entries.get(&(bucket_id, object.to_string())) {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn put(&self, meta: &ObjectMetadata) {
        if !self.enabled {
            return;
        }
        let key = (meta.bucket_id, meta.object_name.clone());
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            self.evict_one();
        }
        self.entries.insert(key, meta.clone());
    }

    pub fn remove(&self, bucket_id: u64, object: &str) {
        self.entries.remove(&(bucket_id, object.to_string()));
    }

    /// Drop every entry of a bucket
    pub fn remove_bucket(&self, bucket_id: u64) {
        self.entries.retain(|(id, _), _| *id != bucket_id);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    fn evict_one(&self) {
        let victim = self.entries.iter().next().map(|e| e.key().clone());
        if let Some(key) = victim {
            self.entries.remove(&key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }
}
