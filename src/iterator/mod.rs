//! Bucket iterators - paged, resumable bucket listings
//!
//! A `BucketIterator` walks the object metadata directories of one bucket
//! and yields object names. It reads ahead at most
//! `BUCKET_ITERATOR_BUFFER_SIZE` names at a time from the underlying
//! directory streams.
//!
//! ```text
//!   Uninitialized ──has_next()──▶ Initialized ──(streams drained)──▶ Exhausted
//! ```
//!
//! Listing agents are kept in the `BucketIteratorService` between pages
//! under a generated agent id. An agent is dropped (closing its directory
//! streams) once exhausted, when explicitly removed, or after being idle for
//! longer than the configured idle time.

use crate::error::{Error, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fs::{self, ReadDir};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// Names read ahead per refill
pub const BUCKET_ITERATOR_BUFFER_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IteratorState {
    Uninitialized,
    Initialized,
    Exhausted,
}

// =============================================================================
// Bucket Iterator
// =============================================================================

pub struct BucketIterator {
    agent_id: String,
    bucket_id: u64,
    /// Metadata directories walked in order, one per drive
    dirs: Vec<PathBuf>,
    /// Entries skipped before the first returned name
    offset: u64,
    /// Lowercase name prefix
    prefix: Option<String>,
    state: IteratorState,
    dir_index: usize,
    stream: Option<ReadDir>,
    buffer: VecDeque<String>,
    /// Set by a successful `has_next`, consumed by `next`
    ready: bool,
    returned: u64,
    last_access: Instant,
}

impl BucketIterator {
    pub fn new(bucket_id: u64, dirs: Vec<PathBuf>, offset: u64, prefix: Option<&str>) -> Self {
        Self {
            agent_id: uuid::Uuid::new_v4().to_string(),
            bucket_id,
            dirs,
            offset,
            prefix: prefix
                .map(|p| p.trim().to_lowercase())
                .filter(|p| !p.is_empty()),
            state: IteratorState::Uninitialized,
            dir_index: 0,
            stream: None,
            buffer: VecDeque::new(),
            ready: false,
            returned: 0,
            last_access: Instant::now(),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn bucket_id(&self) -> u64 {
        self.bucket_id
    }

    pub fn state(&self) -> IteratorState {
        self.state
    }

    /// Listing position: skipped entries plus names returned so far
    pub fn offset(&self) -> u64 {
        self.offset + self.returned
    }

    pub fn idle_for(&self) -> Duration {
        self.last_access.elapsed()
    }

    /// True if a name is available; initializes and refills as needed
    pub fn has_next(&mut self) -> Result<bool> {
        self.last_access = Instant::now();
        if self.state == IteratorState::Uninitialized {
            self.init()?;
        }
        if self.buffer.is_empty() && self.state == IteratorState::Initialized {
            self.fetch()?;
        }
        self.ready = !self.buffer.is_empty();
        Ok(self.ready)
    }

    /// Next object name; must follow a `has_next()` that returned true
    pub fn next(&mut self) -> Result<String> {
        self.last_access = Instant::now();
        if !self.ready {
            return Err(Error::IndexOutOfBounds(format!(
                "next() without has_next() on agent {}",
                self.agent_id
            )));
        }
        let name = self.buffer.pop_front().ok_or_else(|| {
            Error::IndexOutOfBounds(format!("agent {} has no buffered entry", self.agent_id))
        })?;
        self.ready = false;
        self.returned += 1;
        Ok(name)
    }

    /// Release the directory streams
    pub fn close(&mut self) {
        self.stream = None;
        self.buffer.clear();
        self.ready = false;
        self.state = IteratorState::Exhausted;
    }

    fn init(&mut self) -> Result<()> {
        self.state = IteratorState::Initialized;
        let mut skipped = 0;
        while skipped < self.offset {
            if self.next_entry()?.is_none() {
                break;
            }
            skipped += 1;
        }
        debug!(
            "Iterator {} initialized on bucket {} (skipped {})",
            self.agent_id, self.bucket_id, skipped
        );
        Ok(())
    }

    fn fetch(&mut self) -> Result<()> {
        while self.buffer.len() < BUCKET_ITERATOR_BUFFER_SIZE {
            match self.next_entry()? {
                Some(name) => self.buffer.push_back(name),
                None => break,
            }
        }
        Ok(())
    }

    /// Next matching object directory across every walked root
    fn next_entry(&mut self) -> Result<Option<String>> {
        loop {
            if self.stream.is_none() {
                let Some(dir) = self.dirs.get(self.dir_index) else {
                    self.state = IteratorState::Exhausted;
                    return Ok(None);
                };
                self.dir_index += 1;
                match fs::read_dir(dir) {
                    Ok(stream) => self.stream = Some(stream),
                    Err(e) if e.kind() == ErrorKind::NotFound => continue,
                    Err(e) => return Err(e.into()),
                }
            }
            let Some(stream) = self.stream.as_mut() else {
                continue;
            };
            match stream.next() {
                None => self.stream = None,
                Some(entry) => {
                    let entry = entry?;
                    if !entry.file_type()?.is_dir() {
                        continue;
                    }
                    let name = entry.file_name().to_string_lossy().to_string();
                    if let Some(prefix) = &self.prefix {
                        if !name.to_lowercase().starts_with(prefix.as_str()) {
                            continue;
                        }
                    }
                    return Ok(Some(name));
                }
            }
        }
    }
}

// =============================================================================
// Iterator Registry
// =============================================================================

pub type SharedIterator = Arc<Mutex<BucketIterator>>;

/// Listing agents kept between pages
pub struct BucketIteratorService {
    iterators: DashMap<String, SharedIterator>,
    idle: Duration,
}

impl BucketIteratorService {
    pub fn new(idle: Duration) -> Self {
        Self {
            iterators: DashMap::new(),
            idle,
        }
    }

    pub fn register(&self, iterator: BucketIterator) -> SharedIterator {
        let agent_id = iterator.agent_id().to_string();
        let shared = Arc::new(Mutex::new(iterator));
        self.iterators.insert(agent_id, shared.clone());
        shared
    }

    pub fn get(&self, agent_id: &str) -> Option<SharedIterator> {
        self.iterators.get(agent_id).map(|e| e.value().clone())
    }

    pub fn remove(&self, agent_id: &str) {
        if let Some((_, iterator)) = self.iterators.remove(agent_id) {
            iterator.lock().close();
        }
    }

    pub fn len(&self) -> usize {
        self.iterators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.iterators.is_empty()
    }

    /// Drop agents idle for longer than the configured idle time; busy agents are kept
    pub fn purge_idle(&self) -> usize {
        let before = self.iterators.len();
        self.iterators.retain(|_, iterator| match iterator.try_lock() {
            Some(mut it) => {
                if it.idle_for() >= self.idle {
                    it.close();
                    false
                } else {
                    true
                }
            }
            None => true,
        });
        before.saturating_sub(self.iterators.len())
    }

    #[instrument(skip_all)]
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!("Starting iterator purge loop (idle {:?})", self.idle);
        let period = (self.idle / 2).max(Duration::from_secs(1));
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let purged = self.purge_idle();
                    if purged > 0 {
                        debug!("Purged {} idle listing agents", purged);
                    }
                }
            }
        }
        info!("Iterator purge loop shutting down");
    }
}
