//! Scheduler - post-commit service requests
//!
//! Delete-family operations leave data files behind once their metadata is
//! gone. Their physical removal is queued as a `ServiceRequest`, persisted on
//! every enabled drive under `sys/scheduler/<queue>/` and executed outside
//! the request path by a background worker.
//!
//! Bulk maintenance, such as dropping the previous versions of every object
//! in a bucket, runs through the same queue.
//!
//! A request is attempted up to `MAX_ATTEMPTS` times, sleeping a growing
//! `RETRY_BACKOFF` between attempts. On success its file is
//! removed; a request that exhausts its attempts stays on disk and is
//! reloaded on the next startup.

use crate::drive::DrivePool;
use crate::error::Result;
use crate::model::{OperationCode, VfsOperation};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Queue used for object cleanup requests
pub const STANDARD_QUEUE: &str = "standard";

/// Attempts per request before it is left for the next startup
pub const MAX_ATTEMPTS: u32 = 5;

/// Delay before the second attempt; grows linearly with each failure
pub const RETRY_BACKOFF: Duration = Duration::from_millis(50);

// =============================================================================
// Service Requests
// =============================================================================

/// Work carried by a service request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServiceRequestKind {
    /// Remove the data files left by a committed delete
    #[serde(rename_all = "camelCase")]
    AfterDeleteObject {
        /// Committed operation that produced the request
        op: OperationCode,
        bucket_id: u64,
        bucket_name: String,
        object_name: String,
        /// Head version at the time of the delete
        head_version: u32,
    },
    /// Drop the previous versions of every object in one bucket, or in all buckets
    #[serde(rename_all = "camelCase")]
    DeleteBucketPreviousVersions { bucket_id: Option<u64> },
}

impl ServiceRequestKind {
    /// Cleanup request for a committed delete-family operation
    pub fn after_delete(op: &VfsOperation) -> Option<Self> {
        Some(ServiceRequestKind::AfterDeleteObject {
            op: op.op,
            bucket_id: op.bucket_id?,
            bucket_name: op.bucket_name.clone()?,
            object_name: op.object_name.clone()?,
            head_version: op.version,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRequest {
    pub id: String,
    pub queue: String,
    pub created: DateTime<Utc>,
    pub kind: ServiceRequestKind,
}

impl ServiceRequest {
    pub fn new(kind: ServiceRequestKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            queue: STANDARD_QUEUE.to_string(),
            created: Utc::now(),
            kind,
        }
    }
}

/// Runs service requests; implemented by the I/O driver
pub trait RequestExecutor: Send + Sync {
    fn execute(&self, request: &ServiceRequest) -> Result<()>;
}

// =============================================================================
// Scheduler Service
// =============================================================================

pub struct SchedulerService {
    drives: Arc<DrivePool>,
    queue: Mutex<VecDeque<ServiceRequest>>,
    notify: Notify,
}

impl SchedulerService {
    pub fn new(drives: Arc<DrivePool>) -> Self {
        Self {
            drives,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    /// Persist and queue a request
    #[instrument(skip(self))]
    pub fn enqueue(&self, kind: ServiceRequestKind) -> ServiceRequest {
        let request = ServiceRequest::new(kind);
        for drive in self.drives.enabled() {
            if let Err(e) = drive.save_scheduler(&request.queue, &request.id, &request) {
                // the request still runs in memory; only restart durability is lost on this drive
                warn!(
                    "Cannot persist service request {} on drive {}: {}",
                    request.id,
                    drive.name(),
                    e
                );
            }
        }
        self.queue.lock().push_back(request.clone());
        self.notify.notify_one();
        debug!("Queued service request {}", request.id);
        request
    }

    /// Queue the requests persisted by a previous run
    pub fn reload(&self) -> Result<usize> {
        let mut seen: HashSet<String> = self.queue.lock().iter().map(|r| r.id.clone()).collect();
        let mut loaded = Vec::new();
        for drive in self.drives.all() {
            for request in drive.scheduler_requests::<ServiceRequest>(STANDARD_QUEUE)? {
                if seen.insert(request.id.clone()) {
                    loaded.push(request);
                }
            }
        }
        loaded.sort_by_key(|r| r.created);
        let count = loaded.len();
        self.queue.lock().extend(loaded);
        if count > 0 {
            info!("Reloaded {} pending service requests", count);
            self.notify.notify_one();
        }
        Ok(count)
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Execute every queued request on the calling thread; returns the number that succeeded
    pub fn process_pending(&self, executor: &dyn RequestExecutor) -> usize {
        let mut succeeded = 0;
        loop {
            let Some(request) = self.queue.lock().pop_front() else {
                break;
            };
            if self.run_with_retries(executor, &request) {
                succeeded += 1;
            }
        }
        succeeded
    }

    fn run_with_retries(&self, executor: &dyn RequestExecutor, request: &ServiceRequest) -> bool {
        for attempt in 1..=MAX_ATTEMPTS {
            match executor.execute(request) {
                Ok(()) => {
                    self.forget(request);
                    return true;
                }
                Err(e) => {
                    warn!(
                        "Service request {} attempt {}/{} failed: {}",
                        request.id, attempt, MAX_ATTEMPTS, e
                    );
                    if attempt < MAX_ATTEMPTS {
                        std::thread::sleep(RETRY_BACKOFF * attempt);
                    }
                }
            }
        }
        error!(
            "Service request {} gave up after {} attempts, left for next startup",
            request.id, MAX_ATTEMPTS
        );
        false
    }

    fn forget(&self, request: &ServiceRequest) {
        for drive in self.drives.all() {
            if let Err(e) = drive.remove_scheduler(&request.queue, &request.id) {
                warn!(
                    "Cannot remove service request {} from drive {}: {}",
                    request.id,
                    drive.name(),
                    e
                );
            }
        }
    }

    /// Background worker draining the queue on the blocking pool
    #[instrument(skip_all)]
    pub async fn run(self: Arc<Self>, executor: Arc<dyn RequestExecutor>, shutdown: CancellationToken) {
        info!("Starting scheduler worker");
        loop {
            if self.pending() == 0 {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = self.notify.notified() => {}
                }
            }
            if shutdown.is_cancelled() {
                break;
            }
            let scheduler = self.clone();
            let executor = executor.clone();
            let result =
                tokio::task::spawn_blocking(move || scheduler.process_pending(executor.as_ref()))
                    .await;
            if let Err(e) = result {
                error!("Scheduler worker task failed: {}", e);
            }
        }
        info!("Scheduler worker shutting down");
    }
}
