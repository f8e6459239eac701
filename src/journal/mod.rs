//! Journal Service - write-ahead log of intents
//!
//! Every mutation records a `VfsOperation` on every drive before touching any
//! file, and removes it once the mutation is durable.
//!
//! ```text
//!   lock ──▶ begin ──▶ mutate ──┬──▶ commit ──▶ unlock
//!                               │
//!                               └──▶ rollback ──▶ cancel ──▶ unlock
//! ```
//!
//! An entry still present at startup belongs to an operation that never
//! reached `commit`; recovery rolls it back.

use crate::drive::DrivePool;
use crate::error::{Error, Result};
use crate::model::{OperationCode, RedundancyLevel, ServerBucket, VfsOperation};
use crate::replication::ReplicationService;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

pub struct JournalService {
    drives: Arc<DrivePool>,
    raid: RedundancyLevel,
    replication: Option<Arc<dyn ReplicationService>>,
}

impl JournalService {
    pub fn new(
        drives: Arc<DrivePool>,
        raid: RedundancyLevel,
        replication: Option<Arc<dyn ReplicationService>>,
    ) -> Self {
        Self {
            drives,
            raid,
            replication,
        }
    }

    /// Record an object or bucket operation on every drive
    #[instrument(skip(self, bucket), fields(bucket = bucket.map(|b| b.name.as_str())))]
    pub fn begin(
        &self,
        code: OperationCode,
        bucket: Option<&ServerBucket>,
        object: Option<&str>,
        version: u32,
    ) -> Result<VfsOperation> {
        let op = VfsOperation::new(
            code,
            bucket.map(|b| (b.id, b.name.as_str())),
            object,
            version,
            self.raid,
        );
        self.save(&op)?;
        debug!("Journal begin {} {} [{}]", op.op, op.id, op.context());
        Ok(op)
    }

    /// Record a server-scope operation (server metadata, master key)
    pub fn begin_server(&self, code: OperationCode) -> Result<VfsOperation> {
        let op = VfsOperation::new(code, None, None, 0, self.raid);
        self.save(&op)?;
        debug!("Journal begin {} {}", op.op, op.id);
        Ok(op)
    }

    fn save(&self, op: &VfsOperation) -> Result<()> {
        for (i, drive) in self.drives.all().iter().enumerate() {
            if let Err(e) = drive.save_journal(op) {
                // undo the partial write so recovery does not see a half-recorded intent
                for written in &self.drives.all()[..i] {
                    if let Err(undo) = written.remove_journal(&op.id) {
                        warn!(
                            "Cannot remove partial journal entry {} from drive {}: {}",
                            op.id,
                            written.name(),
                            undo
                        );
                    }
                }
                return Err(Error::internal(
                    format!("{} d:{}", op.context(), drive.name()),
                    e,
                ));
            }
        }
        Ok(())
    }

    /// The operation completed: drop it from every drive and notify the standby
    pub fn commit(&self, op: &VfsOperation) -> Result<()> {
        self.remove(op)?;
        if let Some(replication) = &self.replication {
            replication.replicate(op)?;
        }
        debug!("Journal commit {} {}", op.op, op.id);
        Ok(())
    }

    /// The operation was rolled back: drop it from every drive
    pub fn cancel(&self, op: &VfsOperation) -> Result<()> {
        self.remove(op)?;
        if let Some(replication) = &self.replication {
            if let Err(e) = replication.cancel(op) {
                warn!("Standby cancel failed for {}: {}", op.id, e);
            }
        }
        debug!("Journal cancel {} {}", op.op, op.id);
        Ok(())
    }

    fn remove(&self, op: &VfsOperation) -> Result<()> {
        let mut failure = None;
        for drive in self.drives.all() {
            if let Err(e) = drive.remove_journal(&op.id) {
                error!(
                    "Cannot remove journal entry {} from drive {}: {}",
                    op.id,
                    drive.name(),
                    e
                );
                failure.get_or_insert(Error::internal(
                    format!("{} d:{}", op.context(), drive.name()),
                    e,
                ));
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Operations found on any drive, deduplicated by id, oldest first
    pub fn pending_operations(&self) -> Result<Vec<VfsOperation>> {
        let mut by_id: HashMap<String, VfsOperation> = HashMap::new();
        for drive in self.drives.all() {
            for op in drive.load_journal()? {
                by_id.entry(op.id.clone()).or_insert(op);
            }
        }
        let mut ops: Vec<VfsOperation> = by_id.into_values().collect();
        ops.sort_by_key(|op| op.timestamp);
        if !ops.is_empty() {
            info!("Journal holds {} pending operations", ops.len());
        }
        Ok(ops)
    }
}
