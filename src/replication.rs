//! Standby replication boundary
//!
//! The journal forwards every committed or cancelled operation to a
//! `ReplicationService` when standby replication is configured. Shipping the
//! operation to another server is the implementor's concern.

use crate::error::Result;
use crate::model::VfsOperation;

pub trait ReplicationService: Send + Sync {
    /// Mirror a committed operation to the standby
    fn replicate(&self, op: &VfsOperation) -> Result<()>;

    /// Tell the standby a pending operation was rolled back
    fn cancel(&self, op: &VfsOperation) -> Result<()>;
}
