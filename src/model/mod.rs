//! Domain model persisted on drives
//!
//! Every type here is serialized as JSON into a drive's `sys/` tree, so field
//! names are stable on-disk identifiers (camelCase).

pub mod bucket;
pub mod drive_info;
pub mod listing;
pub mod object;
pub mod operation;
pub mod server;

pub use bucket::{BucketMetadata, BucketStatus, ServerBucket};
pub use drive_info::{DriveInfo, DriveStatus};
pub use listing::{DataList, Item};
pub use object::{ObjectMetadata, ObjectStatus};
pub use operation::{OperationCode, VfsOperation};
pub use server::ServerInfo;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Redundancy strategy applied to every object on the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RedundancyLevel {
    /// Stripe: one object on one drive, no redundancy
    #[default]
    Raid0,
    /// Mirror: every drive holds a full copy
    Raid1,
    /// Erasure coded: k data + m parity shards per block
    Raid6,
}

impl fmt::Display for RedundancyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RedundancyLevel::Raid0 => write!(f, "RAID 0"),
            RedundancyLevel::Raid1 => write!(f, "RAID 1"),
            RedundancyLevel::Raid6 => write!(f, "RAID 6"),
        }
    }
}
