//! Object metadata
//!
//! One JSON document per (bucket, object, version). The head document is
//! `<object>.json`; retained history lives next to it as `<object>.v<N>.json`.

use super::RedundancyLevel;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Object lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObjectStatus {
    Enabled,
    Archived,
    Deleted,
    Draft,
}

impl ObjectStatus {
    pub fn is_accessible(&self) -> bool {
        matches!(self, ObjectStatus::Enabled | ObjectStatus::Archived)
    }
}

/// Metadata of one object version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMetadata {
    pub bucket_id: u64,
    pub bucket_name: String,
    pub object_name: String,

    /// Original file name supplied by the client
    pub file_name: String,
    pub content_type: String,

    /// Plaintext length in bytes
    pub length: u64,

    /// Bytes persisted on disk (ciphertext length when encrypted)
    #[serde(default)]
    pub stored_length: u64,

    /// RAID 6 block size used to split the stored payload, 0 otherwise
    #[serde(default)]
    pub block_size: u64,

    /// Creation date of the object (version 0)
    pub creation_date: DateTime<Utc>,
    /// Creation date of this version
    pub version_creation_date: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,

    /// Last time the stored hashes were verified against the data files
    #[serde(default)]
    pub integrity_check: Option<DateTime<Utc>>,

    /// 0-based version, equals the number of retained prior versions
    pub version: u32,
    pub status: ObjectStatus,

    /// Hash of the stored data file (RAID 0 / RAID 1)
    #[serde(default)]
    pub sha256: Option<String>,

    /// One hash per shard file in (chunk, block) order (RAID 6)
    #[serde(default)]
    pub sha256_blocks: Vec<String>,

    pub etag: String,
    pub encrypt: bool,

    /// Drive that owns the object (RAID 0) or served the write
    pub drive: String,
    pub raid: RedundancyLevel,

    #[serde(default)]
    pub system_tags: Option<String>,
}

impl ObjectMetadata {
    /// Number of RAID 6 chunks the stored payload was split into
    pub fn total_chunks(&self) -> u32 {
        if self.block_size == 0 || self.stored_length == 0 {
            return 1;
        }
        self.stored_length.div_ceil(self.block_size) as u32
    }

    /// Length of chunk `chunk` of the stored payload
    pub fn chunk_length(&self, chunk: u32) -> usize {
        if self.block_size == 0 {
            return self.stored_length as usize;
        }
        let start = chunk as u64 * self.block_size;
        self.stored_length
            .saturating_sub(start)
            .min(self.block_size) as usize
    }

    pub fn is_accessible(&self) -> bool {
        self.status.is_accessible()
    }
}

#[cfg(test)]
pub(crate) fn sample_metadata(bucket_id: u64, object: &str) -> ObjectMetadata {
    let now = Utc::now();
    ObjectMetadata {
        bucket_id,
        bucket_name: format!("bucket-{}", bucket_id),
        object_name: object.to_string(),
        file_name: object.to_string(),
        content_type: "application/octet-stream".to_string(),
        length: 5,
        stored_length: 5,
        block_size: 0,
        creation_date: now,
        version_creation_date: now,
        last_modified: now,
        integrity_check: None,
        version: 0,
        status: ObjectStatus::Enabled,
        sha256: None,
        sha256_blocks: Vec::new(),
        etag: String::new(),
        encrypt: false,
        drive: "drive0".to_string(),
        raid: RedundancyLevel::Raid0,
        system_tags: None,
    }
}
