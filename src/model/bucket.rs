//! Bucket metadata

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Bucket lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BucketStatus {
    Enabled,
    Deleted,
    Archived,
}

impl BucketStatus {
    /// Objects may be read from the bucket
    pub fn is_accessible(&self) -> bool {
        matches!(self, BucketStatus::Enabled | BucketStatus::Archived)
    }
}

/// Bucket descriptor, replicated identically on every drive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketMetadata {
    /// Stable numeric id, used in every on-disk path
    pub id: u64,
    /// Human readable name, unique per server
    pub bucket_name: String,
    pub status: BucketStatus,
    pub creation_date: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

impl BucketMetadata {
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            bucket_name: name.into(),
            status: BucketStatus::Enabled,
            creation_date: now,
            last_modified: now,
        }
    }
}

/// In-memory registry copy of a bucket, referenced by id elsewhere
#[derive(Debug, Clone, PartialEq)]
pub struct ServerBucket {
    pub id: u64,
    pub name: String,
    pub status: BucketStatus,
    pub creation_date: DateTime<Utc>,
}

impl ServerBucket {
    pub fn is_accessible(&self) -> bool {
        self.status.is_accessible()
    }

    pub fn is_enabled(&self) -> bool {
        self.status == BucketStatus::Enabled
    }
}

impl From<&BucketMetadata> for ServerBucket {
    fn from(meta: &BucketMetadata) -> Self {
        Self {
            id: meta.id,
            name: meta.bucket_name.clone(),
            status: meta.status,
            creation_date: meta.creation_date,
        }
    }
}
