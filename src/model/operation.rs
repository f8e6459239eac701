//! Journal entries

use super::RedundancyLevel;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of mutation recorded in the journal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationCode {
    CreateObject,
    UpdateObject,
    DeleteObject,
    DeleteObjectPreviousVersions,
    UpdateObjectMetadata,
    RestoreObjectPreviousVersion,
    CreateBucket,
    DeleteBucket,
    CreateServerMetadata,
    UpdateServerMetadata,
    #[serde(rename = "CREATE_SERVER_MASTERKEY")]
    CreateServerMasterKey,
}

impl OperationCode {
    /// True for codes whose rollback touches object files
    pub fn is_object_operation(&self) -> bool {
        matches!(
            self,
            OperationCode::CreateObject
                | OperationCode::UpdateObject
                | OperationCode::DeleteObject
                | OperationCode::DeleteObjectPreviousVersions
                | OperationCode::UpdateObjectMetadata
                | OperationCode::RestoreObjectPreviousVersion
        )
    }
}

impl fmt::Display for OperationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// An intent recorded before any physical mutation; immutable once written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VfsOperation {
    pub id: String,
    pub op: OperationCode,
    #[serde(default)]
    pub bucket_id: Option<u64>,
    #[serde(default)]
    pub bucket_name: Option<String>,
    #[serde(default)]
    pub object_name: Option<String>,
    /// Head version at the time the operation started
    pub version: u32,
    pub raid: RedundancyLevel,
    pub timestamp: DateTime<Utc>,
}

impl VfsOperation {
    pub fn new(
        op: OperationCode,
        bucket: Option<(u64, &str)>,
        object_name: Option<&str>,
        version: u32,
        raid: RedundancyLevel,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            op,
            bucket_id: bucket.map(|(id, _)| id),
            bucket_name: bucket.map(|(_, name)| name.to_string()),
            object_name: object_name.map(str::to_string),
            version,
            raid,
            timestamp: Utc::now(),
        }
    }

    /// `b:/o:/v:` tag for logs and internal errors
    pub fn context(&self) -> String {
        crate::error::context_tag(
            self.bucket_name.as_deref(),
            self.object_name.as_deref(),
            Some(self.version),
            None,
        )
    }
}
