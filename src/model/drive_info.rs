//! Durable per-drive descriptor

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Drive synchronization status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DriveStatus {
    /// Freshly connected, does not yet hold a full copy of the data
    #[serde(rename = "NOTSYNC")]
    NotSync,
    /// Serving reads
    Enabled,
}

/// Written once to `sys/drive-info` on first start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveInfo {
    pub drive_id: String,
    pub name: String,
    pub status: DriveStatus,
    pub date_connected: DateTime<Utc>,
    /// Position of the drive in the configured drive list
    pub order: usize,
}

impl DriveInfo {
    pub fn new(name: impl Into<String>, order: usize) -> Self {
        Self {
            drive_id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            status: DriveStatus::NotSync,
            date_connected: Utc::now(),
            order,
        }
    }
}
