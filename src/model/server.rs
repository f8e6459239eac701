//! Server-wide singleton stored in `sys/server-metadata`

use super::RedundancyLevel;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub server_id: String,
    pub name: String,
    pub creation_date: DateTime<Utc>,
    pub redundancy_level: RedundancyLevel,
    #[serde(default)]
    pub standby_enabled: bool,
}

impl ServerInfo {
    pub fn new(name: impl Into<String>, redundancy_level: RedundancyLevel) -> Self {
        Self {
            server_id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            creation_date: Utc::now(),
            redundancy_level,
            standby_enabled: false,
        }
    }
}
