//! Paged listing results

use super::ObjectMetadata;
use serde::{Deserialize, Serialize};

/// One listing entry: the object's head metadata, or why it could not be read
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Item {
    Ok(ObjectMetadata),
    Err(String),
}

impl Item {
    pub fn is_ok(&self) -> bool {
        matches!(self, Item::Ok(_))
    }

    pub fn metadata(&self) -> Option<&ObjectMetadata> {
        match self {
            Item::Ok(meta) => Some(meta),
            Item::Err(_) => None,
        }
    }
}

/// One page of a bucket listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataList {
    pub items: Vec<Item>,
    /// Position of the listing after this page
    pub offset: u64,
    pub page_size: usize,
    /// Agent to pass back for the next page, absent once the listing ended
    pub agent_id: Option<String>,
    /// End of data
    pub eod: bool,
}
