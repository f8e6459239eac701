//! RAID 0 - each object lives on exactly one drive
//!
//! The drive is chosen by a stable hash of `(bucket id, object name)` over
//! the drives in configuration order, so adding a drive moves objects and
//! the pool cannot be expanded in place.

use super::StoredData;
use crate::drive::{Drive, DrivePool};
use crate::error::{Error, Result};
use crate::model::ObjectMetadata;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::sync::Arc;

pub(crate) struct Raid0Layout {
    drives: Arc<DrivePool>,
}

impl Raid0Layout {
    pub fn new(drives: Arc<DrivePool>) -> Self {
        Self { drives }
    }

    pub fn all_drives(&self) -> Vec<Arc<Drive>> {
        self.drives.all().to_vec()
    }

    /// Owner drive of an object
    pub fn drive_for(&self, bucket_id: u64, object: &str) -> Result<Arc<Drive>> {
        let all = self.drives.all();
        if all.is_empty() {
            return Err(Error::IllegalState("no drive configured".to_string()));
        }
        let index = (placement_hash(bucket_id, object) % all.len() as u64) as usize;
        Ok(all[index].clone())
    }

    pub fn write_data(&self, bucket_id: u64, object: &str, payload: &[u8]) -> Result<StoredData> {
        let drive = self.drive_for(bucket_id, object)?;
        let written = drive.put_data_bytes(bucket_id, object, payload)?;
        Ok(StoredData {
            stored_length: written.length,
            block_size: 0,
            etag: written.sha256.clone(),
            sha256: Some(written.sha256),
            sha256_blocks: Vec::new(),
            drive: drive.name().to_string(),
        })
    }

    pub fn open_data(&self, meta: &ObjectMetadata, version: Option<u32>) -> Result<Box<dyn Read + Send>> {
        let drive = self.drive_for(meta.bucket_id, &meta.object_name)?;
        let file = match version {
            Some(v) => drive.open_data_file_version(meta.bucket_id, &meta.object_name, v)?,
            None => drive.open_data_file(meta.bucket_id, &meta.object_name)?,
        };
        Ok(Box::new(file))
    }
}

/// First 8 bytes of SHA-256 over `<bucketId>:<object>`
fn placement_hash(bucket_id: u64, object: &str) -> u64 {
    let digest = Sha256::digest(format!("{}:{}", bucket_id, object).as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}
