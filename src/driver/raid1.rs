//! RAID 1 - every drive holds a full copy
//!
//! Writes go to every drive, `NotSync` ones included, so a drive being
//! seeded never misses new objects. Reads pick a random enabled drive.

use super::StoredData;
use crate::drive::{Drive, DrivePool};
use crate::error::{Error, Result};
use crate::model::ObjectMetadata;
use std::io::Read;
use std::sync::Arc;

pub(crate) struct Raid1Layout {
    drives: Arc<DrivePool>,
}

impl Raid1Layout {
    pub fn new(drives: Arc<DrivePool>) -> Self {
        Self { drives }
    }

    pub fn all_drives(&self) -> Vec<Arc<Drive>> {
        self.drives.all().to_vec()
    }

    pub fn enabled_drives(&self) -> Vec<Arc<Drive>> {
        self.drives.enabled()
    }

    pub fn read_drive(&self) -> Result<Arc<Drive>> {
        self.drives.random_enabled()
    }

    pub fn write_data(&self, bucket_id: u64, object: &str, payload: &[u8]) -> Result<StoredData> {
        let mut first = None;
        for drive in self.drives.all() {
            let written = drive.put_data_bytes(bucket_id, object, payload)?;
            first.get_or_insert((drive.name().to_string(), written));
        }
        let (drive, written) =
            first.ok_or_else(|| Error::IllegalState("no drive configured".to_string()))?;
        Ok(StoredData {
            stored_length: written.length,
            block_size: 0,
            etag: written.sha256.clone(),
            sha256: Some(written.sha256),
            sha256_blocks: Vec::new(),
            drive,
        })
    }

    pub fn open_data(&self, meta: &ObjectMetadata, version: Option<u32>) -> Result<Box<dyn Read + Send>> {
        let drive = self.read_drive()?;
        let file = match version {
            Some(v) => drive.open_data_file_version(meta.bucket_id, &meta.object_name, v)?,
            None => drive.open_data_file(meta.bucket_id, &meta.object_name)?,
        };
        Ok(Box::new(file))
    }

    /// Copy the data of a version from an enabled drive onto `targets`
    pub fn copy_data_to(&self, meta: &ObjectMetadata, version: Option<u32>, targets: &[Arc<Drive>]) -> Result<()> {
        let source = self.read_drive()?;
        let data = source
            .read_data(meta.bucket_id, &meta.object_name, version)?
            .ok_or_else(|| {
                Error::IllegalState(format!(
                    "data file of {} v:{:?} missing on drive {}",
                    meta.object_name,
                    version,
                    source.name()
                ))
            })?;
        for target in targets {
            match version {
                Some(v) => target.put_data_version_bytes(meta.bucket_id, &meta.object_name, v, &data)?,
                None => {
                    target.put_data_bytes(meta.bucket_id, &meta.object_name, &data)?;
                }
            }
        }
        Ok(())
    }
}
