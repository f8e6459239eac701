//! Bucket, object metadata and data file operations of a drive

use super::{read_json_opt, remove_dir_if_exists, remove_file_if_exists, Drive};
use crate::error::{Error, Result};
use crate::model::{BucketMetadata, ObjectMetadata};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Read, Write};
use std::path::Path;
use tracing::debug;

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Outcome of writing one data file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataWrite {
    /// Bytes written
    pub length: u64,
    /// Hex SHA-256 of the bytes written
    pub sha256: String,
}

impl Drive {
    // =========================================================================
    // Buckets
    // =========================================================================

    /// Create the metadata, data, version, work and cache directories of a bucket
    pub fn create_bucket(&self, meta: &BucketMetadata) -> Result<()> {
        let meta_dir = self.bucket_metadata_dir(meta.id);
        if meta_dir.exists() {
            return Err(Error::IllegalState(format!(
                "bucket {} already exists on drive {}",
                meta.id, self.name
            )));
        }
        fs::create_dir_all(&meta_dir)?;
        fs::create_dir_all(self.bucket_version_dir(meta.id))?;
        fs::create_dir_all(self.bucket_work_dir(meta.id))?;
        fs::create_dir_all(self.bucket_cache_dir(meta.id))?;
        self.write_json(&self.bucket_metadata_path(meta.id), meta)?;
        debug!("Drive {} created bucket {}", self.name, meta.id);
        Ok(())
    }

    /// Overwrite the bucket descriptor (status changes)
    pub fn update_bucket(&self, meta: &BucketMetadata) -> Result<()> {
        if !self.bucket_metadata_dir(meta.id).exists() {
            return Err(Error::BucketNotFound(meta.bucket_name.clone()));
        }
        self.write_json(&self.bucket_metadata_path(meta.id), meta)
    }

    pub fn get_bucket(&self, bucket_id: u64) -> Result<Option<BucketMetadata>> {
        read_json_opt(&self.bucket_metadata_path(bucket_id))
    }

    pub fn bucket_exists(&self, bucket_id: u64) -> bool {
        self.bucket_metadata_dir(bucket_id).is_dir()
    }

    /// Every bucket descriptor found on this drive
    pub fn load_buckets(&self) -> Result<Vec<BucketMetadata>> {
        let dir = self.sys_dir().join(super::BUCKETS_DIR);
        let mut buckets = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Ok(id) = entry.file_name().to_string_lossy().parse::<u64>() else {
                continue;
            };
            if let Some(meta) = self.get_bucket(id)? {
                buckets.push(meta);
            }
        }
        buckets.sort_by_key(|b| b.id);
        Ok(buckets)
    }

    /// A bucket is empty when its metadata directory holds no object directory
    pub fn is_bucket_empty(&self, bucket_id: u64) -> Result<bool> {
        let entries = match fs::read_dir(self.bucket_metadata_dir(bucket_id)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            if entry?.file_type()?.is_dir() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Remove an empty bucket
    pub fn delete_bucket(&self, bucket_id: u64) -> Result<()> {
        if !self.is_bucket_empty(bucket_id)? {
            return Err(Error::IllegalState(format!(
                "bucket {} is not empty on drive {}",
                bucket_id, self.name
            )));
        }
        self.force_delete_bucket(bucket_id)
    }

    /// Remove every directory of a bucket regardless of content
    pub fn force_delete_bucket(&self, bucket_id: u64) -> Result<()> {
        remove_dir_if_exists(&self.bucket_metadata_dir(bucket_id))?;
        remove_dir_if_exists(&self.bucket_data_dir(bucket_id))?;
        remove_dir_if_exists(&self.bucket_work_dir(bucket_id))?;
        remove_dir_if_exists(&self.bucket_cache_dir(bucket_id))?;
        debug!("Drive {} removed bucket {}", self.name, bucket_id);
        Ok(())
    }

    pub fn clean_work_dir(&self, bucket_id: u64) -> Result<()> {
        let dir = self.bucket_work_dir(bucket_id);
        remove_dir_if_exists(&dir)?;
        fs::create_dir_all(&dir)?;
        Ok(())
    }

    pub fn clean_cache_dir(&self, bucket_id: u64) -> Result<()> {
        let dir = self.bucket_cache_dir(bucket_id);
        remove_dir_if_exists(&dir)?;
        fs::create_dir_all(&dir)?;
        Ok(())
    }

    // =========================================================================
    // Object Metadata
    // =========================================================================

    pub fn get_object_metadata(&self, bucket_id: u64, object: &str) -> Result<Option<ObjectMetadata>> {
        read_json_opt(&self.object_metadata_path(bucket_id, object))
    }

    /// A purged or never written version yields `None`
    pub fn get_object_metadata_version(
        &self,
        bucket_id: u64,
        object: &str,
        version: u32,
    ) -> Result<Option<ObjectMetadata>> {
        read_json_opt(&self.object_metadata_version_path(bucket_id, object, version))
    }

    /// Write the head metadata file; `last_modified` is left as given
    pub fn save_object_metadata(&self, meta: &ObjectMetadata) -> Result<()> {
        let dir = self.object_metadata_dir(meta.bucket_id, &meta.object_name);
        fs::create_dir_all(&dir)?;
        self.write_json(
            &self.object_metadata_path(meta.bucket_id, &meta.object_name),
            meta,
        )
    }

    /// Write `meta` as the `.v<meta.version>` file
    pub fn save_object_metadata_version(&self, meta: &ObjectMetadata) -> Result<()> {
        let dir = self.object_metadata_dir(meta.bucket_id, &meta.object_name);
        fs::create_dir_all(&dir)?;
        self.write_json(
            &self.object_metadata_version_path(meta.bucket_id, &meta.object_name, meta.version),
            meta,
        )
    }

    pub fn remove_object_metadata_version(&self, bucket_id: u64, object: &str, version: u32) -> Result<()> {
        remove_file_if_exists(&self.object_metadata_version_path(bucket_id, object, version))
    }

    /// Remove head and every version metadata file of an object
    pub fn remove_object_metadata_dir(&self, bucket_id: u64, object: &str) -> Result<()> {
        remove_dir_if_exists(&self.object_metadata_dir(bucket_id, object))
    }

    pub fn exists_object_metadata(&self, bucket_id: u64, object: &str) -> bool {
        self.object_metadata_path(bucket_id, object).is_file()
    }

    // =========================================================================
    // Metadata Backups (work dir)
    // =========================================================================

    /// Copy the object's metadata directory into `sys/work/<bucket>/<object>/<op_id>`
    pub fn backup_metadata_dir(&self, bucket_id: u64, object: &str, op_id: &str) -> Result<()> {
        let src = self.object_metadata_dir(bucket_id, object);
        let dst = self.metadata_backup_dir(bucket_id, object, op_id);
        remove_dir_if_exists(&dst)?;
        if !src.is_dir() {
            return Ok(());
        }
        // staged in sys/temp so a backup is either complete or absent
        let staging = self.temp_file();
        if let Err(e) = copy_dir_files(&src, &staging) {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        if let Err(e) = fs::rename(&staging, &dst) {
            let _ = fs::remove_dir_all(&staging);
            return Err(e.into());
        }
        Ok(())
    }

    /// Replace the metadata directory with the backup taken by `op_id`; false if it took none
    ///
    /// Backups left by other operations are never used, so an operation that
    /// failed before its own backup leaves the metadata directory untouched.
    pub fn restore_metadata_dir(&self, bucket_id: u64, object: &str, op_id: &str) -> Result<bool> {
        let backup = self.metadata_backup_dir(bucket_id, object, op_id);
        if !backup.is_dir() {
            return Ok(false);
        }
        let dst = self.object_metadata_dir(bucket_id, object);
        remove_dir_if_exists(&dst)?;
        copy_dir_files(&backup, &dst)?;
        Ok(true)
    }

    pub fn has_metadata_backup(&self, bucket_id: u64, object: &str, op_id: &str) -> bool {
        self.metadata_backup_dir(bucket_id, object, op_id).is_dir()
    }

    pub fn remove_metadata_backup(&self, bucket_id: u64, object: &str, op_id: &str) -> Result<()> {
        remove_dir_if_exists(&self.metadata_backup_dir(bucket_id, object, op_id))?;
        // fails while backups of other operations remain
        let _ = fs::remove_dir(self.object_work_dir(bucket_id, object));
        Ok(())
    }

    pub fn remove_object_work_dir(&self, bucket_id: u64, object: &str) -> Result<()> {
        remove_dir_if_exists(&self.object_work_dir(bucket_id, object))
    }

    // =========================================================================
    // Data Files
    // =========================================================================

    /// Stream `data` into the head data file through `sys/temp`, hashing as it goes
    pub fn put_data_file(&self, bucket_id: u64, file: &str, data: &mut dyn Read) -> Result<DataWrite> {
        let dest = self.data_file_path(bucket_id, file);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.temp_file();
        let written = match write_hashed(&tmp, data) {
            Ok(w) => w,
            Err(e) => {
                let _ = fs::remove_file(&tmp);
                return Err(e);
            }
        };
        if let Err(e) = fs::rename(&tmp, &dest) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(written)
    }

    pub fn put_data_bytes(&self, bucket_id: u64, file: &str, data: &[u8]) -> Result<DataWrite> {
        let mut cursor = std::io::Cursor::new(data);
        self.put_data_file(bucket_id, file, &mut cursor)
    }

    /// Write a version data file directly, used when seeding a drive
    pub fn put_data_version_bytes(&self, bucket_id: u64, file: &str, version: u32, data: &[u8]) -> Result<()> {
        self.write_atomic(&self.data_file_version_path(bucket_id, file, version), data)
    }

    pub fn open_data_file(&self, bucket_id: u64, file: &str) -> Result<File> {
        Ok(File::open(self.data_file_path(bucket_id, file))?)
    }

    pub fn open_data_file_version(&self, bucket_id: u64, file: &str, version: u32) -> Result<File> {
        Ok(File::open(self.data_file_version_path(bucket_id, file, version))?)
    }

    /// Read a head or version data file; missing files yield `None`
    pub fn read_data(&self, bucket_id: u64, file: &str, version: Option<u32>) -> Result<Option<Vec<u8>>> {
        let path = match version {
            Some(v) => self.data_file_version_path(bucket_id, file, v),
            None => self.data_file_path(bucket_id, file),
        };
        match fs::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn data_file_exists(&self, bucket_id: u64, file: &str) -> bool {
        self.data_file_path(bucket_id, file).is_file()
    }

    pub fn data_file_version_exists(&self, bucket_id: u64, file: &str, version: u32) -> bool {
        self.data_file_version_path(bucket_id, file, version).is_file()
    }

    /// Hex SHA-256 of a head or version data file, `None` if absent
    pub fn hash_data_file(&self, bucket_id: u64, file: &str, version: Option<u32>) -> Result<Option<String>> {
        let path = match version {
            Some(v) => self.data_file_version_path(bucket_id, file, v),
            None => self.data_file_path(bucket_id, file),
        };
        let mut f = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        loop {
            let n = f.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Some(hex::encode(hasher.finalize())))
    }

    /// Copy the head data file to `version/<file>.v<version>`
    pub fn copy_data_to_version(&self, bucket_id: u64, file: &str, version: u32) -> Result<()> {
        let src = self.data_file_path(bucket_id, file);
        let dst = self.data_file_version_path(bucket_id, file, version);
        self.copy_atomic(&src, &dst)
    }

    /// Copy `version/<file>.v<version>` over the head data file
    pub fn copy_version_to_data(&self, bucket_id: u64, file: &str, version: u32) -> Result<()> {
        let src = self.data_file_version_path(bucket_id, file, version);
        let dst = self.data_file_path(bucket_id, file);
        self.copy_atomic(&src, &dst)
    }

    pub fn remove_data_file(&self, bucket_id: u64, file: &str) -> Result<()> {
        remove_file_if_exists(&self.data_file_path(bucket_id, file))
    }

    pub fn remove_data_file_version(&self, bucket_id: u64, file: &str, version: u32) -> Result<()> {
        remove_file_if_exists(&self.data_file_version_path(bucket_id, file, version))
    }

    /// Names of the head data files of a bucket
    pub fn list_data_files(&self, bucket_id: u64) -> Result<Vec<String>> {
        list_file_names(&self.bucket_data_dir(bucket_id))
    }

    /// Names of the version data files of a bucket
    pub fn list_version_files(&self, bucket_id: u64) -> Result<Vec<String>> {
        list_file_names(&self.bucket_version_dir(bucket_id))
    }

    fn copy_atomic(&self, src: &Path, dst: &Path) -> Result<()> {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.temp_file();
        fs::copy(src, &tmp)?;
        if let Err(e) = fs::rename(&tmp, dst) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn write_hashed(path: &Path, data: &mut dyn Read) -> Result<DataWrite> {
    let mut out = BufWriter::new(File::create(path)?);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut length = 0u64;
    loop {
        let n = data.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        out.write_all(&buf[..n])?;
        length += n as u64;
    }
    out.flush()?;
    out.get_ref().sync_all()?;
    Ok(DataWrite {
        length,
        sha256: hex::encode(hasher.finalize()),
    })
}

fn copy_dir_files(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            fs::copy(entry.path(), dst.join(entry.file_name()))?;
        }
    }
    Ok(())
}

fn list_file_names(dir: &Path) -> Result<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    Ok(names)
}
