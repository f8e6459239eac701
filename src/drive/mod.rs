//! Drive - one mount point managed by the server
//!
//! A drive owns the directory layout under its root and performs raw
//! file-level CRUD. It has no knowledge of other drives, and it is not safe
//! for concurrent mutation of the same path: callers hold the object and
//! bucket locks.
//!
//! # Layout
//!
//! ```text
//! <root>/
//! ├── sys/
//! │   ├── buckets/<bucketId>/<bucketId>.json          bucket metadata
//! │   ├── buckets/<bucketId>/<object>/<object>.json   head metadata
//! │   ├── buckets/<bucketId>/<object>/<object>.vN.json
//! │   ├── journal/<opId>.json
//! │   ├── scheduler/<queue>/<requestId>.json
//! │   ├── work/<bucketId>/<object>/                   metadata backups
//! │   ├── cache/<bucketId>/
//! │   ├── temp/
//! │   ├── drive-info
//! │   ├── server-metadata
//! │   └── encryption-key
//! └── <bucketId>/
//!     ├── <object>                                    head data (or shards)
//!     └── version/<object>.vN
//! ```

mod objects;
mod pool;

pub use objects::DataWrite;
pub use pool::DrivePool;

use crate::error::{Error, Result};
use crate::model::{DriveInfo, DriveStatus, VfsOperation};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

// =============================================================================
// Constants
// =============================================================================

pub const SYS_DIR: &str = "sys";
pub const BUCKETS_DIR: &str = "buckets";
pub const JOURNAL_DIR: &str = "journal";
pub const SCHEDULER_DIR: &str = "scheduler";
pub const TEMP_DIR: &str = "temp";
pub const WORK_DIR: &str = "work";
pub const CACHE_DIR: &str = "cache";
pub const VERSION_DIR: &str = "version";

pub const DRIVE_INFO_FILE: &str = "drive-info";
pub const SERVER_METADATA_FILE: &str = "server-metadata";
pub const ENCRYPTION_KEY_FILE: &str = "encryption-key";

const JSON_EXT: &str = ".json";

// =============================================================================
// Drive
// =============================================================================

/// One physical root directory
#[derive(Debug)]
pub struct Drive {
    /// Name used in metadata and logs
    name: String,
    /// Root directory
    root: PathBuf,
    /// Position in the configured drive list
    order: usize,
    /// Durable descriptor, cached
    info: RwLock<DriveInfo>,
}

impl Drive {
    /// Open a drive, creating its directory skeleton and descriptor if absent
    pub fn open(root: impl Into<PathBuf>, order: usize) -> Result<Self> {
        let root = root.into();
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| format!("drive{}", order));

        let drive = Self {
            info: RwLock::new(DriveInfo::new(name.clone(), order)),
            name,
            root,
            order,
        };
        drive.bootstrap()?;
        Ok(drive)
    }

    /// Idempotent creation of every required subdirectory and of `drive-info`
    fn bootstrap(&self) -> Result<()> {
        for dir in [
            self.sys_dir(),
            self.sys_dir().join(BUCKETS_DIR),
            self.journal_dir(),
            self.sys_dir().join(SCHEDULER_DIR),
            self.temp_dir(),
            self.sys_dir().join(WORK_DIR),
            self.sys_dir().join(CACHE_DIR),
        ] {
            fs::create_dir_all(&dir)?;
        }

        let info_path = self.sys_dir().join(DRIVE_INFO_FILE);
        if info_path.exists() {
            let info: DriveInfo = read_json(&info_path)?;
            debug!(
                "Drive {} loaded descriptor id={} status={:?}",
                self.name, info.drive_id, info.status
            );
            *self.info.write() = info;
        } else {
            let info = self.info.read().clone();
            self.write_json(&info_path, &info)?;
            info!("Drive {} initialized at {}", self.name, self.root.display());
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn info(&self) -> DriveInfo {
        self.info.read().clone()
    }

    pub fn status(&self) -> DriveStatus {
        self.info.read().status
    }

    pub fn is_enabled(&self) -> bool {
        self.status() == DriveStatus::Enabled
    }

    /// Persist a new status in `drive-info`
    pub fn set_status(&self, status: DriveStatus) -> Result<()> {
        let mut info = self.info.write();
        let mut updated = info.clone();
        updated.status = status;
        self.write_json(&self.sys_dir().join(DRIVE_INFO_FILE), &updated)?;
        *info = updated;
        info!("Drive {} status -> {:?}", self.name, status);
        Ok(())
    }

    // =========================================================================
    // Paths
    // =========================================================================

    pub fn sys_dir(&self) -> PathBuf {
        self.root.join(SYS_DIR)
    }

    pub fn journal_dir(&self) -> PathBuf {
        self.sys_dir().join(JOURNAL_DIR)
    }

    pub fn scheduler_dir(&self, queue: &str) -> PathBuf {
        self.sys_dir().join(SCHEDULER_DIR).join(queue)
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.sys_dir().join(TEMP_DIR)
    }

    pub fn bucket_metadata_dir(&self, bucket_id: u64) -> PathBuf {
        self.sys_dir().join(BUCKETS_DIR).join(bucket_id.to_string())
    }

    pub fn bucket_metadata_path(&self, bucket_id: u64) -> PathBuf {
        self.bucket_metadata_dir(bucket_id)
            .join(format!("{}{}", bucket_id, JSON_EXT))
    }

    pub fn object_metadata_dir(&self, bucket_id: u64, object: &str) -> PathBuf {
        self.bucket_metadata_dir(bucket_id).join(object)
    }

    pub fn object_metadata_path(&self, bucket_id: u64, object: &str) -> PathBuf {
        self.object_metadata_dir(bucket_id, object)
            .join(format!("{}{}", object, JSON_EXT))
    }

    pub fn object_metadata_version_path(&self, bucket_id: u64, object: &str, version: u32) -> PathBuf {
        self.object_metadata_dir(bucket_id, object)
            .join(format!("{}.v{}{}", object, version, JSON_EXT))
    }

    pub fn bucket_data_dir(&self, bucket_id: u64) -> PathBuf {
        self.root.join(bucket_id.to_string())
    }

    pub fn bucket_version_dir(&self, bucket_id: u64) -> PathBuf {
        self.bucket_data_dir(bucket_id).join(VERSION_DIR)
    }

    /// Head data file; `file` is the object name or a RAID 6 shard name
    pub fn data_file_path(&self, bucket_id: u64, file: &str) -> PathBuf {
        self.bucket_data_dir(bucket_id).join(file)
    }

    pub fn data_file_version_path(&self, bucket_id: u64, file: &str, version: u32) -> PathBuf {
        self.bucket_version_dir(bucket_id)
            .join(format!("{}.v{}", file, version))
    }

    pub fn bucket_work_dir(&self, bucket_id: u64) -> PathBuf {
        self.sys_dir().join(WORK_DIR).join(bucket_id.to_string())
    }

    pub fn object_work_dir(&self, bucket_id: u64, object: &str) -> PathBuf {
        self.bucket_work_dir(bucket_id).join(object)
    }

    /// Metadata backup taken by one journal operation
    pub fn metadata_backup_dir(&self, bucket_id: u64, object: &str, op_id: &str) -> PathBuf {
        self.object_work_dir(bucket_id, object).join(op_id)
    }

    pub fn bucket_cache_dir(&self, bucket_id: u64) -> PathBuf {
        self.sys_dir().join(CACHE_DIR).join(bucket_id.to_string())
    }

    fn journal_path(&self, id: &str) -> PathBuf {
        self.journal_dir().join(format!("{}{}", id, JSON_EXT))
    }

    // =========================================================================
    // Journal
    // =========================================================================

    /// Persist a pending operation
    pub fn save_journal(&self, op: &VfsOperation) -> Result<()> {
        self.write_json(&self.journal_path(&op.id), op)
    }

    /// Remove a pending operation; absent entries are ignored
    pub fn remove_journal(&self, id: &str) -> Result<()> {
        remove_file_if_exists(&self.journal_path(id))
    }

    /// Every operation still present in the journal directory
    pub fn load_journal(&self) -> Result<Vec<VfsOperation>> {
        let mut ops = Vec::new();
        for path in list_json_files(&self.journal_dir())? {
            match read_json::<VfsOperation>(&path) {
                Ok(op) => ops.push(op),
                Err(e) => warn!(
                    "Drive {} skipping unreadable journal entry {}: {}",
                    self.name,
                    path.display(),
                    e
                ),
            }
        }
        Ok(ops)
    }

    // =========================================================================
    // Scheduler Queue
    // =========================================================================

    pub fn save_scheduler<T: Serialize>(&self, queue: &str, id: &str, request: &T) -> Result<()> {
        let dir = self.scheduler_dir(queue);
        fs::create_dir_all(&dir)?;
        self.write_json(&dir.join(format!("{}{}", id, JSON_EXT)), request)
    }

    pub fn remove_scheduler(&self, queue: &str, id: &str) -> Result<()> {
        remove_file_if_exists(&self.scheduler_dir(queue).join(format!("{}{}", id, JSON_EXT)))
    }

    pub fn scheduler_requests<T: DeserializeOwned>(&self, queue: &str) -> Result<Vec<T>> {
        let mut requests = Vec::new();
        for path in list_json_files(&self.scheduler_dir(queue))? {
            match read_json::<T>(&path) {
                Ok(req) => requests.push(req),
                Err(e) => warn!(
                    "Drive {} skipping unreadable service request {}: {}",
                    self.name,
                    path.display(),
                    e
                ),
            }
        }
        Ok(requests)
    }

    // =========================================================================
    // Sys Files
    // =========================================================================

    pub fn put_sys_file(&self, name: &str, data: &[u8]) -> Result<()> {
        self.write_atomic(&self.sys_dir().join(name), data)
    }

    pub fn sys_file(&self, name: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.sys_dir().join(name)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn exists_sys_file(&self, name: &str) -> bool {
        self.sys_dir().join(name).is_file()
    }

    pub fn remove_sys_file(&self, name: &str) -> Result<()> {
        remove_file_if_exists(&self.sys_dir().join(name))
    }

    /// Remove leftovers of interrupted writes
    pub fn clean_temp_dir(&self) -> Result<()> {
        let dir = self.temp_dir();
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;
        Ok(())
    }

    // =========================================================================
    // Atomic Writes
    // =========================================================================

    /// Unique path inside `sys/temp`
    pub(crate) fn temp_file(&self) -> PathBuf {
        self.temp_dir().join(uuid::Uuid::new_v4().to_string())
    }

    /// Write to a temp file, then rename over the destination
    pub(crate) fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.temp_file();
        fs::write(&tmp, data)?;
        if let Err(e) = fs::rename(&tmp, path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    pub(crate) fn write_json<T: Serialize + ?Sized>(&self, path: &Path, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(value)?;
        self.write_atomic(path, &bytes)
    }
}

// =============================================================================
// Helpers
// =============================================================================

pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Read a JSON file, mapping a missing file to `None`
pub(crate) fn read_json_opt<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::Io(e)),
    }
}

pub(crate) fn remove_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn list_json_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
