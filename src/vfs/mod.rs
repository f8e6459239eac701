//! Virtual file system - owner of the drives, the bucket registry and every service
//!
//! # Startup
//!
//! ```text
//!   validate settings ─▶ open drives ─▶ enable drives (fresh install / RAID 0)
//!     ─▶ roll back pending journal entries ─▶ load buckets
//!     ─▶ clean temp + work dirs ─▶ reload scheduler queue
//!     ─▶ server metadata ─▶ encryption key
//! ```
//!
//! Any failure here is fatal: a server that cannot recover its journal must
//! not accept traffic.
//!
//! # Background work
//!
//! `start_background` spawns the lock sweeper, the scheduler worker, the
//! iterator purge loop and, when drives are `NotSync`, a drive sync on the
//! blocking pool. `shutdown` stops them.

use crate::config::ServerSettings;
use crate::crypto::{AesGcmEncryption, MasterKey};
use crate::drive::DrivePool;
use crate::driver::{DriveSyncReport, IoDriver, VfsContext};
use crate::error::{Error, Result};
use crate::model::{
    BucketStatus, DataList, DriveStatus, ObjectMetadata, RedundancyLevel, ServerBucket, ServerInfo,
};
use crate::replication::ReplicationService;
use crate::scheduler::{RequestExecutor, ServiceRequest, ServiceRequestKind};
use std::io::Read;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

pub struct VirtualFileSystem {
    ctx: Arc<VfsContext>,
    driver: Arc<IoDriver>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for VirtualFileSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualFileSystem").finish_non_exhaustive()
    }
}

impl VirtualFileSystem {
    /// Open the drives and recover the server state
    pub fn open(settings: ServerSettings) -> Result<Arc<Self>> {
        Self::open_with_replication(settings, None)
    }

    /// Open with a standby replication target
    #[instrument(skip_all, fields(server = %settings.server_name, raid = %settings.redundancy_level))]
    pub fn open_with_replication(
        settings: ServerSettings,
        replication: Option<Arc<dyn ReplicationService>>,
    ) -> Result<Arc<Self>> {
        settings.validate()?;
        if settings.standby_enabled && replication.is_none() {
            warn!("Standby is enabled but no replication service was supplied");
        }

        let drives = Arc::new(DrivePool::open(&settings.drives)?);
        let ctx = Arc::new(VfsContext::new(settings, drives, replication));
        let driver = Arc::new(IoDriver::new(ctx.clone())?);
        let vfs = Self {
            ctx,
            driver,
            shutdown: CancellationToken::new(),
        };

        vfs.bootstrap().map_err(|e| match e {
            Error::Fatal(_) => e,
            other => Error::Fatal(other.to_string()),
        })?;
        info!(
            "Opened {} with {} drives ({} buckets)",
            vfs.ctx.settings.redundancy_level,
            vfs.ctx.drives.len(),
            vfs.ctx.buckets.len()
        );
        Ok(Arc::new(vfs))
    }

    fn bootstrap(&self) -> Result<()> {
        self.enable_drives()?;
        self.recover_journal()?;
        self.load_buckets()?;

        for drive in self.ctx.drives.all() {
            drive.clean_temp_dir()?;
            for bucket in self.ctx.buckets.iter() {
                drive.clean_work_dir(bucket.id)?;
            }
        }

        let reloaded = self.ctx.scheduler.reload()?;
        if reloaded > 0 {
            info!("Reloaded {} pending service requests", reloaded);
        }

        if self.driver.server_info()?.is_none() {
            let info = ServerInfo::new(
                self.ctx.settings.server_name.clone(),
                self.ctx.settings.redundancy_level,
            );
            self.driver.save_server_metadata(&info)?;
        }

        if self.ctx.settings.encryption.enabled {
            self.bootstrap_encryption()?;
        }
        Ok(())
    }

    /// Fresh installs and RAID 0 have nothing to sync from
    fn enable_drives(&self) -> Result<()> {
        let not_sync = self.ctx.drives.not_sync();
        if not_sync.is_empty() {
            return Ok(());
        }
        let fresh = not_sync.len() == self.ctx.drives.len();
        if fresh || self.ctx.settings.redundancy_level == RedundancyLevel::Raid0 {
            for drive in not_sync {
                drive.set_status(DriveStatus::Enabled)?;
            }
            return Ok(());
        }
        info!(
            "{} drives need sync: {:?}",
            not_sync.len(),
            not_sync.iter().map(|d| d.name()).collect::<Vec<_>>()
        );
        Ok(())
    }

    fn recover_journal(&self) -> Result<()> {
        let pending = self.ctx.journal.pending_operations()?;
        if pending.is_empty() {
            return Ok(());
        }
        warn!("Rolling back {} interrupted operations", pending.len());
        for op in &pending {
            self.driver.rollback_journal(op, true)?;
        }
        Ok(())
    }

    /// Register every bucket found on the drives and finish committed deletes
    fn load_buckets(&self) -> Result<()> {
        let mut drives = self.ctx.drives.enabled();
        drives.extend(self.ctx.drives.not_sync());
        for drive in &drives {
            for meta in drive.load_buckets()? {
                if meta.status == BucketStatus::Deleted {
                    drive.force_delete_bucket(meta.id)?;
                    continue;
                }
                self.ctx
                    .buckets
                    .entry(meta.id)
                    .or_insert_with(|| ServerBucket::from(&meta));
            }
        }
        Ok(())
    }

    fn bootstrap_encryption(&self) -> Result<()> {
        let hex_key = self
            .ctx
            .settings
            .encryption
            .master_key
            .as_deref()
            .ok_or_else(|| Error::Fatal("encryption enabled without a master key".to_string()))?;
        let master = MasterKey::from_hex(hex_key)?;

        let wrapped = match self.driver.wrapped_data_key()? {
            Some(wrapped) => wrapped,
            None => {
                let wrapped = master.wrap(&AesGcmEncryption::generate_key())?;
                self.driver.save_wrapped_data_key(&wrapped)?;
                wrapped
            }
        };
        let data_key = unwrap_data_key(&master, &wrapped)?;
        self.ctx
            .set_encryption(Arc::new(AesGcmEncryption::new(&data_key)?));
        info!("Encryption enabled");
        Ok(())
    }

    // =========================================================================
    // Background
    // =========================================================================

    /// Spawn the background daemons on the current tokio runtime
    pub fn start_background(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let locks = self.ctx.locks.clone();
        handles.push(tokio::spawn(locks.run(self.shutdown.clone())));

        let scheduler = self.ctx.scheduler.clone();
        let executor: Arc<dyn RequestExecutor> = self.driver.clone();
        handles.push(tokio::spawn(scheduler.run(executor, self.shutdown.clone())));

        let iterators = self.ctx.iterators.clone();
        handles.push(tokio::spawn(iterators.run(self.shutdown.clone())));

        if self.needs_sync() {
            let driver = self.driver.clone();
            handles.push(tokio::spawn(async move {
                match tokio::task::spawn_blocking(move || driver.sync_drives()).await {
                    Ok(Ok(report)) => info!("Drive sync finished: {:?}", report),
                    Ok(Err(e)) => error!("Drive sync failed: {}", e),
                    Err(e) => error!("Drive sync task panicked: {}", e),
                }
            }));
        }

        info!("Started {} background tasks", handles.len());
        handles
    }

    fn needs_sync(&self) -> bool {
        self.ctx.settings.redundancy_level != RedundancyLevel::Raid0
            && !self.ctx.drives.not_sync().is_empty()
    }

    /// Stop the background daemons
    pub fn shutdown(&self) {
        info!("Shutting down virtual file system");
        self.shutdown.cancel();
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn settings(&self) -> &ServerSettings {
        &self.ctx.settings
    }

    pub fn context(&self) -> &Arc<VfsContext> {
        &self.ctx
    }

    pub fn driver(&self) -> &Arc<IoDriver> {
        &self.driver
    }

    pub fn server_info(&self) -> Result<ServerInfo> {
        self.driver
            .server_info()?
            .ok_or_else(|| Error::IllegalState("server metadata is missing".to_string()))
    }

    /// Copy missing data onto `NotSync` drives now
    pub fn sync_drives(&self) -> Result<DriveSyncReport> {
        self.driver.sync_drives()
    }

    /// Run queued service requests on the calling thread
    pub fn process_pending_requests(&self) -> usize {
        self.ctx.scheduler.process_pending(self.driver.as_ref())
    }

    // =========================================================================
    // Buckets
    // =========================================================================

    pub fn create_bucket(&self, name: &str) -> Result<ServerBucket> {
        self.driver.create_bucket(name)
    }

    pub fn delete_bucket(&self, name: &str) -> Result<()> {
        let bucket = self.get_bucket(name)?;
        self.driver.delete_bucket(&bucket)
    }

    /// Accessible buckets ordered by id
    pub fn list_buckets(&self) -> Vec<ServerBucket> {
        let mut buckets: Vec<ServerBucket> = self
            .ctx
            .buckets
            .iter()
            .filter(|b| b.is_accessible())
            .map(|b| b.value().clone())
            .collect();
        buckets.sort_by_key(|b| b.id);
        buckets
    }

    pub fn get_bucket(&self, name: &str) -> Result<ServerBucket> {
        self.ctx
            .buckets
            .iter()
            .find(|b| b.name == name && b.is_accessible())
            .map(|b| b.value().clone())
            .ok_or_else(|| Error::BucketNotFound(name.to_string()))
    }

    pub fn exists_bucket(&self, name: &str) -> bool {
        self.get_bucket(name).is_ok()
    }

    pub fn is_bucket_empty(&self, name: &str) -> Result<bool> {
        self.driver.is_empty(&self.get_bucket(name)?)
    }

    // =========================================================================
    // Objects
    // =========================================================================

    pub fn put_object(
        &self,
        bucket: &str,
        object: &str,
        data: &mut dyn Read,
        file_name: Option<&str>,
        content_type: Option<&str>,
    ) -> Result<ObjectMetadata> {
        let bucket = self.get_bucket(bucket)?;
        self.driver
            .put_object(&bucket, object, data, file_name, content_type)
    }

    /// Store an in-memory payload
    pub fn put_object_bytes(&self, bucket: &str, object: &str, data: &[u8]) -> Result<ObjectMetadata> {
        let mut reader = data;
        self.put_object(bucket, object, &mut reader, None, None)
    }

    pub fn get_object_metadata(&self, bucket: &str, object: &str) -> Result<ObjectMetadata> {
        self.driver
            .get_object_metadata(&self.get_bucket(bucket)?, object)
    }

    pub fn get_object_metadata_version(
        &self,
        bucket: &str,
        object: &str,
        version: u32,
    ) -> Result<ObjectMetadata> {
        self.driver
            .get_object_metadata_version(&self.get_bucket(bucket)?, object, version)
    }

    pub fn get_object_metadata_version_all(&self, bucket: &str, object: &str) -> Result<Vec<ObjectMetadata>> {
        self.driver
            .get_object_metadata_version_all(&self.get_bucket(bucket)?, object)
    }

    pub fn get_object(&self, bucket: &str, object: &str) -> Result<Box<dyn Read + Send>> {
        self.driver.get_input_stream(&self.get_bucket(bucket)?, object)
    }

    pub fn get_object_version(&self, bucket: &str, object: &str, version: u32) -> Result<Box<dyn Read + Send>> {
        self.driver
            .get_object_version_input_stream(&self.get_bucket(bucket)?, object, version)
    }

    /// Whole content of the head version
    pub fn read_object(&self, bucket: &str, object: &str) -> Result<Vec<u8>> {
        let mut content = Vec::new();
        self.get_object(bucket, object)?.read_to_end(&mut content)?;
        Ok(content)
    }

    /// Whole content of a version
    pub fn read_object_version(&self, bucket: &str, object: &str, version: u32) -> Result<Vec<u8>> {
        let mut content = Vec::new();
        self.get_object_version(bucket, object, version)?
            .read_to_end(&mut content)?;
        Ok(content)
    }

    pub fn exists_object(&self, bucket: &str, object: &str) -> Result<bool> {
        self.driver.exists(&self.get_bucket(bucket)?, object)
    }

    pub fn delete_object(&self, bucket: &str, object: &str) -> Result<()> {
        self.driver.delete(&self.get_bucket(bucket)?, object)
    }

    pub fn delete_object_all_previous_versions(&self, bucket: &str, object: &str) -> Result<()> {
        self.driver
            .delete_object_all_previous_versions(&self.get_bucket(bucket)?, object)
    }

    /// Queue the removal of every previous version in the bucket
    pub fn delete_bucket_all_previous_versions(&self, bucket: &str) -> Result<ServiceRequest> {
        let bucket = self.get_bucket(bucket)?;
        Ok(self
            .ctx
            .scheduler
            .enqueue(ServiceRequestKind::DeleteBucketPreviousVersions {
                bucket_id: Some(bucket.id),
            }))
    }

    /// Queue the removal of every previous version in every bucket
    pub fn wipe_all_previous_versions(&self) -> ServiceRequest {
        self.ctx
            .scheduler
            .enqueue(ServiceRequestKind::DeleteBucketPreviousVersions { bucket_id: None })
    }

    pub fn restore_previous_version(&self, bucket: &str, object: &str) -> Result<ObjectMetadata> {
        self.driver
            .restore_previous_version(&self.get_bucket(bucket)?, object)
    }

    pub fn put_object_metadata(&self, bucket: &str, meta: &ObjectMetadata) -> Result<()> {
        self.driver
            .put_object_metadata(&self.get_bucket(bucket)?, meta)
    }

    pub fn list_objects(
        &self,
        bucket: &str,
        offset: Option<u64>,
        page_size: Option<usize>,
        prefix: Option<&str>,
        agent_id: Option<&str>,
    ) -> Result<DataList> {
        self.driver
            .list_objects(&self.get_bucket(bucket)?, offset, page_size, prefix, agent_id)
    }

    pub fn check_integrity(&self, bucket: &str, object: &str, force: bool) -> Result<bool> {
        self.driver
            .check_integrity(&self.get_bucket(bucket)?, object, force)
    }

    pub fn object_data_files_names(&self, bucket: &str, object: &str, version: Option<u32>) -> Result<Vec<String>> {
        let meta = match version {
            Some(v) => self.get_object_metadata_version(bucket, object, v)?,
            None => self.get_object_metadata(bucket, object)?,
        };
        self.driver.object_data_files_names(&meta, version)
    }
}

impl Drop for VirtualFileSystem {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Recover the data key persisted on the drives
pub fn unwrap_data_key(master: &MasterKey, wrapped: &[u8]) -> Result<Vec<u8>> {
    master
        .unwrap_key(wrapped)
        .map_err(|e| Error::Fatal(format!("cannot unwrap the server data key: {}", e)))
}
