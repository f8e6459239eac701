//! I/O drivers - RAID 0, RAID 1 and RAID 6 over the drive pool
//!
//! The `IoDriver` is the single entry point for object and bucket I/O. It
//! owns the transactional protocol shared by every redundancy level (lock,
//! validate, journal, mutate, commit or roll back) and delegates physical
//! placement to a `RaidLayout`:
//!
//! ```text
//!                 ┌─────────────────────────────┐
//!   VFS ────────▶ │          IoDriver           │ handlers / integrity / sync
//!                 └──────────────┬──────────────┘
//!                                │ RaidLayout
//!          ┌─────────────────────┼─────────────────────┐
//!          ▼                     ▼                     ▼
//!     Raid0Layout           Raid1Layout           Raid6Layout
//!   one hashed drive       mirror on all       k+m shards per chunk
//! ```
//!
//! # Modules
//!
//! - `handlers.rs`: mutations and their rollback
//! - `integrity.rs`: hash verification and repair
//! - `sync.rs`: seeding of drives in `NotSync` state

mod handlers;
mod integrity;
mod raid0;
mod raid1;
mod raid6;
mod sync;

pub use sync::DriveSyncReport;

use crate::cache::ObjectMetadataCache;
use crate::config::ServerSettings;
use crate::crypto::EncryptionService;
use crate::drive::{Drive, DrivePool};
use crate::error::{context_tag, Error, Result};
use crate::iterator::{BucketIterator, BucketIteratorService};
use crate::journal::JournalService;
use crate::lock::{LockService, LockServiceConfig, ReadGuard};
use crate::model::{DataList, Item, ObjectMetadata, RedundancyLevel, ServerBucket};
use crate::replication::ReplicationService;
use crate::scheduler::{RequestExecutor, SchedulerService, ServiceRequest, ServiceRequestKind};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::io::{Cursor, Read};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

use raid0::Raid0Layout;
use raid1::Raid1Layout;
use raid6::Raid6Layout;

// =============================================================================
// Shared Context
// =============================================================================

/// Services shared by the driver and the VFS, built once at startup
pub struct VfsContext {
    pub settings: ServerSettings,
    pub drives: Arc<DrivePool>,
    /// Bucket registry keyed by id
    pub buckets: DashMap<u64, ServerBucket>,
    pub locks: Arc<LockService>,
    pub journal: JournalService,
    pub cache: ObjectMetadataCache,
    pub scheduler: Arc<SchedulerService>,
    pub iterators: Arc<BucketIteratorService>,
    /// Installed once the data key has been unwrapped
    encryption: RwLock<Option<Arc<dyn EncryptionService>>>,
}

impl VfsContext {
    pub fn new(
        settings: ServerSettings,
        drives: Arc<DrivePool>,
        replication: Option<Arc<dyn ReplicationService>>,
    ) -> Self {
        let locks = LockService::new(LockServiceConfig {
            rate_millisecs: settings.lock_rate_millisecs,
            min_sleep: Duration::from_millis(settings.lock_sweep_min_millisecs),
            max_sleep: Duration::from_millis(settings.lock_sweep_max_millisecs),
        });
        Self {
            journal: JournalService::new(drives.clone(), settings.redundancy_level, replication),
            cache: ObjectMetadataCache::new(settings.use_object_cache, settings.object_cache_capacity),
            scheduler: Arc::new(SchedulerService::new(drives.clone())),
            iterators: Arc::new(BucketIteratorService::new(settings.iterator_idle())),
            locks: Arc::new(locks),
            buckets: DashMap::new(),
            encryption: RwLock::new(None),
            drives,
            settings,
        }
    }

    pub fn encryption(&self) -> Option<Arc<dyn EncryptionService>> {
        self.encryption.read().clone()
    }

    pub fn set_encryption(&self, service: Arc<dyn EncryptionService>) {
        *self.encryption.write() = Some(service);
    }

    /// Current registry entry of an accessible bucket
    pub fn accessible_bucket(&self, bucket: &ServerBucket) -> Result<ServerBucket> {
        match self.buckets.get(&bucket.id) {
            Some(b) if b.is_accessible() => Ok(b.clone()),
            _ => Err(Error::BucketNotFound(bucket.name.clone())),
        }
    }
}

// =============================================================================
// Layouts
// =============================================================================

/// Bytes persisted for an object and their hashes
#[derive(Debug, Clone)]
pub(crate) struct StoredData {
    pub stored_length: u64,
    pub block_size: u64,
    pub sha256: Option<String>,
    pub sha256_blocks: Vec<String>,
    pub etag: String,
    /// Drive recorded in the object metadata
    pub drive: String,
}

/// Physical placement of one redundancy level
pub(crate) enum RaidLayout {
    Raid0(Raid0Layout),
    Raid1(Raid1Layout),
    Raid6(Raid6Layout),
}

impl RaidLayout {
    fn new(settings: &ServerSettings, drives: Arc<DrivePool>) -> Result<Self> {
        Ok(match settings.redundancy_level {
            RedundancyLevel::Raid0 => RaidLayout::Raid0(Raid0Layout::new(drives)),
            RedundancyLevel::Raid1 => RaidLayout::Raid1(Raid1Layout::new(drives)),
            RedundancyLevel::Raid6 => RaidLayout::Raid6(Raid6Layout::new(drives, &settings.raid6)?),
        })
    }

    pub fn level(&self) -> RedundancyLevel {
        match self {
            RaidLayout::Raid0(_) => RedundancyLevel::Raid0,
            RaidLayout::Raid1(_) => RedundancyLevel::Raid1,
            RaidLayout::Raid6(_) => RedundancyLevel::Raid6,
        }
    }

    /// Drives that hold the object's metadata
    pub fn metadata_drives(&self, bucket_id: u64, object: &str) -> Result<Vec<Arc<Drive>>> {
        match self {
            RaidLayout::Raid0(l) => Ok(vec![l.drive_for(bucket_id, object)?]),
            RaidLayout::Raid1(l) => Ok(l.all_drives()),
            RaidLayout::Raid6(l) => Ok(l.all_drives()),
        }
    }

    /// Drive the object's metadata is read from
    pub fn metadata_read_drive(&self, bucket_id: u64, object: &str) -> Result<Arc<Drive>> {
        match self {
            RaidLayout::Raid0(l) => l.drive_for(bucket_id, object),
            RaidLayout::Raid1(l) => l.read_drive(),
            RaidLayout::Raid6(l) => l.read_drive(),
        }
    }

    /// Metadata directories a bucket listing walks
    pub fn listing_dirs(&self, bucket_id: u64) -> Result<Vec<PathBuf>> {
        match self {
            RaidLayout::Raid0(l) => Ok(l
                .all_drives()
                .iter()
                .map(|d| d.bucket_metadata_dir(bucket_id))
                .collect()),
            RaidLayout::Raid1(l) => Ok(vec![l.read_drive()?.bucket_metadata_dir(bucket_id)]),
            RaidLayout::Raid6(l) => Ok(vec![l.read_drive()?.bucket_metadata_dir(bucket_id)]),
        }
    }

    /// Write `payload` as the object's head data
    pub fn write_data(&self, bucket_id: u64, object: &str, payload: &[u8]) -> Result<StoredData> {
        match self {
            RaidLayout::Raid0(l) => l.write_data(bucket_id, object, payload),
            RaidLayout::Raid1(l) => l.write_data(bucket_id, object, payload),
            RaidLayout::Raid6(l) => l.write_data(bucket_id, object, payload),
        }
    }

    /// Stored bytes of the head (`None`) or of a version
    pub fn open_data(&self, meta: &ObjectMetadata, version: Option<u32>) -> Result<Box<dyn Read + Send>> {
        match self {
            RaidLayout::Raid0(l) => l.open_data(meta, version),
            RaidLayout::Raid1(l) => l.open_data(meta, version),
            RaidLayout::Raid6(l) => Ok(Box::new(l.reader(meta, version))),
        }
    }

    /// Every (drive, file) pair holding the data described by `meta`
    pub fn data_files(&self, meta: &ObjectMetadata) -> Result<Vec<(Arc<Drive>, String)>> {
        match self {
            RaidLayout::Raid0(l) => Ok(vec![(
                l.drive_for(meta.bucket_id, &meta.object_name)?,
                meta.object_name.clone(),
            )]),
            RaidLayout::Raid1(l) => Ok(l
                .all_drives()
                .into_iter()
                .map(|d| (d, meta.object_name.clone()))
                .collect()),
            RaidLayout::Raid6(l) => Ok(l.data_files(meta)),
        }
    }

    /// Remove the head (`None`) or version data files of an object, whatever their count
    pub fn remove_data_files(&self, bucket_id: u64, object: &str, version: Option<u32>) -> Result<()> {
        let remove = |drive: &Drive| match version {
            Some(v) => drive.remove_data_file_version(bucket_id, object, v),
            None => drive.remove_data_file(bucket_id, object),
        };
        match self {
            RaidLayout::Raid0(l) => remove(l.drive_for(bucket_id, object)?.as_ref()),
            RaidLayout::Raid1(l) => l.all_drives().iter().try_for_each(|d| remove(d)),
            RaidLayout::Raid6(l) => l.remove_shards(bucket_id, object, version),
        }
    }

    /// True if no drive holds an object of the bucket
    pub fn is_bucket_empty(&self, bucket_id: u64) -> Result<bool> {
        let drives = match self {
            RaidLayout::Raid0(l) => l.all_drives(),
            RaidLayout::Raid1(l) => l.enabled_drives(),
            RaidLayout::Raid6(l) => l.enabled_drives(),
        };
        for drive in drives {
            if !drive.is_bucket_empty(bucket_id)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

// =============================================================================
// Object Names
// =============================================================================

/// Reject names that cannot be used as a file name inside a bucket
pub fn validate_object_name(object: &str) -> Result<()> {
    if object.trim().is_empty() {
        return Err(Error::IllegalArgument("object name is empty".to_string()));
    }
    if object.contains('/') || object.contains('\\') {
        return Err(Error::IllegalArgument(format!(
            "object name must not contain path separators: {}",
            object
        )));
    }
    if object == "." || object == ".." || object == crate::drive::VERSION_DIR {
        return Err(Error::IllegalArgument(format!("reserved object name: {}", object)));
    }
    // `<bucketId>.json` is the bucket descriptor next to the object metadata dirs
    if let Some(stem) = object.strip_suffix(".json") {
        if !stem.is_empty() && stem.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::IllegalArgument(format!("reserved object name: {}", object)));
        }
    }
    Ok(())
}

// =============================================================================
// IoDriver
// =============================================================================

pub struct IoDriver {
    ctx: Arc<VfsContext>,
    layout: RaidLayout,
}

/// Reader that keeps the object readable until it is dropped
struct GuardedReader<R> {
    inner: R,
    _bucket: ReadGuard,
    _object: ReadGuard,
}

impl<R: Read> Read for GuardedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

impl IoDriver {
    pub fn new(ctx: Arc<VfsContext>) -> Result<Self> {
        let layout = RaidLayout::new(&ctx.settings, ctx.drives.clone())?;
        Ok(Self { ctx, layout })
    }

    pub fn context(&self) -> &Arc<VfsContext> {
        &self.ctx
    }

    pub fn redundancy_level(&self) -> RedundancyLevel {
        self.layout.level()
    }

    pub(crate) fn layout(&self) -> &RaidLayout {
        &self.layout
    }

    fn tag(bucket: &ServerBucket, object: &str, version: Option<u32>) -> String {
        context_tag(Some(&bucket.name), Some(object), version, None)
    }

    fn not_found(bucket: &ServerBucket, object: &str) -> Error {
        Error::ObjectNotFound {
            bucket: bucket.name.clone(),
            object: object.to_string(),
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Head metadata without locking; callers hold the object lock
    pub(crate) fn read_head(&self, bucket: &ServerBucket, object: &str) -> Result<Option<ObjectMetadata>> {
        if let Some(meta) = self.ctx.cache.get(bucket.id, object) {
            return Ok(Some(meta));
        }
        let drive = self.layout.metadata_read_drive(bucket.id, object)?;
        let meta = drive.get_object_metadata(bucket.id, object)?;
        if let Some(m) = &meta {
            self.ctx.cache.put(m);
        }
        Ok(meta)
    }

    #[instrument(skip(self, bucket), fields(bucket = %bucket.name))]
    pub fn get_object_metadata(&self, bucket: &ServerBucket, object: &str) -> Result<ObjectMetadata> {
        let _object = self.ctx.locks.read_object(bucket.id, object);
        let _bucket = self.ctx.locks.read_bucket(bucket.id);
        let bucket = self.ctx.accessible_bucket(bucket)?;
        self.read_head(&bucket, object)?
            .ok_or_else(|| Self::not_found(&bucket, object))
    }

    /// Metadata of `version`; the head version resolves to the head document
    pub fn get_object_metadata_version(
        &self,
        bucket: &ServerBucket,
        object: &str,
        version: u32,
    ) -> Result<ObjectMetadata> {
        let _object = self.ctx.locks.read_object(bucket.id, object);
        let _bucket = self.ctx.locks.read_bucket(bucket.id);
        let bucket = self.ctx.accessible_bucket(bucket)?;
        self.read_version(&bucket, object, version)
    }

    fn read_version(&self, bucket: &ServerBucket, object: &str, version: u32) -> Result<ObjectMetadata> {
        let head = self
            .read_head(bucket, object)?
            .ok_or_else(|| Self::not_found(bucket, object))?;
        if head.version == version {
            return Ok(head);
        }
        let drive = self.layout.metadata_read_drive(bucket.id, object)?;
        drive
            .get_object_metadata_version(bucket.id, object, version)?
            .ok_or_else(|| Error::VersionNotFound {
                bucket: bucket.name.clone(),
                object: object.to_string(),
                version,
            })
    }

    /// Retained prior versions, oldest first; the head is not included
    pub fn get_object_metadata_version_all(
        &self,
        bucket: &ServerBucket,
        object: &str,
    ) -> Result<Vec<ObjectMetadata>> {
        let _object = self.ctx.locks.read_object(bucket.id, object);
        let _bucket = self.ctx.locks.read_bucket(bucket.id);
        let bucket = self.ctx.accessible_bucket(bucket)?;
        let head = self
            .read_head(&bucket, object)?
            .ok_or_else(|| Self::not_found(&bucket, object))?;
        let drive = self.layout.metadata_read_drive(bucket.id, object)?;
        let mut versions = Vec::new();
        for v in 0..head.version {
            if let Some(meta) = drive.get_object_metadata_version(bucket.id, object, v)? {
                versions.push(meta);
            }
        }
        Ok(versions)
    }

    pub fn exists(&self, bucket: &ServerBucket, object: &str) -> Result<bool> {
        let _object = self.ctx.locks.read_object(bucket.id, object);
        let _bucket = self.ctx.locks.read_bucket(bucket.id);
        let bucket = self.ctx.accessible_bucket(bucket)?;
        if self.ctx.cache.get(bucket.id, object).is_some() {
            return Ok(true);
        }
        let drive = self.layout.metadata_read_drive(bucket.id, object)?;
        Ok(drive.exists_object_metadata(bucket.id, object))
    }

    /// Content of the head version
    pub fn get_input_stream(&self, bucket: &ServerBucket, object: &str) -> Result<Box<dyn Read + Send>> {
        self.open_stream(bucket, object, None)
    }

    /// Content of a retained version
    pub fn get_object_version_input_stream(
        &self,
        bucket: &ServerBucket,
        object: &str,
        version: u32,
    ) -> Result<Box<dyn Read + Send>> {
        self.open_stream(bucket, object, Some(version))
    }

    fn open_stream(
        &self,
        bucket: &ServerBucket,
        object: &str,
        version: Option<u32>,
    ) -> Result<Box<dyn Read + Send>> {
        let object_guard = self.ctx.locks.read_object(bucket.id, object);
        let bucket_guard = self.ctx.locks.read_bucket(bucket.id);
        let bucket = self.ctx.accessible_bucket(bucket)?;

        let head = self
            .read_head(&bucket, object)?
            .ok_or_else(|| Self::not_found(&bucket, object))?;
        // the head is stored unversioned, even when asked for by number
        let (meta, file_version) = match version {
            Some(v) if v != head.version => (self.read_version(&bucket, object, v)?, Some(v)),
            _ => (head, None),
        };
        let stored = self.layout.open_data(&meta, file_version)?;

        if meta.encrypt {
            let encryption = self.ctx.encryption().ok_or_else(|| {
                Error::Crypto(format!(
                    "object is encrypted but encryption is not enabled [{}]",
                    Self::tag(&bucket, object, Some(meta.version))
                ))
            })?;
            let mut sealed = Vec::with_capacity(meta.stored_length as usize);
            let mut stored = stored;
            stored.read_to_end(&mut sealed)?;
            return Ok(Box::new(Cursor::new(encryption.decrypt(&sealed)?)));
        }

        if matches!(self.layout, RaidLayout::Raid6(_)) {
            // shards are decoded lazily, keep writers out until the reader is dropped
            return Ok(Box::new(GuardedReader {
                inner: stored,
                _bucket: bucket_guard,
                _object: object_guard,
            }));
        }
        Ok(stored)
    }

    /// File names holding the data of a version (the head when `version` is `None`)
    pub fn object_data_files_names(&self, meta: &ObjectMetadata, version: Option<u32>) -> Result<Vec<String>> {
        let names = self
            .layout
            .data_files(meta)?
            .into_iter()
            .map(|(_, file)| match version {
                Some(v) => format!("{}.v{}", file, v),
                None => file,
            });
        let mut unique: Vec<String> = Vec::new();
        for name in names {
            if !unique.contains(&name) {
                unique.push(name);
            }
        }
        Ok(unique)
    }

    pub fn is_empty(&self, bucket: &ServerBucket) -> Result<bool> {
        let _bucket = self.ctx.locks.read_bucket(bucket.id);
        let bucket = self.ctx.accessible_bucket(bucket)?;
        self.layout.is_bucket_empty(bucket.id)
    }

    // =========================================================================
    // Listing
    // =========================================================================

    /// One page of the bucket's objects, resumable through the returned agent id
    #[instrument(skip(self, bucket), fields(bucket = %bucket.name))]
    pub fn list_objects(
        &self,
        bucket: &ServerBucket,
        offset: Option<u64>,
        page_size: Option<usize>,
        prefix: Option<&str>,
        agent_id: Option<&str>,
    ) -> Result<DataList> {
        let bucket = {
            let _bucket = self.ctx.locks.read_bucket(bucket.id);
            self.ctx.accessible_bucket(bucket)?
        };
        let page_size = page_size
            .filter(|s| *s > 0)
            .unwrap_or(self.ctx.settings.page_size);

        let iterator = match agent_id.and_then(|id| self.ctx.iterators.get(id)) {
            Some(it) => it,
            None => self.ctx.iterators.register(BucketIterator::new(
                bucket.id,
                self.layout.listing_dirs(bucket.id)?,
                offset.unwrap_or(0),
                prefix,
            )),
        };

        let mut walker = iterator.lock();
        if walker.bucket_id() != bucket.id {
            return Err(Error::IllegalArgument(format!(
                "agent {} does not list bucket {}",
                walker.agent_id(),
                bucket.name
            )));
        }
        let mut items = Vec::with_capacity(page_size);
        while items.len() < page_size && walker.has_next()? {
            let name = walker.next()?;
            let item = match self.get_object_metadata(&bucket, &name) {
                Ok(meta) => Item::Ok(meta),
                Err(e) => {
                    debug!("Listing {} skipped {}: {}", bucket.name, name, e);
                    Item::Err(e.to_string())
                }
            };
            items.push(item);
        }
        let eod = !walker.has_next()?;
        let agent = walker.agent_id().to_string();
        let result = DataList {
            items,
            offset: walker.offset(),
            page_size,
            agent_id: (!eod).then(|| agent.clone()),
            eod,
        };
        drop(walker);
        if eod {
            self.ctx.iterators.remove(&agent);
        }
        Ok(result)
    }
}

// =============================================================================
// Scheduled Work
// =============================================================================

impl RequestExecutor for IoDriver {
    fn execute(&self, request: &ServiceRequest) -> Result<()> {
        match &request.kind {
            ServiceRequestKind::AfterDeleteObject {
                bucket_id,
                bucket_name,
                object_name,
                head_version,
                ..
            } => self.post_delete_cleanup(*bucket_id, bucket_name, object_name, *head_version),
            ServiceRequestKind::DeleteBucketPreviousVersions { bucket_id } => {
                self.delete_buckets_previous_versions(*bucket_id).map(|_| ())
            }
        }
    }
}

impl IoDriver {
    /// Drop the previous versions of every object of one bucket, or of every
    /// accessible bucket when `bucket_id` is `None`. Returns the objects trimmed.
    #[instrument(skip(self))]
    pub fn delete_buckets_previous_versions(&self, bucket_id: Option<u64>) -> Result<u64> {
        let buckets: Vec<ServerBucket> = self
            .ctx
            .buckets
            .iter()
            .filter(|b| b.is_accessible() && bucket_id.map_or(true, |id| b.id == id))
            .map(|b| b.value().clone())
            .collect();

        let mut trimmed = 0;
        for bucket in buckets {
            let mut agent: Option<String> = None;
            loop {
                let page = self.list_objects(&bucket, None, None, None, agent.as_deref())?;
                for item in &page.items {
                    let Item::Ok(meta) = item else {
                        continue;
                    };
                    if meta.version == 0 {
                        continue;
                    }
                    match self.delete_object_all_previous_versions(&bucket, &meta.object_name) {
                        Ok(()) => trimmed += 1,
                        // deleted since it was listed
                        Err(Error::ObjectNotFound { .. }) => {}
                        Err(e) => return Err(e),
                    }
                }
                if page.eod {
                    break;
                }
                agent = page.agent_id;
            }
        }
        info!("Dropped previous versions of {} objects", trimmed);
        Ok(trimmed)
    }
}
