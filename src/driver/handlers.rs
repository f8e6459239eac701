//! Mutations and their rollback
//!
//! Every handler follows the same sequence:
//!
//! ```text
//!   object write lock ─▶ bucket read lock ─▶ validate ─▶ journal begin
//!     ─▶ backup ─▶ mutate ─▶ commit ─▶ cleanup
//!                    │
//!                    └─(error)─▶ rollback by operation code ─▶ cancel
//! ```
//!
//! Validation failures happen before the journal entry and leave no trace.
//! Cleanup after commit is best effort: failures are logged, never returned.

use super::{validate_object_name, IoDriver, StoredData};
use crate::drive::{Drive, ENCRYPTION_KEY_FILE, SERVER_METADATA_FILE};
use crate::error::{Error, Result, ResultExt};
use crate::model::{
    BucketMetadata, BucketStatus, ObjectMetadata, ObjectStatus, OperationCode, RedundancyLevel,
    ServerBucket, ServerInfo, VfsOperation,
};
use crate::scheduler::ServiceRequestKind;
use chrono::Utc;
use std::io::Read;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Previous server metadata kept while an update is in flight
const SERVER_METADATA_BACKUP: &str = "work/server-metadata";

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Client payload as it will be stored
struct Payload {
    bytes: Vec<u8>,
    /// Plaintext length
    length: u64,
    encrypt: bool,
}

impl IoDriver {
    // =========================================================================
    // Transaction Plumbing
    // =========================================================================

    /// Run `mutate`, then commit; any failure rolls the operation back
    fn transact<T>(&self, op: &VfsOperation, mutate: impl FnOnce() -> Result<T>) -> Result<T> {
        let outcome = mutate().and_then(|value| self.ctx.journal.commit(op).map(|_| value));
        match outcome {
            Ok(value) => Ok(value),
            Err(e) => {
                error!("{} failed [{}]: {}", op.op, op.context(), e);
                if let Err(rollback) = self.rollback(op, false) {
                    return Err(Error::internal(
                        format!("{} rollback failed after: {}", op.context(), e),
                        rollback,
                    ));
                }
                Err(e).context_with(|| op.context())
            }
        }
    }

    /// Undo `op` and cancel its journal entry; callers hold the locks
    fn rollback(&self, op: &VfsOperation, recovery: bool) -> Result<()> {
        match self.undo(op) {
            Ok(()) => self.ctx.journal.cancel(op),
            Err(e) if recovery || self.ctx.settings.recovery_mode => {
                error!(
                    "Rollback of {} {} failed, cancelling anyway [{}]: {}",
                    op.op,
                    op.id,
                    op.context(),
                    e
                );
                self.ctx.journal.cancel(op)
            }
            Err(e) => Err(e).context_with(|| op.context()),
        }
    }

    /// Roll back a journal entry, taking the locks its scope requires
    #[instrument(skip(self, op), fields(code = %op.op, id = %op.id))]
    pub fn rollback_journal(&self, op: &VfsOperation, recovery: bool) -> Result<()> {
        match (op.bucket_id, op.object_name.as_deref()) {
            (Some(bucket_id), Some(object)) if op.op.is_object_operation() => {
                let _object = self.ctx.locks.write_object(bucket_id, object);
                let _bucket = self.ctx.locks.read_bucket(bucket_id);
                self.rollback(op, recovery)
            }
            (Some(bucket_id), _) => {
                let _bucket = self.ctx.locks.write_bucket(bucket_id);
                self.rollback(op, recovery)
            }
            _ => {
                let _server = self.ctx.locks.write_server();
                self.rollback(op, recovery)
            }
        }
    }

    fn undo(&self, op: &VfsOperation) -> Result<()> {
        debug!("Rolling back {} [{}]", op.op, op.context());
        match op.op {
            OperationCode::CreateObject => {
                let (bucket_id, object) = object_target(op)?;
                self.ctx.cache.remove(bucket_id, object);
                self.layout.remove_data_files(bucket_id, object, None)?;
                for drive in self.layout.metadata_drives(bucket_id, object)? {
                    drive.remove_object_metadata_dir(bucket_id, object)?;
                }
                Ok(())
            }
            OperationCode::UpdateObject | OperationCode::RestoreObjectPreviousVersion => {
                let (bucket_id, object) = object_target(op)?;
                self.ctx.cache.remove(bucket_id, object);
                self.undo_version_backup(bucket_id, object, op.version)
            }
            OperationCode::DeleteObject
            | OperationCode::DeleteObjectPreviousVersions
            | OperationCode::UpdateObjectMetadata => {
                let (bucket_id, object) = object_target(op)?;
                self.ctx.cache.remove(bucket_id, object);
                for drive in self.layout.metadata_drives(bucket_id, object)? {
                    drive.restore_metadata_dir(bucket_id, object, &op.id)?;
                    drive.remove_metadata_backup(bucket_id, object, &op.id)?;
                }
                Ok(())
            }
            OperationCode::CreateBucket => {
                let bucket_id = bucket_target(op)?;
                for drive in self.ctx.drives.all() {
                    drive.force_delete_bucket(bucket_id)?;
                }
                self.ctx.buckets.remove(&bucket_id);
                Ok(())
            }
            OperationCode::DeleteBucket => {
                let bucket_id = bucket_target(op)?;
                for drive in self.ctx.drives.all() {
                    if let Some(mut meta) = drive.get_bucket(bucket_id)? {
                        meta.status = BucketStatus::Enabled;
                        drive.update_bucket(&meta)?;
                    }
                }
                if let Some(mut bucket) = self.ctx.buckets.get_mut(&bucket_id) {
                    bucket.status = BucketStatus::Enabled;
                }
                Ok(())
            }
            OperationCode::CreateServerMetadata => {
                for drive in self.ctx.drives.all() {
                    drive.remove_sys_file(SERVER_METADATA_FILE)?;
                }
                Ok(())
            }
            OperationCode::UpdateServerMetadata => {
                for drive in self.ctx.drives.all() {
                    if let Some(previous) = drive.sys_file(SERVER_METADATA_BACKUP)? {
                        drive.put_sys_file(SERVER_METADATA_FILE, &previous)?;
                        drive.remove_sys_file(SERVER_METADATA_BACKUP)?;
                    }
                }
                Ok(())
            }
            OperationCode::CreateServerMasterKey => {
                for drive in self.ctx.drives.all() {
                    drive.remove_sys_file(ENCRYPTION_KEY_FILE)?;
                }
                Ok(())
            }
        }
    }

    /// Put the `.v<version>` backup back as head and drop it
    fn undo_version_backup(&self, bucket_id: u64, object: &str, version: u32) -> Result<()> {
        let drives = self.layout.metadata_drives(bucket_id, object)?;
        let mut backup = None;
        for drive in &drives {
            if let Some(meta) = drive.get_object_metadata_version(bucket_id, object, version)? {
                backup = Some(meta);
                break;
            }
        }

        // no version metadata means the head was never touched
        if let Some(previous) = backup {
            self.layout.remove_data_files(bucket_id, object, None)?;
            for (drive, file) in self.layout.data_files(&previous)? {
                if drive.data_file_version_exists(bucket_id, &file, version) {
                    drive.copy_version_to_data(bucket_id, &file, version)?;
                }
            }
            for drive in &drives {
                drive.save_object_metadata(&previous)?;
                drive.remove_object_metadata_version(bucket_id, object, version)?;
            }
        }
        self.layout.remove_data_files(bucket_id, object, Some(version))
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn read_payload(&self, data: &mut dyn Read) -> Result<Payload> {
        let mut bytes = Vec::new();
        data.read_to_end(&mut bytes)?;
        let length = bytes.len() as u64;
        match self.ctx.encryption() {
            Some(encryption) => Ok(Payload {
                bytes: encryption.encrypt(&bytes)?,
                length,
                encrypt: true,
            }),
            None => Ok(Payload {
                bytes,
                length,
                encrypt: false,
            }),
        }
    }

    fn save_head(&self, meta: &ObjectMetadata) -> Result<()> {
        for drive in self.layout.metadata_drives(meta.bucket_id, &meta.object_name)? {
            drive.save_object_metadata(meta)?;
        }
        Ok(())
    }

    /// A data file absent from its drive only blocks the operation where it is the sole copy
    fn tolerates_missing(&self, drive: &Drive) -> bool {
        !drive.is_enabled() || self.layout.level() == RedundancyLevel::Raid6
    }

    /// Copy head data and metadata to the `.v<head.version>` files
    fn backup_version(&self, head: &ObjectMetadata) -> Result<()> {
        let (bucket_id, version) = (head.bucket_id, head.version);
        // shards of an older, larger object may still carry this version
        self.layout
            .remove_data_files(bucket_id, &head.object_name, Some(version))?;
        for (drive, file) in self.layout.data_files(head)? {
            if !drive.data_file_exists(bucket_id, &file) {
                if self.tolerates_missing(&drive) {
                    debug!("No head file {} on drive {} to back up", file, drive.name());
                    continue;
                }
                return Err(Error::IllegalState(format!(
                    "data file {} missing on drive {}",
                    file,
                    drive.name()
                )));
            }
            drive.copy_data_to_version(bucket_id, &file, version)?;
        }
        for drive in self.layout.metadata_drives(bucket_id, &head.object_name)? {
            drive.save_object_metadata_version(head)?;
        }
        Ok(())
    }

    /// Copy the data of version `meta.version` over the head data
    fn restore_version_data(&self, meta: &ObjectMetadata) -> Result<()> {
        let (bucket_id, version) = (meta.bucket_id, meta.version);
        for (drive, file) in self.layout.data_files(meta)? {
            if !drive.data_file_version_exists(bucket_id, &file, version) {
                if self.tolerates_missing(&drive) {
                    continue;
                }
                return Err(Error::IllegalState(format!(
                    "version file {}.v{} missing on drive {}",
                    file,
                    version,
                    drive.name()
                )));
            }
            drive.copy_version_to_data(bucket_id, &file, version)?;
        }
        Ok(())
    }

    /// Remove metadata and data of version `meta.version`
    fn remove_version(&self, meta: &ObjectMetadata) -> Result<()> {
        for drive in self.layout.metadata_drives(meta.bucket_id, &meta.object_name)? {
            drive.remove_object_metadata_version(meta.bucket_id, &meta.object_name, meta.version)?;
        }
        self.layout
            .remove_data_files(meta.bucket_id, &meta.object_name, Some(meta.version))
    }

    fn cleanup_after_commit(&self, op: &VfsOperation, cleanup: impl FnOnce() -> Result<()>) {
        if let Err(e) = cleanup() {
            warn!("Cleanup after {} failed [{}]: {}", op.op, op.context(), e);
        }
    }

    fn schedule_cleanup(&self, op: &VfsOperation) {
        if let Some(kind) = ServiceRequestKind::after_delete(op) {
            self.ctx.scheduler.enqueue(kind);
        }
    }

    fn new_metadata(
        &self,
        bucket: &ServerBucket,
        object: &str,
        file_name: &str,
        content_type: &str,
        payload: &Payload,
        stored: StoredData,
    ) -> ObjectMetadata {
        let now = Utc::now();
        ObjectMetadata {
            bucket_id: bucket.id,
            bucket_name: bucket.name.clone(),
            object_name: object.to_string(),
            file_name: file_name.to_string(),
            content_type: content_type.to_string(),
            length: payload.length,
            stored_length: stored.stored_length,
            block_size: stored.block_size,
            creation_date: now,
            version_creation_date: now,
            last_modified: now,
            integrity_check: Some(now),
            version: 0,
            status: ObjectStatus::Enabled,
            sha256: stored.sha256,
            sha256_blocks: stored.sha256_blocks,
            etag: stored.etag,
            encrypt: payload.encrypt,
            drive: stored.drive,
            raid: self.layout.level(),
            system_tags: None,
        }
    }

    // =========================================================================
    // Objects
    // =========================================================================

    /// Create the object, or store a new version of it when it exists
    #[instrument(skip(self, bucket, data), fields(bucket = %bucket.name))]
    pub fn put_object(
        &self,
        bucket: &ServerBucket,
        object: &str,
        data: &mut dyn Read,
        file_name: Option<&str>,
        content_type: Option<&str>,
    ) -> Result<ObjectMetadata> {
        validate_object_name(object)?;
        let _object = self.ctx.locks.write_object(bucket.id, object);
        let _bucket = self.ctx.locks.read_bucket(bucket.id);
        let bucket = self.ctx.accessible_bucket(bucket)?;

        let payload = self.read_payload(data)?;
        match self.read_head(&bucket, object)? {
            None => self.create_object(&bucket, object, payload, file_name, content_type),
            Some(head) => self.update_object(&bucket, object, payload, head, file_name, content_type),
        }
    }

    fn create_object(
        &self,
        bucket: &ServerBucket,
        object: &str,
        payload: Payload,
        file_name: Option<&str>,
        content_type: Option<&str>,
    ) -> Result<ObjectMetadata> {
        let op = self
            .ctx
            .journal
            .begin(OperationCode::CreateObject, Some(bucket), Some(object), 0)?;
        self.ctx.cache.remove(bucket.id, object);

        let meta = self.transact(&op, || {
            let stored = self.layout.write_data(bucket.id, object, &payload.bytes)?;
            let meta = self.new_metadata(
                bucket,
                object,
                file_name.unwrap_or(object),
                content_type.unwrap_or(DEFAULT_CONTENT_TYPE),
                &payload,
                stored,
            );
            self.save_head(&meta)?;
            Ok(meta)
        })?;

        info!("Created {} ({} bytes) [{}]", object, meta.length, op.context());
        Ok(meta)
    }

    fn update_object(
        &self,
        bucket: &ServerBucket,
        object: &str,
        payload: Payload,
        head: ObjectMetadata,
        file_name: Option<&str>,
        content_type: Option<&str>,
    ) -> Result<ObjectMetadata> {
        let version_control = self.ctx.settings.version_control;
        let op = self.ctx.journal.begin(
            OperationCode::UpdateObject,
            Some(bucket),
            Some(object),
            head.version,
        )?;
        self.ctx.cache.remove(bucket.id, object);

        let meta = self.transact(&op, || {
            self.backup_version(&head)?;
            self.layout.remove_data_files(bucket.id, object, None)?;
            let stored = self.layout.write_data(bucket.id, object, &payload.bytes)?;

            let mut meta = self.new_metadata(
                bucket,
                object,
                file_name.unwrap_or(&head.file_name),
                content_type.unwrap_or(&head.content_type),
                &payload,
                stored,
            );
            meta.creation_date = head.creation_date;
            meta.version = if version_control {
                head.version + 1
            } else {
                head.version
            };
            self.save_head(&meta)?;
            Ok(meta)
        })?;

        if !version_control {
            // the backup only served the rollback
            self.cleanup_after_commit(&op, || self.remove_version(&head));
        }
        info!("Updated {} to v{} [{}]", object, meta.version, op.context());
        Ok(meta)
    }

    /// Make the latest retained prior version the head again
    #[instrument(skip(self, bucket), fields(bucket = %bucket.name))]
    pub fn restore_previous_version(&self, bucket: &ServerBucket, object: &str) -> Result<ObjectMetadata> {
        validate_object_name(object)?;
        let _object = self.ctx.locks.write_object(bucket.id, object);
        let _bucket = self.ctx.locks.read_bucket(bucket.id);
        let bucket = self.ctx.accessible_bucket(bucket)?;

        let head = self
            .read_head(&bucket, object)?
            .ok_or_else(|| Self::not_found(&bucket, object))?;
        let drive = self.layout.metadata_read_drive(bucket.id, object)?;
        let mut previous = None;
        for version in (0..head.version).rev() {
            if let Some(meta) = drive.get_object_metadata_version(bucket.id, object, version)? {
                previous = Some(meta);
                break;
            }
        }
        let previous = previous.ok_or_else(|| {
            Error::IllegalState(format!(
                "no previous version to restore [{}]",
                Self::tag(&bucket, object, Some(head.version))
            ))
        })?;

        let op = self.ctx.journal.begin(
            OperationCode::RestoreObjectPreviousVersion,
            Some(&bucket),
            Some(object),
            head.version,
        )?;
        self.ctx.cache.remove(bucket.id, object);

        let restored = self.transact(&op, || {
            self.backup_version(&head)?;
            self.layout.remove_data_files(bucket.id, object, None)?;
            self.restore_version_data(&previous)?;
            let mut restored = previous.clone();
            restored.last_modified = Utc::now();
            self.save_head(&restored)?;
            Ok(restored)
        })?;

        self.cleanup_after_commit(&op, || {
            self.remove_version(&head)?;
            self.remove_version(&previous)
        });
        info!(
            "Restored {} from v{} to v{} [{}]",
            object,
            head.version,
            restored.version,
            op.context()
        );
        Ok(restored)
    }

    /// Remove the object; data files are released by a scheduled cleanup
    #[instrument(skip(self, bucket), fields(bucket = %bucket.name))]
    pub fn delete(&self, bucket: &ServerBucket, object: &str) -> Result<()> {
        validate_object_name(object)?;
        let _object = self.ctx.locks.write_object(bucket.id, object);
        let _bucket = self.ctx.locks.read_bucket(bucket.id);
        let bucket = self.ctx.accessible_bucket(bucket)?;

        let head = self
            .read_head(&bucket, object)?
            .ok_or_else(|| Self::not_found(&bucket, object))?;

        let op = self.ctx.journal.begin(
            OperationCode::DeleteObject,
            Some(&bucket),
            Some(object),
            head.version,
        )?;
        self.ctx.cache.remove(bucket.id, object);

        self.transact(&op, || {
            for drive in self.layout.metadata_drives(bucket.id, object)? {
                drive.backup_metadata_dir(bucket.id, object, &op.id)?;
                drive.remove_object_metadata_dir(bucket.id, object)?;
            }
            Ok(())
        })?;

        self.schedule_cleanup(&op);
        info!("Deleted {} [{}]", object, op.context());
        Ok(())
    }

    /// Drop every retained prior version; the head becomes version 0
    #[instrument(skip(self, bucket), fields(bucket = %bucket.name))]
    pub fn delete_object_all_previous_versions(&self, bucket: &ServerBucket, object: &str) -> Result<()> {
        validate_object_name(object)?;
        let _object = self.ctx.locks.write_object(bucket.id, object);
        let _bucket = self.ctx.locks.read_bucket(bucket.id);
        let bucket = self.ctx.accessible_bucket(bucket)?;

        let head = self
            .read_head(&bucket, object)?
            .ok_or_else(|| Self::not_found(&bucket, object))?;
        if head.version == 0 {
            return Ok(());
        }

        let op = self.ctx.journal.begin(
            OperationCode::DeleteObjectPreviousVersions,
            Some(&bucket),
            Some(object),
            head.version,
        )?;
        self.ctx.cache.remove(bucket.id, object);

        self.transact(&op, || {
            let drives = self.layout.metadata_drives(bucket.id, object)?;
            for drive in &drives {
                drive.backup_metadata_dir(bucket.id, object, &op.id)?;
                for version in 0..head.version {
                    drive.remove_object_metadata_version(bucket.id, object, version)?;
                }
            }
            let mut meta = head.clone();
            meta.version = 0;
            meta.last_modified = Utc::now();
            self.save_head(&meta)
        })?;

        self.schedule_cleanup(&op);
        info!(
            "Deleted {} previous versions of {} [{}]",
            head.version,
            object,
            op.context()
        );
        Ok(())
    }

    /// Replace the head metadata document
    #[instrument(skip(self, bucket, meta), fields(bucket = %bucket.name, object = %meta.object_name))]
    pub fn put_object_metadata(&self, bucket: &ServerBucket, meta: &ObjectMetadata) -> Result<()> {
        let object = meta.object_name.as_str();
        validate_object_name(object)?;
        if meta.bucket_id != bucket.id {
            return Err(Error::IllegalArgument(format!(
                "metadata of bucket {} cannot be saved in bucket {}",
                meta.bucket_id, bucket.name
            )));
        }
        let _object = self.ctx.locks.write_object(bucket.id, object);
        let _bucket = self.ctx.locks.read_bucket(bucket.id);
        let bucket = self.ctx.accessible_bucket(bucket)?;

        let head = self
            .read_head(&bucket, object)?
            .ok_or_else(|| Self::not_found(&bucket, object))?;
        if head.version != meta.version {
            return Err(Error::IllegalArgument(format!(
                "metadata is for v{} but the head is v{} [{}]",
                meta.version,
                head.version,
                Self::tag(&bucket, object, None)
            )));
        }

        let op = self.ctx.journal.begin(
            OperationCode::UpdateObjectMetadata,
            Some(&bucket),
            Some(object),
            head.version,
        )?;
        self.ctx.cache.remove(bucket.id, object);

        self.transact(&op, || {
            for drive in self.layout.metadata_drives(bucket.id, object)? {
                drive.backup_metadata_dir(bucket.id, object, &op.id)?;
                drive.save_object_metadata(meta)?;
            }
            Ok(())
        })?;

        self.cleanup_after_commit(&op, || {
            for drive in self.layout.metadata_drives(bucket.id, object)? {
                drive.remove_metadata_backup(bucket.id, object, &op.id)?;
            }
            Ok(())
        });
        debug!("Saved metadata of {} [{}]", object, op.context());
        Ok(())
    }

    /// Release the data files a committed delete left behind
    #[instrument(skip(self))]
    pub fn post_delete_cleanup(
        &self,
        bucket_id: u64,
        bucket_name: &str,
        object: &str,
        head_version: u32,
    ) -> Result<()> {
        let _object = self.ctx.locks.write_object(bucket_id, object);
        let _bucket = self.ctx.locks.read_bucket(bucket_id);

        let drive = self.layout.metadata_read_drive(bucket_id, object)?;
        for version in 0..=head_version {
            if drive
                .get_object_metadata_version(bucket_id, object, version)?
                .is_none()
            {
                self.layout.remove_data_files(bucket_id, object, Some(version))?;
            }
        }
        if !drive.exists_object_metadata(bucket_id, object) {
            self.layout.remove_data_files(bucket_id, object, None)?;
        }
        for drive in self.layout.metadata_drives(bucket_id, object)? {
            drive.remove_object_work_dir(bucket_id, object)?;
        }
        debug!("Cleaned up {} in bucket {}", object, bucket_name);
        Ok(())
    }

    // =========================================================================
    // Buckets
    // =========================================================================

    #[instrument(skip(self))]
    pub fn create_bucket(&self, name: &str) -> Result<ServerBucket> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::IllegalArgument("bucket name is empty".to_string()));
        }
        let _server = self.ctx.locks.write_server();
        if self.ctx.buckets.iter().any(|b| b.name == name) {
            return Err(Error::IllegalState(format!("bucket already exists: {}", name)));
        }

        let id = self.ctx.buckets.iter().map(|b| b.id).max().unwrap_or(0) + 1;
        let meta = BucketMetadata::new(id, name);
        let bucket = ServerBucket::from(&meta);

        let op = self
            .ctx
            .journal
            .begin(OperationCode::CreateBucket, Some(&bucket), None, 0)?;
        self.transact(&op, || {
            for drive in self.ctx.drives.all() {
                drive.create_bucket(&meta)?;
            }
            Ok(())
        })?;

        self.ctx.buckets.insert(id, bucket.clone());
        info!("Created bucket {} (id {})", name, id);
        Ok(bucket)
    }

    /// Delete an empty bucket
    #[instrument(skip(self, bucket), fields(bucket = %bucket.name))]
    pub fn delete_bucket(&self, bucket: &ServerBucket) -> Result<()> {
        let _bucket = self.ctx.locks.write_bucket(bucket.id);
        let bucket = self.ctx.accessible_bucket(bucket)?;
        if !self.layout.is_bucket_empty(bucket.id)? {
            return Err(Error::IllegalState(format!(
                "bucket is not empty: {}",
                bucket.name
            )));
        }

        let op = self
            .ctx
            .journal
            .begin(OperationCode::DeleteBucket, Some(&bucket), None, 0)?;
        self.transact(&op, || {
            for drive in self.ctx.drives.all() {
                if let Some(mut meta) = drive.get_bucket(bucket.id)? {
                    meta.status = BucketStatus::Deleted;
                    meta.last_modified = Utc::now();
                    drive.update_bucket(&meta)?;
                }
            }
            Ok(())
        })?;

        self.ctx.buckets.remove(&bucket.id);
        self.ctx.cache.remove_bucket(bucket.id);
        self.cleanup_after_commit(&op, || {
            for drive in self.ctx.drives.all() {
                drive.delete_bucket(bucket.id)?;
            }
            Ok(())
        });
        info!("Deleted bucket {}", bucket.name);
        Ok(())
    }

    // =========================================================================
    // Server Singletons
    // =========================================================================

    /// Server metadata as stored on the first drive that has it, enabled drives first
    pub fn server_info(&self) -> Result<Option<ServerInfo>> {
        let mut drives: Vec<Arc<Drive>> = self.ctx.drives.enabled();
        drives.extend(self.ctx.drives.not_sync());
        for drive in drives {
            if let Some(bytes) = drive.sys_file(SERVER_METADATA_FILE)? {
                return Ok(Some(serde_json::from_slice(&bytes)?));
            }
        }
        Ok(None)
    }

    /// Create or replace the server metadata on every drive
    #[instrument(skip(self, info), fields(server = %info.name))]
    pub fn save_server_metadata(&self, info: &ServerInfo) -> Result<()> {
        let _server = self.ctx.locks.write_server();
        let code = match self.server_info()? {
            Some(_) => OperationCode::UpdateServerMetadata,
            None => OperationCode::CreateServerMetadata,
        };
        let bytes = serde_json::to_vec_pretty(info)?;

        let op = self.ctx.journal.begin_server(code)?;
        self.transact(&op, || {
            for drive in self.ctx.drives.all() {
                if code == OperationCode::UpdateServerMetadata {
                    if let Some(previous) = drive.sys_file(SERVER_METADATA_FILE)? {
                        drive.put_sys_file(SERVER_METADATA_BACKUP, &previous)?;
                    }
                }
                drive.put_sys_file(SERVER_METADATA_FILE, &bytes)?;
            }
            Ok(())
        })?;

        self.cleanup_after_commit(&op, || {
            for drive in self.ctx.drives.all() {
                drive.remove_sys_file(SERVER_METADATA_BACKUP)?;
            }
            Ok(())
        });
        info!("Saved server metadata ({})", code);
        Ok(())
    }

    /// Wrapped data key, if one was ever created
    pub fn wrapped_data_key(&self) -> Result<Option<Vec<u8>>> {
        let mut drives: Vec<Arc<Drive>> = self.ctx.drives.enabled();
        drives.extend(self.ctx.drives.not_sync());
        for drive in drives {
            if let Some(bytes) = drive.sys_file(ENCRYPTION_KEY_FILE)? {
                return Ok(Some(bytes));
            }
        }
        Ok(None)
    }

    /// Store the wrapped data key on every drive; it is written once
    #[instrument(skip_all)]
    pub fn save_wrapped_data_key(&self, wrapped: &[u8]) -> Result<()> {
        let _server = self.ctx.locks.write_server();
        if self.wrapped_data_key()?.is_some() {
            return Err(Error::IllegalState(
                "server encryption key already exists".to_string(),
            ));
        }
        let op = self
            .ctx
            .journal
            .begin_server(OperationCode::CreateServerMasterKey)?;
        self.transact(&op, || {
            for drive in self.ctx.drives.all() {
                drive.put_sys_file(ENCRYPTION_KEY_FILE, wrapped)?;
            }
            Ok(())
        })?;
        info!("Created server encryption key");
        Ok(())
    }
}

fn object_target(op: &VfsOperation) -> Result<(u64, &str)> {
    match (op.bucket_id, op.object_name.as_deref()) {
        (Some(bucket_id), Some(object)) => Ok((bucket_id, object)),
        _ => Err(Error::IllegalState(format!(
            "{} {} has no object target",
            op.op, op.id
        ))),
    }
}

fn bucket_target(op: &VfsOperation) -> Result<u64> {
    op.bucket_id
        .ok_or_else(|| Error::IllegalState(format!("{} {} has no bucket target", op.op, op.id)))
}
