//! Drive sync - seed drives in `NotSync` state from the enabled ones
//!
//! New writes already reach every drive, so only objects that existed before
//! the newest drive was connected need copying:
//!
//! ```text
//!   server files ─▶ buckets ─▶ list objects ──channel──▶ N workers ─▶ copy versions + head
//!                                                                        │
//!                                   no errors ─▶ mark drives Enabled ◀───┘
//! ```

use super::{IoDriver, RaidLayout};
use crate::drive::{Drive, ENCRYPTION_KEY_FILE, SERVER_METADATA_FILE};
use crate::error::{Error, Result};
use crate::model::{DriveStatus, Item, ObjectMetadata, ServerBucket};
use chrono::{DateTime, Utc};
use crossbeam::channel::{bounded, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Objects buffered between the lister and the workers
const SYNC_QUEUE_DEPTH: usize = 256;

/// Outcome of a drive sync pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriveSyncReport {
    /// Objects considered for copy
    pub objects: u64,
    /// Objects copied onto the new drives
    pub synced: u64,
    pub errors: u64,
}

impl DriveSyncReport {
    pub fn is_complete(&self) -> bool {
        self.errors == 0
    }
}

impl IoDriver {
    /// Copy everything the `NotSync` drives miss, then enable them
    ///
    /// Drives stay `NotSync` when any object fails, so the next start retries.
    #[instrument(skip(self))]
    pub fn sync_drives(&self) -> Result<DriveSyncReport> {
        if matches!(self.layout, RaidLayout::Raid0(_)) {
            return Err(Error::IllegalState(
                "RAID 0 drives hold distinct objects and cannot be synced".to_string(),
            ));
        }
        let targets = self.ctx.drives.not_sync();
        if targets.is_empty() {
            return Ok(DriveSyncReport::default());
        }
        let source = self.ctx.drives.random_enabled()?;
        info!(
            "Syncing {} drives from {}",
            targets.len(),
            source.name()
        );

        self.sync_server_files(&source, &targets)?;
        self.sync_buckets(&source, &targets)?;

        let cutoff = targets
            .iter()
            .map(|d| d.info().date_connected)
            .max()
            .unwrap_or_else(Utc::now);

        let objects = AtomicU64::new(0);
        let synced = AtomicU64::new(0);
        let errors = AtomicU64::new(0);
        let threads = self.ctx.settings.effective_sync_threads();
        let (tx, rx) = bounded::<(ServerBucket, String)>(SYNC_QUEUE_DEPTH);

        let listed = std::thread::scope(|scope| {
            for _ in 0..threads {
                let rx = rx.clone();
                let (targets, synced, errors) = (&targets, &synced, &errors);
                scope.spawn(move || {
                    for (bucket, object) in rx {
                        match self.sync_object(&bucket, &object, targets) {
                            Ok(true) => {
                                synced.fetch_add(1, Ordering::Relaxed);
                            }
                            Ok(false) => debug!("{} vanished before sync", object),
                            Err(e) => {
                                warn!("Sync of {} in {} failed: {}", object, bucket.name, e);
                                errors.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                });
            }
            drop(rx);
            // the sender drops on return, which ends the workers
            self.feed_sync(tx, cutoff, &objects, &errors)
        });
        listed?;

        let report = DriveSyncReport {
            objects: objects.into_inner(),
            synced: synced.into_inner(),
            errors: errors.into_inner(),
        };
        if report.is_complete() {
            for drive in &targets {
                drive.set_status(DriveStatus::Enabled)?;
            }
            info!(
                "Drive sync complete, {} objects copied to {} drives",
                report.synced,
                targets.len()
            );
        } else {
            warn!(
                "Drive sync left {} errors, drives stay NotSync: {:?}",
                report.errors, report
            );
        }
        Ok(report)
    }

    fn sync_server_files(&self, source: &Drive, targets: &[Arc<Drive>]) -> Result<()> {
        for name in [SERVER_METADATA_FILE, ENCRYPTION_KEY_FILE] {
            let Some(bytes) = source.sys_file(name)? else {
                continue;
            };
            for target in targets {
                if !target.exists_sys_file(name) {
                    target.put_sys_file(name, &bytes)?;
                }
            }
        }
        Ok(())
    }

    fn sync_buckets(&self, source: &Drive, targets: &[Arc<Drive>]) -> Result<()> {
        for meta in source.load_buckets()? {
            if !meta.status.is_accessible() {
                continue;
            }
            for target in targets {
                if target.get_bucket(meta.id)?.is_some() {
                    continue;
                }
                // writes that raced the sync may have created the directory without its descriptor
                if target.bucket_exists(meta.id) {
                    target.update_bucket(&meta)?;
                } else {
                    target.create_bucket(&meta)?;
                }
                debug!("Synced bucket {} to drive {}", meta.bucket_name, target.name());
            }
        }
        Ok(())
    }

    /// List every bucket and queue the objects created before `cutoff`
    fn feed_sync(
        &self,
        tx: Sender<(ServerBucket, String)>,
        cutoff: DateTime<Utc>,
        objects: &AtomicU64,
        errors: &AtomicU64,
    ) -> Result<()> {
        let buckets: Vec<ServerBucket> = self
            .ctx
            .buckets
            .iter()
            .filter(|b| b.is_accessible())
            .map(|b| b.value().clone())
            .collect();

        for bucket in buckets {
            let mut agent: Option<String> = None;
            loop {
                let page = self.list_objects(&bucket, None, None, None, agent.as_deref())?;
                for item in page.items {
                    match item {
                        Item::Ok(meta) if meta.creation_date < cutoff => {
                            objects.fetch_add(1, Ordering::Relaxed);
                            if tx.send((bucket.clone(), meta.object_name)).is_err() {
                                return Err(Error::IllegalState(
                                    "drive sync workers stopped".to_string(),
                                ));
                            }
                        }
                        Item::Ok(_) => {}
                        Item::Err(e) => {
                            warn!("Listing {} during sync: {}", bucket.name, e);
                            errors.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                if page.eod {
                    break;
                }
                agent = page.agent_id;
            }
        }
        Ok(())
    }

    /// Copy retained versions and the head of one object onto `targets`
    fn sync_object(&self, bucket: &ServerBucket, object: &str, targets: &[Arc<Drive>]) -> Result<bool> {
        let _object = self.ctx.locks.write_object(bucket.id, object);
        let _bucket = self.ctx.locks.read_bucket(bucket.id);

        let source = self.ctx.drives.random_enabled()?;
        let Some(head) = source.get_object_metadata(bucket.id, object)? else {
            return Ok(false);
        };
        for version in 0..head.version {
            if let Some(meta) = source.get_object_metadata_version(bucket.id, object, version)? {
                self.copy_data_to(&meta, Some(version), targets)?;
                for target in targets {
                    target.save_object_metadata_version(&meta)?;
                }
            }
        }
        self.copy_data_to(&head, None, targets)?;
        for target in targets {
            target.save_object_metadata(&head)?;
        }
        debug!("Synced {} v{} in {}", object, head.version, bucket.name);
        Ok(true)
    }

    fn copy_data_to(&self, meta: &ObjectMetadata, version: Option<u32>, targets: &[Arc<Drive>]) -> Result<()> {
        match &self.layout {
            RaidLayout::Raid1(l) => l.copy_data_to(meta, version, targets),
            RaidLayout::Raid6(l) => l.copy_data_to(meta, version, targets),
            RaidLayout::Raid0(_) => Err(Error::IllegalState(
                "RAID 0 objects are not copied between drives".to_string(),
            )),
        }
    }
}
