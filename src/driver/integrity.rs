//! Integrity checks - verify stored hashes and repair from redundancy
//!
//! ```text
//!   read locks (bounded wait) ─▶ hash every copy / shard
//!       │ all good ──────────────▶ refresh integrity date
//!       │ repairable ─▶ write locks ─▶ unchanged? ─▶ rewrite bad copies
//!       └ beyond redundancy ─────▶ report failure
//! ```
//!
//! RAID 0 has nothing to repair from and always reports healthy.

use super::{IoDriver, RaidLayout};
use crate::drive::Drive;
use crate::ec::shard_file_name;
use crate::error::{Error, Result};
use crate::model::{ObjectMetadata, ServerBucket};
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// Longest wait for the object and bucket read locks
const INTEGRITY_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

impl IoDriver {
    /// Verify the head version of an object, repairing bad copies when possible
    ///
    /// Returns `false` only when the object cannot be read back intact. A
    /// check that cannot get its locks in time is skipped and reports `true`.
    #[instrument(skip(self, bucket), fields(bucket = %bucket.name))]
    pub fn check_integrity(&self, bucket: &ServerBucket, object: &str, force: bool) -> Result<bool> {
        if matches!(self.layout, RaidLayout::Raid0(_)) {
            return Ok(true);
        }

        let Some(object_guard) =
            self.ctx
                .locks
                .try_read_object_for(bucket.id, object, INTEGRITY_LOCK_TIMEOUT)
        else {
            warn!("Integrity check of {} skipped, object is busy", object);
            return Ok(true);
        };
        let Some(bucket_guard) = self
            .ctx
            .locks
            .try_read_bucket_for(bucket.id, INTEGRITY_LOCK_TIMEOUT)
        else {
            warn!("Integrity check of {} skipped, bucket is busy", object);
            return Ok(true);
        };
        let bucket = self.ctx.accessible_bucket(bucket)?;
        let head = self
            .read_head(&bucket, object)?
            .ok_or_else(|| Self::not_found(&bucket, object))?;

        if !force && self.recently_checked(&head) {
            debug!("Integrity of {} checked recently", object);
            return Ok(true);
        }

        let verdict = match &self.layout {
            RaidLayout::Raid1(_) => self.verify_mirrors(&head)?,
            RaidLayout::Raid6(l) => {
                match self.verify_shards(l, &head)? {
                    None => Verdict::Lost,
                    Some(bad) if bad.is_empty() => Verdict::Healthy,
                    Some(bad) => Verdict::RepairShards(bad),
                }
            }
            RaidLayout::Raid0(_) => Verdict::Healthy,
        };
        drop(bucket_guard);
        drop(object_guard);

        if matches!(verdict, Verdict::Lost) {
            error!(
                "Integrity of {} cannot be restored [{}]",
                object,
                Self::tag(&bucket, object, Some(head.version))
            );
            return Ok(false);
        }

        let _object = self.ctx.locks.write_object(bucket.id, object);
        let _bucket = self.ctx.locks.read_bucket(bucket.id);
        // the object changed while unlocked, the new write carries fresh hashes
        let Some(current) = self.read_head(&bucket, object)? else {
            return Ok(true);
        };
        if current.last_modified != head.last_modified {
            return Ok(true);
        }

        match verdict {
            Verdict::Healthy | Verdict::Lost => {}
            Verdict::RepairMirrors { source, targets } => {
                self.repair_mirrors(&source, &targets, &head)?;
            }
            Verdict::RepairShards(bad) => {
                if let RaidLayout::Raid6(l) = &self.layout {
                    for (chunk, blocks) in &bad {
                        let shards = l.reconstruct_chunk(&head, *chunk, None)?;
                        for block in blocks {
                            let drive = self.ctx.drives.get(*block).ok_or_else(|| {
                                Error::InvalidRaidConfig(format!("no drive for shard {}", block))
                            })?;
                            let file = shard_file_name(object, *chunk, *block);
                            drive.put_data_bytes(bucket.id, &file, &shards[*block])?;
                            info!("Repaired shard {} on drive {}", file, drive.name());
                        }
                    }
                }
            }
        }
        self.refresh_integrity_date(current)?;
        Ok(true)
    }

    fn recently_checked(&self, head: &ObjectMetadata) -> bool {
        let window = ChronoDuration::days(self.ctx.settings.integrity_check_days);
        head.integrity_check
            .is_some_and(|checked| Utc::now() - checked < window)
    }

    /// Compare each enabled mirror's data with the hash in its own metadata
    fn verify_mirrors(&self, head: &ObjectMetadata) -> Result<Verdict> {
        let (bucket_id, object) = (head.bucket_id, head.object_name.as_str());
        let mut good = Vec::new();
        let mut bad = Vec::new();
        for drive in self.ctx.drives.enabled() {
            let meta = drive.get_object_metadata(bucket_id, object)?;
            let hash = drive.hash_data_file(bucket_id, object, None)?;
            let intact = match (&meta, &hash) {
                (Some(m), Some(h)) => m.last_modified == head.last_modified && m.sha256.as_ref() == Some(h),
                _ => false,
            };
            if intact {
                good.push(drive);
            } else {
                warn!("Mirror of {} on drive {} fails its hash check", object, drive.name());
                bad.push(drive);
            }
        }

        Ok(match (good.first(), bad.is_empty()) {
            (_, true) => Verdict::Healthy,
            (None, false) => Verdict::Lost,
            (Some(source), false) => Verdict::RepairMirrors {
                source: source.clone(),
                targets: bad,
            },
        })
    }

    /// Chunks with at least one bad shard on an enabled drive, and those shards
    ///
    /// `None` when some chunk lost more shards than there are parity shards.
    fn verify_shards(
        &self,
        layout: &super::raid6::Raid6Layout,
        head: &ObjectMetadata,
    ) -> Result<Option<Vec<(u32, Vec<usize>)>>> {
        let mut bad = Vec::new();
        for chunk in 0..head.total_chunks() {
            let shards = layout.read_shards(head, chunk, None)?;
            let missing = shards.iter().filter(|s| s.is_none()).count();
            if missing > layout.parity_shards() {
                warn!(
                    "Chunk {} of {} lost {} of {} shards",
                    chunk,
                    head.object_name,
                    missing,
                    layout.total_shards()
                );
                return Ok(None);
            }
            let blocks: Vec<usize> = shards
                .iter()
                .enumerate()
                .filter(|(block, shard)| {
                    shard.is_none()
                        && self
                            .ctx
                            .drives
                            .get(*block)
                            .is_some_and(|d| d.is_enabled())
                })
                .map(|(block, _)| block)
                .collect();
            if !blocks.is_empty() {
                warn!(
                    "Chunk {} of {} has {} bad shards",
                    chunk,
                    head.object_name,
                    blocks.len()
                );
                bad.push((chunk, blocks));
            }
        }
        Ok(Some(bad))
    }

    fn repair_mirrors(&self, source: &Drive, targets: &[Arc<Drive>], head: &ObjectMetadata) -> Result<()> {
        let (bucket_id, object) = (head.bucket_id, head.object_name.as_str());
        let data = source.read_data(bucket_id, object, None)?.ok_or_else(|| {
            Error::IllegalState(format!(
                "data file of {} vanished from drive {}",
                object,
                source.name()
            ))
        })?;
        let mut meta = source
            .get_object_metadata(bucket_id, object)?
            .unwrap_or_else(|| head.clone());
        for target in targets {
            target.put_data_bytes(bucket_id, object, &data)?;
            meta.drive = target.name().to_string();
            target.save_object_metadata(&meta)?;
            info!("Repaired mirror of {} on drive {} from {}", object, target.name(), source.name());
        }
        Ok(())
    }

    /// Stamp the head with the time of a successful check; callers hold the write lock
    fn refresh_integrity_date(&self, mut head: ObjectMetadata) -> Result<()> {
        head.integrity_check = Some(Utc::now());
        for drive in self.layout.metadata_drives(head.bucket_id, &head.object_name)? {
            if drive.is_enabled() {
                // keep per-drive fields such as the drive a mirror was repaired on
                let mut meta = drive
                    .get_object_metadata(head.bucket_id, &head.object_name)?
                    .unwrap_or_else(|| head.clone());
                meta.integrity_check = head.integrity_check;
                drive.save_object_metadata(&meta)?;
            }
        }
        self.ctx.cache.remove(head.bucket_id, &head.object_name);
        Ok(())
    }
}

/// Outcome of the read-locked verification pass
enum Verdict {
    Healthy,
    Lost,
    RepairMirrors {
        source: Arc<Drive>,
        targets: Vec<Arc<Drive>>,
    },
    /// (chunk, bad blocks) pairs
    RepairShards(Vec<(u32, Vec<usize>)>),
}
