//! RAID 6 - Reed-Solomon shards spread over every drive
//!
//! The stored payload is cut into `block_size` chunks. Each chunk is encoded
//! into k data + m parity shards and shard `b` is written to drive `b`:
//!
//! ```text
//!   payload ──split──▶ chunk c ──encode──▶ <obj>.<c>.0 … <obj>.<c>.<k+m-1>
//!                                             drive 0 …   drive k+m-1
//! ```
//!
//! Metadata is replicated on every drive and records one SHA-256 per shard
//! file, in (chunk, block) order. Reads decode from the enabled drives; a
//! missing shard or one whose hash does not match counts as an erasure.

use super::StoredData;
use crate::config::Raid6Config;
use crate::drive::{Drive, DrivePool};
use crate::ec::{parse_shard_name, shard_file_name, EcDecoder, EcEncoder};
use crate::error::{Error, Result};
use crate::model::ObjectMetadata;
use sha2::{Digest, Sha256};
use std::io::{self, Read};
use std::sync::Arc;
use tracing::{debug, warn};

pub(crate) struct Raid6Layout {
    drives: Arc<DrivePool>,
    encoder: EcEncoder,
    decoder: EcDecoder,
    block_size: usize,
}

impl Raid6Layout {
    pub fn new(drives: Arc<DrivePool>, config: &Raid6Config) -> Result<Self> {
        config.validate(drives.len())?;
        Ok(Self {
            encoder: EcEncoder::new(config.data_drives, config.parity_drives)?,
            decoder: EcDecoder::new(config.data_drives, config.parity_drives)?,
            block_size: config.block_size,
            drives,
        })
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

    pub fn total_shards(&self) -> usize {
        self.encoder.total_shards()
    }

    pub fn parity_shards(&self) -> usize {
        self.encoder.parity_shards()
    }

    fn shard_drive(&self, block: usize) -> Result<&Arc<Drive>> {
        self.drives.get(block).ok_or_else(|| {
            Error::InvalidRaidConfig(format!("no drive for shard {}", block))
        })
    }

    // =========================================================================
    // Write
    // =========================================================================

    pub fn write_data(&self, bucket_id: u64, object: &str, payload: &[u8]) -> Result<StoredData> {
        let chunks: Vec<&[u8]> = if payload.is_empty() {
            vec![payload]
        } else {
            payload.chunks(self.block_size).collect()
        };

        let mut hashes = Vec::with_capacity(chunks.len() * self.total_shards());
        for (c, chunk) in chunks.iter().enumerate() {
            let shards = self.encoder.encode(chunk)?;
            for (b, shard) in shards.iter().enumerate() {
                let written = self.shard_drive(b)?.put_data_bytes(
                    bucket_id,
                    &shard_file_name(object, c as u32, b),
                    shard,
                )?;
                hashes.push(written.sha256);
            }
        }
        debug!(
            "Wrote {} chunks x {} shards for {}",
            chunks.len(),
            self.total_shards(),
            object
        );

        Ok(StoredData {
            stored_length: payload.len() as u64,
            block_size: self.block_size as u64,
            sha256: Some(hex::encode(Sha256::digest(payload))),
            etag: hex::encode(Sha256::digest(hashes.concat().as_bytes())),
            sha256_blocks: hashes,
            drive: self
                .drives
                .get(0)
                .map(|d| d.name().to_string())
                .unwrap_or_default(),
        })
    }

    /// Every shard file of the head or version described by `meta`
    pub fn data_files(&self, meta: &ObjectMetadata) -> Vec<(Arc<Drive>, String)> {
        let mut files = Vec::with_capacity(meta.total_chunks() as usize * self.total_shards());
        for chunk in 0..meta.total_chunks() {
            for (block, drive) in self.drives.all().iter().enumerate() {
                files.push((drive.clone(), shard_file_name(&meta.object_name, chunk, block)));
            }
        }
        files
    }

    /// Remove every head or version shard of an object found on any drive
    pub fn remove_shards(&self, bucket_id: u64, object: &str, version: Option<u32>) -> Result<()> {
        for drive in self.drives.all() {
            let names = match version {
                Some(_) => drive.list_version_files(bucket_id)?,
                None => drive.list_data_files(bucket_id)?,
            };
            for name in names {
                let Some(shard) = parse_shard_name(object, &name) else {
                    continue;
                };
                if shard.version != version {
                    continue;
                }
                let file = shard_file_name(object, shard.chunk, shard.block);
                match version {
                    Some(v) => drive.remove_data_file_version(bucket_id, &file, v)?,
                    None => drive.remove_data_file(bucket_id, &file)?,
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Read
    // =========================================================================

    /// Lazy decoding reader over the chunks of a head or version
    pub fn reader(&self, meta: &ObjectMetadata, version: Option<u32>) -> ShardReader {
        ShardReader {
            drives: self.drives.clone(),
            decoder: self.decoder.clone(),
            meta: meta.clone(),
            version,
            next_chunk: 0,
            current: io::Cursor::new(Vec::new()),
        }
    }

    /// Shards of a chunk read from the enabled drives, erasures as `None`
    pub fn read_shards(&self, meta: &ObjectMetadata, chunk: u32, version: Option<u32>) -> Result<Vec<Option<Vec<u8>>>> {
        read_shards(&self.drives, self.total_shards(), meta, chunk, version)
    }

    /// All k+m shards of a chunk, rebuilt where missing
    pub fn reconstruct_chunk(
        &self,
        meta: &ObjectMetadata,
        chunk: u32,
        version: Option<u32>,
    ) -> Result<Vec<Vec<u8>>> {
        let mut shards = self.read_shards(meta, chunk, version)?;
        self.decoder.reconstruct(&mut shards, chunk)?;
        shards
            .into_iter()
            .map(|s| {
                s.ok_or_else(|| Error::EcReconstructionFailed {
                    chunk,
                    reason: "shard still missing after reconstruction".to_string(),
                })
            })
            .collect()
    }

    /// Write the shards owned by `targets` for a head or version, rebuilding them from the enabled drives
    pub fn copy_data_to(&self, meta: &ObjectMetadata, version: Option<u32>, targets: &[Arc<Drive>]) -> Result<()> {
        for chunk in 0..meta.total_chunks() {
            let shards = self.reconstruct_chunk(meta, chunk, version)?;
            for target in targets {
                let block = target.order();
                let shard = shards.get(block).ok_or_else(|| {
                    Error::InvalidRaidConfig(format!("drive {} has no shard slot", target.name()))
                })?;
                let file = shard_file_name(&meta.object_name, chunk, block);
                match version {
                    Some(v) => target.put_data_version_bytes(meta.bucket_id, &file, v, shard)?,
                    None => {
                        target.put_data_bytes(meta.bucket_id, &file, shard)?;
                    }
                }
            }
        }
        Ok(())
    }
}

fn read_shards(
    drives: &DrivePool,
    total_shards: usize,
    meta: &ObjectMetadata,
    chunk: u32,
    version: Option<u32>,
) -> Result<Vec<Option<Vec<u8>>>> {
    let mut shards = Vec::with_capacity(total_shards);
    for block in 0..total_shards {
        let Some(drive) = drives.get(block).filter(|d| d.is_enabled()) else {
            shards.push(None);
            continue;
        };
        let file = shard_file_name(&meta.object_name, chunk, block);
        let data = match drive.read_data(meta.bucket_id, &file, version) {
            Ok(data) => data,
            Err(e) => {
                warn!("Cannot read shard {} on drive {}: {}", file, drive.name(), e);
                None
            }
        };
        let expected = meta
            .sha256_blocks
            .get(chunk as usize * total_shards + block);
        let data = match (data, expected) {
            (Some(bytes), Some(hash)) if hex::encode(Sha256::digest(&bytes)) != *hash => {
                warn!("Shard {} on drive {} fails its hash check", file, drive.name());
                None
            }
            (data, _) => data,
        };
        shards.push(data);
    }
    Ok(shards)
}

// =============================================================================
// Shard Reader
// =============================================================================

/// Decodes one chunk at a time as the caller reads
pub(crate) struct ShardReader {
    drives: Arc<DrivePool>,
    decoder: EcDecoder,
    meta: ObjectMetadata,
    version: Option<u32>,
    next_chunk: u32,
    current: io::Cursor<Vec<u8>>,
}

impl ShardReader {
    fn load_next_chunk(&mut self) -> Result<bool> {
        if self.next_chunk >= self.meta.total_chunks() {
            return Ok(false);
        }
        let chunk = self.next_chunk;
        let mut shards = read_shards(
            &self.drives,
            self.decoder.total_shards(),
            &self.meta,
            chunk,
            self.version,
        )?;
        let data = self
            .decoder
            .decode(&mut shards, self.meta.chunk_length(chunk), chunk)?;
        self.current = io::Cursor::new(data);
        self.next_chunk += 1;
        Ok(true)
    }
}

impl Read for ShardReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let n = self.current.read(buf)?;
            if n > 0 || buf.is_empty() {
                return Ok(n);
            }
            match self.load_next_chunk() {
                Ok(true) => continue,
                Ok(false) => return Ok(0),
                Err(e) => return Err(io::Error::new(io::ErrorKind::Other, e)),
            }
        }
    }
}
