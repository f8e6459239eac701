//! Erasure Coding Encoder/Decoder
//!
//! Reed-Solomon transform over one RAID 6 block using the
//! `reed-solomon-erasure` crate: a block becomes k data shards plus m parity
//! shards of equal size, and any k surviving shards give the block back.

use crate::error::{Error, Result};
use reed_solomon_erasure::galois_8::ReedSolomon;
use std::sync::Arc;
use tracing::{debug, instrument};

fn build_codec(data_shards: usize, parity_shards: usize) -> Result<Arc<ReedSolomon>> {
    if data_shards == 0 {
        return Err(Error::InvalidEcConfig(
            "data_shards must be greater than 0".to_string(),
        ));
    }
    if parity_shards == 0 {
        return Err(Error::InvalidEcConfig(
            "parity_shards must be greater than 0".to_string(),
        ));
    }
    let rs = ReedSolomon::new(data_shards, parity_shards).map_err(|e| {
        Error::InvalidEcConfig(format!("Failed to create Reed-Solomon codec: {}", e))
    })?;
    Ok(Arc::new(rs))
}

// =============================================================================
// EC Encoder
// =============================================================================

/// Splits one block into data shards and computes the parity shards
#[derive(Clone)]
pub struct EcEncoder {
    /// Reed-Solomon codec instance
    rs: Arc<ReedSolomon>,
    /// Number of data shards (k)
    data_shards: usize,
    /// Number of parity shards (m)
    parity_shards: usize,
}

impl EcEncoder {
    /// Create a new encoder with the specified k+m configuration
    pub fn new(data_shards: usize, parity_shards: usize) -> Result<Self> {
        Ok(Self {
            rs: build_codec(data_shards, parity_shards)?,
            data_shards,
            parity_shards,
        })
    }

    pub fn data_shards(&self) -> usize {
        self.data_shards
    }

    pub fn parity_shards(&self) -> usize {
        self.parity_shards
    }

    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    /// Encode a block into k + m shards (data shards first)
    ///
    /// The block is zero padded so it divides evenly. An empty block is
    /// encoded as a single zero byte; the caller keeps the real length in
    /// the object metadata and trims on decode.
    #[instrument(skip(self, block), fields(block_len = block.len()))]
    pub fn encode(&self, block: &[u8]) -> Result<Vec<Vec<u8>>> {
        let block: &[u8] = if block.is_empty() { &[0u8] } else { block };
        let shard_size = block.len().div_ceil(self.data_shards);

        let mut shards: Vec<Vec<u8>> = block
            .chunks(shard_size)
            .map(|piece| {
                let mut shard = piece.to_vec();
                shard.resize(shard_size, 0);
                shard
            })
            .collect();
        shards.resize(self.total_shards(), vec![0u8; shard_size]);

        self.rs
            .encode(&mut shards)
            .map_err(|e| Error::EcEncodingFailed(format!("Reed-Solomon encoding failed: {}", e)))?;

        debug!(
            "Encoded {} bytes into {} shards of {} bytes each",
            block.len(),
            self.total_shards(),
            shard_size
        );
        Ok(shards)
    }
}

// =============================================================================
// EC Decoder
// =============================================================================

/// Rebuilds missing shards and reassembles blocks
#[derive(Clone)]
pub struct EcDecoder {
    rs: Arc<ReedSolomon>,
    data_shards: usize,
    parity_shards: usize,
}

impl EcDecoder {
    pub fn new(data_shards: usize, parity_shards: usize) -> Result<Self> {
        Ok(Self {
            rs: build_codec(data_shards, parity_shards)?,
            data_shards,
            parity_shards,
        })
    }

    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    fn check_available(&self, shards: &[Option<Vec<u8>>]) -> Result<usize> {
        if shards.len() != self.total_shards() {
            return Err(Error::InvalidEcConfig(format!(
                "Expected {} shards, got {}",
                self.total_shards(),
                shards.len()
            )));
        }
        let available = shards.iter().filter(|s| s.is_some()).count();
        if available < self.data_shards {
            return Err(Error::InsufficientShards {
                available,
                required: self.data_shards,
            });
        }
        Ok(available)
    }

    /// Fill in every missing shard, parity included
    #[instrument(skip(self, shards))]
    pub fn reconstruct(&self, shards: &mut [Option<Vec<u8>>], chunk: u32) -> Result<()> {
        let available = self.check_available(shards)?;
        self.rs
            .reconstruct(shards)
            .map_err(|e| Error::EcReconstructionFailed {
                chunk,
                reason: format!("Reed-Solomon reconstruction failed: {}", e),
            })?;
        debug!(
            "Reconstructed chunk {} from {}/{} shards",
            chunk,
            available,
            self.total_shards()
        );
        Ok(())
    }

    /// Rebuild the data shards and return the first `original_size` bytes
    #[instrument(skip(self, shards))]
    pub fn decode(&self, shards: &mut [Option<Vec<u8>>], original_size: usize, chunk: u32) -> Result<Vec<u8>> {
        self.check_available(shards)?;
        self.rs
            .reconstruct_data(shards)
            .map_err(|e| Error::EcReconstructionFailed {
                chunk,
                reason: format!("Reed-Solomon data reconstruction failed: {}", e),
            })?;

        let mut data = Vec::with_capacity(original_size);
        for s in shards.iter().take(self.data_shards).flatten() {
            data.extend_from_slice(s);
        }
        data.truncate(original_size);
        Ok(data)
    }
}

// =============================================================================
// Tests
// =============================================================================
