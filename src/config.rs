//! Server configuration
//!
//! Loaded from a YAML file; every field has a default so a minimal file only
//! needs the drive list:
//!
//! ```yaml
//! redundancyLevel: RAID1
//! drives:
//!   - /mnt/disk0
//!   - /mnt/disk1
//! ```

use crate::error::{Error, Result};
use crate::model::RedundancyLevel;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default RAID 6 block size (1MB)
pub const DEFAULT_BLOCK_SIZE: usize = 1024 * 1024;

/// Default page size for object listings
pub const DEFAULT_PAGE_SIZE: usize = 100;

// =============================================================================
// RAID 6
// =============================================================================

/// Erasure coding layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Raid6Config {
    /// Data shards per block (k)
    pub data_drives: usize,
    /// Parity shards per block (m)
    pub parity_drives: usize,
    /// Bytes per block before encoding
    pub block_size: usize,
}

impl Default for Raid6Config {
    fn default() -> Self {
        Self {
            data_drives: 4,
            parity_drives: 2,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl Raid6Config {
    pub fn total_drives(&self) -> usize {
        self.data_drives + self.parity_drives
    }

    /// Only 2+1, 4+2 and 8+4 are supported
    pub fn validate(&self, drive_count: usize) -> Result<()> {
        let valid = matches!(
            (drive_count, self.data_drives, self.parity_drives),
            (3, 2, 1) | (6, 4, 2) | (12, 8, 4)
        );
        if !valid {
            return Err(Error::InvalidRaidConfig(format!(
                "RAID 6 requires 3 (2+1), 6 (4+2) or 12 (8+4) drives, got {} drives with {}+{}",
                drive_count, self.data_drives, self.parity_drives
            )));
        }
        if self.block_size == 0 {
            return Err(Error::InvalidRaidConfig(
                "RAID 6 block size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Encryption
// =============================================================================

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EncryptionConfig {
    pub enabled: bool,
    /// Hex encoded 256-bit key wrapping the data key stored on the drives
    pub master_key: Option<String>,
}

// =============================================================================
// Server Settings
// =============================================================================

/// Top-level server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Server name recorded in the server metadata on first start
    pub server_name: String,

    /// Drive root directories, in order
    pub drives: Vec<PathBuf>,

    pub redundancy_level: RedundancyLevel,
    pub raid6: Raid6Config,

    /// Keep prior versions on update
    pub version_control: bool,

    /// Lock creation rate used to size the sweeper batch
    pub lock_rate_millisecs: u64,
    /// Lower bound of the lock sweeper interval
    pub lock_sweep_min_millisecs: u64,
    /// Upper bound of the lock sweeper interval
    pub lock_sweep_max_millisecs: u64,

    pub use_object_cache: bool,
    pub object_cache_capacity: usize,

    /// A drive copy is re-hashed when its last check is older than this
    pub integrity_check_days: i64,

    /// Rollback failures are logged instead of returned
    pub recovery_mode: bool,

    pub encryption: EncryptionConfig,

    /// Forward committed operations to a standby server
    pub standby_enabled: bool,

    /// Worker threads used by drive sync, 0 picks a value from the CPU count
    pub sync_threads: usize,

    /// Listing agents idle for longer than this are discarded
    pub iterator_idle_secs: u64,

    pub page_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            server_name: "raidvault".to_string(),
            drives: Vec::new(),
            redundancy_level: RedundancyLevel::Raid0,
            raid6: Raid6Config::default(),
            version_control: true,
            lock_rate_millisecs: 2,
            lock_sweep_min_millisecs: 5_000,
            lock_sweep_max_millisecs: 120_000,
            use_object_cache: true,
            object_cache_capacity: 500_000,
            integrity_check_days: 180,
            recovery_mode: false,
            encryption: EncryptionConfig::default(),
            standby_enabled: false,
            sync_threads: 0,
            iterator_idle_secs: 600,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl ServerSettings {
    /// Load settings from a YAML file and validate them
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let settings: ServerSettings = serde_yaml::from_str(&text)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Convenience constructor used by embedders and tests
    pub fn with_drives(level: RedundancyLevel, drives: Vec<PathBuf>) -> Self {
        Self {
            redundancy_level: level,
            drives,
            ..Default::default()
        }
    }

    /// Check the drive list against the redundancy level
    pub fn validate(&self) -> Result<()> {
        if self.drives.is_empty() {
            return Err(Error::Config("at least one drive is required".to_string()));
        }
        match self.redundancy_level {
            RedundancyLevel::Raid0 => Ok(()),
            RedundancyLevel::Raid1 => {
                if self.drives.len() < 2 {
                    return Err(Error::InvalidRaidConfig(format!(
                        "RAID 1 requires at least 2 drives, got {}",
                        self.drives.len()
                    )));
                }
                Ok(())
            }
            RedundancyLevel::Raid6 => self.raid6.validate(self.drives.len()),
        }?;
        if self.encryption.enabled && self.encryption.master_key.is_none() {
            return Err(Error::Config(
                "encryption is enabled but no master key is configured".to_string(),
            ));
        }
        if self.page_size == 0 {
            return Err(Error::Config("page size must be greater than 0".to_string()));
        }
        Ok(())
    }

    /// Number of drive-sync workers
    pub fn effective_sync_threads(&self) -> usize {
        if self.sync_threads > 0 {
            return self.sync_threads;
        }
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        (cpus.saturating_sub(1)) / 2 + 1
    }

    pub fn iterator_idle(&self) -> Duration {
        Duration::from_secs(self.iterator_idle_secs)
    }
}
