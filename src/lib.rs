//! RaidVault - Multi-drive virtual file system for object storage
//!
//! Persists buckets and versioned objects across a pool of independent drives
//! with RAID 0 (stripe), RAID 1 (mirror) or RAID 6 (Reed-Solomon) redundancy.
//! Every multi-file mutation is recorded in a write-ahead journal first and is
//! either committed or rolled back, including after a crash.
//!
//! # Architecture
//!
//! ```text
//! VirtualFileSystem ─▶ IoDriver ─▶ LockService (object ▶ bucket)
//!                                ─▶ JournalService (begin / commit / cancel)
//!                                ─▶ RaidLayout ─▶ Drive × N
//!                                ─▶ SchedulerService (post-commit cleanup)
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Object metadata cache
//! - [`config`] - Server settings
//! - [`crypto`] - AES-256-GCM object encryption
//! - [`drive`] - One mount point and its on-disk layout
//! - [`driver`] - RAID drivers, mutations, integrity checks and drive sync
//! - [`ec`] - Erasure coding components
//! - [`error`] - Error types
//! - [`iterator`] - Paged bucket listing
//! - [`journal`] - Write-ahead journal
//! - [`lock`] - Server, bucket and object locks
//! - [`model`] - Metadata persisted on the drives
//! - [`replication`] - Standby replication boundary
//! - [`scheduler`] - Persisted queue of service requests
//! - [`vfs`] - Startup, recovery and the bucket / object facade

pub mod cache;
pub mod config;
pub mod crypto;
pub mod drive;
pub mod driver;
pub mod ec;
pub mod error;
pub mod iterator;
pub mod journal;
pub mod lock;
pub mod model;
pub mod replication;
pub mod scheduler;
pub mod vfs;

// Re-export commonly used types
pub use config::ServerSettings;
pub use driver::{DriveSyncReport, IoDriver};
pub use error::{Error, Result};
pub use model::{DataList, Item, ObjectMetadata, RedundancyLevel, ServerBucket};
pub use vfs::VirtualFileSystem;
