//! The set of drives configured on the server, in configuration order

use super::Drive;
use crate::error::{Error, Result};
use crate::model::DriveStatus;
use rand::seq::SliceRandom;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug)]
pub struct DrivePool {
    drives: Vec<Arc<Drive>>,
}

impl DrivePool {
    /// Open (and bootstrap) every configured drive root
    pub fn open(roots: &[PathBuf]) -> Result<Self> {
        let drives = roots
            .iter()
            .enumerate()
            .map(|(order, root)| Drive::open(root, order).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { drives })
    }

    /// Every drive, whatever its status
    pub fn all(&self) -> &[Arc<Drive>] {
        &self.drives
    }

    pub fn len(&self) -> usize {
        self.drives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drives.is_empty()
    }

    pub fn get(&self, order: usize) -> Option<&Arc<Drive>> {
        self.drives.get(order)
    }

    pub fn enabled(&self) -> Vec<Arc<Drive>> {
        self.with_status(DriveStatus::Enabled)
    }

    pub fn not_sync(&self) -> Vec<Arc<Drive>> {
        self.with_status(DriveStatus::NotSync)
    }

    fn with_status(&self, status: DriveStatus) -> Vec<Arc<Drive>> {
        self.drives
            .iter()
            .filter(|d| d.status() == status)
            .cloned()
            .collect()
    }

    /// Uniform random choice among enabled drives
    pub fn random_enabled(&self) -> Result<Arc<Drive>> {
        let enabled = self.enabled();
        enabled
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| Error::IllegalState("no enabled drive available".to_string()))
    }
}
