//! Directory operations

use std::path::{Path, PathBuf};

use tokio::fs;

use crate::errors::FleetError;

#[derive(Debug, Clone)]
pub struct Dir {
    path: PathBuf,
}

impl Dir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    /// Create the directory and its parents
    pub async fn create(&self) -> Result<(), FleetError> {
        fs::create_dir_all(&self.path).await?;
        Ok(())
    }

    async fn is_empty(&self) -> Result<bool, FleetError> {
        let mut entries = fs::read_dir(&self.path).await?;
        Ok(entries.next_entry().await?.is_none())
    }

    /// Remove empty directories from `start` upwards, stopping below this
    /// directory or at the first non-empty one. Returns how many were removed.
    pub async fn prune_empty_from(&self, start: &Path) -> Result<usize, FleetError> {
        if !start.starts_with(&self.path) {
            return Ok(0);
        }

        let mut removed = 0;
        let mut current = start.to_path_buf();
        while current != self.path {
            let dir = Dir::new(&current);
            if !dir.exists().await || !dir.is_empty().await? {
                break;
            }
            fs::remove_dir(&current).await?;
            removed += 1;
            match current.parent() {
                Some(parent) => current = parent.to_path_buf(),
                None => break,
            }
        }
        Ok(removed)
    }
}
