//! Lock-guarded set of target names already present or in flight.

use std::path::{Path, PathBuf};

use dashmap::DashSet;
use tracing::{debug, instrument};

use super::DownloadError;

/// Tracks which target names are taken in the destination directory.
///
/// The set is seeded from the directory listing at construction. A claim is an
/// atomic read-then-insert, so two tasks racing for the same name never both
/// win. Claims are also checked against the filesystem to catch files that
/// appeared after seeding.
#[derive(Debug)]
pub struct TargetRegistry {
    dir: PathBuf,
    names: DashSet<String>,
}

impl TargetRegistry {
    /// Creates the destination directory if needed and seeds the registry from
    /// its current listing.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Io`] if the directory cannot be created or read.
    #[instrument(fields(dir = %dir.display()))]
    pub async fn from_directory(dir: &Path) -> Result<Self, DownloadError> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| DownloadError::io(dir, e))?;

        let names = DashSet::new();
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| DownloadError::io(dir, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| DownloadError::io(dir, e))?
        {
            if let Some(name) = entry.file_name().to_str() {
                names.insert(name.to_string());
            }
        }

        debug!(seeded = names.len(), "target registry seeded");
        Ok(Self {
            dir: dir.to_path_buf(),
            names,
        })
    }

    /// Returns the destination directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Claims `name` for writing.
    ///
    /// Returns `false` when the name is already taken, either by an existing
    /// file or by another claim.
    pub fn claim(&self, name: &str) -> bool {
        if !self.names.insert(name.to_string()) {
            return false;
        }
        // Keep the name reserved when the file already exists.
        !self.dir.join(name).exists()
    }

    /// Releases a claim whose write did not produce a file.
    pub fn release(&self, name: &str) {
        self.names.remove(name);
    }

    /// Returns whether `name` is taken.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    /// Returns the number of taken names.
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Returns whether no names are taken.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
