//! Lists relay candidates in the acquisition output directory.

use std::path::{Path, PathBuf};

use tracing::{debug, instrument};

use crate::download::constants::PART_SUFFIX;

/// Name markers of temporary files written by relay preparation.
pub const NORMALIZED_MARKER: &str = ".relay-tmp.";
pub const THUMBNAIL_MARKER: &str = ".relay-thumb.";

/// A completed file eligible for relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    pub path: PathBuf,
    pub name: String,
}

/// Returns relay candidates in `dir`, sorted by name.
///
/// Directories, empty files, hidden files, partial downloads, and relay
/// artifacts are excluded, as are names that are not valid UTF-8.
///
/// # Errors
///
/// Returns the I/O error if `dir` cannot be listed.
#[instrument(fields(dir = %dir.display()))]
pub async fn scan(dir: &Path) -> std::io::Result<Vec<ScannedFile>> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if is_excluded_name(&name) {
            continue;
        }
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(e) => {
                debug!(%name, error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if !metadata.is_file() || metadata.len() == 0 {
            continue;
        }
        files.push(ScannedFile {
            path: entry.path(),
            name,
        });
    }

    files.sort_by(|a, b| a.name.cmp(&b.name));
    debug!(count = files.len(), "scan complete");
    Ok(files)
}

fn is_excluded_name(name: &str) -> bool {
    name.starts_with('.')
        || name.ends_with(PART_SUFFIX)
        || name.contains(NORMALIZED_MARKER)
        || name.contains(THUMBNAIL_MARKER)
}
