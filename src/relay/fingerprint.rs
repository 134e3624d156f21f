//! Content fingerprints for relay deduplication.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

/// Read size used while hashing.
const READ_CHUNK: usize = 1024 * 1024;

/// Returns the lowercase hex SHA-256 of the file at `path`.
///
/// Hashing runs on the blocking thread pool.
///
/// # Errors
///
/// Returns the I/O error if the file cannot be read.
pub async fn fingerprint(path: &Path) -> std::io::Result<String> {
    let path: PathBuf = path.to_path_buf();
    tokio::task::spawn_blocking(move || fingerprint_sync(&path))
        .await
        .map_err(std::io::Error::other)?
}

fn fingerprint_sync(path: &Path) -> std::io::Result<String> {
    let mut reader = BufReader::with_capacity(READ_CHUNK, File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let read = reader.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}
