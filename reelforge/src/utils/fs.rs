//! Filesystem helpers with operation + path context on errors.

use std::path::Path;

use crate::{Error, Result};

/// Ensure a directory exists, creating it recursively if needed.
pub async fn ensure_dir_all(op: &'static str, path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| Error::io_path(op, path, e))
}

/// Synchronous variant of [`ensure_dir_all`] for start-up code.
pub fn ensure_dir_all_sync(op: &'static str, path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| Error::io_path(op, path, e))
}

/// Remove a file, ignoring one that is already gone.
pub async fn remove_file_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io_path("removing", path, e)),
    }
}
