//! flock(2) guards for per-key vault writes, the registry and the audit log.
//!
//! Each guard opens its own file description, so two threads of one process
//! exclude each other just like two processes do.

use crate::error::{Error, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::Path;

/// Held for the lifetime of the value. Closing the file releases the flock.
pub struct FileLock {
    _file: File,
}

impl FileLock {
    /// Block until the lock at `path` is ours. Creates the lock file if needed.
    pub fn exclusive(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(|e| Error::io_context(e, format!("open lock file {}", path.display())))?;
        file.lock_exclusive()
            .map_err(|e| Error::io_context(e, format!("acquire lock {}", path.display())))?;
        tracing::trace!(lock = %path.display(), "lock acquired");
        Ok(Self { _file: file })
    }
}
