//! Single-instance lock for the tunnel client.
//!
//! Two clients on one host would fight over the virtual interface and the
//! device's registry entry, so the client holds an exclusive file lock for
//! its lifetime.

use crate::error::{OverlayError, OverlayResult};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Lock file name for the tunnel client.
const LOCK_FILE_NAME: &str = "edge-overlay.lock";

/// A file-based lock held until drop.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    file: File,
}

impl InstanceLock {
    /// Acquire the lock at the default location.
    pub fn acquire() -> OverlayResult<Self> {
        Self::acquire_at(&Self::default_path())
    }

    /// Acquire the lock at `path`.
    ///
    /// Returns an error if another process holds it.
    pub fn acquire_at(path: &Path) -> OverlayResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                OverlayError::config_with_source("Failed to create lock directory", e)
            })?;
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| OverlayError::config_with_source("Failed to open lock file", e))?;

        file.try_lock_exclusive().map_err(|_| {
            OverlayError::config(format!(
                "Another tunnel client is already running (lock {})",
                path.display()
            ))
        })?;

        // PID for debugging; only written once the lock is ours.
        let _ = file.set_len(0);
        let _ = writeln!(file, "{}", std::process::id());

        log::debug!("Acquired instance lock: {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Lock file location: `$XDG_RUNTIME_DIR`, then `$TMPDIR`, then `/tmp`.
    pub fn default_path() -> PathBuf {
        if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
            PathBuf::from(runtime_dir).join(LOCK_FILE_NAME)
        } else if let Ok(tmpdir) = std::env::var("TMPDIR") {
            PathBuf::from(tmpdir).join(LOCK_FILE_NAME)
        } else {
            PathBuf::from("/tmp").join(LOCK_FILE_NAME)
        }
    }

    /// Check whether `path` is locked without taking the lock.
    pub fn is_locked(path: &Path) -> bool {
        let file = match OpenOptions::new().read(true).open(path) {
            Ok(f) => f,
            Err(_) => return false,
        };
        match file.try_lock_exclusive() {
            Ok(()) => {
                let _ = FileExt::unlock(&file);
                false
            }
            Err(_) => true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        // The file is left behind; the lock goes with the descriptor.
        let _ = FileExt::unlock(&self.file);
        log::debug!("Released instance lock: {}", self.path.display());
    }
}
