//! Local scratch storage for cache backing files.
//!
//! Several mounts may share one cache directory. Each mount works inside its own `mount-*`
//! subdirectory and holds an exclusive lock on the `.lock` file within it for as long as it lives,
//! so a starting mount can tell abandoned subdirectories from those of live processes.

use std::fs::{File, TryLockError};
use std::io;
use std::path::{Path, PathBuf};

use tempfile::{NamedTempFile, TempDir};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum InvalidScratchDirError {
    #[error("Scratch path is not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("Scratch path contains data this app did not create: {0}")]
    ForeignContents(PathBuf),

    #[error("IO error while preparing scratch path: {0}")]
    Io(#[from] io::Error),
}

/// One mount's private directory inside a shared cache directory, holding sparse backing files
/// and upload snapshots.
///
/// Every file handed out is a randomly named, exclusively created temporary that is unlinked as
/// soon as its [`NamedTempFile`] is dropped. The directory itself is removed when this value is
/// dropped.
#[derive(Debug)]
pub struct ScratchDir {
    // Dropped before `_lock`, so the directory is gone before another mount may claim it.
    dir: TempDir,
    _lock: File,
}

impl ScratchDir {
    // Changing this makes existing cache directories look foreign, and they will be refused
    // rather than reused.
    const MARKER_FILE: &'static str = ".cloudfs_cache";
    const MOUNT_PREFIX: &'static str = "mount-";
    const LOCK_FILE: &'static str = ".lock";

    /// Claim a private scratch directory under the cache directory at `path`.
    ///
    /// `path` is created if missing. An existing directory must either be empty or carry the
    /// marker file left by an earlier run. Anything in it that no live mount holds is removed.
    pub async fn new(path: &Path) -> Result<Self, InvalidScratchDirError> {
        let root = match tokio::fs::canonicalize(path).await {
            Ok(p) => {
                if !tokio::fs::metadata(&p).await?.is_dir() {
                    return Err(InvalidScratchDirError::NotADirectory(p));
                }

                let mut entries = tokio::fs::read_dir(&p).await?;
                let is_empty = entries.next_entry().await?.is_none();
                let marker_exists = tokio::fs::try_exists(p.join(Self::MARKER_FILE)).await?;
                if !(is_empty || marker_exists) {
                    return Err(InvalidScratchDirError::ForeignContents(p));
                }
                p
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tokio::fs::create_dir_all(path).await?;
                tokio::fs::canonicalize(path).await?
            }
            Err(e) => return Err(e.into()),
        };

        // File locks block, so claiming happens off the async workers.
        let scratch = tokio::task::spawn_blocking(move || Self::claim(&root))
            .await
            .map_err(io::Error::other)??;
        debug!(dir = ?scratch.path(), "scratch directory ready");
        Ok(scratch)
    }

    /// Sweep abandoned contents of `root` and create this mount's locked subdirectory.
    ///
    /// Runs with the marker file locked, so no other mount is sweeping or claiming meanwhile.
    fn claim(root: &Path) -> io::Result<Self> {
        let marker = File::options()
            .create(true)
            .truncate(false)
            .write(true)
            .open(root.join(Self::MARKER_FILE))?;
        marker.lock()?;

        let swept = Self::sweep_abandoned(root)?;
        if swept > 0 {
            debug!(root = ?root, swept, "removed leftovers of earlier runs");
        }

        let dir = tempfile::Builder::new()
            .prefix(Self::MOUNT_PREFIX)
            .tempdir_in(root)?;
        let lock = File::create(dir.path().join(Self::LOCK_FILE))?;
        lock.try_lock().map_err(|e| match e {
            TryLockError::WouldBlock => io::Error::from(io::ErrorKind::WouldBlock),
            TryLockError::Error(e) => e,
        })?;

        drop(marker);
        Ok(Self { dir, _lock: lock })
    }

    fn sweep_abandoned(root: &Path) -> io::Result<usize> {
        let mut swept = 0;
        for entry in std::fs::read_dir(root)? {
            let entry = entry?;
            let name = entry.file_name();
            if name == Self::MARKER_FILE {
                continue;
            }

            let child = entry.path();
            if !entry.file_type()?.is_dir() {
                std::fs::remove_file(&child)?;
                swept += 1;
                continue;
            }

            let is_mount = name.to_string_lossy().starts_with(Self::MOUNT_PREFIX);
            if is_mount && Self::is_held(&child)? {
                continue;
            }
            if let Err(e) = std::fs::remove_dir_all(&child) {
                // The owner may have just finished removing it.
                if e.kind() != io::ErrorKind::NotFound {
                    return Err(e);
                }
                debug!(dir = ?child, "leftover vanished while sweeping");
            }
            swept += 1;
        }
        Ok(swept)
    }

    /// Returns `true` if a live mount holds the lock of the mount directory `dir`.
    fn is_held(dir: &Path) -> io::Result<bool> {
        // Mounts create and lock this file while the marker is locked, so a live one always has it.
        let lock = match File::open(dir.join(Self::LOCK_FILE)) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e),
        };
        match lock.try_lock() {
            Ok(()) => Ok(false),
            Err(TryLockError::WouldBlock) => Ok(true),
            Err(TryLockError::Error(e)) => Err(e),
        }
    }

    /// The canonical path of this mount's private directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Create a new backing file grown to `size` bytes without writing any of them.
    pub fn create_sparse(&self, size: u64) -> io::Result<NamedTempFile> {
        let file = tempfile::Builder::new()
            .prefix("entry-")
            .tempfile_in(self.path())?;
        file.as_file().set_len(size)?;
        Ok(file)
    }

    /// Create an empty file to receive a point-in-time copy of an entry before upload.
    pub fn create_snapshot(&self) -> io::Result<NamedTempFile> {
        tempfile::Builder::new()
            .prefix("upload-")
            .tempfile_in(self.path())
    }
}
