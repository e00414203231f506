//! Per-mount shared state.
//!
//! Everything that must be shared by the registry and the uploader of one mounted filesystem,
//! and must never leak into another mount, lives in a [`MountContext`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use thiserror::Error;
use tracing::debug;

use crate::config::{CacheConfig, ConfigError};
use crate::fs::FileHandle;
use crate::remote::RemoteStore;
use crate::scratch::{InvalidScratchDirError, ScratchDir};

#[derive(Debug, Error)]
pub enum MountError {
    #[error("invalid cache configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("unusable scratch directory: {0}")]
    Scratch(#[from] InvalidScratchDirError),
}

/// Monotonically increasing file handle counter. Starts at 1 (0 is reserved).
#[derive(Debug)]
pub struct HandleGenerator {
    next: AtomicU64,
}

impl HandleGenerator {
    /// Create a counter whose first handle is 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Allocate the next handle.
    pub fn next_handle(&self) -> FileHandle {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for HandleGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Resources owned by a single mounted filesystem instance.
pub struct MountContext<R: RemoteStore> {
    remote: Arc<R>,
    scratch: ScratchDir,
    config: CacheConfig,
    handles: HandleGenerator,
    /// Held exclusively while a rename relocates cache entries, shared by operations that must
    /// not observe an entry half-way between two paths.
    move_lock: RwLock<()>,
    runtime: tokio::runtime::Handle,
}

impl<R: RemoteStore> MountContext<R> {
    /// Validate `config`, prepare its scratch directory, and bind the context to the current
    /// tokio runtime.
    pub async fn new(remote: Arc<R>, config: CacheConfig) -> Result<Arc<Self>, MountError> {
        config.validate().map_err(ConfigError::Validation)?;
        let scratch = ScratchDir::new(&config.path).await?;
        debug!(scratch = ?scratch.path(), "mount context created");

        Ok(Arc::new(Self {
            remote,
            scratch,
            config,
            handles: HandleGenerator::new(),
            move_lock: RwLock::new(()),
            runtime: tokio::runtime::Handle::current(),
        }))
    }

    /// The remote store of this mount.
    #[must_use]
    pub fn remote(&self) -> &Arc<R> {
        &self.remote
    }

    /// The scratch directory of this mount.
    #[must_use]
    pub fn scratch(&self) -> &ScratchDir {
        &self.scratch
    }

    /// The cache configuration of this mount.
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Allocate a file handle unique within this mount.
    pub fn next_handle(&self) -> FileHandle {
        self.handles.next_handle()
    }

    /// The mount-wide rename lock.
    ///
    /// [`OpenFileRegistry::move_file`](crate::cache::registry::OpenFileRegistry::move_file) holds
    /// it exclusively. It is not reentrant: never call into the registry while holding it.
    #[must_use]
    pub fn move_lock(&self) -> &RwLock<()> {
        &self.move_lock
    }

    /// The runtime background work of this mount is spawned on.
    #[must_use]
    pub fn runtime(&self) -> &tokio::runtime::Handle {
        &self.runtime
    }
}
