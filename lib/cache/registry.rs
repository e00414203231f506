//! The path → cache entry map of one mount, and the handle table that references it.
//!
//! Every structural change to the path map goes through an `scc` entry lock keyed by path, so two
//! racing opens of a new path create exactly one entry and an eviction never removes an entry that
//! a concurrent open has just picked up.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use scc::hash_map::Entry;
use tracing::{debug, instrument, trace, warn};

use crate::cache::open_file::{OpenFile, OpenFileError};
use crate::cache::uploader::{UploadCallback, Uploader};
use crate::fs::{FileHandle, OpenFlags};
use crate::mount::MountContext;
use crate::remote::{ItemMetadata, RemoteStore};

/// Maps logical paths to cache entries and file handles to the entries they reference.
///
/// Entries outlive their last handle: closing it schedules an upload, and the entry is evicted
/// only after that upload has finished and a grace period has passed without a reopen.
pub struct OpenFileRegistry<R: RemoteStore, U: Uploader<R>> {
    ctx: Arc<MountContext<R>>,
    uploader: Arc<U>,
    active: Arc<scc::HashMap<PathBuf, Arc<OpenFile<R>>>>,
    handles: scc::HashMap<FileHandle, Arc<OpenFile<R>>>,
}

impl<R: RemoteStore, U: Uploader<R>> OpenFileRegistry<R, U> {
    /// Create an empty registry for the mount described by `ctx`.
    #[must_use]
    pub fn new(ctx: Arc<MountContext<R>>, uploader: Arc<U>) -> Self {
        Self {
            ctx,
            uploader,
            active: Arc::new(scc::HashMap::new()),
            handles: scc::HashMap::new(),
        }
    }

    /// The uploader this registry hands entries to.
    #[must_use]
    pub fn uploader(&self) -> &Arc<U> {
        &self.uploader
    }

    /// Open `path`, creating a cache entry for it if none is mapped yet.
    ///
    /// `initial_size` only matters when a new entry is created. `last_modified` is applied to the
    /// entry either way.
    #[instrument(name = "OpenFileRegistry::open", skip(self))]
    pub fn open(
        &self,
        path: &Path,
        flags: OpenFlags,
        initial_size: u64,
        last_modified: SystemTime,
    ) -> Result<FileHandle, OpenFileError> {
        // A stale upload finishing after this write would overwrite it remotely.
        if flags.is_writable() && self.uploader.cancel_upload(path) {
            debug!("cancelled pending upload before opening for write");
        }

        let file = match self.active.entry_sync(path.to_path_buf()) {
            Entry::Occupied(occ) => {
                let file = Arc::clone(occ.get());
                file.open_handle();
                file.update_last_modified(last_modified);
                file
            }
            Entry::Vacant(vac) => {
                let file = Arc::new(OpenFile::create(
                    path.to_path_buf(),
                    Arc::clone(self.ctx.remote()),
                    self.ctx.scratch(),
                    initial_size,
                    last_modified,
                )?);
                file.open_handle();
                vac.insert_entry(Arc::clone(&file));
                file
            }
        };

        if flags.contains(OpenFlags::TRUNC)
            && let Err(e) = file.truncate(0)
        {
            self.release(&file);
            return Err(e);
        }

        let fh = self.ctx.next_handle();
        let inserted = self.handles.insert_sync(fh, file);
        debug_assert!(inserted.is_ok(), "file handle {fh} was issued twice");
        trace!(fh, "opened");
        Ok(fh)
    }

    /// The entry behind `fh`, if the handle is open.
    #[must_use]
    pub fn get(&self, fh: FileHandle) -> Option<Arc<OpenFile<R>>> {
        self.handles.read_sync(&fh, |_, file| Arc::clone(file))
    }

    /// Close `fh`. Closing the last handle of an entry schedules its upload.
    #[instrument(name = "OpenFileRegistry::close", skip(self))]
    pub fn close(&self, fh: FileHandle) {
        let Some((_, file)) = self.handles.remove_sync(&fh) else {
            warn!(fh, "close of an unknown file handle");
            return;
        };
        self.release(&file);
    }

    fn release(&self, file: &Arc<OpenFile<R>>) {
        let _guard = self.ctx.move_lock().read();
        let path = file.path();

        // Decrement under the entry lock so an open racing this close is ordered against it.
        let released = self.active.update_sync(&path, |_, mapped| {
            Arc::ptr_eq(mapped, file).then(|| (file.release_handle(), file.idle_epoch()))
        });

        match released.flatten() {
            Some((0, epoch)) => {
                debug!(path = ?path, "last handle closed, scheduling upload");
                self.uploader
                    .schedule_upload(Arc::clone(file), self.evict_after_grace(epoch));
            }
            Some(_) => {}
            None => {
                // No longer mapped: deleted or displaced by a move, and already closed.
                file.release_handle();
            }
        }
    }

    /// The completion callback for an upload scheduled when the entry went idle at `epoch`.
    fn evict_after_grace(&self, epoch: u64) -> UploadCallback<R> {
        let ctx = Arc::clone(&self.ctx);
        let active = Arc::clone(&self.active);
        Box::new(move |file| {
            let grace = ctx.config().eviction_grace_period();
            let runtime = ctx.runtime().clone();
            runtime.spawn(async move {
                tokio::time::sleep(grace).await;
                evict_if_idle(&ctx, &active, &file, epoch);
            });
        })
    }

    /// Relocate the entry cached at `old_path` to `new_path`.
    ///
    /// Any entry already mapped at `new_path` is closed and discarded. An upload that was in flight
    /// for `old_path` is restarted under `new_path`.
    ///
    /// # Panics
    ///
    /// Panics if `old_path == new_path`.
    #[instrument(name = "OpenFileRegistry::move_file", skip(self))]
    pub fn move_file(&self, old_path: &Path, new_path: &Path) {
        assert_ne!(old_path, new_path, "move source and destination must differ");
        let _guard = self.ctx.move_lock().write();

        let was_uploading = self.uploader.cancel_upload(old_path);
        if self.uploader.cancel_upload(new_path) {
            debug!("cancelled upload of the overwritten destination");
        }

        let Some((_, file)) = self.active.remove_sync(old_path) else {
            trace!("nothing cached at source");
            if let Some((_, displaced)) = self.active.remove_sync(new_path) {
                debug!("discarding cached destination");
                displaced.close();
            }
            return;
        };
        file.update_path(new_path.to_path_buf());

        match self.active.entry_sync(new_path.to_path_buf()) {
            Entry::Occupied(mut occ) => {
                let displaced = std::mem::replace(occ.get_mut(), Arc::clone(&file));
                debug!("discarding cached destination");
                displaced.close();
            }
            Entry::Vacant(vac) => {
                vac.insert_entry(Arc::clone(&file));
            }
        }

        if was_uploading {
            debug!("rescheduling interrupted upload under the new path");
            let epoch = file.idle_epoch();
            self.uploader
                .schedule_upload(file, self.evict_after_grace(epoch));
        }
    }

    /// Drop the entry cached at `path`, if any, and cancel its upload.
    ///
    /// Entries cached under `path` as a directory are left alone; see
    /// [`delete_tree`](Self::delete_tree).
    #[instrument(name = "OpenFileRegistry::delete", skip(self))]
    pub fn delete(&self, path: &Path) {
        let _guard = self.ctx.move_lock().read();
        self.uploader.cancel_upload(path);
        if let Some((_, file)) = self.active.remove_sync(path) {
            file.close();
            debug!("dropped cached entry");
        }
    }

    /// Drop the entry at `path` and every entry cached beneath it.
    #[instrument(name = "OpenFileRegistry::delete_tree", skip(self))]
    pub fn delete_tree(&self, path: &Path) {
        let _guard = self.ctx.move_lock().read();

        let mut removed = Vec::new();
        self.active.retain_sync(|key, file| {
            if key.starts_with(path) {
                removed.push((key.clone(), Arc::clone(file)));
                false
            } else {
                true
            }
        });

        for (key, file) in &removed {
            self.uploader.cancel_upload(key);
            file.close();
        }
        debug!(count = removed.len(), "dropped cached subtree");
    }

    /// Metadata of the entry mapped at `path`, if one happens to be cached right now.
    ///
    /// The entry may be evicted the moment this returns.
    #[must_use]
    pub fn cached_metadata(&self, path: &Path) -> Option<ItemMetadata> {
        self.active
            .read_sync(path, |_, file| file.metadata().ok())
            .flatten()
    }

    /// Returns `true` if an entry is mapped at `path`.
    #[must_use]
    pub fn is_cached(&self, path: &Path) -> bool {
        self.active.contains_sync(path)
    }

    /// Number of paths with a cache entry.
    #[must_use]
    pub fn cached_count(&self) -> usize {
        self.active.len()
    }

    /// Number of open file handles.
    #[must_use]
    pub fn open_handle_count(&self) -> usize {
        self.handles.len()
    }
}

/// Evict `file` if it is still the entry mapped at its path and nobody has used it since `epoch`.
fn evict_if_idle<R: RemoteStore>(
    ctx: &MountContext<R>,
    active: &scc::HashMap<PathBuf, Arc<OpenFile<R>>>,
    file: &Arc<OpenFile<R>>,
    epoch: u64,
) {
    let _guard = ctx.move_lock().read();
    let path = file.path();

    let evicted = active
        .remove_if_sync(&path, |mapped| {
            Arc::ptr_eq(mapped, file) && file.handle_count() == 0 && file.idle_epoch() == epoch
        })
        .is_some();

    if evicted {
        file.close();
        debug!(path = ?path, "evicted idle entry");
    } else {
        trace!(path = ?path, "entry was reused during the grace period, keeping it");
    }
}
