//! Background persistence of modified cache entries.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};
use scc::hash_map::Entry;
use tokio::io::AsyncReadExt as _;
use tokio::sync::Semaphore;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::cache::open_file::{OpenFile, OpenFileError};
use crate::mount::MountContext;
use crate::remote::{ByteStream, ItemMetadata, RemoteError, RemoteStore};

/// Chunk size of the stream an upload feeds to the remote store.
const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// Invoked with the entry once its upload has finished, whether or not it succeeded.
pub type UploadCallback<R> = Box<dyn FnOnce(Arc<OpenFile<R>>) + Send + 'static>;

/// Persists cache entries back to the remote store.
pub trait Uploader<R: RemoteStore>: Send + Sync + 'static {
    /// Persist `file` under its current path, then call `on_complete` exactly once.
    ///
    /// Scheduling a path that already has an upload in flight supersedes the older one, whose
    /// callback will never run.
    fn schedule_upload(&self, file: Arc<OpenFile<R>>, on_complete: UploadCallback<R>);

    /// Abort the in-flight upload of `path`, if any. Its callback will not run.
    ///
    /// Returns `true` if an upload was cancelled.
    fn cancel_upload(&self, path: &Path) -> bool;
}

struct PendingUpload {
    generation: u64,
    task: AbortHandle,
}

/// An [`Uploader`] that runs each upload as a task on the mount's runtime.
///
/// At most `max-concurrent-uploads` uploads transfer at the same time; the rest wait for a permit.
pub struct BackgroundUploader<R: RemoteStore> {
    ctx: Arc<MountContext<R>>,
    permits: Arc<Semaphore>,
    pending: Arc<scc::HashMap<PathBuf, PendingUpload>>,
    next_generation: AtomicU64,
}

impl<R: RemoteStore> BackgroundUploader<R> {
    /// Create an uploader bound to `ctx`.
    #[must_use]
    pub fn new(ctx: Arc<MountContext<R>>) -> Self {
        let permits = Arc::new(Semaphore::new(ctx.config().max_concurrent_uploads));
        Self {
            ctx,
            permits,
            pending: Arc::new(scc::HashMap::new()),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Returns `true` if an upload of `path` is queued or running.
    #[must_use]
    pub fn is_pending(&self, path: &Path) -> bool {
        self.pending.contains_sync(path)
    }

    /// Number of uploads queued or running.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn spawn_upload(
        &self,
        path: PathBuf,
        generation: u64,
        file: Arc<OpenFile<R>>,
        on_complete: UploadCallback<R>,
    ) -> AbortHandle {
        let ctx = Arc::clone(&self.ctx);
        let permits = Arc::clone(&self.permits);
        let pending = Arc::clone(&self.pending);

        let task = self.ctx.runtime().spawn(async move {
            // The semaphore is never closed.
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };

            match upload(&ctx, &path, &file).await {
                Ok(Some(meta)) => info!(path = ?path, size = ?meta.size, "upload finished"),
                Ok(None) => debug!(path = ?path, "entry is clean, nothing to upload"),
                Err(e) => error!(path = ?path, error = %e, "upload failed"),
            }

            // Losing this race means the upload was superseded or cancelled in the meantime.
            let still_current = pending
                .remove_if_async(&path, |p| p.generation == generation)
                .await
                .is_some();
            if still_current {
                on_complete(file);
            }
        });
        task.abort_handle()
    }
}

impl<R: RemoteStore> Uploader<R> for BackgroundUploader<R> {
    fn schedule_upload(&self, file: Arc<OpenFile<R>>, on_complete: UploadCallback<R>) {
        let path = file.path();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        // The entry lock is held while spawning so the task cannot clear its slot before it is
        // filled.
        match self.pending.entry_sync(path.clone()) {
            Entry::Occupied(mut occ) => {
                debug!(path = ?path, "superseding in-flight upload");
                occ.get().task.abort();
                let task = self.spawn_upload(path, generation, file, on_complete);
                *occ.get_mut() = PendingUpload { generation, task };
            }
            Entry::Vacant(vac) => {
                let task = self.spawn_upload(path, generation, file, on_complete);
                vac.insert_entry(PendingUpload { generation, task });
            }
        }
    }

    fn cancel_upload(&self, path: &Path) -> bool {
        let Some((_, pending)) = self.pending.remove_sync(path) else {
            return false;
        };
        pending.task.abort();
        debug!(path = ?path, "upload cancelled");
        true
    }
}

impl<R: RemoteStore> Drop for BackgroundUploader<R> {
    fn drop(&mut self) {
        let mut aborted = 0usize;
        self.pending.retain_sync(|_, pending| {
            pending.task.abort();
            aborted += 1;
            false
        });
        if aborted > 0 {
            warn!(aborted, "uploader dropped with uploads in flight");
        }
    }
}

/// Persist `file` to `path`. Returns `None` if the entry had nothing to upload.
async fn upload<R: RemoteStore>(
    ctx: &MountContext<R>,
    path: &Path,
    file: &OpenFile<R>,
) -> Result<Option<ItemMetadata>, OpenFileError> {
    if !file.is_dirty() {
        return Ok(None);
    }

    // Bytes that were never fetched are zero holes locally; pull them in before copying.
    file.load(0, u64::MAX).await?;

    // Captured before the snapshot, so a write racing with the copy leaves the entry dirty. An
    // upload that fails or is aborted never marks anything clean.
    let version = file.version();
    let meta = transfer(ctx, path, file).await?;
    file.mark_clean(version);
    Ok(Some(meta))
}

async fn transfer<R: RemoteStore>(
    ctx: &MountContext<R>,
    path: &Path,
    file: &OpenFile<R>,
) -> Result<ItemMetadata, OpenFileError> {
    let (snapshot, size) = file.snapshot_to(ctx.scratch())?;
    let reader = tokio::fs::File::from_std(snapshot.reopen()?);
    debug!(path = ?path, size, snapshot = ?snapshot.path(), "uploading snapshot");

    let meta = ctx
        .remote()
        .write(path, true, snapshot_stream(reader), size)
        .await?;
    drop(snapshot);
    Ok(meta)
}

fn snapshot_stream(file: tokio::fs::File) -> ByteStream {
    Box::pin(futures::stream::try_unfold(file, |mut file| async move {
        let mut chunk = BytesMut::with_capacity(UPLOAD_CHUNK_SIZE);
        let read = file.read_buf(&mut chunk).await?;
        let next: Option<(Bytes, tokio::fs::File)> = (read > 0).then(|| (chunk.freeze(), file));
        Ok::<_, RemoteError>(next)
    }))
}
