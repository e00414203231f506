//! A single cached file: one sparse local backing file mirroring one remote path.

use std::fs::File;
use std::io::{self, Write};
use std::ops::Range;
use std::os::unix::fs::FileExt as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::SystemTime;

use bytes::Bytes;
use futures::StreamExt as _;
use parking_lot::{Mutex, RwLock};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, error, instrument, trace};

use crate::range_set::RangeSet;
use crate::remote::{ItemMetadata, RemoteError, RemoteStore};
use crate::scratch::ScratchDir;

/// Buffer size used when copying a backing file out of the cache.
const COPY_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum OpenFileError {
    #[error("failed to allocate backing file: {0}")]
    Allocation(#[source] io::Error),

    #[error("offset {offset} is beyond the end of the file ({size} bytes)")]
    EndOfFile { offset: u64, size: u64 },

    #[error("remote transfer failed: {0}")]
    Transfer(#[from] RemoteError),

    #[error("local io error: {0}")]
    Io(#[from] io::Error),

    #[error("cache entry is closed")]
    Closed,
}

impl OpenFileError {
    /// Returns `true` if a load started past the end of the file.
    ///
    /// Adapters usually answer this with an empty read rather than an error.
    #[must_use]
    pub fn is_end_of_file(&self) -> bool {
        matches!(self, Self::EndOfFile { .. })
    }
}

impl From<OpenFileError> for i32 {
    fn from(e: OpenFileError) -> Self {
        match e {
            OpenFileError::Allocation(ref io_err) | OpenFileError::Io(ref io_err) => {
                io_err.raw_os_error().unwrap_or(libc::EIO)
            }
            OpenFileError::EndOfFile { .. } => libc::ENXIO,
            OpenFileError::Transfer(remote) => remote.into(),
            OpenFileError::Closed => libc::EBADF,
        }
    }
}

/// A cache entry for one logical path.
///
/// The entry owns a sparse temporary file in the mount's scratch directory and remembers which
/// byte ranges of it are valid. Bytes are fetched from the [`RemoteStore`] lazily, the first time
/// a [`load`](Self::load) covers them.
///
/// Lock order is `populated` before `backing`. The `populated` lock is held while bytes are
/// written into the backing file, never across a network await.
pub struct OpenFile<R: RemoteStore> {
    path: RwLock<PathBuf>,
    /// `None` once the entry has been closed.
    backing: RwLock<Option<NamedTempFile>>,
    remote: Arc<R>,
    populated: Mutex<RangeSet>,
    handle_count: AtomicUsize,
    /// Bumped every time the handle count drops to zero.
    idle_epoch: AtomicU64,
    /// Incremented by every mutation. The entry is dirty while it is ahead of `clean_version`.
    version: AtomicU64,
    clean_version: AtomicU64,
    last_modified: Mutex<SystemTime>,
}

impl<R: RemoteStore> std::fmt::Debug for OpenFile<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenFile")
            .field("path", &*self.path.read())
            .field("open", &self.is_open())
            .field("handle_count", &self.handle_count())
            .field("dirty", &self.is_dirty())
            .finish_non_exhaustive()
    }
}

impl<R: RemoteStore> OpenFile<R> {
    /// Allocate a new entry whose backing file is grown to `initial_size` bytes.
    ///
    /// No bytes are written: the file stays sparse until content is loaded or written.
    pub fn create(
        path: PathBuf,
        remote: Arc<R>,
        scratch: &ScratchDir,
        initial_size: u64,
        last_modified: SystemTime,
    ) -> Result<Self, OpenFileError> {
        let backing = scratch
            .create_sparse(initial_size)
            .map_err(OpenFileError::Allocation)?;
        debug!(path = ?path, initial_size, backing = ?backing.path(), "allocated cache entry");

        Ok(Self {
            path: RwLock::new(path),
            backing: RwLock::new(Some(backing)),
            remote,
            populated: Mutex::new(RangeSet::new()),
            handle_count: AtomicUsize::new(0),
            idle_epoch: AtomicU64::new(0),
            version: AtomicU64::new(0),
            clean_version: AtomicU64::new(0),
            last_modified: Mutex::new(last_modified),
        })
    }

    /// Run `f` against the backing file, failing if the entry has been closed.
    fn with_backing<T>(&self, f: impl FnOnce(&File) -> io::Result<T>) -> Result<T, OpenFileError> {
        let guard = self.backing.read();
        let file = guard.as_ref().ok_or(OpenFileError::Closed)?;
        Ok(f(file.as_file())?)
    }

    /// The current logical path of this entry.
    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.path.read().clone()
    }

    /// Point this entry at a new logical path. The backing file is untouched.
    pub fn update_path(&self, new_path: PathBuf) {
        *self.path.write() = new_path;
    }

    /// The current length of the backing file.
    pub fn size(&self) -> Result<u64, OpenFileError> {
        self.with_backing(|file| Ok(file.metadata()?.len()))
    }

    /// Returns `true` until [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.backing.read().is_some()
    }

    /// Register one more open handle. Returns the count after incrementing.
    pub fn open_handle(&self) -> usize {
        self.handle_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop one open handle. Returns the count after decrementing.
    pub fn release_handle(&self) -> usize {
        match self
            .handle_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1))
        {
            Ok(1) => {
                self.idle_epoch.fetch_add(1, Ordering::AcqRel);
                0
            }
            Ok(prev) => prev - 1,
            Err(_) => {
                error!(path = ?self.path(), "released a handle of an entry with no open handles");
                0
            }
        }
    }

    /// Number of handles currently referencing this entry.
    #[must_use]
    pub fn handle_count(&self) -> usize {
        self.handle_count.load(Ordering::Acquire)
    }

    /// How many times the handle count has dropped to zero.
    ///
    /// Lets a deferred eviction tell whether the entry has been reopened and released again since
    /// it was scheduled.
    #[must_use]
    pub fn idle_epoch(&self) -> u64 {
        self.idle_epoch.load(Ordering::Acquire)
    }

    /// Mark the entry as modified (or clean). Marking it dirty also refreshes last-modified.
    pub fn set_dirty(&self, dirty: bool) {
        if dirty {
            *self.last_modified.lock() = SystemTime::now();
            self.version.fetch_add(1, Ordering::AcqRel);
        } else {
            self.mark_clean(self.version());
        }
    }

    /// Returns `true` if the entry holds local changes that have not been persisted.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.version.load(Ordering::Acquire) > self.clean_version.load(Ordering::Acquire)
    }

    /// The mutation counter. Capture it before copying content out for persistence.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Record that every mutation up to `version` has been persisted.
    ///
    /// Mutations made after `version` was captured keep the entry dirty.
    pub fn mark_clean(&self, version: u64) {
        self.clean_version.fetch_max(version, Ordering::AcqRel);
    }

    /// The entry's last-modified time.
    #[must_use]
    pub fn last_modified(&self) -> SystemTime {
        *self.last_modified.lock()
    }

    /// Overwrite the last-modified time without touching the backing file.
    pub fn update_last_modified(&self, last_modified: SystemTime) {
        *self.last_modified.lock() = last_modified;
    }

    /// A point-in-time metadata record for this entry.
    pub fn metadata(&self) -> Result<ItemMetadata, OpenFileError> {
        Ok(ItemMetadata::file(
            &self.path(),
            self.last_modified(),
            self.size()?,
        ))
    }

    /// Release the backing file. Safe to call more than once; failures are only logged.
    pub fn close(&self) {
        let Some(backing) = self.backing.write().take() else {
            return;
        };
        if let Err(e) = backing.close() {
            error!(path = ?self.path(), error = %e, "failed to close backing file");
        }
    }

    /// Make sure bytes `[offset, min(size, offset + count))` are present in the backing file.
    ///
    /// Missing sub-ranges are fetched from the remote store concurrently. Overlapping loads may
    /// fetch the same bytes twice; whichever copy lands first is kept. If any fetch fails the
    /// load fails, but bytes already transferred stay marked as populated.
    #[instrument(name = "OpenFile::load", skip(self))]
    pub async fn load(&self, offset: u64, count: u64) -> Result<(), OpenFileError> {
        let size = self.size()?;
        if offset > size {
            return Err(OpenFileError::EndOfFile { offset, size });
        }

        let upper = size.min(offset.saturating_add(count));
        let missing = self.populated.lock().difference(offset..upper);
        if missing.is_empty() {
            trace!("range already cached");
            return Ok(());
        }

        let path = self.path();
        debug!(path = ?path, missing = ?missing, "fetching missing ranges");
        futures::future::try_join_all(missing.into_iter().map(|gap| self.fetch(&path, gap)))
            .await?;
        Ok(())
    }

    /// Fetch one missing range, storing each received chunk as it arrives.
    async fn fetch(&self, path: &Path, gap: Range<u64>) -> Result<(), OpenFileError> {
        let length = gap.end - gap.start;
        let mut stream = self.remote.read(path, gap.start, length).await?;

        let mut transferred = 0u64;
        while transferred < length
            && let Some(chunk) = stream.next().await
        {
            let chunk = chunk?;
            let remaining = usize::try_from(length - transferred).unwrap_or(usize::MAX);
            let data = &chunk[..remaining.min(chunk.len())];
            self.store_fetched(gap.start + transferred, data)?;
            transferred += data.len() as u64;
        }

        if transferred < length {
            debug!(
                path = ?path,
                offset = gap.start,
                requested = length,
                transferred,
                "short remote transfer"
            );
        }
        Ok(())
    }

    /// Write fetched bytes at `at`, skipping anything that became populated in the meantime so a
    /// late fetch never clobbers a local write. Bytes past a concurrent truncation are dropped.
    fn store_fetched(&self, at: u64, data: &[u8]) -> Result<(), OpenFileError> {
        let mut populated = self.populated.lock();
        let size = self.size()?;
        let range = at..size.min(at + data.len() as u64);
        if range.is_empty() {
            return Ok(());
        }
        for piece in populated.difference(range.clone()) {
            #[expect(
                clippy::cast_possible_truncation,
                reason = "piece lies within data, whose length fits in usize"
            )]
            let (lo, hi) = ((piece.start - at) as usize, (piece.end - at) as usize);
            self.with_backing(|file| file.write_all_at(&data[lo..hi], piece.start))?;
        }
        populated.add(range);
        Ok(())
    }

    /// Load and return up to `size` bytes starting at `offset`.
    ///
    /// The result is shorter than `size` when the range reaches the end of the file.
    pub async fn read(&self, offset: u64, size: u32) -> Result<Bytes, OpenFileError> {
        self.load(offset, u64::from(size)).await?;
        self.with_backing(|file| {
            let len = file.metadata()?.len();
            let end = len.min(offset.saturating_add(u64::from(size)));
            let count = usize::try_from(end.saturating_sub(offset)).unwrap_or(usize::MAX);
            let mut buf = vec![0u8; count];
            file.read_exact_at(&mut buf, offset)?;
            Ok(Bytes::from(buf))
        })
    }

    /// Write `data` at `offset` and mark the entry dirty. Returns the number of bytes written.
    ///
    /// Growing the file past its old end also marks the zero-filled gap as populated: those bytes
    /// have no remote counterpart.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<usize, OpenFileError> {
        let mut populated = self.populated.lock();
        let old_size = self.with_backing(|file| {
            let len = file.metadata()?.len();
            file.write_all_at(data, offset)?;
            Ok(len)
        })?;
        if offset > old_size {
            populated.add(old_size..offset);
        }
        populated.add(offset..offset + data.len() as u64);
        drop(populated);

        self.set_dirty(true);
        Ok(data.len())
    }

    /// Shrink or grow the backing file to `size` bytes and mark the entry dirty.
    ///
    /// Shrinking forgets populated marks past the new end. Growing marks the new tail populated.
    pub fn truncate(&self, size: u64) -> Result<(), OpenFileError> {
        let mut populated = self.populated.lock();
        let old_size = self.with_backing(|file| {
            let len = file.metadata()?.len();
            file.set_len(size)?;
            Ok(len)
        })?;
        if size < old_size {
            populated.remove(size..u64::MAX);
        } else {
            populated.add(old_size..size);
        }
        drop(populated);

        self.set_dirty(true);
        Ok(())
    }

    /// Copy the whole backing file into `dst`. Returns the number of bytes copied.
    ///
    /// Holds the backing file open for the duration, so a concurrent [`close`](Self::close)
    /// waits until the copy finishes.
    pub fn persist_into(&self, dst: &mut impl Write) -> Result<u64, OpenFileError> {
        self.with_backing(|src| copy_file(src, dst))
    }

    /// Copy the whole backing file into a new file at `destination`, which must not exist yet.
    pub fn persist_to(&self, destination: &Path) -> Result<u64, OpenFileError> {
        let mut dst = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(destination)?;
        self.persist_into(&mut dst)
    }

    /// Copy the whole backing file into a fresh scratch file. Returns the file and its length.
    pub fn snapshot_to(&self, scratch: &ScratchDir) -> Result<(NamedTempFile, u64), OpenFileError> {
        let mut snapshot = scratch.create_snapshot()?;
        let size = self.persist_into(snapshot.as_file_mut())?;
        Ok((snapshot, size))
    }

    /// Snapshot of the populated ranges, for diagnostics and tests.
    #[must_use]
    pub fn populated_ranges(&self) -> RangeSet {
        self.populated.lock().clone()
    }
}

fn copy_file(src: &File, dst: &mut impl Write) -> io::Result<u64> {
    let len = src.metadata()?.len();
    let mut buf = vec![0u8; COPY_CHUNK_SIZE];
    let mut pos = 0u64;
    while pos < len {
        let want = usize::try_from(len - pos).map_or(COPY_CHUNK_SIZE, |r| r.min(COPY_CHUNK_SIZE));
        src.read_exact_at(&mut buf[..want], pos)?;
        dst.write_all(&buf[..want])?;
        pos += want as u64;
    }
    dst.flush()?;
    Ok(len)
}
