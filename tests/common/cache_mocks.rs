#![allow(missing_docs, clippy::unwrap_used)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use bytes::{Bytes, BytesMut};
use futures::StreamExt as _;
use tokio::sync::Semaphore;

use cloud_fs::cache::open_file::OpenFile;
use cloud_fs::cache::uploader::{UploadCallback, Uploader};
use cloud_fs::remote::{ByteStream, ItemMetadata, RemoteError, RemoteStore};

/// Shared state backing `MockRemote`.
#[derive(Debug)]
pub struct MockRemoteState {
    /// `path -> file content`
    pub contents: HashMap<PathBuf, Bytes>,
    /// Every `read` call as `(path, offset, length)`, in call order.
    pub reads: Vec<(PathBuf, u64, u64)>,
    /// Every completed `write` as `(path, content)`, in completion order.
    pub writes: Vec<(PathBuf, Bytes)>,
    /// When set, a read stream ends after at most this many bytes.
    pub transfer_limit: Option<u64>,
    /// Size of the chunks a read stream is split into.
    pub chunk_size: usize,
    pub fail_reads: bool,
    pub fail_writes: bool,
}

impl Default for MockRemoteState {
    fn default() -> Self {
        Self {
            contents: HashMap::new(),
            reads: Vec::new(),
            writes: Vec::new(),
            transfer_limit: None,
            chunk_size: 16,
            fail_reads: false,
            fail_writes: false,
        }
    }
}

/// An in-memory `RemoteStore` that records every transfer.
#[derive(Debug, Default)]
pub struct MockRemote {
    pub state: Mutex<MockRemoteState>,
    /// Number of `write` calls that have started, including ones still blocked on the gate.
    pub writes_started: AtomicUsize,
    /// When set, every `write` waits for a permit before storing its content.
    pub write_gate: Option<Arc<Semaphore>>,
}

impl MockRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// A remote whose writes block until permits are added to the returned semaphore.
    pub fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let remote = Self {
            write_gate: Some(Arc::clone(&gate)),
            ..Self::default()
        };
        (remote, gate)
    }

    pub fn with_file(self, path: impl Into<PathBuf>, content: impl Into<Bytes>) -> Self {
        self.state
            .lock()
            .unwrap()
            .contents
            .insert(path.into(), content.into());
        self
    }

    pub fn reads(&self) -> Vec<(PathBuf, u64, u64)> {
        self.state.lock().unwrap().reads.clone()
    }

    pub fn writes(&self) -> Vec<(PathBuf, Bytes)> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn content(&self, path: &Path) -> Option<Bytes> {
        self.state.lock().unwrap().contents.get(path).cloned()
    }

    pub fn set_transfer_limit(&self, limit: Option<u64>) {
        self.state.lock().unwrap().transfer_limit = limit;
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.state.lock().unwrap().fail_reads = fail;
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.state.lock().unwrap().fail_writes = fail;
    }
}

impl RemoteStore for MockRemote {
    #[expect(
        clippy::cast_possible_truncation,
        reason = "test mock, offsets stay small"
    )]
    async fn read(&self, path: &Path, offset: u64, length: u64) -> Result<ByteStream, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.reads.push((path.to_path_buf(), offset, length));
        if state.fail_reads {
            return Err(RemoteError::Provider("injected read failure".to_owned()));
        }
        let content = state
            .contents
            .get(path)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(path.to_path_buf()))?;

        let length = state.transfer_limit.map_or(length, |limit| limit.min(length));
        let start = (offset as usize).min(content.len());
        let end = (start + length as usize).min(content.len());
        let chunks: Vec<Result<Bytes, RemoteError>> = content
            .slice(start..end)
            .chunks(state.chunk_size)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    async fn write(
        &self,
        path: &Path,
        _overwrite: bool,
        mut content: ByteStream,
        size: u64,
    ) -> Result<ItemMetadata, RemoteError> {
        self.writes_started.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.write_gate {
            gate.acquire().await.unwrap().forget();
        }

        let mut buf = BytesMut::new();
        while let Some(chunk) = content.next().await {
            buf.extend_from_slice(&chunk?);
        }
        assert_eq!(buf.len() as u64, size, "declared upload size must match stream");

        let mut state = self.state.lock().unwrap();
        if state.fail_writes {
            return Err(RemoteError::Provider("injected write failure".to_owned()));
        }
        let content = buf.freeze();
        state.contents.insert(path.to_path_buf(), content.clone());
        state.writes.push((path.to_path_buf(), content));
        Ok(ItemMetadata::file(path, SystemTime::now(), size))
    }

    async fn move_item(
        &self,
        old_path: &Path,
        new_path: &Path,
        overwrite: bool,
    ) -> Result<ItemMetadata, RemoteError> {
        let mut state = self.state.lock().unwrap();
        if !overwrite && state.contents.contains_key(new_path) {
            return Err(RemoteError::AlreadyExists(new_path.to_path_buf()));
        }
        let content = state
            .contents
            .remove(old_path)
            .ok_or_else(|| RemoteError::NotFound(old_path.to_path_buf()))?;
        let size = content.len() as u64;
        state.contents.insert(new_path.to_path_buf(), content);
        Ok(ItemMetadata::file(new_path, SystemTime::now(), size))
    }

    async fn delete(&self, path: &Path) -> Result<(), RemoteError> {
        self.state
            .lock()
            .unwrap()
            .contents
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| RemoteError::NotFound(path.to_path_buf()))
    }

    async fn metadata(&self, path: &Path) -> Result<ItemMetadata, RemoteError> {
        let state = self.state.lock().unwrap();
        let content = state
            .contents
            .get(path)
            .ok_or_else(|| RemoteError::NotFound(path.to_path_buf()))?;
        Ok(ItemMetadata::file(
            path,
            SystemTime::UNIX_EPOCH,
            content.len() as u64,
        ))
    }
}

type PendingCallback = (Arc<OpenFile<MockRemote>>, UploadCallback<MockRemote>);

/// An `Uploader` that only records what it is asked to do.
///
/// Scheduled uploads stay pending until the test completes them, at which point their callbacks
/// run on the calling thread.
#[derive(Default)]
pub struct MockUploader {
    pub scheduled: Mutex<Vec<PathBuf>>,
    pub cancelled: Mutex<Vec<PathBuf>>,
    pending: Mutex<Vec<PendingCallback>>,
}

impl MockUploader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scheduled(&self) -> Vec<PathBuf> {
        self.scheduled.lock().unwrap().clone()
    }

    pub fn cancelled(&self) -> Vec<PathBuf> {
        self.cancelled.lock().unwrap().clone()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Finish every pending upload, running their callbacks. Returns how many ran.
    pub fn complete_all(&self) -> usize {
        let pending = std::mem::take(&mut *self.pending.lock().unwrap());
        let count = pending.len();
        for (file, on_complete) in pending {
            on_complete(file);
        }
        count
    }
}

impl Uploader<MockRemote> for MockUploader {
    fn schedule_upload(
        &self,
        file: Arc<OpenFile<MockRemote>>,
        on_complete: UploadCallback<MockRemote>,
    ) {
        let path = file.path();
        self.scheduled.lock().unwrap().push(path.clone());
        let mut pending = self.pending.lock().unwrap();
        pending.retain(|(f, _)| f.path() != path);
        pending.push((file, on_complete));
    }

    fn cancel_upload(&self, path: &Path) -> bool {
        self.cancelled.lock().unwrap().push(path.to_path_buf());
        let mut pending = self.pending.lock().unwrap();
        let before = pending.len();
        pending.retain(|(f, _)| f.path() != path);
        pending.len() != before
    }
}
