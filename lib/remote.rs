//! The authoritative, network-backed content store.
//!
//! The cache never talks to the network itself. Every fetch, upload, and metadata query goes
//! through a [`RemoteStore`], which the embedding filesystem supplies.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::SystemTime;

use bytes::Bytes;
use futures::Stream;
use thiserror::Error;

/// A boxed stream of bytes, used for both remote reads and uploads.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, RemoteError>> + Send>>;

/// Errors reported by a [`RemoteStore`].
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("item not found: {0}")]
    NotFound(PathBuf),

    #[error("item already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("item has an unexpected type: {0}")]
    TypeMismatch(PathBuf),

    #[error("remote provider error: {0}")]
    Provider(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl From<RemoteError> for i32 {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::NotFound(_) => libc::ENOENT,
            RemoteError::AlreadyExists(_) => libc::EEXIST,
            RemoteError::TypeMismatch(_) => libc::ENOTDIR,
            RemoteError::Provider(_) => libc::EIO,
            RemoteError::Io(ref io_err) => io_err.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

/// The kind of item a path refers to in the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ItemType {
    /// A regular file.
    File,
    /// A folder.
    Folder,
    /// Anything the provider cannot classify.
    Unknown,
}

/// A point-in-time description of a remote (or cached) item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemMetadata {
    /// The final path component.
    pub name: String,
    /// The full path of the item.
    pub path: PathBuf,
    /// What kind of item this is.
    pub item_type: ItemType,
    /// When the item was last modified, if known.
    pub last_modified: Option<SystemTime>,
    /// The item's size in bytes, if known.
    pub size: Option<u64>,
}

impl ItemMetadata {
    /// Build metadata for a regular file at `path`.
    #[must_use]
    pub fn file(path: &Path, last_modified: SystemTime, size: u64) -> Self {
        Self {
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            path: path.to_path_buf(),
            item_type: ItemType::File,
            last_modified: Some(last_modified),
            size: Some(size),
        }
    }
}

/// The remote content provider backing a mounted filesystem.
///
/// Implementations are expected to be cheap to share behind an `Arc` and to impose their own
/// timeouts and retry policy. Reads and writes must be idempotent: the cache may fetch the same
/// range twice when two loads race.
pub trait RemoteStore: Send + Sync + 'static {
    /// Stream up to `length` bytes of `path` starting at `offset`.
    ///
    /// The stream may end early. The caller only trusts the bytes it actually receives.
    fn read(
        &self,
        path: &Path,
        offset: u64,
        length: u64,
    ) -> impl Future<Output = Result<ByteStream, RemoteError>> + Send;

    /// Replace (or create) the content at `path` with `size` bytes from `content`.
    ///
    /// Fails with [`RemoteError::AlreadyExists`] if `overwrite` is false and the item exists.
    fn write(
        &self,
        path: &Path,
        overwrite: bool,
        content: ByteStream,
        size: u64,
    ) -> impl Future<Output = Result<ItemMetadata, RemoteError>> + Send;

    /// Move the item at `old_path` to `new_path`.
    fn move_item(
        &self,
        old_path: &Path,
        new_path: &Path,
        overwrite: bool,
    ) -> impl Future<Output = Result<ItemMetadata, RemoteError>> + Send;

    /// Delete the item at `path`.
    fn delete(&self, path: &Path) -> impl Future<Output = Result<(), RemoteError>> + Send;

    /// Fetch metadata for the item at `path`.
    fn metadata(&self, path: &Path)
    -> impl Future<Output = Result<ItemMetadata, RemoteError>> + Send;
}
