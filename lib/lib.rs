//! cloud-fs shared library.
//!
//! A local, partial-range content cache for files of a remote store, together with the registry
//! that shares cache entries between open handles and pushes modified content back in the
//! background.

/// File content caching: entries, the path registry, and background uploads.
pub mod cache;
/// Cache configuration.
pub mod config;
/// Types shared with the filesystem adapter.
pub mod fs;
/// Per-mount shared state.
pub mod mount;
pub mod range_set;
/// The remote store interface.
pub mod remote;
/// Local scratch storage for backing files.
pub mod scratch;
