#![allow(dead_code, missing_docs, clippy::unwrap_used, clippy::cast_possible_truncation)]

pub mod cache_mocks;

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use cloud_fs::cache::open_file::OpenFile;
use cloud_fs::config::CacheConfig;
use cloud_fs::mount::MountContext;
use tempfile::TempDir;

use cache_mocks::MockRemote;

/// `len` bytes whose value at offset `i` is `i % 251`, so misplaced bytes are easy to spot.
pub fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Build a mount context whose scratch directory lives in a fresh temporary directory.
///
/// The `TempDir` must be kept alive for as long as the context is used.
pub async fn make_ctx(
    remote: Arc<MockRemote>,
    grace: Duration,
    max_concurrent_uploads: usize,
) -> (TempDir, Arc<MountContext<MockRemote>>) {
    let tmp = tempfile::tempdir().unwrap();
    let config = CacheConfig {
        path: tmp.path().join("cache"),
        eviction_grace_period_ms: u64::try_from(grace.as_millis()).unwrap(),
        max_concurrent_uploads,
    };
    let ctx = MountContext::new(remote, config).await.unwrap();
    (tmp, ctx)
}

/// Create a standalone cache entry for `path` of `size` bytes.
pub fn make_entry(ctx: &MountContext<MockRemote>, path: &Path, size: u64) -> Arc<OpenFile<MockRemote>> {
    Arc::new(
        OpenFile::create(
            path.to_path_buf(),
            Arc::clone(ctx.remote()),
            ctx.scratch(),
            size,
            SystemTime::UNIX_EPOCH,
        )
        .unwrap(),
    )
}

/// Poll `condition` until it holds, or panic after roughly two seconds.
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}
