//! Cooperative inter-process file locks.
//!
//! A lock is an exclusively created `<file>.lock` marker. Contenders poll at
//! a fixed interval, evict markers older than the stale threshold (a crashed
//! holder never releases), and give up with `LockTimeout` after the deadline.

use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use openclaw_types::{StorageError, StorageResult};

/// Poll interval while another process holds the lock.
pub const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Markers older than this are treated as abandoned and evicted.
pub const LOCK_STALE_AFTER: Duration = Duration::from_secs(30);

/// Give up after this long.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Held file lock. Release explicitly with [`FileLock::release`]; dropping
/// the guard removes the marker best-effort as a fallback.
pub struct FileLock {
    path: Option<PathBuf>,
}

impl FileLock {
    /// Acquire the lock at `path`, polling until `timeout` elapses.
    pub async fn acquire(
        path: PathBuf,
        timeout: Duration,
        stale_after: Duration,
    ) -> StorageResult<FileLock> {
        let start = Instant::now();
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(mut file) => {
                    // Record the holder pid for post-mortem debugging.
                    let _ = file.write_all(std::process::id().to_string().as_bytes()).await;
                    return Ok(FileLock { path: Some(path) });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if Self::evict_if_stale(&path, stale_after).await {
                        continue;
                    }
                    if start.elapsed() >= timeout {
                        return Err(StorageError::LockTimeout(format!(
                            "gave up on {} after {:?}",
                            path.display(),
                            timeout
                        )));
                    }
                    tokio::time::sleep(LOCK_POLL_INTERVAL).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Remove an abandoned marker. Returns whether an eviction happened.
    async fn evict_if_stale(path: &PathBuf, stale_after: Duration) -> bool {
        let Ok(meta) = tokio::fs::metadata(path).await else {
            // Holder released between our create attempt and this stat.
            return true;
        };
        let age = meta
            .modified()
            .ok()
            .and_then(|m| m.elapsed().ok())
            .unwrap_or_default();
        if age > stale_after {
            warn!(path = %path.display(), age_secs = age.as_secs(), "Evicting stale lock");
            return tokio::fs::remove_file(path).await.is_ok();
        }
        false
    }

    /// Release the lock.
    pub async fn release(mut self) {
        if let Some(path) = self.path.take() {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %e, "Failed to remove lock file");
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("k.json.lock");
        let lock = FileLock::acquire(path.clone(), LOCK_TIMEOUT, LOCK_STALE_AFTER)
            .await
            .unwrap();
        assert!(path.exists());
        lock.release().await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_contended_acquire_waits_for_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("k.json.lock");
        let held = FileLock::acquire(path.clone(), LOCK_TIMEOUT, LOCK_STALE_AFTER)
            .await
            .unwrap();

        let contender = tokio::spawn(FileLock::acquire(
            path.clone(),
            Duration::from_secs(5),
            LOCK_STALE_AFTER,
        ));
        tokio::time::sleep(Duration::from_millis(250)).await;
        held.release().await;

        let lock = contender.await.unwrap().unwrap();
        lock.release().await;
    }

    #[tokio::test]
    async fn test_timeout_when_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("k.json.lock");
        let held = FileLock::acquire(path.clone(), LOCK_TIMEOUT, LOCK_STALE_AFTER)
            .await
            .unwrap();

        let result = FileLock::acquire(
            path.clone(),
            Duration::from_millis(300),
            LOCK_STALE_AFTER,
        )
        .await;
        assert!(matches!(result, Err(StorageError::LockTimeout(_))));
        held.release().await;
    }

    #[tokio::test]
    async fn test_stale_lock_is_evicted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("k.json.lock");
        std::fs::write(&path, "12345").unwrap();

        // Any age is stale with a zero threshold.
        let lock = FileLock::acquire(path.clone(), Duration::from_secs(5), Duration::ZERO)
            .await
            .unwrap();
        lock.release().await;
    }

    #[tokio::test]
    async fn test_drop_removes_marker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("k.json.lock");
        {
            let _lock = FileLock::acquire(path.clone(), LOCK_TIMEOUT, LOCK_STALE_AFTER)
                .await
                .unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }
}
