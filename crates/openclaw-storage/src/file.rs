//! Local filesystem backend.
//!
//! Layout: `<base_dir>/<namespace>/<sanitized_key>.json` for key-value
//! entries, `.jsonl` for transcripts. Writes go through a unique temp file
//! and an atomic rename on POSIX (permissions `0600`); Windows falls back to
//! a plain write. `update` serializes with sibling processes through a
//! cooperative `<file>.lock` marker.

use async_trait::async_trait;
use futures::stream;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use openclaw_types::{Namespace, StorageConfig, StorageError, StorageResult};

use crate::backend::{
    sanitize_key, BackendKind, HealthStatus, LineStream, StorageBackend, Updater,
};
use crate::cache::ValueCache;
use crate::lock::{FileLock, LOCK_STALE_AFTER, LOCK_TIMEOUT};

/// Filesystem-backed storage with a per-instance value cache.
pub struct FileBackend {
    base_dir: PathBuf,
    cache: ValueCache,
}

impl FileBackend {
    /// Create a backend rooted at `base_dir`. A zero cache TTL disables the
    /// cache.
    pub fn new(base_dir: PathBuf, cache_ttl: Duration) -> Self {
        Self {
            base_dir,
            cache: ValueCache::new(cache_ttl),
        }
    }

    /// Create a backend from the service configuration.
    pub fn from_config(config: &StorageConfig) -> Self {
        let cache_ttl = if config.cache_enabled {
            Duration::from_millis(config.cache_ttl_ms)
        } else {
            Duration::ZERO
        };
        Self::new(config.resolved_base_dir(), cache_ttl)
    }

    /// The storage root.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn extension(ns: Namespace) -> &'static str {
        match ns {
            Namespace::Transcripts => "jsonl",
            _ => "json",
        }
    }

    fn value_path(&self, ns: Namespace, key: &str) -> PathBuf {
        self.base_dir
            .join(ns.as_str())
            .join(format!("{}.{}", sanitize_key(key), Self::extension(ns)))
    }

    fn cache_key(ns: Namespace, key: &str) -> String {
        format!("{}/{}", ns.as_str(), sanitize_key(key))
    }

    async fn disk_mtime_ms(path: &Path) -> Option<i64> {
        let meta = fs::metadata(path).await.ok()?;
        let modified = meta.modified().ok()?;
        let since_epoch = modified
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Some(since_epoch.as_millis() as i64)
    }

    /// Atomic write: unique temp file in the target directory, then rename.
    async fn write_atomic(&self, path: &Path, contents: &str) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        #[cfg(unix)]
        {
            let temp_name = format!(
                ".{}.{}.tmp",
                path.file_name().unwrap_or_default().to_string_lossy(),
                uuid::Uuid::new_v4()
            );
            let temp_path = path.with_file_name(temp_name);
            let mut options = fs::OpenOptions::new();
            options.write(true).create_new(true).mode(0o600);
            let mut file = options.open(&temp_path).await?;
            if let Err(e) = async {
                file.write_all(contents.as_bytes()).await?;
                file.sync_all().await?;
                drop(file);
                fs::rename(&temp_path, path).await
            }
            .await
            {
                let _ = fs::remove_file(&temp_path).await;
                return Err(e.into());
            }
        }

        #[cfg(not(unix))]
        {
            // Rename-over-existing is not reliable here; write in place.
            fs::write(path, contents).await?;
        }

        Ok(())
    }

    /// Read and parse the value file, bypassing the cache.
    async fn read_value(&self, path: &Path) -> StorageResult<Option<Value>> {
        let contents = match fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let value = serde_json::from_str(&contents).map_err(|e| {
            StorageError::Corruption(format!("{} is not valid JSON: {e}", path.display()))
        })?;
        Ok(Some(value))
    }

    async fn write_value(&self, path: &Path, value: &Value) -> StorageResult<()> {
        let contents = serde_json::to_string_pretty(value)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.write_atomic(path, &contents).await
    }
}

#[async_trait]
impl StorageBackend for FileBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::File
    }

    fn is_distributed(&self) -> bool {
        false
    }

    async fn initialize(&self) -> StorageResult<()> {
        for ns in Namespace::ALL {
            fs::create_dir_all(self.base_dir.join(ns.as_str())).await?;
        }
        debug!(base_dir = %self.base_dir.display(), "File backend initialized");
        Ok(())
    }

    async fn close(&self) -> StorageResult<()> {
        self.cache.clear();
        Ok(())
    }

    async fn get(&self, ns: Namespace, key: &str) -> StorageResult<Option<Value>> {
        let path = self.value_path(ns, key);
        let cache_key = Self::cache_key(ns, key);

        let mtime = Self::disk_mtime_ms(&path).await;
        if let Some(mtime) = mtime {
            if let Some(cached) = self.cache.get(&cache_key, mtime) {
                return Ok(Some(cached));
            }
        }

        let value = self.read_value(&path).await?;
        if let (Some(value), Some(mtime)) = (&value, mtime) {
            self.cache.put(cache_key, value.clone(), mtime);
        }
        Ok(value)
    }

    async fn set(&self, ns: Namespace, key: &str, value: &Value) -> StorageResult<()> {
        let path = self.value_path(ns, key);
        self.write_value(&path, value).await?;
        self.cache.invalidate(&Self::cache_key(ns, key));
        Ok(())
    }

    async fn delete(&self, ns: Namespace, key: &str) -> StorageResult<bool> {
        let path = self.value_path(ns, key);
        self.cache.invalidate(&Self::cache_key(ns, key));
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, ns: Namespace, prefix: Option<&str>) -> StorageResult<Vec<String>> {
        let dir = self.base_dir.join(ns.as_str());
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let wanted_ext = Self::extension(ns);
        let prefix = prefix.map(sanitize_key);
        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            // Temp files are dotted; lock markers end in .lock.
            if name.starts_with('.') || name.ends_with(".lock") {
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some(wanted_ext) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Some(p) = &prefix {
                if !stem.starts_with(p.as_str()) {
                    continue;
                }
            }
            keys.push(stem.to_string());
        }
        Ok(keys)
    }

    async fn update(
        &self,
        ns: Namespace,
        key: &str,
        f: Updater,
    ) -> StorageResult<Option<Value>> {
        let path = self.value_path(ns, key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let lock_path = PathBuf::from(format!("{}.lock", path.display()));
        let lock = FileLock::acquire(lock_path, LOCK_TIMEOUT, LOCK_STALE_AFTER).await?;

        // Re-read under the lock; the cache may be behind another writer.
        let result = async {
            let current = self.read_value(&path).await?;
            let next = f(current);
            match &next {
                Some(value) => self.write_value(&path, value).await?,
                None => match fs::remove_file(&path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                },
            }
            Ok(next)
        }
        .await;

        self.cache.invalidate(&Self::cache_key(ns, key));
        lock.release().await;
        result
    }

    async fn append(&self, ns: Namespace, key: &str, line: &str) -> StorageResult<()> {
        let path = self.value_path(ns, key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .await?;
        let mut record = String::with_capacity(line.len() + 1);
        record.push_str(line);
        record.push('\n');
        file.write_all(record.as_bytes()).await?;
        Ok(())
    }

    async fn read_lines(&self, ns: Namespace, key: &str) -> StorageResult<LineStream> {
        let path = self.value_path(ns, key);
        let contents = match fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        let lines: Vec<StorageResult<String>> = contents
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| Ok(l.to_string()))
            .collect();
        Ok(Box::pin(stream::iter(lines)))
    }

    async fn health_check(&self) -> HealthStatus {
        let start = Instant::now();
        match fs::metadata(&self.base_dir).await {
            Ok(meta) if meta.is_dir() => {
                HealthStatus::healthy(start.elapsed().as_millis() as u64)
            }
            Ok(_) => HealthStatus::unhealthy(
                start.elapsed().as_millis() as u64,
                format!("{} is not a directory", self.base_dir.display()),
            ),
            Err(e) => HealthStatus::unhealthy(
                start.elapsed().as_millis() as u64,
                format!("cannot stat {}: {e}", self.base_dir.display()),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn setup() -> (TempDir, FileBackend) {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::new(dir.path().to_path_buf(), Duration::from_secs(45));
        (dir, backend)
    }

    #[tokio::test]
    async fn test_round_trip() {
        let (_dir, backend) = setup();
        backend
            .set(Namespace::Sessions, "abc", &json!({"a": 1}))
            .await
            .unwrap();
        let value = backend.get(Namespace::Sessions, "abc").await.unwrap();
        assert_eq!(value, Some(json!({"a": 1})));
    }

    #[tokio::test]
    async fn test_delete_shadows_and_is_idempotent() {
        let (_dir, backend) = setup();
        backend
            .set(Namespace::Sessions, "abc", &json!({"a": 1}))
            .await
            .unwrap();
        assert!(backend.delete(Namespace::Sessions, "abc").await.unwrap());
        assert_eq!(backend.get(Namespace::Sessions, "abc").await.unwrap(), None);
        assert!(!backend.delete(Namespace::Sessions, "abc").await.unwrap());
    }

    #[tokio::test]
    async fn test_get_missing() {
        let (_dir, backend) = setup();
        assert_eq!(
            backend.get(Namespace::Config, "nothing").await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_values_are_pretty_json_on_disk() {
        let (dir, backend) = setup();
        backend
            .set(Namespace::Config, "c", &json!({"a": {"b": 1}}))
            .await
            .unwrap();
        let raw = std::fs::read_to_string(dir.path().join("config").join("c.json")).unwrap();
        assert!(raw.contains("  \"a\""), "expected two-space indent: {raw}");
    }

    #[tokio::test]
    async fn test_keys_are_sanitized_in_paths() {
        let (dir, backend) = setup();
        backend
            .set(Namespace::Sessions, "agent://main/s 1", &json!(1))
            .await
            .unwrap();
        assert!(dir
            .path()
            .join("sessions")
            .join("agent___main_s_1.json")
            .exists());
        // Readable through either spelling of the key.
        assert_eq!(
            backend
                .get(Namespace::Sessions, "agent___main_s_1")
                .await
                .unwrap(),
            Some(json!(1))
        );
    }

    #[tokio::test]
    async fn test_list_with_prefix() {
        let (_dir, backend) = setup();
        for key in ["alpha-1", "alpha-2", "beta-1"] {
            backend.set(Namespace::Sessions, key, &json!(1)).await.unwrap();
        }
        backend.delete(Namespace::Sessions, "alpha-2").await.unwrap();

        let mut all = backend.list(Namespace::Sessions, None).await.unwrap();
        all.sort();
        assert_eq!(all, vec!["alpha-1", "beta-1"]);

        let alphas = backend
            .list(Namespace::Sessions, Some("alpha"))
            .await
            .unwrap();
        assert_eq!(alphas, vec!["alpha-1"]);
    }

    #[tokio::test]
    async fn test_list_ignores_locks_and_temp_files() {
        let (dir, backend) = setup();
        backend.set(Namespace::Sessions, "real", &json!(1)).await.unwrap();
        std::fs::write(dir.path().join("sessions").join("real.json.lock"), "1").unwrap();
        std::fs::write(dir.path().join("sessions").join(".real.json.x.tmp"), "1").unwrap();
        assert_eq!(
            backend.list(Namespace::Sessions, None).await.unwrap(),
            vec!["real"]
        );
    }

    #[tokio::test]
    async fn test_update_creates_and_returns_next() {
        let (_dir, backend) = setup();
        let next = backend
            .update(
                Namespace::Sessions,
                "k",
                Box::new(|current| {
                    let n = current
                        .and_then(|v| v.get("n").and_then(Value::as_i64))
                        .unwrap_or(0);
                    Some(json!({"n": n + 1}))
                }),
            )
            .await
            .unwrap();
        assert_eq!(next, Some(json!({"n": 1})));
    }

    #[tokio::test]
    async fn test_update_returning_none_deletes() {
        let (_dir, backend) = setup();
        backend.set(Namespace::Sessions, "k", &json!(1)).await.unwrap();
        let next = backend
            .update(Namespace::Sessions, "k", Box::new(|_| None))
            .await
            .unwrap();
        assert_eq!(next, None);
        assert_eq!(backend.get(Namespace::Sessions, "k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_concurrent_updates_serialize() {
        let (_dir, backend) = setup();
        let backend = Arc::new(backend);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let backend = backend.clone();
            handles.push(tokio::spawn(async move {
                backend
                    .update(
                        Namespace::Sessions,
                        "counter",
                        Box::new(|current| {
                            let n = current
                                .and_then(|v| v.get("n").and_then(Value::as_i64))
                                .unwrap_or(0);
                            Some(json!({"n": n + 1}))
                        }),
                    )
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(
            backend.get(Namespace::Sessions, "counter").await.unwrap(),
            Some(json!({"n": 8}))
        );
    }

    #[tokio::test]
    async fn test_append_and_read_lines_in_order() {
        let (_dir, backend) = setup();
        for i in 0..5 {
            backend
                .append(Namespace::Transcripts, "t", &format!("{{\"i\":{i}}}"))
                .await
                .unwrap();
        }
        let lines = backend
            .read_all_lines(Namespace::Transcripts, "t")
            .await
            .unwrap();
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[0], "{\"i\":0}");
        assert_eq!(lines[4], "{\"i\":4}");
    }

    #[tokio::test]
    async fn test_read_lines_missing_key_is_empty() {
        let (_dir, backend) = setup();
        let lines = backend
            .read_all_lines(Namespace::Transcripts, "nope")
            .await
            .unwrap();
        assert!(lines.is_empty());
    }

    #[tokio::test]
    async fn test_transcripts_use_jsonl_extension() {
        let (dir, backend) = setup();
        backend
            .append(Namespace::Transcripts, "t", "{}")
            .await
            .unwrap();
        assert!(dir.path().join("transcripts").join("t.jsonl").exists());
    }

    #[tokio::test]
    async fn test_cache_invalidated_by_same_handle_mutation() {
        let (_dir, backend) = setup();
        backend.set(Namespace::Sessions, "k", &json!(1)).await.unwrap();
        assert_eq!(
            backend.get(Namespace::Sessions, "k").await.unwrap(),
            Some(json!(1))
        );
        backend.set(Namespace::Sessions, "k", &json!(2)).await.unwrap();
        assert_eq!(
            backend.get(Namespace::Sessions, "k").await.unwrap(),
            Some(json!(2))
        );
    }

    #[tokio::test]
    async fn test_cache_detects_out_of_band_mtime_change() {
        let (dir, backend) = setup();
        backend.set(Namespace::Sessions, "k", &json!(1)).await.unwrap();
        let _ = backend.get(Namespace::Sessions, "k").await.unwrap();

        // Simulate another process rewriting the file with a newer mtime.
        let path = dir.path().join("sessions").join("k.json");
        std::fs::write(&path, "2").unwrap();
        let future = std::time::SystemTime::now() + Duration::from_secs(5);
        let file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.set_modified(future).unwrap();

        assert_eq!(
            backend.get(Namespace::Sessions, "k").await.unwrap(),
            Some(json!(2))
        );
    }

    #[tokio::test]
    async fn test_atomic_set_leaves_no_temp_files() {
        let (dir, backend) = setup();
        backend.set(Namespace::Sessions, "k", &json!(1)).await.unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("sessions"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_values_written_with_owner_only_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let (dir, backend) = setup();
        backend.set(Namespace::Auth, "token", &json!("s")).await.unwrap();
        let meta = std::fs::metadata(dir.path().join("auth").join("token.json")).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_health_check() {
        let (_dir, backend) = setup();
        backend.initialize().await.unwrap();
        let health = backend.health_check().await;
        assert!(health.ok);
    }
}
