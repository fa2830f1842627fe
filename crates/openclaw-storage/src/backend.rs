//! The storage backend contract shared by all four implementations.

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::pin::Pin;
use std::time::Duration;

use openclaw_types::{Namespace, StorageError, StorageResult};

/// Default deadline for a single backend network call.
pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for health probes; probes must stay cheap.
pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

/// Backend tag, advertised for routing and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    File,
    Agentcore,
    Dynamodb,
    SecretsManager,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::File => "file",
            BackendKind::Agentcore => "agentcore",
            BackendKind::Dynamodb => "dynamodb",
            BackendKind::SecretsManager => "secrets-manager",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a bounded, side-effect-free backend probe.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub ok: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthStatus {
    pub fn healthy(latency_ms: u64) -> Self {
        Self {
            ok: true,
            latency_ms,
            error: None,
        }
    }

    pub fn unhealthy(latency_ms: u64, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            latency_ms,
            error: Some(error.into()),
        }
    }
}

/// Atomic read-modify-write callback. Receives the current value (absent as
/// `None`), returns the next value (`None` deletes the key). Backends with
/// optimistic concurrency may invoke it more than once, so it must be `Fn`.
pub type Updater = Box<dyn Fn(Option<Value>) -> Option<Value> + Send + Sync>;

/// A finite stream of log lines in chronological order.
pub type LineStream = Pin<Box<dyn Stream<Item = StorageResult<String>> + Send>>;

/// Uniform contract implemented by every storage backend.
///
/// Missing keys are never errors: `get` returns `None` and `delete` returns
/// `false`. Backends that lack the append-log shape return
/// [`StorageError::Unsupported`] from `append`/`read_lines` rather than being
/// modeled as a separate trait, to keep routing simple.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Backend tag for routing and diagnostics.
    fn kind(&self) -> BackendKind;

    /// Whether writes are visible to other hosts.
    fn is_distributed(&self) -> bool;

    /// Prepare the backend for use (create directories, probe connectivity).
    async fn initialize(&self) -> StorageResult<()>;

    /// Release resources. Idempotent.
    async fn close(&self) -> StorageResult<()>;

    /// Latest value for a key, or `None` when absent.
    async fn get(&self, ns: Namespace, key: &str) -> StorageResult<Option<Value>>;

    /// Persist a value, overwriting any prior one.
    async fn set(&self, ns: Namespace, key: &str, value: &Value) -> StorageResult<()>;

    /// Remove a key. Returns whether a value existed. Idempotent.
    async fn delete(&self, ns: Namespace, key: &str) -> StorageResult<bool>;

    /// Enumerate keys whose sanitized form starts with `prefix`. Order is
    /// unspecified; deleted keys are excluded.
    async fn list(&self, ns: Namespace, prefix: Option<&str>) -> StorageResult<Vec<String>>;

    /// Atomic read-modify-write. Returns the value the updater produced.
    async fn update(&self, ns: Namespace, key: &str, f: Updater)
        -> StorageResult<Option<Value>>;

    /// Append one record to a log-shaped key. `line` must not contain
    /// embedded newlines (caller responsibility).
    async fn append(&self, ns: Namespace, key: &str, line: &str) -> StorageResult<()>;

    /// Stream the records of a log-shaped key in chronological order.
    /// Yields nothing for a missing key.
    async fn read_lines(&self, ns: Namespace, key: &str) -> StorageResult<LineStream>;

    /// Collect [`StorageBackend::read_lines`] into a vector.
    async fn read_all_lines(&self, ns: Namespace, key: &str) -> StorageResult<Vec<String>> {
        let mut stream = self.read_lines(ns, key).await?;
        let mut lines = Vec::new();
        while let Some(line) = stream.next().await {
            lines.push(line?);
        }
        Ok(lines)
    }

    /// Bounded, side-effect-free probe.
    async fn health_check(&self) -> HealthStatus;
}

/// Reduce an arbitrary key to `[A-Za-z0-9_.-]`, replacing every other
/// character with `_`. The result is safe as a file stem or session id.
pub fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Like [`sanitize_key`] but preserves `/`, for hierarchical secret names.
pub fn sanitize_key_path(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '/') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Run a future under a deadline, mapping expiry to `Unavailable`.
pub(crate) async fn bounded<T, E, F>(
    deadline: Duration,
    operation: &str,
    fut: F,
) -> StorageResult<T>
where
    F: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(StorageError::Unavailable(format!("{operation} failed: {e}"))),
        Err(_) => Err(StorageError::Unavailable(format!(
            "{operation} timed out after {deadline:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_passthrough() {
        assert_eq!(sanitize_key("session_01.log-a"), "session_01.log-a");
    }

    #[test]
    fn test_sanitize_replaces_everything_else() {
        assert_eq!(sanitize_key("a/b:c d@e"), "a_b_c_d_e");
        assert_eq!(sanitize_key("über-key"), "_ber-key");
    }

    #[test]
    fn test_sanitize_is_idempotent() {
        let once = sanitize_key("agent://main/session 1");
        assert_eq!(sanitize_key(&once), once);
    }

    #[test]
    fn test_sanitize_path_keeps_slashes() {
        assert_eq!(sanitize_key_path("github/token 1"), "github/token_1");
    }

    #[test]
    fn test_backend_kind_tags() {
        assert_eq!(BackendKind::File.as_str(), "file");
        assert_eq!(BackendKind::Agentcore.as_str(), "agentcore");
        assert_eq!(BackendKind::Dynamodb.as_str(), "dynamodb");
        assert_eq!(BackendKind::SecretsManager.as_str(), "secrets-manager");
    }

    #[tokio::test]
    async fn test_bounded_times_out() {
        let result: StorageResult<()> = bounded(
            Duration::from_millis(10),
            "probe",
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<(), std::io::Error>(())
            },
        )
        .await;
        assert!(matches!(result, Err(StorageError::Unavailable(_))));
    }
}
