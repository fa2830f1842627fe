//! Encrypted credential store over the managed secrets vault.
//!
//! Each (namespace, key) pair maps to a secret named
//! `openclaw-auth/<ns>/<key>` (slashes in the key are preserved so callers
//! can keep hierarchical names). Raw string values are stored verbatim,
//! everything else as canonical JSON. There is no append-log shape here.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_secretsmanager::config::Region;
use aws_sdk_secretsmanager::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_secretsmanager::types::{Filter, FilterNameStringType, Tag};
use aws_sdk_secretsmanager::Client;
use serde_json::Value;
use std::time::Instant;
use tracing::debug;

use openclaw_types::{Namespace, SecretsManagerConfig, StorageError, StorageResult};

use crate::backend::{
    bounded, sanitize_key_path, BackendKind, HealthStatus, LineStream, StorageBackend, Updater,
    DEFAULT_OP_TIMEOUT, HEALTH_TIMEOUT,
};

/// Name root for every secret this layer owns.
const SECRET_ROOT: &str = "openclaw-auth";

/// Credential storage over the managed secrets service.
pub struct SecretsBackend {
    client: Client,
    kms_key_id: Option<String>,
}

impl SecretsBackend {
    /// Build a backend from configuration. Credentials come from the
    /// environment; no network call is made until first use.
    pub async fn connect(config: &SecretsManagerConfig) -> StorageResult<Self> {
        let region = config.resolved_region().ok_or_else(|| {
            StorageError::Config(
                "no region for the secrets vault; set secretsManager.region or AWS_REGION"
                    .to_string(),
            )
        })?;
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region))
            .load()
            .await;
        Ok(Self {
            client: Client::new(&aws_config),
            kms_key_id: config.kms_key_id.clone(),
        })
    }

    fn secret_name(ns: Namespace, key: &str) -> String {
        format!("{SECRET_ROOT}/{ns}/{}", sanitize_key_path(key))
    }

    fn namespace_prefix(ns: Namespace) -> String {
        format!("{SECRET_ROOT}/{ns}/")
    }

    /// Render a value the way it is stored: strings verbatim, anything else
    /// as canonical JSON.
    fn render(value: &Value) -> StorageResult<String> {
        match value {
            Value::String(s) => Ok(s.clone()),
            other => serde_json::to_string(other)
                .map_err(|e| StorageError::Serialization(e.to_string())),
        }
    }

    /// Parse a stored string back into a value. Non-JSON text is a string.
    fn revive(raw: &str) -> Value {
        serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
    }

    async fn create_secret(
        &self,
        ns: Namespace,
        name: &str,
        rendered: &str,
    ) -> StorageResult<()> {
        let mut request = self
            .client
            .create_secret()
            .name(name)
            .secret_string(rendered)
            .tags(
                Tag::builder()
                    .key("Application")
                    .value("openclaw")
                    .build(),
            )
            .tags(Tag::builder().key("Namespace").value(ns.as_str()).build());
        if let Some(kms_key_id) = &self.kms_key_id {
            request = request.kms_key_id(kms_key_id);
        }
        bounded(DEFAULT_OP_TIMEOUT, "create_secret", request.send()).await?;
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for SecretsBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::SecretsManager
    }

    fn is_distributed(&self) -> bool {
        true
    }

    async fn initialize(&self) -> StorageResult<()> {
        let health = self.health_check().await;
        if health.ok {
            debug!("Secrets backend initialized");
            Ok(())
        } else {
            Err(StorageError::Unavailable(
                health.error.unwrap_or_else(|| "health probe failed".to_string()),
            ))
        }
    }

    async fn close(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn get(&self, ns: Namespace, key: &str) -> StorageResult<Option<Value>> {
        let send = self
            .client
            .get_secret_value()
            .secret_id(Self::secret_name(ns, key))
            .send();
        match tokio::time::timeout(DEFAULT_OP_TIMEOUT, send).await {
            Err(_) => Err(StorageError::Unavailable(format!(
                "get_secret_value timed out after {DEFAULT_OP_TIMEOUT:?}"
            ))),
            Ok(Err(e)) if is_not_found(&e) => Ok(None),
            Ok(Err(e)) => Err(StorageError::Unavailable(format!(
                "get_secret_value failed: {e}"
            ))),
            Ok(Ok(output)) => Ok(output.secret_string().map(Self::revive)),
        }
    }

    async fn set(&self, ns: Namespace, key: &str, value: &Value) -> StorageResult<()> {
        let name = Self::secret_name(ns, key);
        let rendered = Self::render(value)?;
        let send = self
            .client
            .put_secret_value()
            .secret_id(&name)
            .secret_string(&rendered)
            .send();
        match tokio::time::timeout(DEFAULT_OP_TIMEOUT, send).await {
            Err(_) => Err(StorageError::Unavailable(format!(
                "put_secret_value timed out after {DEFAULT_OP_TIMEOUT:?}"
            ))),
            Ok(Err(e)) if is_not_found(&e) => self.create_secret(ns, &name, &rendered).await,
            Ok(Err(e)) => Err(StorageError::Unavailable(format!(
                "put_secret_value failed: {e}"
            ))),
            Ok(Ok(_)) => Ok(()),
        }
    }

    async fn delete(&self, ns: Namespace, key: &str) -> StorageResult<bool> {
        let send = self
            .client
            .delete_secret()
            .secret_id(Self::secret_name(ns, key))
            .force_delete_without_recovery(true)
            .send();
        match tokio::time::timeout(DEFAULT_OP_TIMEOUT, send).await {
            Err(_) => Err(StorageError::Unavailable(format!(
                "delete_secret timed out after {DEFAULT_OP_TIMEOUT:?}"
            ))),
            Ok(Err(e)) if is_not_found(&e) => Ok(false),
            Ok(Err(e)) => Err(StorageError::Unavailable(format!(
                "delete_secret failed: {e}"
            ))),
            Ok(Ok(_)) => Ok(true),
        }
    }

    async fn list(&self, ns: Namespace, prefix: Option<&str>) -> StorageResult<Vec<String>> {
        let name_prefix = match prefix {
            Some(p) => format!("{}{}", Self::namespace_prefix(ns), sanitize_key_path(p)),
            None => Self::namespace_prefix(ns),
        };
        let strip = Self::namespace_prefix(ns);
        let mut keys = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let mut request = self
                .client
                .list_secrets()
                .filters(
                    Filter::builder()
                        .key(FilterNameStringType::Name)
                        .values(&name_prefix)
                        .build(),
                )
                .max_results(100);
            if let Some(token) = next_token.take() {
                request = request.next_token(token);
            }
            let output = bounded(DEFAULT_OP_TIMEOUT, "list_secrets", request.send()).await?;
            for entry in output.secret_list() {
                if let Some(name) = entry.name() {
                    if let Some(key) = name.strip_prefix(&strip) {
                        keys.push(key.to_string());
                    }
                }
            }
            next_token = output.next_token().map(String::from);
            if next_token.is_none() {
                break;
            }
        }
        Ok(keys)
    }

    /// Read-then-write; the vault offers no compare-and-set, and credential
    /// writes are rare enough that last-write-wins is acceptable here.
    async fn update(
        &self,
        ns: Namespace,
        key: &str,
        f: Updater,
    ) -> StorageResult<Option<Value>> {
        let current = self.get(ns, key).await?;
        let next = f(current);
        match &next {
            Some(value) => self.set(ns, key, value).await?,
            None => {
                self.delete(ns, key).await?;
            }
        }
        Ok(next)
    }

    async fn append(&self, _ns: Namespace, _key: &str, _line: &str) -> StorageResult<()> {
        Err(StorageError::Unsupported {
            backend: BackendKind::SecretsManager.as_str(),
            operation: "append",
        })
    }

    async fn read_lines(&self, _ns: Namespace, _key: &str) -> StorageResult<LineStream> {
        Err(StorageError::Unsupported {
            backend: BackendKind::SecretsManager.as_str(),
            operation: "read_lines",
        })
    }

    async fn health_check(&self) -> HealthStatus {
        let start = Instant::now();
        let send = self.client.list_secrets().max_results(1).send();
        match tokio::time::timeout(HEALTH_TIMEOUT, send).await {
            Ok(Ok(_)) => HealthStatus::healthy(start.elapsed().as_millis() as u64),
            Ok(Err(e)) => HealthStatus::unhealthy(
                start.elapsed().as_millis() as u64,
                format!("list_secrets failed: {e}"),
            ),
            Err(_) => HealthStatus::unhealthy(
                start.elapsed().as_millis() as u64,
                format!("probe timed out after {HEALTH_TIMEOUT:?}"),
            ),
        }
    }
}

fn is_not_found<E, R>(err: &SdkError<E, R>) -> bool
where
    E: ProvideErrorMetadata,
{
    matches!(
        err.as_service_error().and_then(|e| e.code()),
        Some("ResourceNotFoundException")
    )
}
