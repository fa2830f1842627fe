//! Storage configuration: service mode, per-namespace classification
//! overrides, and backend connection settings.
//!
//! Loaded from `~/.openclaw/storage.toml` with defaults. Key spelling follows
//! the documented camelCase schema (`dataClassification`, `memoryArn`,
//! `cacheTtlMs`); unknown keys are rejected so typos fail loudly instead of
//! silently routing data to the wrong backend.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{StorageError, StorageResult};
use crate::namespace::Namespace;

/// Default cloud item TTL: 30 days.
pub const DEFAULT_TTL_SECONDS: u64 = 2_592_000;

/// Default per-process value cache TTL.
pub const DEFAULT_CACHE_TTL_MS: u64 = 45_000;

/// Default secondary index for namespace listing.
pub const DEFAULT_NAMESPACE_INDEX: &str = "NamespaceIndex";

/// Service-wide backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// Everything on the local filesystem.
    #[default]
    File,
    /// Cloud namespaces served by the event memory service.
    AgentCore,
    /// Document database for sessions, event memory for transcripts.
    Hybrid,
}

impl StorageMode {
    /// Lowercase tag for diagnostics.
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageMode::File => "file",
            StorageMode::AgentCore => "agentcore",
            StorageMode::Hybrid => "hybrid",
        }
    }
}

/// Per-namespace decision between local and cloud storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Local,
    Cloud,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Local => "local",
            Classification::Cloud => "cloud",
        }
    }
}

/// Explicit per-namespace classification overrides. Unset fields fall back
/// to the mode default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ClassificationOverrides {
    pub sessions: Option<Classification>,
    pub transcripts: Option<Classification>,
    pub auth: Option<Classification>,
    pub config: Option<Classification>,
}

impl ClassificationOverrides {
    fn get(&self, ns: Namespace) -> Option<Classification> {
        match ns {
            Namespace::Sessions => self.sessions,
            Namespace::Transcripts => self.transcripts,
            Namespace::Auth => self.auth,
            Namespace::Config => self.config,
        }
    }
}

/// Connection settings for the event memory service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct AgentCoreConfig {
    /// ARN of the cloud memory resource. Opaque; may contain slashes.
    pub memory_arn: String,
    /// Explicit region; falls back to `AWS_REGION`, then the ARN region.
    #[serde(default)]
    pub region: Option<String>,
    /// Actor-id prefix for multi-tenant isolation.
    #[serde(default)]
    pub namespace_prefix: String,
}

impl AgentCoreConfig {
    /// Region resolution order: explicit config, `AWS_REGION`, ARN region.
    pub fn resolved_region(&self) -> Option<String> {
        self.region
            .clone()
            .or_else(|| std::env::var("AWS_REGION").ok().filter(|r| !r.is_empty()))
            .or_else(|| region_from_arn(&self.memory_arn))
    }

    /// The memory id the data-plane API expects: the final path segment of
    /// the ARN, or the whole string when it is already a bare id.
    pub fn memory_id(&self) -> &str {
        self.memory_arn
            .rsplit('/')
            .next()
            .unwrap_or(&self.memory_arn)
    }
}

/// Connection settings for the document database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct DynamoDbConfig {
    pub table_name: String,
    #[serde(default)]
    pub region: Option<String>,
    /// Item TTL in seconds; 0 disables TTL entirely.
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,
    #[serde(default = "default_namespace_index")]
    pub namespace_index_name: String,
}

impl DynamoDbConfig {
    pub fn resolved_region(&self) -> Option<String> {
        self.region
            .clone()
            .or_else(|| std::env::var("AWS_REGION").ok().filter(|r| !r.is_empty()))
    }
}

/// Connection settings for the managed secrets vault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct SecretsManagerConfig {
    /// Marker ARN of the vault; its presence routes `auth` to the vault.
    pub secret_arn: String,
    /// Optional envelope-encryption key attached to created secrets.
    #[serde(default)]
    pub kms_key_id: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
}

impl SecretsManagerConfig {
    pub fn resolved_region(&self) -> Option<String> {
        self.region
            .clone()
            .or_else(|| std::env::var("AWS_REGION").ok().filter(|r| !r.is_empty()))
    }
}

/// Top-level storage configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase", default)]
pub struct StorageConfig {
    /// Service mode.
    #[serde(rename = "type")]
    pub mode: StorageMode,
    /// Explicit per-namespace classification overrides.
    pub data_classification: ClassificationOverrides,
    /// Event memory backend settings.
    pub agentcore: Option<AgentCoreConfig>,
    /// Document database backend settings.
    pub dynamodb: Option<DynamoDbConfig>,
    /// Secrets vault backend settings.
    pub secrets_manager: Option<SecretsManagerConfig>,
    /// Whether the file backend keeps a per-process value cache.
    pub cache_enabled: bool,
    /// Value cache TTL in milliseconds; must be positive.
    pub cache_ttl_ms: u64,
    /// Root directory for local storage. Defaults to `~/.openclaw/storage`.
    pub base_dir: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mode: StorageMode::File,
            data_classification: ClassificationOverrides::default(),
            agentcore: None,
            dynamodb: None,
            secrets_manager: None,
            cache_enabled: true,
            cache_ttl_ms: DEFAULT_CACHE_TTL_MS,
            base_dir: None,
        }
    }
}

impl StorageConfig {
    /// Resolve the classification for a namespace: explicit override first,
    /// then the mode default. In `file` mode everything is local; in
    /// `agentcore`/`hybrid` mode sessions and transcripts are cloud while
    /// auth and config stay local.
    pub fn classification(&self, ns: Namespace) -> Classification {
        if let Some(explicit) = self.data_classification.get(ns) {
            return explicit;
        }
        match (self.mode, ns) {
            (StorageMode::File, _) => Classification::Local,
            (_, Namespace::Sessions) | (_, Namespace::Transcripts) => Classification::Cloud,
            _ => Classification::Local,
        }
    }

    /// The effective local storage root.
    pub fn resolved_base_dir(&self) -> PathBuf {
        self.base_dir.clone().unwrap_or_else(default_base_dir)
    }

    /// Validate cross-field constraints, producing messages that name the
    /// config key to fix.
    pub fn validate(&self) -> StorageResult<()> {
        if self.cache_ttl_ms == 0 {
            return Err(StorageError::Config(
                "cacheTtlMs must be positive; set cacheEnabled = false to disable caching"
                    .to_string(),
            ));
        }
        if let Some(ac) = &self.agentcore {
            if ac.memory_arn.trim().is_empty() {
                return Err(StorageError::Config(
                    "agentcore.memoryArn is empty; set it to the memory resource ARN".to_string(),
                ));
            }
        }
        if let Some(ddb) = &self.dynamodb {
            if ddb.table_name.trim().is_empty() {
                return Err(StorageError::Config(
                    "dynamodb.tableName is empty; set it to the sessions table name".to_string(),
                ));
            }
        }
        if self.mode == StorageMode::AgentCore
            && self.agentcore.is_none()
            && Namespace::ALL
                .iter()
                .any(|ns| self.classification(*ns) == Classification::Cloud)
        {
            return Err(StorageError::Config(
                "mode 'agentcore' stores cloud namespaces in the event memory service; \
                 set agentcore.memoryArn"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Load configuration from a TOML file. A missing file yields defaults;
    /// a malformed file is a configuration error.
    pub fn load(path: Option<&Path>) -> StorageResult<StorageConfig> {
        let config_path = path
            .map(|p| p.to_path_buf())
            .unwrap_or_else(default_config_path);

        if !config_path.exists() {
            info!(
                path = %config_path.display(),
                "Storage config not found, using defaults"
            );
            return Ok(StorageConfig::default());
        }

        let contents = std::fs::read_to_string(&config_path).map_err(|e| {
            StorageError::Config(format!(
                "Failed to read {}: {e}",
                config_path.display()
            ))
        })?;
        let config: StorageConfig = toml::from_str(&contents).map_err(|e| {
            StorageError::Config(format!(
                "Failed to parse {}: {e}",
                config_path.display()
            ))
        })?;
        config.validate()?;
        info!(
            path = %config_path.display(),
            mode = config.mode.as_str(),
            "Loaded storage configuration"
        );
        Ok(config)
    }
}

fn default_ttl_seconds() -> u64 {
    DEFAULT_TTL_SECONDS
}

fn default_namespace_index() -> String {
    DEFAULT_NAMESPACE_INDEX.to_string()
}

/// Default config file path: `~/.openclaw/storage.toml`.
pub fn default_config_path() -> PathBuf {
    openclaw_home().join("storage.toml")
}

/// Default local storage root: `~/.openclaw/storage`.
pub fn default_base_dir() -> PathBuf {
    openclaw_home().join("storage")
}

/// The OpenClaw home directory.
pub fn openclaw_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".openclaw")
}

/// Extract the region field from an ARN (`arn:partition:service:region:…`).
fn region_from_arn(arn: &str) -> Option<String> {
    let region = arn.split(':').nth(3)?;
    if region.is_empty() {
        None
    } else {
        Some(region.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = StorageConfig::default();
        assert_eq!(config.mode, StorageMode::File);
        assert!(config.cache_enabled);
        assert_eq!(config.cache_ttl_ms, DEFAULT_CACHE_TTL_MS);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_file_mode_is_all_local() {
        let config = StorageConfig::default();
        for ns in Namespace::ALL {
            assert_eq!(config.classification(ns), Classification::Local);
        }
    }

    #[test]
    fn test_hybrid_mode_defaults() {
        let config = StorageConfig {
            mode: StorageMode::Hybrid,
            ..Default::default()
        };
        assert_eq!(
            config.classification(Namespace::Sessions),
            Classification::Cloud
        );
        assert_eq!(
            config.classification(Namespace::Transcripts),
            Classification::Cloud
        );
        assert_eq!(config.classification(Namespace::Auth), Classification::Local);
        assert_eq!(
            config.classification(Namespace::Config),
            Classification::Local
        );
    }

    #[test]
    fn test_explicit_override_wins() {
        let config = StorageConfig {
            mode: StorageMode::Hybrid,
            data_classification: ClassificationOverrides {
                sessions: Some(Classification::Local),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(
            config.classification(Namespace::Sessions),
            Classification::Local
        );
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let err = toml::from_str::<StorageConfig>("cacheTtlMss = 1000").unwrap_err();
        assert!(err.to_string().contains("unknown field"));
    }

    #[test]
    fn test_parse_documented_keys() {
        let config: StorageConfig = toml::from_str(
            r#"
            type = "hybrid"
            cacheTtlMs = 1000

            [dataClassification]
            auth = "cloud"

            [agentcore]
            memoryArn = "arn:aws:bedrock-agentcore:us-east-1:123:memory/m1"
            namespacePrefix = "tenant-a"

            [dynamodb]
            tableName = "openclaw-sessions"
            ttlSeconds = 0
        "#,
        )
        .unwrap();
        assert_eq!(config.mode, StorageMode::Hybrid);
        assert_eq!(config.cache_ttl_ms, 1000);
        assert_eq!(
            config.data_classification.auth,
            Some(Classification::Cloud)
        );
        let ac = config.agentcore.unwrap();
        assert_eq!(ac.namespace_prefix, "tenant-a");
        assert_eq!(ac.memory_id(), "m1");
        let ddb = config.dynamodb.unwrap();
        assert_eq!(ddb.ttl_seconds, 0);
        assert_eq!(ddb.namespace_index_name, DEFAULT_NAMESPACE_INDEX);
    }

    #[test]
    fn test_region_from_arn() {
        assert_eq!(
            region_from_arn("arn:aws:bedrock-agentcore:eu-west-1:123:memory/m1"),
            Some("eu-west-1".to_string())
        );
        assert_eq!(region_from_arn("not-an-arn"), None);
        assert_eq!(region_from_arn("arn:aws:svc::123:x"), None);
    }

    #[test]
    fn test_zero_cache_ttl_rejected() {
        let config = StorageConfig {
            cache_ttl_ms: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("cacheTtlMs"));
    }

    #[test]
    fn test_agentcore_mode_requires_memory_arn() {
        let config = StorageConfig {
            mode: StorageMode::AgentCore,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("agentcore.memoryArn"));
    }

    #[test]
    fn test_agentcore_mode_all_local_needs_no_arn() {
        let config = StorageConfig {
            mode: StorageMode::AgentCore,
            data_classification: ClassificationOverrides {
                sessions: Some(Classification::Local),
                transcripts: Some(Classification::Local),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_missing_file_yields_defaults() {
        let config = StorageConfig::load(Some(Path::new("/nonexistent/storage.toml"))).unwrap();
        assert_eq!(config, StorageConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "type = \"hybrid\"").unwrap();
        writeln!(f, "[dynamodb]").unwrap();
        writeln!(f, "tableName = \"T\"").unwrap();
        drop(f);

        let config = StorageConfig::load(Some(&path)).unwrap();
        assert_eq!(config.mode, StorageMode::Hybrid);
        assert_eq!(config.dynamodb.unwrap().table_name, "T");
    }

    #[test]
    fn test_load_malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.toml");
        std::fs::write(&path, "type = \"warehouse\"").unwrap();
        assert!(matches!(
            StorageConfig::load(Some(&path)),
            Err(StorageError::Config(_))
        ));
    }
}
