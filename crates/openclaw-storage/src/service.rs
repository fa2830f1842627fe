//! Namespace-to-backend routing, lazy backend construction, and the
//! process-wide service handle.
//!
//! Routing per namespace:
//! 1. `auth` goes to the secrets vault whenever one is configured;
//! 2. the namespace classification resolves (explicit override, else mode
//!    default);
//! 3. hybrid + cloud: `sessions` prefers the document database, then the
//!    event memory service; `transcripts` prefers the event memory service;
//! 4. agentcore + cloud: the event memory service;
//! 5. everything else: the file backend.
//!
//! Cloud backends are constructed on first demand and memoized. A cloud
//! backend that fails to initialize is logged and skipped so the service
//! keeps serving local namespaces; the failure re-raises on first use.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, OnceLock};
use tracing::{info, warn};

use openclaw_types::{
    Classification, Namespace, StorageConfig, StorageError, StorageMode, StorageResult,
};

use crate::agentcore::EventMemoryBackend;
use crate::backend::{BackendKind, HealthStatus, StorageBackend};
use crate::dynamodb::DocumentDbBackend;
use crate::file::FileBackend;
use crate::secrets::SecretsBackend;

/// Diagnostic summary row for one namespace.
#[derive(Debug, Clone, serde::Serialize)]
pub struct NamespaceSummary {
    pub namespace: Namespace,
    pub backend: BackendKind,
    pub classification: Classification,
}

/// The storage router. Reentrant; construct once and share.
pub struct StorageService {
    config: StorageConfig,
    file: Arc<FileBackend>,
    agentcore: tokio::sync::Mutex<Option<Arc<EventMemoryBackend>>>,
    dynamodb: tokio::sync::Mutex<Option<Arc<DocumentDbBackend>>>,
    secrets: tokio::sync::Mutex<Option<Arc<SecretsBackend>>>,
}

impl StorageService {
    /// Validate the configuration and create the service. The file backend
    /// is always available; cloud backends materialize on first use.
    pub fn new(config: StorageConfig) -> StorageResult<Self> {
        config.validate()?;
        let file = Arc::new(FileBackend::from_config(&config));
        Ok(Self {
            config,
            file,
            agentcore: tokio::sync::Mutex::new(None),
            dynamodb: tokio::sync::Mutex::new(None),
            secrets: tokio::sync::Mutex::new(None),
        })
    }

    /// The configuration this service was built from.
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Resolved classification for a namespace.
    pub fn classification(&self, ns: Namespace) -> Classification {
        self.config.classification(ns)
    }

    /// The backend a namespace routes to. Pure decision, no construction.
    pub fn backend_kind_for(&self, ns: Namespace) -> BackendKind {
        if ns == Namespace::Auth && self.config.secrets_manager.is_some() {
            return BackendKind::SecretsManager;
        }
        if self.classification(ns) == Classification::Local {
            return BackendKind::File;
        }
        match self.config.mode {
            StorageMode::Hybrid => match ns {
                Namespace::Sessions if self.config.dynamodb.is_some() => BackendKind::Dynamodb,
                Namespace::Sessions | Namespace::Transcripts
                    if self.config.agentcore.is_some() =>
                {
                    BackendKind::Agentcore
                }
                _ => BackendKind::File,
            },
            StorageMode::AgentCore => BackendKind::Agentcore,
            StorageMode::File => BackendKind::File,
        }
    }

    /// Resolve the backend handle for a namespace, constructing it on first
    /// demand.
    pub async fn backend(&self, ns: Namespace) -> StorageResult<Arc<dyn StorageBackend>> {
        match self.backend_kind_for(ns) {
            BackendKind::File => Ok(self.file.clone()),
            BackendKind::Agentcore => Ok(self.agentcore_backend().await?),
            BackendKind::Dynamodb => Ok(self.dynamodb_backend().await?),
            BackendKind::SecretsManager => Ok(self.secrets_backend().await?),
        }
    }

    async fn agentcore_backend(&self) -> StorageResult<Arc<EventMemoryBackend>> {
        let mut slot = self.agentcore.lock().await;
        if let Some(backend) = slot.as_ref() {
            return Ok(backend.clone());
        }
        let config = self.config.agentcore.as_ref().ok_or_else(|| {
            StorageError::Config(
                "cloud namespace requires the event memory service; set agentcore.memoryArn"
                    .to_string(),
            )
        })?;
        let backend = Arc::new(EventMemoryBackend::connect(config).await?);
        *slot = Some(backend.clone());
        Ok(backend)
    }

    async fn dynamodb_backend(&self) -> StorageResult<Arc<DocumentDbBackend>> {
        let mut slot = self.dynamodb.lock().await;
        if let Some(backend) = slot.as_ref() {
            return Ok(backend.clone());
        }
        let config = self.config.dynamodb.as_ref().ok_or_else(|| {
            StorageError::Config(
                "hybrid sessions require the document database; set dynamodb.tableName"
                    .to_string(),
            )
        })?;
        let backend = Arc::new(DocumentDbBackend::connect(config).await?);
        *slot = Some(backend.clone());
        Ok(backend)
    }

    async fn secrets_backend(&self) -> StorageResult<Arc<SecretsBackend>> {
        let mut slot = self.secrets.lock().await;
        if let Some(backend) = slot.as_ref() {
            return Ok(backend.clone());
        }
        let config = self.config.secrets_manager.as_ref().ok_or_else(|| {
            StorageError::Config(
                "auth routing requires the secrets vault; set secretsManager.secretArn"
                    .to_string(),
            )
        })?;
        let backend = Arc::new(SecretsBackend::connect(config).await?);
        *slot = Some(backend.clone());
        Ok(backend)
    }

    /// Initialize the file backend, then attempt every configured cloud
    /// backend. A cloud backend that fails stays unconstructed; the warning
    /// is logged here and the error re-raises on first use.
    pub async fn initialize(&self) -> StorageResult<()> {
        self.file.initialize().await?;

        if self.config.agentcore.is_some() {
            if let Err(e) = self.try_cloud_init(BackendKind::Agentcore).await {
                warn!(error = %e, "Event memory backend failed to initialize, continuing");
            }
        }
        if self.config.dynamodb.is_some() {
            if let Err(e) = self.try_cloud_init(BackendKind::Dynamodb).await {
                warn!(error = %e, "Document database backend failed to initialize, continuing");
            }
        }
        if self.config.secrets_manager.is_some() {
            if let Err(e) = self.try_cloud_init(BackendKind::SecretsManager).await {
                warn!(error = %e, "Secrets backend failed to initialize, continuing");
            }
        }

        info!(mode = self.config.mode.as_str(), "Storage service initialized");
        Ok(())
    }

    async fn try_cloud_init(&self, kind: BackendKind) -> StorageResult<()> {
        match kind {
            BackendKind::Agentcore => {
                let backend = self.agentcore_backend().await?;
                if let Err(e) = backend.initialize().await {
                    *self.agentcore.lock().await = None;
                    return Err(e);
                }
            }
            BackendKind::Dynamodb => {
                let backend = self.dynamodb_backend().await?;
                if let Err(e) = backend.initialize().await {
                    *self.dynamodb.lock().await = None;
                    return Err(e);
                }
            }
            BackendKind::SecretsManager => {
                let backend = self.secrets_backend().await?;
                if let Err(e) = backend.initialize().await {
                    *self.secrets.lock().await = None;
                    return Err(e);
                }
            }
            BackendKind::File => {}
        }
        Ok(())
    }

    /// Probe the resolved backend of every namespace.
    pub async fn health_check(&self) -> BTreeMap<Namespace, HealthStatus> {
        let mut report = BTreeMap::new();
        for ns in Namespace::ALL {
            let status = match self.backend(ns).await {
                Ok(backend) => backend.health_check().await,
                Err(e) => HealthStatus::unhealthy(0, e.to_string()),
            };
            report.insert(ns, status);
        }
        report
    }

    /// Per-namespace backend tag and classification, for diagnostics.
    pub fn config_summary(&self) -> Vec<NamespaceSummary> {
        Namespace::ALL
            .iter()
            .map(|&ns| NamespaceSummary {
                namespace: ns,
                backend: self.backend_kind_for(ns),
                classification: self.classification(ns),
            })
            .collect()
    }

    /// Close every backend that was constructed.
    pub async fn close(&self) -> StorageResult<()> {
        self.file.close().await?;
        if let Some(backend) = self.agentcore.lock().await.take() {
            backend.close().await?;
        }
        if let Some(backend) = self.dynamodb.lock().await.take() {
            backend.close().await?;
        }
        if let Some(backend) = self.secrets.lock().await.take() {
            backend.close().await?;
        }
        Ok(())
    }
}

static GLOBAL: OnceLock<Mutex<Option<Arc<StorageService>>>> = OnceLock::new();

fn global_cell() -> &'static Mutex<Option<Arc<StorageService>>> {
    GLOBAL.get_or_init(|| Mutex::new(None))
}

/// The process-wide service handle, created on first call. Library code
/// should prefer an explicitly constructed and injected service; this exists
/// for entry points that have nowhere to thread one through.
pub fn global_service(config: &StorageConfig) -> StorageResult<Arc<StorageService>> {
    let mut guard = global_cell()
        .lock()
        .map_err(|e| StorageError::Internal(format!("global service lock poisoned: {e}")))?;
    if let Some(service) = guard.as_ref() {
        return Ok(service.clone());
    }
    let service = Arc::new(StorageService::new(config.clone())?);
    *guard = Some(service.clone());
    Ok(service)
}

/// Drop the process-wide handle so the next [`global_service`] call builds a
/// fresh one. Tests rely on this.
pub fn reset_global() {
    if let Ok(mut guard) = global_cell().lock() {
        *guard = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openclaw_types::{
        AgentCoreConfig, ClassificationOverrides, DynamoDbConfig, SecretsManagerConfig,
    };

    fn agentcore_config() -> AgentCoreConfig {
        AgentCoreConfig {
            memory_arn: "arn:aws:bedrock-agentcore:us-east-1:123:memory/m1".to_string(),
            region: None,
            namespace_prefix: String::new(),
        }
    }

    fn dynamodb_config() -> DynamoDbConfig {
        DynamoDbConfig {
            table_name: "T".to_string(),
            region: None,
            ttl_seconds: 0,
            namespace_index_name: "NamespaceIndex".to_string(),
        }
    }

    #[test]
    fn test_file_mode_routes_everything_local() {
        let service = StorageService::new(StorageConfig::default()).unwrap();
        for ns in Namespace::ALL {
            assert_eq!(service.backend_kind_for(ns), BackendKind::File);
        }
    }

    #[test]
    fn test_hybrid_routing() {
        // Hybrid with both cloud backends configured and no secrets vault.
        let service = StorageService::new(StorageConfig {
            mode: StorageMode::Hybrid,
            dynamodb: Some(dynamodb_config()),
            agentcore: Some(agentcore_config()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            service.backend_kind_for(Namespace::Sessions),
            BackendKind::Dynamodb
        );
        assert_eq!(
            service.backend_kind_for(Namespace::Transcripts),
            BackendKind::Agentcore
        );
        assert_eq!(service.backend_kind_for(Namespace::Auth), BackendKind::File);
        assert_eq!(
            service.backend_kind_for(Namespace::Config),
            BackendKind::File
        );
    }

    #[test]
    fn test_hybrid_sessions_fall_back_to_event_memory_then_file() {
        let with_agentcore = StorageService::new(StorageConfig {
            mode: StorageMode::Hybrid,
            agentcore: Some(agentcore_config()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            with_agentcore.backend_kind_for(Namespace::Sessions),
            BackendKind::Agentcore
        );

        let bare = StorageService::new(StorageConfig {
            mode: StorageMode::Hybrid,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            bare.backend_kind_for(Namespace::Sessions),
            BackendKind::File
        );
        assert_eq!(
            bare.backend_kind_for(Namespace::Transcripts),
            BackendKind::File
        );
    }

    #[test]
    fn test_agentcore_mode_routes_cloud_to_event_memory() {
        let service = StorageService::new(StorageConfig {
            mode: StorageMode::AgentCore,
            agentcore: Some(agentcore_config()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            service.backend_kind_for(Namespace::Sessions),
            BackendKind::Agentcore
        );
        assert_eq!(
            service.backend_kind_for(Namespace::Transcripts),
            BackendKind::Agentcore
        );
        assert_eq!(service.backend_kind_for(Namespace::Auth), BackendKind::File);
    }

    #[test]
    fn test_secrets_vault_captures_auth_in_every_mode() {
        let secrets = SecretsManagerConfig {
            secret_arn: "arn:aws:secretsmanager:us-east-1:123:secret:openclaw".to_string(),
            kms_key_id: None,
            region: None,
        };
        for mode in [StorageMode::File, StorageMode::AgentCore, StorageMode::Hybrid] {
            let service = StorageService::new(StorageConfig {
                mode,
                agentcore: Some(agentcore_config()),
                secrets_manager: Some(secrets.clone()),
                ..Default::default()
            })
            .unwrap();
            assert_eq!(
                service.backend_kind_for(Namespace::Auth),
                BackendKind::SecretsManager,
                "mode {mode:?}"
            );
        }
    }

    #[test]
    fn test_classification_override_changes_routing() {
        let service = StorageService::new(StorageConfig {
            mode: StorageMode::AgentCore,
            agentcore: Some(agentcore_config()),
            data_classification: ClassificationOverrides {
                sessions: Some(Classification::Local),
                config: Some(Classification::Cloud),
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            service.backend_kind_for(Namespace::Sessions),
            BackendKind::File
        );
        assert_eq!(
            service.backend_kind_for(Namespace::Config),
            BackendKind::Agentcore
        );
    }

    #[test]
    fn test_config_summary_covers_all_namespaces() {
        let service = StorageService::new(StorageConfig::default()).unwrap();
        let summary = service.config_summary();
        assert_eq!(summary.len(), Namespace::ALL.len());
        assert!(summary
            .iter()
            .all(|row| row.classification == Classification::Local));
    }

    #[test]
    fn test_invalid_config_is_rejected_at_construction() {
        let result = StorageService::new(StorageConfig {
            cache_ttl_ms: 0,
            ..Default::default()
        });
        assert!(matches!(result, Err(StorageError::Config(_))));
    }

    #[test]
    fn test_global_service_is_memoized_and_resettable() {
        reset_global();
        let a = global_service(&StorageConfig::default()).unwrap();
        let b = global_service(&StorageConfig::default()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        reset_global();
        let c = global_service(&StorageConfig::default()).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
