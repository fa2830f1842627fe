//! Core types for the OpenClaw storage layer.
//!
//! This crate defines the shared data structures used across the storage
//! backends, the routing service, and the CLI. It contains no business logic.

pub mod config;
pub mod error;
pub mod namespace;

pub use config::{
    AgentCoreConfig, Classification, ClassificationOverrides, DynamoDbConfig,
    SecretsManagerConfig, StorageConfig, StorageMode,
};
pub use error::{StorageError, StorageResult};
pub use namespace::Namespace;
