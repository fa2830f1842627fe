//! Storage layer for the OpenClaw agent platform.
//!
//! Exposes a uniform namespaced key-value and append-log interface over four
//! backends with very different native semantics:
//!
//! - **File**: local JSON/JSONL files with atomic renames and cooperative
//!   file locks;
//! - **Event memory**: an append-only cloud event service where deletes are
//!   tombstones and blobs occasionally come back in a non-JSON text form;
//! - **Document database**: true deletes, TTL, and conditional writes;
//! - **Secrets vault**: encrypted credential storage, no append support.
//!
//! [`StorageService`] routes each namespace to a backend based on the
//! configured mode and data classification, and the transcript URI layer lets
//! session records point at either local files or cloud event streams.

pub mod agentcore;
pub mod backend;
pub mod blob;
pub mod cache;
pub mod dynamodb;
pub mod file;
pub mod lock;
pub mod secrets;
pub mod service;
pub mod transcript;

pub use backend::{
    sanitize_key, BackendKind, HealthStatus, LineStream, StorageBackend, Updater,
};
pub use file::FileBackend;
pub use service::{global_service, reset_global, StorageService};
pub use transcript::{
    build_agentcore_transcript_uri, is_agentcore_uri, parse_transcript_uri,
    read_transcript_messages_from_uri, TranscriptLocation,
};

pub use openclaw_types::{
    Classification, Namespace, StorageConfig, StorageError, StorageMode, StorageResult,
};
