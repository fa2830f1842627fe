//! Transcript location URIs and the unified transcript reader.
//!
//! A session index entry points at its transcript with either an absolute
//! `.jsonl` path or `agentcore://<memoryArn>/<sessionId>`. The memory ARN
//! itself contains slashes, so the session id is everything after the LAST
//! slash. Readers dispatch on the scheme and hand back the same message
//! shape either way.

use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::debug;

use openclaw_types::{Namespace, StorageConfig, StorageError, StorageResult};

use crate::backend::StorageBackend;
use crate::blob::extract_embedded_text;
use crate::service::StorageService;

/// Scheme prefix for cloud transcript locations.
pub const AGENTCORE_SCHEME: &str = "agentcore://";

/// A parsed transcript location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptLocation {
    /// Absolute path to a local `.jsonl` file.
    File(PathBuf),
    /// An event stream in the cloud memory service.
    AgentCore {
        memory_arn: String,
        session_id: String,
    },
}

/// Whether a transcript URI points at the cloud memory service.
pub fn is_agentcore_uri(uri: &str) -> bool {
    uri.starts_with(AGENTCORE_SCHEME)
}

/// Parse a transcript URI. For the `agentcore` form the remainder splits at
/// the last slash: left is the memory ARN, right the session id, and both
/// must be non-empty.
pub fn parse_transcript_uri(uri: &str) -> StorageResult<TranscriptLocation> {
    if let Some(remainder) = uri.strip_prefix(AGENTCORE_SCHEME) {
        let (memory_arn, session_id) = remainder.rsplit_once('/').ok_or_else(|| {
            StorageError::InvalidArgument(format!(
                "transcript URI '{uri}' is missing a session id"
            ))
        })?;
        if memory_arn.is_empty() || session_id.is_empty() {
            return Err(StorageError::InvalidArgument(format!(
                "transcript URI '{uri}' must be {AGENTCORE_SCHEME}<memoryArn>/<sessionId>"
            )));
        }
        return Ok(TranscriptLocation::AgentCore {
            memory_arn: memory_arn.to_string(),
            session_id: session_id.to_string(),
        });
    }
    if uri.is_empty() {
        return Err(StorageError::InvalidArgument(
            "transcript URI is empty".to_string(),
        ));
    }
    Ok(TranscriptLocation::File(PathBuf::from(uri)))
}

/// Compose the cloud transcript URI for a memory ARN and session id.
pub fn build_agentcore_transcript_uri(memory_arn: &str, session_id: &str) -> String {
    format!("{AGENTCORE_SCHEME}{memory_arn}/{session_id}")
}

/// Read the messages of a transcript, wherever it lives, in chronological
/// order. Missing local files read as empty. Each non-blank line is parsed
/// as JSON; lines carrying a `message` field yield that message with its
/// content sanitized.
pub async fn read_transcript_messages_from_uri(
    uri: &str,
    config: &StorageConfig,
) -> StorageResult<Vec<Value>> {
    match parse_transcript_uri(uri)? {
        TranscriptLocation::File(path) => read_file_messages(&path).await,
        TranscriptLocation::AgentCore {
            memory_arn,
            session_id,
        } => read_agentcore_messages(&memory_arn, &session_id, config).await,
    }
}

async fn read_file_messages(path: &Path) -> StorageResult<Vec<Value>> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    Ok(collect_messages(contents.lines()))
}

async fn read_agentcore_messages(
    memory_arn: &str,
    session_id: &str,
    config: &StorageConfig,
) -> StorageResult<Vec<Value>> {
    // A fresh, non-singleton service addressed at the URI's memory resource;
    // the surrounding config supplies region and tenant prefix. The URI is
    // authoritative for where the transcript lives, so transcripts are
    // forced onto the event memory backend regardless of the service mode.
    let mut config = config.clone();
    let agentcore = config.agentcore.get_or_insert_with(|| {
        openclaw_types::AgentCoreConfig {
            memory_arn: memory_arn.to_string(),
            region: None,
            namespace_prefix: String::new(),
        }
    });
    agentcore.memory_arn = memory_arn.to_string();
    config.mode = openclaw_types::StorageMode::AgentCore;
    config.data_classification.transcripts = Some(openclaw_types::Classification::Cloud);

    let service = StorageService::new(config)?;
    service.initialize().await?;
    let backend = service.backend(Namespace::Transcripts).await?;
    // read_lines already normalizes the event service's newest-first
    // enumeration to chronological order.
    let lines = backend
        .read_all_lines(Namespace::Transcripts, session_id)
        .await?;
    service.close().await?;

    debug!(session_id, count = lines.len(), "Read cloud transcript");
    Ok(collect_messages(lines.iter().map(String::as_str)))
}

fn collect_messages<'a>(lines: impl Iterator<Item = &'a str>) -> Vec<Value> {
    let mut messages = Vec::new();
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let Ok(record) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if let Some(message) = record.get("message") {
            let mut message = message.clone();
            sanitize_message_content(&mut message);
            messages.push(message);
        }
    }
    messages
}

/// Repair message content whose `text` was flattened into Python-dict text
/// by the event service. Only fields that look like a dict rendering with an
/// embedded `'text'` are touched; everything else passes through unchanged.
pub fn sanitize_message_content(message: &mut Value) {
    let Some(items) = message.get_mut("content").and_then(Value::as_array_mut) else {
        return;
    };
    for item in items {
        let Some(text) = item.get("text").and_then(Value::as_str) else {
            continue;
        };
        if text.starts_with('{') && text.contains("'text'") {
            if let Some(extracted) = extract_embedded_text(text) {
                item["text"] = Value::String(extracted);
            }
        }
    }
}
