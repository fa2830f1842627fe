//! Event memory backend over the cloud AgentCore memory service.
//!
//! The service is append-only and keyed by `(memoryId, actorId, sessionId)`.
//! Key-value semantics are mapped onto it event-sourced: each `set` appends
//! an event whose blob payload is `{_type:"kv", value}`, `get` reads the most
//! recent event, and `delete` writes a `{_type:"tombstone"}` event that
//! shadows everything before it. A later `set` resurrects the key; the
//! latest event always wins. Transcript appends carry a `{_type:"line",
//! text}` blob for faithful recovery plus, for conversational records, a
//! structured conversational payload that feeds downstream long-term-memory
//! extraction.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_bedrockagentcore::config::Region;
use aws_sdk_bedrockagentcore::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_bedrockagentcore::types::{Content, Conversational, PayloadType, Role};
use aws_sdk_bedrockagentcore::Client;
use aws_smithy_types::{DateTime, Document, Number};
use chrono::Utc;
use futures::stream;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;
use tracing::debug;

use openclaw_types::{AgentCoreConfig, Namespace, StorageError, StorageResult};

use crate::backend::{
    bounded, sanitize_key, BackendKind, HealthStatus, LineStream, StorageBackend, Updater,
    DEFAULT_OP_TIMEOUT, HEALTH_TIMEOUT,
};
use crate::blob;

/// Actor-id root shared by every deployment.
const ACTOR_ROOT: &str = "openclaw-storage";

/// Session-id prefix for key-value entries.
const KV_PREFIX: &str = "kv-";

/// Session-id prefix for transcripts.
const TR_PREFIX: &str = "tr-";

/// Page size for event and session enumeration.
const PAGE_SIZE: i32 = 100;

/// Last event timestamp issued by this process, for monotonic ordering.
static LAST_EVENT_TS_MS: AtomicI64 = AtomicI64::new(0);

/// Wall-clock milliseconds, bumped to stay strictly increasing within the
/// process so same-millisecond writes keep their order.
fn next_event_timestamp_ms() -> i64 {
    let now = Utc::now().timestamp_millis();
    let mut prev = LAST_EVENT_TS_MS.load(Ordering::SeqCst);
    loop {
        let candidate = now.max(prev + 1);
        match LAST_EVENT_TS_MS.compare_exchange(
            prev,
            candidate,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => return candidate,
            Err(actual) => prev = actual,
        }
    }
}

/// Key-value and append-log storage over the event memory service.
pub struct EventMemoryBackend {
    client: Client,
    memory_id: String,
    namespace_prefix: String,
}

impl EventMemoryBackend {
    /// Build a backend from configuration. Loads AWS credentials from the
    /// environment; no network call is made until first use.
    pub async fn connect(config: &AgentCoreConfig) -> StorageResult<Self> {
        let region = config.resolved_region().ok_or_else(|| {
            StorageError::Config(
                "no region for the event memory service; set agentcore.region or AWS_REGION"
                    .to_string(),
            )
        })?;
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region))
            .load()
            .await;
        Ok(Self {
            client: Client::new(&aws_config),
            memory_id: config.memory_id().to_string(),
            namespace_prefix: config.namespace_prefix.clone(),
        })
    }

    fn actor_id(&self, ns: Namespace) -> String {
        if self.namespace_prefix.is_empty() {
            format!("{ACTOR_ROOT}/{ns}")
        } else {
            format!("{ACTOR_ROOT}/{}/{ns}", self.namespace_prefix)
        }
    }

    fn kv_session(key: &str) -> String {
        format!("{KV_PREFIX}{}", sanitize_key(key))
    }

    fn tr_session(key: &str) -> String {
        format!("{TR_PREFIX}{}", sanitize_key(key))
    }

    async fn put_event(
        &self,
        ns: Namespace,
        session_id: &str,
        payloads: Vec<PayloadType>,
    ) -> StorageResult<()> {
        let mut request = self
            .client
            .create_event()
            .memory_id(&self.memory_id)
            .actor_id(self.actor_id(ns))
            .session_id(session_id)
            .event_timestamp(DateTime::from_millis(next_event_timestamp_ms()));
        for payload in payloads {
            request = request.payload(payload);
        }
        bounded(DEFAULT_OP_TIMEOUT, "create_event", request.send()).await?;
        Ok(())
    }

    /// Latest payload document of a key-value session, tombstones included.
    async fn latest_kv_document(
        &self,
        ns: Namespace,
        key: &str,
    ) -> StorageResult<Option<Value>> {
        let send = self
            .client
            .list_events()
            .memory_id(&self.memory_id)
            .actor_id(self.actor_id(ns))
            .session_id(Self::kv_session(key))
            .include_payloads(true)
            .max_results(1)
            .send();
        let output = match tokio::time::timeout(DEFAULT_OP_TIMEOUT, send).await {
            Err(_) => {
                return Err(StorageError::Unavailable(format!(
                    "list_events timed out after {DEFAULT_OP_TIMEOUT:?}"
                )))
            }
            Ok(Err(e)) if is_not_found(&e) => return Ok(None),
            Ok(Err(e)) => {
                return Err(StorageError::Unavailable(format!("list_events failed: {e}")))
            }
            Ok(Ok(output)) => output,
        };
        let Some(event) = output.events().first() else {
            return Ok(None);
        };
        for payload in event.payload() {
            if let Some(doc) = payload_document(payload)? {
                return Ok(Some(doc));
            }
        }
        Ok(None)
    }

    async fn write_tombstone(&self, ns: Namespace, key: &str) -> StorageResult<()> {
        let doc = json!({
            "_type": "tombstone",
            "deletedAt": Utc::now().to_rfc3339(),
        });
        self.put_event(
            ns,
            &Self::kv_session(key),
            vec![PayloadType::Blob(value_to_document(&doc))],
        )
        .await
    }
}

#[async_trait]
impl StorageBackend for EventMemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Agentcore
    }

    fn is_distributed(&self) -> bool {
        true
    }

    async fn initialize(&self) -> StorageResult<()> {
        let health = self.health_check().await;
        if health.ok {
            debug!(memory_id = %self.memory_id, "Event memory backend initialized");
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
        match self.latest_kv_document(ns, key).await? {
            Some(doc) => Ok(live_kv_value(&doc)),
            None => Ok(None),
        }
    }

    async fn set(&self, ns: Namespace, key: &str, value: &Value) -> StorageResult<()> {
        let doc = json!({"_type": "kv", "value": value});
        self.put_event(
            ns,
            &Self::kv_session(key),
            vec![PayloadType::Blob(value_to_document(&doc))],
        )
        .await
    }

    async fn delete(&self, ns: Namespace, key: &str) -> StorageResult<bool> {
        let existed = self.get(ns, key).await?.is_some();
        if existed {
            self.write_tombstone(ns, key).await?;
        }
        Ok(existed)
    }

    async fn list(&self, ns: Namespace, prefix: Option<&str>) -> StorageResult<Vec<String>> {
        let actor = self.actor_id(ns);
        let wanted = prefix.map(sanitize_key);
        let mut candidates = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let mut request = self
                .client
                .list_sessions()
                .memory_id(&self.memory_id)
                .actor_id(&actor)
                .max_results(PAGE_SIZE);
            if let Some(token) = next_token.take() {
                request = request.next_token(token);
            }
            let output = match tokio::time::timeout(DEFAULT_OP_TIMEOUT, request.send()).await {
                Err(_) => {
                    return Err(StorageError::Unavailable(format!(
                        "list_sessions timed out after {DEFAULT_OP_TIMEOUT:?}"
                    )))
                }
                Ok(Err(e)) if is_not_found(&e) => return Ok(Vec::new()),
                Ok(Err(e)) => {
                    return Err(StorageError::Unavailable(format!(
                        "list_sessions failed: {e}"
                    )))
                }
                Ok(Ok(output)) => output,
            };
            for summary in output.session_summaries() {
                let session_id = summary.session_id();
                let Some(key) = session_id.strip_prefix(KV_PREFIX) else {
                    continue;
                };
                if let Some(p) = &wanted {
                    if !key.starts_with(p.as_str()) {
                        continue;
                    }
                }
                candidates.push(key.to_string());
            }
            next_token = output.next_token().map(String::from);
            if next_token.is_none() {
                break;
            }
        }

        // Tombstoned keys still have sessions; drop them by reading each
        // candidate's latest event.
        let mut keys = Vec::with_capacity(candidates.len());
        for key in candidates {
            if self.get(ns, &key).await?.is_some() {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    /// Read-then-write without a concurrency guard: the event service has no
    /// conditional append, so two racing updaters can both observe the same
    /// prior value. Sessions that need strict atomicity belong in the
    /// document database via hybrid mode.
    async fn update(
        &self,
        ns: Namespace,
        key: &str,
        f: Updater,
    ) -> StorageResult<Option<Value>> {
        let current = self.get(ns, key).await?;
        let had_value = current.is_some();
        let next = f(current);
        match &next {
            Some(value) => self.set(ns, key, value).await?,
            None => {
                if had_value {
                    self.write_tombstone(ns, key).await?;
                }
            }
        }
        Ok(next)
    }

    async fn append(&self, ns: Namespace, key: &str, line: &str) -> StorageResult<()> {
        let doc = json!({"_type": "line", "text": line});
        let mut payloads = vec![PayloadType::Blob(value_to_document(&doc))];
        if let Some((role, text)) = conversational_message(line) {
            let conversational = Conversational::builder()
                .content(Content::Text(text))
                .role(role)
                .build()
                .map_err(|e| StorageError::Internal(format!("conversational payload: {e}")))?;
            payloads.push(PayloadType::Conversational(conversational));
        }
        self.put_event(ns, &Self::tr_session(key), payloads).await
    }

    async fn read_lines(&self, ns: Namespace, key: &str) -> StorageResult<LineStream> {
        let actor = self.actor_id(ns);
        let session = Self::tr_session(key);
        let mut lines = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let mut request = self
                .client
                .list_events()
                .memory_id(&self.memory_id)
                .actor_id(&actor)
                .session_id(&session)
                .include_payloads(true)
                .max_results(PAGE_SIZE);
            if let Some(token) = next_token.take() {
                request = request.next_token(token);
            }
            let output = match tokio::time::timeout(DEFAULT_OP_TIMEOUT, request.send()).await {
                Err(_) => {
                    return Err(StorageError::Unavailable(format!(
                        "list_events timed out after {DEFAULT_OP_TIMEOUT:?}"
                    )))
                }
                Ok(Err(e)) if is_not_found(&e) => break,
                Ok(Err(e)) => {
                    return Err(StorageError::Unavailable(format!("list_events failed: {e}")))
                }
                Ok(Ok(output)) => output,
            };
            for event in output.events() {
                for payload in event.payload() {
                    if let Some(line) = payload_line(payload) {
                        lines.push(line);
                    }
                }
            }
            next_token = output.next_token().map(String::from);
            if next_token.is_none() {
                break;
            }
        }

        // The service enumerates newest-first; undo that exactly once here so
        // every caller observes chronological order.
        lines.reverse();
        Ok(Box::pin(stream::iter(lines.into_iter().map(Ok))))
    }

    async fn health_check(&self) -> HealthStatus {
        let start = Instant::now();
        let send = self
            .client
            .list_sessions()
            .memory_id(&self.memory_id)
            .actor_id(self.actor_id(Namespace::Sessions))
            .max_results(1)
            .send();
        match tokio::time::timeout(HEALTH_TIMEOUT, send).await {
            Ok(Ok(_)) => HealthStatus::healthy(start.elapsed().as_millis() as u64),
            Ok(Err(e)) if is_not_found(&e) => {
                // An empty actor is healthy; the memory resource answered.
                HealthStatus::healthy(start.elapsed().as_millis() as u64)
            }
            Ok(Err(e)) => HealthStatus::unhealthy(
                start.elapsed().as_millis() as u64,
                format!("list_sessions failed: {e}"),
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

/// Decode a blob payload into its JSON document, tolerating the stringified
/// text form the service sometimes returns.
fn payload_document(payload: &PayloadType) -> StorageResult<Option<Value>> {
    let PayloadType::Blob(doc) = payload else {
        return Ok(None);
    };
    match doc {
        Document::String(raw) => match blob::parse_loose_document(raw) {
            Some(value) => Ok(Some(value)),
            None => Err(StorageError::Corruption(format!(
                "blob payload is neither JSON nor dict text: {raw}"
            ))),
        },
        other => Ok(Some(document_to_value(other))),
    }
}

/// The live value of a key-value document, or `None` when tombstoned or
/// unrecognized.
fn live_kv_value(doc: &Value) -> Option<Value> {
    match doc.get("_type").and_then(Value::as_str) {
        Some("kv") => doc.get("value").cloned(),
        _ => None,
    }
}

/// Extract one transcript line from a blob payload, decoding the quirky
/// string form when needed. Non-line payloads yield nothing.
fn payload_line(payload: &PayloadType) -> Option<String> {
    let PayloadType::Blob(doc) = payload else {
        return None;
    };
    match doc {
        Document::String(raw) => Some(blob::decode_line(raw)),
        Document::Object(map) => {
            match map.get("_type") {
                Some(Document::String(t)) if t == "line" => {}
                _ => return None,
            }
            match map.get("text") {
                Some(Document::String(text)) => Some(text.clone()),
                Some(other) => serde_json::to_string(&document_to_value(other)).ok(),
                None => None,
            }
        }
        _ => None,
    }
}

/// Recognize a conversational transcript record and pull out the role and
/// flattened text for the structured payload.
fn conversational_message(line: &str) -> Option<(Role, String)> {
    let value: Value = serde_json::from_str(line).ok()?;
    let message = value.get("message").unwrap_or(&value);
    let role = match message.get("role").and_then(Value::as_str)? {
        r if r.eq_ignore_ascii_case("user") => Role::User,
        r if r.eq_ignore_ascii_case("assistant") => Role::Assistant,
        _ => return None,
    };
    let text = match message.get("content")? {
        Value::String(s) => s.clone(),
        Value::Array(items) => {
            let parts: Vec<&str> = items
                .iter()
                .filter_map(|item| item.get("text").and_then(Value::as_str))
                .collect();
            if parts.is_empty() {
                return None;
            }
            parts.join("\n")
        }
        _ => return None,
    };
    if text.trim().is_empty() {
        return None;
    }
    Some((role, text))
}

fn value_to_document(value: &Value) -> Document {
    match value {
        Value::Null => Document::Null,
        Value::Bool(b) => Document::Bool(*b),
        Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                Document::Number(Number::PosInt(u))
            } else if let Some(i) = n.as_i64() {
                Document::Number(Number::NegInt(i))
            } else {
                Document::Number(Number::Float(n.as_f64().unwrap_or(0.0)))
            }
        }
        Value::String(s) => Document::String(s.clone()),
        Value::Array(items) => Document::Array(items.iter().map(value_to_document).collect()),
        Value::Object(map) => Document::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), value_to_document(v)))
                .collect(),
        ),
    }
}

fn document_to_value(doc: &Document) -> Value {
    match doc {
        Document::Null => Value::Null,
        Document::Bool(b) => Value::Bool(*b),
        Document::Number(Number::PosInt(u)) => Value::from(*u),
        Document::Number(Number::NegInt(i)) => Value::from(*i),
        Document::Number(Number::Float(f)) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Document::String(s) => Value::String(s.clone()),
        Document::Array(items) => Value::Array(items.iter().map(document_to_value).collect()),
        Document::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), document_to_value(v)))
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_round_trip() {
        let value = json!({
            "s": "text",
            "n": 7,
            "neg": -2,
            "f": 1.5,
            "b": true,
            "nothing": null,
            "arr": [1, "two", {"deep": false}],
        });
        assert_eq!(document_to_value(&value_to_document(&value)), value);
    }

    #[test]
    fn test_live_kv_value() {
        assert_eq!(
            live_kv_value(&json!({"_type": "kv", "value": {"a": 1}})),
            Some(json!({"a": 1}))
        );
        assert_eq!(
            live_kv_value(&json!({"_type": "tombstone", "deletedAt": "2024-01-01"})),
            None
        );
        assert_eq!(live_kv_value(&json!({"unrelated": 1})), None);
    }

    #[test]
    fn test_payload_line_object_form() {
        let doc = value_to_document(&json!({"_type": "line", "text": "{\"a\":1}"}));
        let line = payload_line(&PayloadType::Blob(doc)).unwrap();
        assert_eq!(line, "{\"a\":1}");
    }

    #[test]
    fn test_payload_line_string_form() {
        // The service flattened the blob into dict text.
        let raw = r#"{_type=line, text={"role":"assistant","content":[{"text":"hi"}]}}"#;
        let line = payload_line(&PayloadType::Blob(Document::String(raw.to_string()))).unwrap();
        assert_eq!(line, r#"{"role":"assistant","content":[{"text":"hi"}]}"#);
    }

    #[test]
    fn test_payload_line_skips_kv_documents() {
        let doc = value_to_document(&json!({"_type": "kv", "value": 1}));
        assert_eq!(payload_line(&PayloadType::Blob(doc)), None);
    }

    #[test]
    fn test_payload_document_loose_string() {
        let payload = PayloadType::Blob(Document::String(
            "{_type=tombstone, deletedAt=2024-06-01T00:00:00Z}".to_string(),
        ));
        let doc = payload_document(&payload).unwrap().unwrap();
        assert_eq!(doc.get("_type").and_then(Value::as_str), Some("tombstone"));
    }

    #[test]
    fn test_payload_document_garbage_is_corruption() {
        let payload = PayloadType::Blob(Document::String("][not recoverable".to_string()));
        assert!(matches!(
            payload_document(&payload),
            Err(StorageError::Corruption(_))
        ));
    }

    #[test]
    fn test_conversational_message_nested_record() {
        let line = r#"{"type":"message","message":{"role":"user","content":[{"type":"text","text":"hello"}]}}"#;
        let (role, text) = conversational_message(line).unwrap();
        assert_eq!(role, Role::User);
        assert_eq!(text, "hello");
    }

    #[test]
    fn test_conversational_message_bare_record_with_string_content() {
        let line = r#"{"role":"assistant","content":"sure thing"}"#;
        let (role, text) = conversational_message(line).unwrap();
        assert_eq!(role, Role::Assistant);
        assert_eq!(text, "sure thing");
    }

    #[test]
    fn test_conversational_message_rejects_other_shapes() {
        assert!(conversational_message("not json").is_none());
        assert!(conversational_message(r#"{"role":"tool","content":"x"}"#).is_none());
        assert!(conversational_message(r#"{"role":"user","content":[]}"#).is_none());
    }

    #[test]
    fn test_event_timestamps_are_strictly_increasing() {
        let a = next_event_timestamp_ms();
        let b = next_event_timestamp_ms();
        let c = next_event_timestamp_ms();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_session_id_mapping() {
        assert_eq!(EventMemoryBackend::kv_session("a b"), "kv-a_b");
        assert_eq!(EventMemoryBackend::tr_session("s/1"), "tr-s_1");
    }
}
