//! Document database backend over DynamoDB.
//!
//! Unlike the event memory service this backend has true deletes, item TTL,
//! and conditional writes, which is why hybrid mode routes `sessions` here.
//! Items live under `PK = "<ns>#<key>"` / `SK = "DATA"` with a monotonically
//! increasing `rev` attribute; `update` re-reads and writes conditionally on
//! the observed `rev`, retrying on contention. A global secondary index on
//! `(namespace, key)` serves `list`.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_dynamodb::config::Region;
use aws_sdk_dynamodb::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_dynamodb::types::{AttributeValue, ReturnValue};
use aws_sdk_dynamodb::Client;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

use openclaw_types::{DynamoDbConfig, Namespace, StorageError, StorageResult};

use crate::backend::{
    bounded, sanitize_key, BackendKind, HealthStatus, LineStream, StorageBackend, Updater,
    DEFAULT_OP_TIMEOUT, HEALTH_TIMEOUT,
};

/// Sort key constant; each (namespace, key) pair owns exactly one item.
const SORT_KEY: &str = "DATA";

/// Conditional-update attempts before reporting contention.
const MAX_UPDATE_ATTEMPTS: u32 = 32;

/// Key-value storage over a DynamoDB table with a namespace GSI.
pub struct DocumentDbBackend {
    client: Client,
    table_name: String,
    index_name: String,
    ttl_seconds: u64,
}

impl DocumentDbBackend {
    /// Build a backend from configuration. Credentials come from the
    /// environment; no network call is made until first use.
    pub async fn connect(config: &DynamoDbConfig) -> StorageResult<Self> {
        let region = config.resolved_region().ok_or_else(|| {
            StorageError::Config(
                "no region for the document database; set dynamodb.region or AWS_REGION"
                    .to_string(),
            )
        })?;
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region))
            .load()
            .await;
        Ok(Self {
            client: Client::new(&aws_config),
            table_name: config.table_name.clone(),
            index_name: config.namespace_index_name.clone(),
            ttl_seconds: config.ttl_seconds,
        })
    }

    fn partition_key(ns: Namespace, key: &str) -> String {
        format!("{ns}#{}", sanitize_key(key))
    }

    fn ttl_epoch(&self) -> Option<i64> {
        if self.ttl_seconds == 0 {
            None
        } else {
            Some(Utc::now().timestamp() + self.ttl_seconds as i64)
        }
    }

    /// Fetch the raw item for a key, with its `rev`. Expired items are
    /// treated as absent even when the table has not reaped them yet.
    async fn fetch_item(
        &self,
        ns: Namespace,
        key: &str,
    ) -> StorageResult<Option<(Value, i64)>> {
        let send = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key("PK", AttributeValue::S(Self::partition_key(ns, key)))
            .key("SK", AttributeValue::S(SORT_KEY.to_string()))
            .consistent_read(true)
            .send();
        let output = bounded(DEFAULT_OP_TIMEOUT, "get_item", send).await?;
        let Some(item) = output.item() else {
            return Ok(None);
        };
        if item_expired(item) {
            return Ok(None);
        }
        let data = item
            .get("data")
            .map(attr_to_value)
            .transpose()?
            .unwrap_or(Value::Null);
        let rev = item
            .get("rev")
            .and_then(|a| a.as_n().ok())
            .and_then(|n| n.parse::<i64>().ok())
            .unwrap_or(0);
        Ok(Some((data, rev)))
    }

    async fn conditional_write(
        &self,
        ns: Namespace,
        key: &str,
        value: &Value,
        prev_rev: Option<i64>,
    ) -> StorageResult<bool> {
        let mut request = self
            .client
            .update_item()
            .table_name(&self.table_name)
            .key("PK", AttributeValue::S(Self::partition_key(ns, key)))
            .key("SK", AttributeValue::S(SORT_KEY.to_string()))
            .expression_attribute_names("#data", "data")
            .expression_attribute_names("#ns", "namespace")
            .expression_attribute_names("#k", "key")
            .expression_attribute_names("#u", "updatedAt")
            .expression_attribute_names("#rev", "rev")
            .expression_attribute_values(":data", value_to_attr(value))
            .expression_attribute_values(":ns", AttributeValue::S(ns.to_string()))
            .expression_attribute_values(":k", AttributeValue::S(sanitize_key(key)))
            .expression_attribute_values(
                ":u",
                AttributeValue::S(Utc::now().to_rfc3339()),
            )
            .expression_attribute_values(
                ":rev",
                AttributeValue::N((prev_rev.unwrap_or(0) + 1).to_string()),
            );

        let mut expression =
            "SET #data = :data, #ns = :ns, #k = :k, #u = :u, #rev = :rev".to_string();
        if let Some(ttl) = self.ttl_epoch() {
            expression.push_str(", #ttl = :ttl");
            request = request
                .expression_attribute_names("#ttl", "ttl")
                .expression_attribute_values(":ttl", AttributeValue::N(ttl.to_string()));
        }
        request = request.update_expression(expression);

        request = match prev_rev {
            Some(rev) => request
                .condition_expression("#rev = :prev")
                .expression_attribute_values(":prev", AttributeValue::N(rev.to_string())),
            None => request.condition_expression("attribute_not_exists(PK)"),
        };

        match tokio::time::timeout(DEFAULT_OP_TIMEOUT, request.send()).await {
            Err(_) => Err(StorageError::Unavailable(format!(
                "update_item timed out after {DEFAULT_OP_TIMEOUT:?}"
            ))),
            Ok(Err(e)) if is_conditional_failure(&e) => Ok(false),
            Ok(Err(e)) => Err(StorageError::Unavailable(format!(
                "update_item failed: {e}"
            ))),
            Ok(Ok(_)) => Ok(true),
        }
    }

    async fn conditional_delete(
        &self,
        ns: Namespace,
        key: &str,
        prev_rev: i64,
    ) -> StorageResult<bool> {
        let send = self
            .client
            .delete_item()
            .table_name(&self.table_name)
            .key("PK", AttributeValue::S(Self::partition_key(ns, key)))
            .key("SK", AttributeValue::S(SORT_KEY.to_string()))
            .condition_expression("#rev = :prev")
            .expression_attribute_names("#rev", "rev")
            .expression_attribute_values(":prev", AttributeValue::N(prev_rev.to_string()))
            .send();
        match tokio::time::timeout(DEFAULT_OP_TIMEOUT, send).await {
            Err(_) => Err(StorageError::Unavailable(format!(
                "delete_item timed out after {DEFAULT_OP_TIMEOUT:?}"
            ))),
            Ok(Err(e)) if is_conditional_failure(&e) => Ok(false),
            Ok(Err(e)) => Err(StorageError::Unavailable(format!(
                "delete_item failed: {e}"
            ))),
            Ok(Ok(_)) => Ok(true),
        }
    }
}

#[async_trait]
impl StorageBackend for DocumentDbBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Dynamodb
    }

    fn is_distributed(&self) -> bool {
        true
    }

    async fn initialize(&self) -> StorageResult<()> {
        let health = self.health_check().await;
        if health.ok {
            debug!(table = %self.table_name, "Document database backend initialized");
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
        Ok(self.fetch_item(ns, key).await?.map(|(data, _)| data))
    }

    async fn set(&self, ns: Namespace, key: &str, value: &Value) -> StorageResult<()> {
        let mut request = self
            .client
            .put_item()
            .table_name(&self.table_name)
            .item("PK", AttributeValue::S(Self::partition_key(ns, key)))
            .item("SK", AttributeValue::S(SORT_KEY.to_string()))
            .item("namespace", AttributeValue::S(ns.to_string()))
            .item("key", AttributeValue::S(sanitize_key(key)))
            .item("data", value_to_attr(value))
            .item("updatedAt", AttributeValue::S(Utc::now().to_rfc3339()))
            .item("rev", AttributeValue::N("1".to_string()));
        if let Some(ttl) = self.ttl_epoch() {
            request = request.item("ttl", AttributeValue::N(ttl.to_string()));
        }
        bounded(DEFAULT_OP_TIMEOUT, "put_item", request.send()).await?;
        Ok(())
    }

    async fn delete(&self, ns: Namespace, key: &str) -> StorageResult<bool> {
        let send = self
            .client
            .delete_item()
            .table_name(&self.table_name)
            .key("PK", AttributeValue::S(Self::partition_key(ns, key)))
            .key("SK", AttributeValue::S(SORT_KEY.to_string()))
            .return_values(ReturnValue::AllOld)
            .send();
        let output = bounded(DEFAULT_OP_TIMEOUT, "delete_item", send).await?;
        Ok(output.attributes().is_some_and(|attrs| !attrs.is_empty()))
    }

    async fn list(&self, ns: Namespace, prefix: Option<&str>) -> StorageResult<Vec<String>> {
        let prefix = prefix.map(sanitize_key);
        let mut keys = Vec::new();
        let mut start_key: Option<HashMap<String, AttributeValue>> = None;
        loop {
            let mut request = self
                .client
                .query()
                .table_name(&self.table_name)
                .index_name(&self.index_name)
                .expression_attribute_names("#ns", "namespace")
                .expression_attribute_names("#k", "key")
                .expression_attribute_names("#ttl", "ttl")
                .expression_attribute_values(":ns", AttributeValue::S(ns.to_string()))
                .projection_expression("#k, #ttl");
            request = match &prefix {
                Some(p) => request
                    .key_condition_expression("#ns = :ns AND begins_with(#k, :prefix)")
                    .expression_attribute_values(":prefix", AttributeValue::S(p.clone())),
                None => request.key_condition_expression("#ns = :ns"),
            };
            if let Some(start) = start_key.take() {
                request = request.set_exclusive_start_key(Some(start));
            }

            let output = bounded(DEFAULT_OP_TIMEOUT, "query", request.send()).await?;
            for item in output.items() {
                if item_expired(item) {
                    continue;
                }
                if let Some(key) = item.get("key").and_then(|a| a.as_s().ok()) {
                    keys.push(key.clone());
                }
            }
            match output.last_evaluated_key() {
                Some(last) if !last.is_empty() => start_key = Some(last.clone()),
                _ => break,
            }
        }
        Ok(keys)
    }

    async fn update(
        &self,
        ns: Namespace,
        key: &str,
        f: Updater,
    ) -> StorageResult<Option<Value>> {
        for attempt in 0..MAX_UPDATE_ATTEMPTS {
            let current = self.fetch_item(ns, key).await?;
            let (current_value, prev_rev) = match &current {
                Some((value, rev)) => (Some(value.clone()), Some(*rev)),
                None => (None, None),
            };
            let next = f(current_value);
            let wrote = match (&next, prev_rev) {
                (Some(value), rev) => self.conditional_write(ns, key, value, rev).await?,
                (None, Some(rev)) => self.conditional_delete(ns, key, rev).await?,
                (None, None) => true,
            };
            if wrote {
                return Ok(next);
            }
            // Lost the race; back off briefly and re-read.
            tokio::time::sleep(Duration::from_millis(10 * (attempt as u64 + 1))).await;
        }
        Err(StorageError::Unavailable(format!(
            "update of {}/{key} still contended after {MAX_UPDATE_ATTEMPTS} attempts",
            ns.as_str()
        )))
    }

    async fn append(&self, _ns: Namespace, _key: &str, _line: &str) -> StorageResult<()> {
        Err(StorageError::Unsupported {
            backend: BackendKind::Dynamodb.as_str(),
            operation: "append",
        })
    }

    async fn read_lines(&self, _ns: Namespace, _key: &str) -> StorageResult<LineStream> {
        Err(StorageError::Unsupported {
            backend: BackendKind::Dynamodb.as_str(),
            operation: "read_lines",
        })
    }

    async fn health_check(&self) -> HealthStatus {
        let start = Instant::now();
        let send = self
            .client
            .describe_table()
            .table_name(&self.table_name)
            .send();
        match tokio::time::timeout(HEALTH_TIMEOUT, send).await {
            Ok(Ok(_)) => HealthStatus::healthy(start.elapsed().as_millis() as u64),
            Ok(Err(e)) => HealthStatus::unhealthy(
                start.elapsed().as_millis() as u64,
                format!("describe_table failed: {e}"),
            ),
            Err(_) => HealthStatus::unhealthy(
                start.elapsed().as_millis() as u64,
                format!("probe timed out after {HEALTH_TIMEOUT:?}"),
            ),
        }
    }
}

fn is_conditional_failure<E, R>(err: &SdkError<E, R>) -> bool
where
    E: ProvideErrorMetadata,
{
    matches!(
        err.as_service_error().and_then(|e| e.code()),
        Some("ConditionalCheckFailedException")
    )
}

/// Whether an item's `ttl` attribute has already elapsed.
fn item_expired(item: &HashMap<String, AttributeValue>) -> bool {
    item.get("ttl")
        .and_then(|a| a.as_n().ok())
        .and_then(|n| n.parse::<i64>().ok())
        .is_some_and(|ttl| ttl <= Utc::now().timestamp())
}

fn value_to_attr(value: &Value) -> AttributeValue {
    match value {
        Value::Null => AttributeValue::Null(true),
        Value::Bool(b) => AttributeValue::Bool(*b),
        Value::Number(n) => AttributeValue::N(n.to_string()),
        Value::String(s) => AttributeValue::S(s.clone()),
        Value::Array(items) => {
            AttributeValue::L(items.iter().map(value_to_attr).collect())
        }
        Value::Object(map) => AttributeValue::M(
            map.iter()
                .map(|(k, v)| (k.clone(), value_to_attr(v)))
                .collect(),
        ),
    }
}

fn attr_to_value(attr: &AttributeValue) -> StorageResult<Value> {
    match attr {
        AttributeValue::Null(_) => Ok(Value::Null),
        AttributeValue::Bool(b) => Ok(Value::Bool(*b)),
        AttributeValue::N(n) => n.parse::<serde_json::Number>().map(Value::Number).map_err(
            |_| StorageError::Corruption(format!("unparseable number attribute: {n}")),
        ),
        AttributeValue::S(s) => Ok(Value::String(s.clone())),
        AttributeValue::L(items) => items
            .iter()
            .map(attr_to_value)
            .collect::<StorageResult<Vec<_>>>()
            .map(Value::Array),
        AttributeValue::M(map) => map
            .iter()
            .map(|(k, v)| attr_to_value(v).map(|v| (k.clone(), v)))
            .collect::<StorageResult<serde_json::Map<_, _>>>()
            .map(Value::Object),
        other => Err(StorageError::Corruption(format!(
            "unsupported attribute type: {other:?}"
        ))),
    }
}
