//! DynamoDB Storage
//!
//! Managed NoSQL backend over the DynamoDB JSON 1.0 API. Expiry is stored in
//! `expires_at` (epoch seconds, filtered on read) and mirrored into the
//! table's native TTL attribute. Refresh locks are items in the same table
//! taken with a conditional put and released with a conditional delete.

pub mod signing;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use self::signing::{sign_request, AwsCredentials};
use super::{is_lock_key, RecordCodec, StorageAdapter};
use crate::core::{HttpRequest, HttpTransport};
use crate::error::{ConfigurationError, TokenCacheError, TokenCacheResult};
use crate::types::{LockRecord, StorageConfig, TokenRecord};

const BACKEND: &str = "dynamodb";
const TARGET_PREFIX: &str = "DynamoDB_20120810";
const CONTENT_TYPE: &str = "application/x-amz-json-1.0";
const DEFAULT_REGION: &str = "us-east-1";

const TOKEN_DATA: &str = "token_data";
const EXPIRES_AT: &str = "expires_at";
const OWNER: &str = "owner";

/// DynamoDB table settings.
#[derive(Clone, Debug)]
pub struct DynamoDbSettings {
    /// Table name.
    pub table_name: String,
    /// AWS region.
    pub region: String,
    /// Service endpoint.
    pub endpoint: Url,
    /// Partition key attribute.
    pub hash_key: String,
    /// Native TTL attribute.
    pub ttl_attribute: String,
}

impl DynamoDbSettings {
    /// Settings from storage configuration. Region falls back to
    /// `AWS_REGION` / `AWS_DEFAULT_REGION`, then `us-east-1`.
    pub fn from_storage_config(storage: &StorageConfig) -> TokenCacheResult<Self> {
        let table_name = storage.table_name.clone().ok_or_else(|| {
            TokenCacheError::Configuration(ConfigurationError::MissingTableName {
                adapter: BACKEND.to_string(),
            })
        })?;

        let region = storage
            .region
            .clone()
            .or_else(|| std::env::var("AWS_REGION").ok())
            .or_else(|| std::env::var("AWS_DEFAULT_REGION").ok())
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| DEFAULT_REGION.to_string());

        let endpoint = storage
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://dynamodb.{}.amazonaws.com/", region));
        let endpoint = Url::parse(&endpoint).map_err(|_| {
            TokenCacheError::Configuration(ConfigurationError::InvalidEndpoint { url: endpoint })
        })?;

        Ok(Self {
            table_name,
            region,
            endpoint,
            hash_key: storage.hash_key.clone(),
            ttl_attribute: storage.ttl_attribute.clone(),
        })
    }
}

/// Service fault returned by DynamoDB.
#[derive(Debug)]
enum DynamoFault {
    Service { kind: String, message: String },
    Transport(TokenCacheError),
}

impl DynamoFault {
    fn is_conditional_check_failed(&self) -> bool {
        matches!(self, Self::Service { kind, .. } if kind == "ConditionalCheckFailedException")
    }

    fn into_error(self, table: &str) -> TokenCacheError {
        let (kind, message) = match self {
            Self::Transport(error) => return error,
            Self::Service { kind, message } => (kind, message),
        };

        match kind.as_str() {
            "ResourceNotFoundException" => {
                TokenCacheError::Configuration(ConfigurationError::InvalidSchema {
                    message: format!("table '{}' does not exist: {}", table, message),
                })
            }
            "ValidationException" => {
                TokenCacheError::Configuration(ConfigurationError::InvalidSchema {
                    message: format!("request rejected for table '{}': {}", table, message),
                })
            }
            "UnrecognizedClientException"
            | "InvalidSignatureException"
            | "MissingAuthenticationTokenException"
            | "AccessDeniedException" => TokenCacheError::invalid_config(format!(
                "dynamodb rejected the configured credentials ({}): {}",
                kind, message
            )),
            _ => TokenCacheError::backend(BACKEND, format!("{}: {}", kind, message)),
        }
    }
}

/// Fault name is the part of `__type` after `#`.
fn fault_kind(body: &Value) -> String {
    body.get("__type")
        .and_then(Value::as_str)
        .map(|t| t.rsplit('#').next().unwrap_or(t).to_string())
        .unwrap_or_else(|| "UnknownError".to_string())
}

fn fault_message(body: &Value) -> String {
    body.get("message")
        .or_else(|| body.get("Message"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string()
}

fn string_attr(value: &str) -> Value {
    json!({ "S": value })
}

fn number_attr(value: i64) -> Value {
    json!({ "N": value.to_string() })
}

fn read_string<'a>(item: &'a Value, name: &str) -> Option<&'a str> {
    item.get(name)?.get("S")?.as_str()
}

fn read_number(item: &Value, name: &str) -> Option<i64> {
    item.get(name)?.get("N")?.as_str()?.parse().ok()
}

/// DynamoDB storage adapter.
pub struct DynamoDbStorageAdapter {
    settings: DynamoDbSettings,
    credentials: AwsCredentials,
    transport: Arc<dyn HttpTransport>,
    codec: RecordCodec,
}

impl DynamoDbStorageAdapter {
    /// Create an adapter without contacting the service.
    pub fn new(
        settings: DynamoDbSettings,
        credentials: AwsCredentials,
        transport: Arc<dyn HttpTransport>,
        codec: RecordCodec,
    ) -> Self {
        Self {
            settings,
            credentials,
            transport,
            codec,
        }
    }

    /// Create an adapter and validate the table layout.
    pub async fn connect(
        settings: DynamoDbSettings,
        credentials: AwsCredentials,
        transport: Arc<dyn HttpTransport>,
        codec: RecordCodec,
    ) -> TokenCacheResult<Self> {
        let adapter = Self::new(settings, credentials, transport, codec);
        adapter.validate_table().await?;
        info!(table = %adapter.settings.table_name, region = %adapter.settings.region, "connected dynamodb token storage");
        Ok(adapter)
    }

    /// Table settings.
    pub fn settings(&self) -> &DynamoDbSettings {
        &self.settings
    }

    /// Check the partition key and native TTL configuration.
    ///
    /// A missing table or a mismatched key schema is a configuration error;
    /// a disabled TTL only warns, since reads filter on `expires_at` anyway.
    pub async fn validate_table(&self) -> TokenCacheResult<()> {
        let table = self.table_payload();
        let description = self.request("DescribeTable", &table).await?;

        let hash_key = description
            .pointer("/Table/KeySchema")
            .and_then(Value::as_array)
            .and_then(|schema| {
                schema
                    .iter()
                    .find(|k| k.get("KeyType").and_then(Value::as_str) == Some("HASH"))
            })
            .and_then(|k| k.get("AttributeName"))
            .and_then(Value::as_str);

        if hash_key != Some(self.settings.hash_key.as_str()) {
            return Err(TokenCacheError::Configuration(
                ConfigurationError::InvalidSchema {
                    message: format!(
                        "table '{}' must use '{}' as its partition key (found {:?})",
                        self.settings.table_name, self.settings.hash_key, hash_key
                    ),
                },
            ));
        }

        let ttl = self.request("DescribeTimeToLive", &table).await?;
        let status = ttl
            .pointer("/TimeToLiveDescription/TimeToLiveStatus")
            .and_then(Value::as_str)
            .unwrap_or("DISABLED");
        let attribute = ttl
            .pointer("/TimeToLiveDescription/AttributeName")
            .and_then(Value::as_str);

        let enabled = matches!(status, "ENABLED" | "ENABLING")
            && attribute == Some(self.settings.ttl_attribute.as_str());
        if !enabled {
            warn!(
                table = %self.settings.table_name,
                ttl_attribute = %self.settings.ttl_attribute,
                status,
                "native TTL is not enabled on the token table; expired items will remain until deleted"
            );
        }

        Ok(())
    }

    fn table_payload(&self) -> Value {
        json!({ "TableName": self.settings.table_name })
    }

    fn key_payload(&self, key: &str) -> Value {
        let mut attributes = Map::new();
        attributes.insert(self.settings.hash_key.clone(), string_attr(key));
        Value::Object(attributes)
    }

    fn item(&self, key: &str, fields: Vec<(&str, Value)>, expires_at: i64) -> Value {
        let mut item = Map::new();
        item.insert(self.settings.hash_key.clone(), string_attr(key));
        for (name, value) in fields {
            item.insert(name.to_string(), value);
        }
        item.insert(EXPIRES_AT.to_string(), number_attr(expires_at));
        item.insert(self.settings.ttl_attribute.clone(), number_attr(expires_at));
        Value::Object(item)
    }

    async fn call(&self, operation: &str, payload: &Value) -> Result<Value, DynamoFault> {
        let body = payload.to_string();

        let host = match (self.settings.endpoint.host_str(), self.settings.endpoint.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => String::new(),
        };

        let mut headers: HashMap<String, String> = HashMap::new();
        headers.insert("host".to_string(), host);
        headers.insert("content-type".to_string(), CONTENT_TYPE.to_string());
        headers.insert(
            "x-amz-target".to_string(),
            format!("{}.{}", TARGET_PREFIX, operation),
        );
        sign_request(
            &mut headers,
            &body,
            &self.credentials,
            &self.settings.region,
            &Utc::now(),
        );

        let mut request = HttpRequest::post(self.settings.endpoint.as_str(), body);
        request.headers = headers;

        let response = self
            .transport
            .send(request)
            .await
            .map_err(DynamoFault::Transport)?;

        let parsed: Value = if response.body.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(&response.body).map_err(|e| {
                DynamoFault::Transport(TokenCacheError::backend(
                    BACKEND,
                    format!("invalid {} response: {}", operation, e),
                ))
            })?
        };

        if response.is_success() {
            Ok(parsed)
        } else {
            Err(DynamoFault::Service {
                kind: fault_kind(&parsed),
                message: fault_message(&parsed),
            })
        }
    }

    async fn request(&self, operation: &str, payload: &Value) -> TokenCacheResult<Value> {
        self.call(operation, payload)
            .await
            .map_err(|fault| fault.into_error(&self.settings.table_name))
    }

    async fn fetch_live(&self, key: &str) -> TokenCacheResult<Option<String>> {
        let payload = json!({
            "TableName": self.settings.table_name,
            "Key": self.key_payload(key),
            "ConsistentRead": true,
        });
        let response = self.request("GetItem", &payload).await?;

        let Some(item) = response.get("Item") else {
            return Ok(None);
        };

        let now = Utc::now().timestamp();
        match read_number(item, EXPIRES_AT) {
            Some(expires_at) if expires_at > now => {
                Ok(read_string(item, TOKEN_DATA).map(str::to_string))
            }
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl StorageAdapter for DynamoDbStorageAdapter {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn store(
        &self,
        key: &str,
        record: &TokenRecord,
        ttl_seconds: i64,
    ) -> TokenCacheResult<bool> {
        let encoded = self.codec.encode(record)?;
        let now = Utc::now().timestamp();
        // A non-positive TTL is written already expired.
        let expires_at = if ttl_seconds <= 0 { now - 1 } else { now.saturating_add(ttl_seconds) };

        let payload = json!({
            "TableName": self.settings.table_name,
            "Item": self.item(key, vec![(TOKEN_DATA, string_attr(&encoded))], expires_at),
        });
        self.request("PutItem", &payload).await?;

        debug!(key = %key, ttl_seconds, "stored token in dynamodb");
        Ok(true)
    }

    async fn retrieve(&self, key: &str) -> TokenCacheResult<Option<TokenRecord>> {
        match self.fetch_live(key).await? {
            Some(raw) => self.codec.decode(&raw),
            None => Ok(None),
        }
    }

    async fn exists(&self, key: &str) -> TokenCacheResult<bool> {
        Ok(self.fetch_live(key).await?.is_some())
    }

    async fn delete(&self, key: &str) -> TokenCacheResult<bool> {
        let payload = json!({
            "TableName": self.settings.table_name,
            "Key": self.key_payload(key),
            "ReturnValues": "ALL_OLD",
        });
        let response = self.request("DeleteItem", &payload).await?;
        Ok(response.get("Attributes").is_some())
    }

    async fn clear_all(&self, prefix: &str) -> TokenCacheResult<u64> {
        let mut removed = 0;
        let mut start_key: Option<Value> = None;

        loop {
            let mut payload = json!({
                "TableName": self.settings.table_name,
                "FilterExpression": "begins_with(#k, :prefix) AND attribute_not_exists(#o)",
                "ProjectionExpression": "#k",
                "ExpressionAttributeNames": { "#k": self.settings.hash_key, "#o": OWNER },
                "ExpressionAttributeValues": { ":prefix": string_attr(prefix) },
            });
            if let Some(start) = start_key.take() {
                payload["ExclusiveStartKey"] = start;
            }

            let page = self.request("Scan", &payload).await?;
            let keys: Vec<String> = page
                .get("Items")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|item| read_string(item, &self.settings.hash_key))
                        .filter(|key| !is_lock_key(key))
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();

            for key in keys {
                if self.delete(&key).await? {
                    removed += 1;
                }
            }

            match page.get("LastEvaluatedKey") {
                Some(last) if !last.is_null() => start_key = Some(last.clone()),
                _ => break,
            }
        }

        debug!(prefix = %prefix, removed, "cleared dynamodb token items");
        Ok(removed)
    }

    async fn healthy(&self) -> bool {
        self.call("DescribeTable", &self.table_payload()).await.is_ok()
    }

    fn supports_locking(&self) -> bool {
        true
    }

    async fn acquire_lock(&self, key: &str, ttl: Duration) -> TokenCacheResult<Option<LockRecord>> {
        let lock = LockRecord::new(key, ttl);
        let now = Utc::now().timestamp();
        let ttl_secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
        let expires_at = now.saturating_add(i64::try_from(ttl_secs).unwrap_or(i64::MAX));

        let payload = json!({
            "TableName": self.settings.table_name,
            "Item": self.item(key, vec![(OWNER, string_attr(&lock.owner))], expires_at),
            "ConditionExpression": "attribute_not_exists(#k) OR #e < :now",
            "ExpressionAttributeNames": { "#k": self.settings.hash_key, "#e": EXPIRES_AT },
            "ExpressionAttributeValues": { ":now": number_attr(now) },
        });

        match self.call("PutItem", &payload).await {
            Ok(_) => Ok(Some(lock)),
            Err(fault) if fault.is_conditional_check_failed() => Ok(None),
            Err(fault) => Err(fault.into_error(&self.settings.table_name)),
        }
    }

    async fn release_lock(&self, lock: &LockRecord) -> TokenCacheResult<bool> {
        let payload = json!({
            "TableName": self.settings.table_name,
            "Key": self.key_payload(&lock.lock_key),
            "ConditionExpression": "#o = :owner",
            "ExpressionAttributeNames": { "#o": OWNER },
            "ExpressionAttributeValues": { ":owner": string_attr(&lock.owner) },
        });

        match self.call("DeleteItem", &payload).await {
            Ok(_) => Ok(true),
            Err(fault) if fault.is_conditional_check_failed() => Ok(false),
            Err(fault) => Err(fault.into_error(&self.settings.table_name)),
        }
    }
}
