//! Central server API client.
//!
//! The sync engine and conflict resolver talk to the server through the
//! `ServerApi` trait so tests drive them against in-memory fakes. The
//! production implementation is a thin `reqwest` client over the
//! `/api/v1/{collection}` REST shape.

use crate::config::SyncCoreConfig;
use crate::error::SyncError;
use crate::models::queue_item::EntityKind;
use async_trait::async_trait;
use reqwest::{header, Client, Response, StatusCode};
use serde::Serialize;
use serde_json::Value;

/// Header carrying the stable request id derived from the queue item id,
/// letting the server deduplicate replayed applies.
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// Resolution metadata reported to the server after a conflict is resolved.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionReport {
    pub conflict_id: String,
    pub entity_kind: EntityKind,
    pub entity_id: String,
    pub strategy: String,
    pub resolved_by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub justification: Option<String>,
    pub final_version: i64,
}

/// Server operations used by the sync pipeline.
#[async_trait]
pub trait ServerApi: Send + Sync {
    /// Fetch an entity record; `None` on 404.
    async fn get_record(&self, kind: EntityKind, id: &str) -> Result<Option<Value>, SyncError>;

    /// Create an entity record.
    async fn create_record(
        &self,
        kind: EntityKind,
        request_id: &str,
        payload: &Value,
    ) -> Result<Value, SyncError>;

    /// Replace an entity record.
    async fn update_record(
        &self,
        kind: EntityKind,
        id: &str,
        request_id: &str,
        payload: &Value,
    ) -> Result<Value, SyncError>;

    /// Delete an entity record.
    async fn delete_record(
        &self,
        kind: EntityKind,
        id: &str,
        request_id: &str,
    ) -> Result<(), SyncError>;

    /// Report an accepted conflict resolution.
    async fn report_resolution(&self, report: &ResolutionReport) -> Result<(), SyncError>;
}

/// HTTP implementation of `ServerApi`.
#[derive(Debug, Clone)]
pub struct HttpServerApi {
    client: Client,
    base_url: String,
}

impl HttpServerApi {
    /// Build a client from the core configuration.
    pub fn new(config: &SyncCoreConfig) -> Result<Self, SyncError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| SyncError::internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Build the URL for an API path.
    fn api_url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base_url, path)
    }

    /// Map a non-success response to the error taxonomy.
    async fn error_for(response: Response, endpoint: &str) -> SyncError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let message = if body.is_empty() {
            format!("HTTP {}", status)
        } else {
            format!("HTTP {}: {}", status, body)
        };
        SyncError::server_api_full(message, status, endpoint)
    }

    /// Parse a JSON body, mapping parse failures to server API errors.
    async fn parse_json(response: Response, endpoint: &str) -> Result<Value, SyncError> {
        response
            .json::<Value>()
            .await
            .map_err(|e| SyncError::server_api_full(format!("Invalid JSON body: {}", e), 0, endpoint))
    }
}

#[async_trait]
impl ServerApi for HttpServerApi {
    async fn get_record(&self, kind: EntityKind, id: &str) -> Result<Option<Value>, SyncError> {
        let endpoint = format!("/{}/{}", kind.collection(), id);
        let response = self.client.get(self.api_url(&endpoint)).send().await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(Self::parse_json(response, &endpoint).await?)),
            _ => Err(Self::error_for(response, &endpoint).await),
        }
    }

    async fn create_record(
        &self,
        kind: EntityKind,
        request_id: &str,
        payload: &Value,
    ) -> Result<Value, SyncError> {
        let endpoint = format!("/{}", kind.collection());
        let response = self
            .client
            .post(self.api_url(&endpoint))
            .header(IDEMPOTENCY_KEY_HEADER, request_id)
            .json(payload)
            .send()
            .await?;

        if response.status().is_success() {
            Self::parse_json(response, &endpoint).await
        } else {
            Err(Self::error_for(response, &endpoint).await)
        }
    }

    async fn update_record(
        &self,
        kind: EntityKind,
        id: &str,
        request_id: &str,
        payload: &Value,
    ) -> Result<Value, SyncError> {
        let endpoint = format!("/{}/{}", kind.collection(), id);
        let response = self
            .client
            .put(self.api_url(&endpoint))
            .header(IDEMPOTENCY_KEY_HEADER, request_id)
            .json(payload)
            .send()
            .await?;

        if response.status().is_success() {
            Self::parse_json(response, &endpoint).await
        } else {
            Err(Self::error_for(response, &endpoint).await)
        }
    }

    async fn delete_record(
        &self,
        kind: EntityKind,
        id: &str,
        request_id: &str,
    ) -> Result<(), SyncError> {
        let endpoint = format!("/{}/{}", kind.collection(), id);
        let response = self
            .client
            .delete(self.api_url(&endpoint))
            .header(IDEMPOTENCY_KEY_HEADER, request_id)
            .send()
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::error_for(response, &endpoint).await)
        }
    }

    async fn report_resolution(&self, report: &ResolutionReport) -> Result<(), SyncError> {
        let endpoint = "/sync/conflicts/resolve";
        let response = self
            .client
            .post(self.api_url(endpoint))
            .json(report)
            .send()
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::error_for(response, endpoint).await)
        }
    }
}

/// Read the integer `version` field of a server record (0 when absent).
pub fn record_version(record: &Value) -> i64 {
    record.get("version").and_then(Value::as_i64).unwrap_or(0)
}

/// Read the `updatedAt` field of a record as Unix milliseconds.
///
/// Returns `None` when the field is absent or not a parsable ISO-8601
/// timestamp.
pub fn record_updated_at_ms(record: &Value) -> Option<i64> {
    record
        .get("updatedAt")
        .and_then(Value::as_str)
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.timestamp_millis())
}

/// Format a Unix-millisecond timestamp as ISO-8601 UTC for record fields.
pub fn format_updated_at(now_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(now_ms)
        .unwrap_or_default()
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
