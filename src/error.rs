//! Error types for the sync core.
//!
//! All variants serialize to a structured JSON object so frontends embedding
//! the core can pattern-match on error kinds without string parsing.

use serde::Serialize;
use thiserror::Error;

/// Errors produced by the sync core.
#[derive(Debug, Error, Serialize)]
#[serde(tag = "type", content = "details")]
pub enum SyncError {
    /// Database operation failed.
    #[error("Database error: {message}")]
    Database {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        operation: Option<String>,
    },

    /// Network request failed (timeout, connection error). Retried with backoff.
    #[error("Network error: {message}")]
    Network { message: String },

    /// Server API request failed.
    #[error("Server API error: {message}")]
    ServerApi {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        status_code: Option<u16>,
        #[serde(skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
    },

    /// Requested resource not found.
    #[error("Not found: {resource}")]
    NotFound {
        resource: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },

    /// Insert rejected because the id already exists.
    #[error("Duplicate id: {resource} {id}")]
    DuplicateId { resource: String, id: String },

    /// Compare-and-set lost against a concurrent modification.
    /// The caller retries with a fresh read.
    #[error("Stale version: {resource} {id}")]
    StaleVersion { resource: String, id: String },

    /// Invalid input rejected at the API boundary. Never retried.
    #[error("Invalid input: {message}")]
    InvalidInput {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        field: Option<String>,
    },

    /// Operation rejected because of the target's current state
    /// (e.g. resolving an already-resolved conflict).
    #[error("Conflict: {message}")]
    Conflict {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        conflict_id: Option<String>,
    },

    /// Applying a conflict resolution to the server failed; the conflict
    /// remains pending and a failed audit entry has been appended.
    #[error("Resolution apply failed: {message}")]
    ResolutionApplyFailed { message: String, conflict_id: String },

    /// The server already applied the mutation that the caller tried to
    /// withdraw (rollback raced a successful sync).
    #[error("Already applied: {message}")]
    AlreadyApplied { message: String },

    /// Sync pipeline failure outside the other categories.
    #[error("Sync error: {message}")]
    Sync {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        item_id: Option<String>,
    },

    /// Internal invariant violation. Logged, the enclosing operation fails,
    /// the process continues.
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl SyncError {
    /// Create a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
            operation: None,
        }
    }

    /// Create a database error with operation context.
    pub fn database_with_op(message: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
            operation: Some(operation.into()),
        }
    }

    /// Create a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create a server API error.
    pub fn server_api(message: impl Into<String>) -> Self {
        Self::ServerApi {
            message: message.into(),
            status_code: None,
            endpoint: None,
        }
    }

    /// Create a server API error with status code and endpoint.
    pub fn server_api_full(
        message: impl Into<String>,
        status_code: u16,
        endpoint: impl Into<String>,
    ) -> Self {
        Self::ServerApi {
            message: message.into(),
            status_code: Some(status_code),
            endpoint: Some(endpoint.into()),
        }
    }

    /// Create a not found error.
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: None,
        }
    }

    /// Create a not found error with ID.
    pub fn not_found_with_id(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: Some(id.into()),
        }
    }

    /// Create a duplicate id error.
    pub fn duplicate_id(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Self::DuplicateId {
            resource: resource.into(),
            id: id.into(),
        }
    }

    /// Create a stale version error.
    pub fn stale_version(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Self::StaleVersion {
            resource: resource.into(),
            id: id.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
            field: None,
        }
    }

    /// Create an invalid input error with field name.
    pub fn invalid_input_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a conflict error.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
            conflict_id: None,
        }
    }

    /// Create a conflict error referencing a conflict record.
    pub fn conflict_with_id(message: impl Into<String>, conflict_id: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
            conflict_id: Some(conflict_id.into()),
        }
    }

    /// Create a resolution apply failure.
    pub fn resolution_apply_failed(
        message: impl Into<String>,
        conflict_id: impl Into<String>,
    ) -> Self {
        Self::ResolutionApplyFailed {
            message: message.into(),
            conflict_id: conflict_id.into(),
        }
    }

    /// Create an already applied error.
    pub fn already_applied(message: impl Into<String>) -> Self {
        Self::AlreadyApplied {
            message: message.into(),
        }
    }

    /// Create a sync error.
    pub fn sync(message: impl Into<String>) -> Self {
        Self::Sync {
            message: message.into(),
            item_id: None,
        }
    }

    /// Create a sync error with the queue item id.
    pub fn sync_with_item(message: impl Into<String>, item_id: impl Into<String>) -> Self {
        Self::Sync {
            message: message.into(),
            item_id: Some(item_id.into()),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether the failed operation should be retried with backoff.
    ///
    /// Network errors and server 5xx/429 responses are transient; everything
    /// else either routes elsewhere (version skew) or surfaces immediately.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. } => true,
            Self::ServerApi { status_code, .. } => match status_code {
                Some(code) => *code >= 500 || *code == 429,
                None => true,
            },
            _ => false,
        }
    }

    /// Whether this is a server response indicating version skew, which
    /// routes into the conflict store instead of the retry path.
    pub fn is_version_conflict(&self) -> bool {
        matches!(
            self,
            Self::ServerApi {
                status_code: Some(409) | Some(412),
                ..
            }
        )
    }
}

// Conversions from common error types

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        Self::database(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::network("Request timed out")
        } else if err.is_connect() {
            Self::network("Failed to connect to server")
        } else if err.is_status() {
            Self::server_api(format!("HTTP error: {}", err))
        } else {
            Self::network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::internal(format!("JSON error: {}", err))
    }
}
