//! Conflict and audit trail models.

use crate::error::SyncError;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// How a conflict was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictType {
    Timestamp,
    FieldLevel,
    ConcurrentEdit,
}

impl From<&str> for ConflictType {
    fn from(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "FIELD_LEVEL" => Self::FieldLevel,
            "CONCURRENT_EDIT" => Self::ConcurrentEdit,
            _ => Self::Timestamp,
        }
    }
}

impl std::fmt::Display for ConflictType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timestamp => write!(f, "TIMESTAMP"),
            Self::FieldLevel => write!(f, "FIELD_LEVEL"),
            Self::ConcurrentEdit => write!(f, "CONCURRENT_EDIT"),
        }
    }
}

/// Four-level ordinal classification driving triage order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl From<&str> for ConflictSeverity {
    fn from(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "CRITICAL" => Self::Critical,
            "HIGH" => Self::High,
            "MEDIUM" => Self::Medium,
            _ => Self::Low,
        }
    }
}

impl std::fmt::Display for ConflictSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Critical => write!(f, "CRITICAL"),
            Self::High => write!(f, "HIGH"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::Low => write!(f, "LOW"),
        }
    }
}

impl ConflictSeverity {
    /// Numeric rank for SQL ordering (higher sorts first).
    pub fn rank(&self) -> i64 {
        match self {
            Self::Critical => 3,
            Self::High => 2,
            Self::Medium => 1,
            Self::Low => 0,
        }
    }
}

/// Lifecycle status of a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictStatus {
    Pending,
    Resolved,
    Escalated,
}

impl From<&str> for ConflictStatus {
    fn from(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "RESOLVED" => Self::Resolved,
            "ESCALATED" => Self::Escalated,
            _ => Self::Pending,
        }
    }
}

impl std::fmt::Display for ConflictStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Resolved => write!(f, "RESOLVED"),
            Self::Escalated => write!(f, "ESCALATED"),
        }
    }
}

/// How a conflict is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionStrategy {
    LocalWins,
    ServerWins,
    Merge,
    Manual,
}

impl std::fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LocalWins => write!(f, "LOCAL_WINS"),
            Self::ServerWins => write!(f, "SERVER_WINS"),
            Self::Merge => write!(f, "MERGE"),
            Self::Manual => write!(f, "MANUAL"),
        }
    }
}

/// A detected disagreement between local and server versions of an entity.
#[derive(Debug, Clone, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    /// Conflict id (UUID).
    pub id: String,

    /// Entity kind.
    pub entity_kind: String,

    /// Entity id.
    pub entity_id: String,

    /// `TIMESTAMP`, `FIELD_LEVEL`, or `CONCURRENT_EDIT`.
    pub conflict_type: String,

    /// `LOW`, `MEDIUM`, `HIGH`, or `CRITICAL`.
    pub severity: String,

    /// Local payload at detection time, as JSON.
    pub local_version: String,

    /// Server record at detection time, as JSON.
    pub server_version: String,

    /// Critical fields that differ, as a JSON array.
    pub conflict_fields: String,

    /// When the conflict was detected (Unix millis).
    pub detected_at: i64,

    /// Worker or subsystem that detected the conflict.
    pub detected_by: String,

    /// `PENDING`, `RESOLVED`, or `ESCALATED`.
    pub status: String,

    /// Strategy used to resolve, once resolved.
    pub resolution_strategy: Option<String>,

    /// Coordinator who resolved the conflict.
    pub resolved_by: Option<String>,

    /// When the conflict was resolved (Unix millis).
    pub resolved_at: Option<i64>,

    /// Coordinator-supplied justification for the resolution.
    pub justification: Option<String>,

    /// Tombstone flag set by archiving.
    #[serde(skip_serializing)]
    pub archived: bool,
}

impl Conflict {
    pub fn conflict_type_enum(&self) -> ConflictType {
        ConflictType::from(self.conflict_type.as_str())
    }

    pub fn severity_enum(&self) -> ConflictSeverity {
        ConflictSeverity::from(self.severity.as_str())
    }

    pub fn status_enum(&self) -> ConflictStatus {
        ConflictStatus::from(self.status.as_str())
    }

    /// Parse the stored local payload.
    pub fn local_version_json(&self) -> Result<serde_json::Value, SyncError> {
        Ok(serde_json::from_str(&self.local_version)?)
    }

    /// Parse the stored server record.
    pub fn server_version_json(&self) -> Result<serde_json::Value, SyncError> {
        Ok(serde_json::from_str(&self.server_version)?)
    }

    /// Parse the conflicting field list.
    pub fn conflict_fields_parsed(&self) -> Vec<String> {
        serde_json::from_str(&self.conflict_fields).unwrap_or_default()
    }
}

/// One append-only audit trail entry for a conflict.
#[derive(Debug, Clone, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    /// Monotonic entry id within the trail.
    pub id: i64,

    /// Conflict this entry belongs to.
    pub conflict_id: String,

    /// When the entry was appended (Unix millis).
    pub timestamp: i64,

    /// Action recorded: `CONFLICT_DETECTED`, `CONFLICT_RESOLVED`,
    /// `CONFLICT_ESCALATED`, `RESOLUTION_APPLY_FAILED`.
    pub action: String,

    /// Who performed the action.
    pub performed_by: String,

    /// Opaque JSON details.
    pub details: String,
}

/// Audit action names.
pub const AUDIT_CONFLICT_DETECTED: &str = "CONFLICT_DETECTED";
pub const AUDIT_CONFLICT_RESOLVED: &str = "CONFLICT_RESOLVED";
pub const AUDIT_CONFLICT_ESCALATED: &str = "CONFLICT_ESCALATED";
pub const AUDIT_RESOLUTION_APPLY_FAILED: &str = "RESOLUTION_APPLY_FAILED";
