//! Queue item model: one durable pending local mutation.

use crate::error::SyncError;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Kind of entity a mutation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityKind {
    Assessment,
    Response,
    Incident,
    Entity,
    Media,
}

impl From<&str> for EntityKind {
    fn from(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "ASSESSMENT" => Self::Assessment,
            "RESPONSE" => Self::Response,
            "INCIDENT" => Self::Incident,
            "MEDIA" => Self::Media,
            _ => Self::Entity,
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Assessment => write!(f, "ASSESSMENT"),
            Self::Response => write!(f, "RESPONSE"),
            Self::Incident => write!(f, "INCIDENT"),
            Self::Entity => write!(f, "ENTITY"),
            Self::Media => write!(f, "MEDIA"),
        }
    }
}

impl EntityKind {
    /// All kinds, in a stable order.
    pub const ALL: [EntityKind; 5] = [
        Self::Assessment,
        Self::Response,
        Self::Incident,
        Self::Entity,
        Self::Media,
    ];

    /// REST collection segment for this kind.
    pub fn collection(&self) -> &'static str {
        match self {
            Self::Assessment => "assessments",
            Self::Response => "responses",
            Self::Incident => "incidents",
            Self::Entity => "entities",
            Self::Media => "media",
        }
    }

    /// Fields compared during conflict detection for this kind.
    pub fn critical_fields(&self) -> &'static [&'static str] {
        match self {
            Self::Assessment => &[
                "status",
                "priority",
                "assignedTo",
                "notes",
                "score",
                "riskLevel",
                "recommendations",
                "checklist",
            ],
            Self::Response => &[
                "status",
                "priority",
                "assignedTo",
                "notes",
                "responseType",
                "resources",
                "timeline",
                "approvalStatus",
            ],
            Self::Incident => &[
                "status",
                "priority",
                "assignedTo",
                "notes",
                "severity",
                "location",
                "casualties",
                "resources",
            ],
            Self::Entity => &[
                "status",
                "priority",
                "assignedTo",
                "notes",
                "entityData",
                "metadata",
            ],
            // Media records have no dedicated critical-field set; the common
            // core applies.
            Self::Media => &["status", "priority", "assignedTo", "notes"],
        }
    }
}

/// Kind of mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    Create,
    Update,
    Delete,
}

impl From<&str> for ActionType {
    fn from(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "CREATE" => Self::Create,
            "DELETE" => Self::Delete,
            _ => Self::Update,
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => write!(f, "CREATE"),
            Self::Update => write!(f, "UPDATE"),
            Self::Delete => write!(f, "DELETE"),
        }
    }
}

/// Priority label derived from the numeric score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PriorityLabel {
    Low,
    Normal,
    High,
    Critical,
}

impl PriorityLabel {
    /// Derive the label from a clamped score.
    pub fn from_score(score: i64) -> Self {
        if score >= 70 {
            Self::Critical
        } else if score >= 40 {
            Self::High
        } else if score >= 20 {
            Self::Normal
        } else {
            Self::Low
        }
    }
}

impl From<&str> for PriorityLabel {
    fn from(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "CRITICAL" => Self::Critical,
            "HIGH" => Self::High,
            "LOW" => Self::Low,
            _ => Self::Normal,
        }
    }
}

impl std::fmt::Display for PriorityLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Critical => write!(f, "CRITICAL"),
            Self::High => write!(f, "HIGH"),
            Self::Normal => write!(f, "NORMAL"),
            Self::Low => write!(f, "LOW"),
        }
    }
}

/// View of a queue item's lifecycle, derived rather than stored.
///
/// `Synced` never appears on a live row: a successfully applied item is
/// removed from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueItemStatus {
    Pending,
    Syncing,
    Failed,
    Blocked,
}

/// Coordinator-supplied replacement of the computed priority score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualOverride {
    pub coordinator_id: String,
    pub original_score: i64,
    pub override_score: i64,
    pub justification: String,
    pub timestamp: i64,
}

/// A durable representation of one pending local mutation.
///
/// Interop fields serialize in the shape consumers expect; scheduling
/// columns (`max_retries`, `next_attempt_at`, `lease_expires_at`,
/// `blocked_by_conflict`, `row_version`) stay internal to the store.
#[derive(Debug, Clone, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    /// Stable item id (UUID).
    pub id: String,

    /// Entity kind: `ASSESSMENT`, `RESPONSE`, `INCIDENT`, `ENTITY`, `MEDIA`.
    pub entity_kind: String,

    /// Mutation: `CREATE`, `UPDATE`, `DELETE`.
    pub action: String,

    /// Target entity id.
    pub entity_id: String,

    /// Opaque JSON payload of the mutation.
    pub payload: String,

    /// Derived label for the current score.
    pub priority_label: String,

    /// Priority score in [0, 100].
    pub priority_score: i64,

    /// Human-readable account of how the score was computed.
    pub priority_reason: String,

    /// Manual override JSON, if a coordinator replaced the computed score.
    pub manual_override: Option<String>,

    /// Estimated wall-clock time of the next sync attempt (Unix millis).
    pub estimated_sync_time: Option<i64>,

    /// When the mutation was queued (Unix millis).
    pub created_at: i64,

    /// When the last sync attempt started (Unix millis).
    pub last_attempt_at: Option<i64>,

    /// Number of sync attempts started.
    pub retry_count: i64,

    /// Error from the most recent failed attempt.
    pub last_error: Option<String>,

    /// Attempt budget for this item.
    #[serde(skip_serializing)]
    pub max_retries: i64,

    /// Earliest time the next attempt may start (backoff schedule).
    #[serde(skip_serializing)]
    pub next_attempt_at: i64,

    /// Active lease expiry; an item with a live lease is held by a worker.
    #[serde(skip_serializing)]
    pub lease_expires_at: Option<i64>,

    /// Conflict id blocking this item, if any.
    #[serde(skip_serializing)]
    pub blocked_by_conflict: Option<String>,

    /// Compare-and-set counter, bumped on every write.
    #[serde(skip_serializing)]
    pub row_version: i64,
}

impl QueueItem {
    /// Build a fresh item ready for `enqueue`.
    pub fn new(
        entity_kind: EntityKind,
        action: ActionType,
        entity_id: impl Into<String>,
        payload: &serde_json::Value,
        max_retries: i64,
        now_ms: i64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            entity_kind: entity_kind.to_string(),
            action: action.to_string(),
            entity_id: entity_id.into(),
            payload: payload.to_string(),
            priority_label: PriorityLabel::from_score(50).to_string(),
            priority_score: 50,
            priority_reason: String::new(),
            manual_override: None,
            estimated_sync_time: None,
            created_at: now_ms,
            last_attempt_at: None,
            retry_count: 0,
            last_error: None,
            max_retries,
            next_attempt_at: now_ms,
            lease_expires_at: None,
            blocked_by_conflict: None,
            row_version: 0,
        }
    }

    /// Parse the entity kind string into an enum.
    pub fn entity_kind_enum(&self) -> EntityKind {
        EntityKind::from(self.entity_kind.as_str())
    }

    /// Parse the action string into an enum.
    pub fn action_enum(&self) -> ActionType {
        ActionType::from(self.action.as_str())
    }

    /// Parse the priority label string into an enum.
    pub fn priority_label_enum(&self) -> PriorityLabel {
        PriorityLabel::from(self.priority_label.as_str())
    }

    /// Parse the payload JSON.
    pub fn payload_json(&self) -> Result<serde_json::Value, SyncError> {
        Ok(serde_json::from_str(&self.payload)?)
    }

    /// Parse the manual override JSON, if set.
    pub fn manual_override_parsed(&self) -> Option<ManualOverride> {
        self.manual_override
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
    }

    /// Whether the attempt budget is exhausted with an error on record.
    pub fn is_terminal_failed(&self) -> bool {
        self.last_error.is_some() && self.retry_count >= self.max_retries
    }

    /// Lifecycle view at `now_ms`.
    pub fn derived_status(&self, now_ms: i64) -> QueueItemStatus {
        if self.blocked_by_conflict.is_some() {
            QueueItemStatus::Blocked
        } else if self.lease_expires_at.is_some_and(|t| t > now_ms) {
            QueueItemStatus::Syncing
        } else if self.last_error.is_some() {
            QueueItemStatus::Failed
        } else {
            QueueItemStatus::Pending
        }
    }
}
