//! Optimistic update and entity UI state models.
//!
//! These are process-local projections held by the optimistic coordinator;
//! only the linked queue item is durable.

use super::queue_item::{ActionType, EntityKind};
use serde::{Deserialize, Serialize};

/// Lifecycle of an optimistic update.
///
/// `Confirmed` and `RolledBack` are terminal; a confirmed update can never
/// transition to rolled back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OptimisticStatus {
    Pending,
    Confirmed,
    Failed,
    RolledBack,
}

impl std::fmt::Display for OptimisticStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Confirmed => write!(f, "CONFIRMED"),
            Self::Failed => write!(f, "FAILED"),
            Self::RolledBack => write!(f, "ROLLED_BACK"),
        }
    }
}

/// UI-facing sync state for an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncState {
    Pending,
    Syncing,
    Synced,
    Failed,
    RolledBack,
}

/// A UI-level projection of a local mutation, linked one-to-one with a
/// queue item.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimisticUpdate {
    /// Update id (UUID).
    pub id: String,

    /// Target entity kind.
    pub entity_kind: EntityKind,

    /// Target entity id.
    pub entity_id: String,

    /// Mutation kind.
    pub operation: ActionType,

    /// Data shown optimistically in the UI.
    pub optimistic_data: serde_json::Value,

    /// Pre-mutation data, restored on rollback of an update.
    pub original_data: Option<serde_json::Value>,

    /// Current lifecycle status.
    pub status: OptimisticStatus,

    /// When the update was applied locally (Unix millis).
    pub timestamp: i64,

    /// When the update was confirmed (Unix millis); drives GC.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmed_at: Option<i64>,

    /// Sync attempts made for the linked queue item.
    pub retry_count: i64,

    /// Attempt budget.
    pub max_retries: i64,

    /// Error from the most recent failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Linked queue item id; present until the item is confirmed and
    /// garbage collected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linked_queue_item_id: Option<String>,
}

impl OptimisticUpdate {
    /// Whether the update may be retried by the user.
    pub fn can_retry(&self) -> bool {
        self.status == OptimisticStatus::Failed && self.retry_count < self.max_retries
    }

    /// Whether the update may be rolled back by the user.
    pub fn can_rollback(&self) -> bool {
        !matches!(
            self.status,
            OptimisticStatus::Confirmed | OptimisticStatus::RolledBack
        )
    }

    /// Whether the update is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            OptimisticStatus::Confirmed | OptimisticStatus::RolledBack
        )
    }
}

/// UI-facing sync state derived from the optimistic updates touching an
/// entity. Removed when no updates reference the entity.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityUiState {
    /// Entity kind.
    pub entity_kind: EntityKind,

    /// Entity id.
    pub entity_id: String,

    /// Current sync state.
    pub sync_status: SyncState,

    /// When the state last changed (Unix millis).
    pub last_update: i64,

    /// The update currently driving this state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_update_id: Option<String>,

    /// Error surfaced to the UI, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Attempts made for the active update.
    pub retry_count: i64,

    /// Whether the active update can be retried.
    pub can_retry: bool,

    /// Whether the active update can be rolled back.
    pub can_rollback: bool,
}
