//! Data models for the sync core.

pub mod conflict;
pub mod optimistic;
pub mod priority_rule;
pub mod queue_item;

pub use conflict::{
    AuditEntry, Conflict, ConflictSeverity, ConflictStatus, ConflictType, ResolutionStrategy,
};
pub use optimistic::{EntityUiState, OptimisticStatus, OptimisticUpdate, SyncState};
pub use priority_rule::{Condition, ConditionOperator, PriorityRule};
pub use queue_item::{
    ActionType, EntityKind, ManualOverride, PriorityLabel, QueueItem, QueueItemStatus,
};
