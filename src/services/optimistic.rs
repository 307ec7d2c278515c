//! Optimistic coordinator.
//!
//! Couples UI-visible mutations to durable queue items and reflects sync
//! outcomes back into per-entity UI state. Updates and entity states are
//! process-local; only the linked queue item survives a restart.

use crate::config::SyncCoreConfig;
use crate::db::pool::DbPool;
use crate::error::SyncError;
use crate::models::optimistic::{EntityUiState, OptimisticStatus, OptimisticUpdate, SyncState};
use crate::models::queue_item::{ActionType, EntityKind, QueueItem};
use crate::services::sync_events::{EventBus, SyncEvent};
use crate::services::{priority, queue_store, rules};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

/// Get the current Unix timestamp in milliseconds.
fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Map key for per-entity state.
type EntityKey = (String, String);

/// Couples user-initiated local mutations to queue entries and tracks
/// UI-facing entity state.
pub struct OptimisticCoordinator {
    pool: DbPool,
    config: Arc<RwLock<SyncCoreConfig>>,
    events: EventBus,
    updates: RwLock<HashMap<String, OptimisticUpdate>>,
    entity_states: RwLock<HashMap<EntityKey, EntityUiState>>,
    /// queue item id → update id
    queue_index: RwLock<HashMap<String, String>>,
}

impl OptimisticCoordinator {
    pub fn new(pool: DbPool, config: Arc<RwLock<SyncCoreConfig>>, events: EventBus) -> Self {
        Self {
            pool,
            config,
            events,
            updates: RwLock::new(HashMap::new()),
            entity_states: RwLock::new(HashMap::new()),
            queue_index: RwLock::new(HashMap::new()),
        }
    }

    /// Apply a mutation optimistically.
    ///
    /// Creates the optimistic update, computes its priority, persists the
    /// linked queue item, and moves the entity UI state to PENDING. Returns
    /// immediately with the update id; the background engine drives the
    /// outcome.
    pub async fn apply(
        &self,
        kind: EntityKind,
        entity_id: &str,
        operation: ActionType,
        optimistic_data: Value,
        original_data: Option<Value>,
    ) -> Result<String, SyncError> {
        let now = now_ms();
        let max_retries = self.config.read().await.max_retries_optimistic;

        let active_rules = rules::list_active(&self.pool, kind).await?;
        let outcome = priority::compute(kind, operation, &optimistic_data, &active_rules, None);

        let mut item = QueueItem::new(kind, operation, entity_id, &optimistic_data, max_retries, now);
        item.priority_score = outcome.score;
        item.priority_label = outcome.label.to_string();
        item.priority_reason = outcome.reason;

        let ahead = queue_store::count_higher_priority(&self.pool, item.priority_score).await?;
        item.estimated_sync_time = Some(priority::estimate_sync_time(now, ahead));

        queue_store::enqueue(&self.pool, &item).await?;

        let update = OptimisticUpdate {
            id: uuid::Uuid::new_v4().to_string(),
            entity_kind: kind,
            entity_id: entity_id.to_string(),
            operation,
            optimistic_data,
            original_data,
            status: OptimisticStatus::Pending,
            timestamp: now,
            confirmed_at: None,
            retry_count: 0,
            max_retries,
            error: None,
            linked_queue_item_id: Some(item.id.clone()),
        };
        let update_id = update.id.clone();

        self.queue_index
            .write()
            .await
            .insert(item.id.clone(), update_id.clone());
        self.entity_states.write().await.insert(
            (kind.to_string(), entity_id.to_string()),
            EntityUiState {
                entity_kind: kind,
                entity_id: entity_id.to_string(),
                sync_status: SyncState::Pending,
                last_update: now,
                active_update_id: Some(update_id.clone()),
                error_message: None,
                retry_count: 0,
                can_retry: false,
                can_rollback: true,
            },
        );
        self.updates.write().await.insert(update_id.clone(), update);

        self.emit_update_event(&update_id, kind, entity_id, OptimisticStatus::Pending, None);

        Ok(update_id)
    }

    /// Record a successful server apply for a queue item.
    ///
    /// Called by the sync engine after the server ack. A rolled-back update
    /// stays rolled back (the race already surfaced to the caller as
    /// `AlreadyApplied`).
    pub async fn confirm_queue_item(&self, queue_item_id: &str) {
        let Some(update_id) = self.queue_index.read().await.get(queue_item_id).cloned() else {
            return;
        };

        let now = now_ms();
        let mut updates = self.updates.write().await;
        let Some(update) = updates.get_mut(&update_id) else {
            return;
        };
        if update.status == OptimisticStatus::RolledBack {
            return;
        }

        update.status = OptimisticStatus::Confirmed;
        update.confirmed_at = Some(now);
        update.error = None;

        let kind = update.entity_kind;
        let entity_id = update.entity_id.clone();
        drop(updates);

        self.set_entity_state(&kind, &entity_id, |state| {
            state.sync_status = SyncState::Synced;
            state.last_update = now;
            state.error_message = None;
            state.can_retry = false;
            state.can_rollback = false;
        })
        .await;

        self.emit_update_event(&update_id, kind, &entity_id, OptimisticStatus::Confirmed, None);
    }

    /// Record a terminal failure (or conflict) for a queue item.
    ///
    /// `attempts` is the number of sync attempts actually made.
    pub async fn fail_queue_item(&self, queue_item_id: &str, error: &str, attempts: i64) {
        let Some(update_id) = self.queue_index.read().await.get(queue_item_id).cloned() else {
            return;
        };

        let now = now_ms();
        let mut updates = self.updates.write().await;
        let Some(update) = updates.get_mut(&update_id) else {
            return;
        };
        if update.is_terminal() {
            return;
        }

        update.status = OptimisticStatus::Failed;
        update.retry_count = attempts;
        update.error = Some(error.to_string());

        let kind = update.entity_kind;
        let entity_id = update.entity_id.clone();
        let can_retry = update.can_retry();
        drop(updates);

        self.set_entity_state(&kind, &entity_id, |state| {
            state.sync_status = SyncState::Failed;
            state.last_update = now;
            state.error_message = Some(error.to_string());
            state.retry_count = attempts;
            state.can_retry = can_retry;
            state.can_rollback = true;
        })
        .await;

        self.emit_update_event(&update_id, kind, &entity_id, OptimisticStatus::Failed, None);
    }

    /// Retry a failed update.
    ///
    /// Only valid while the update is FAILED with retry budget remaining.
    /// Resets the linked queue item so the engine picks it up again.
    pub async fn retry(&self, update_id: &str) -> Result<(), SyncError> {
        let now = now_ms();
        let (kind, entity_id, queue_item_id) = {
            let updates = self.updates.read().await;
            let update = updates
                .get(update_id)
                .ok_or_else(|| SyncError::not_found_with_id("OptimisticUpdate", update_id))?;

            if !update.can_retry() {
                return Err(SyncError::invalid_input(
                    "Update is not failed or its retry budget is exhausted",
                ));
            }

            (
                update.entity_kind,
                update.entity_id.clone(),
                update.linked_queue_item_id.clone(),
            )
        };

        let Some(queue_item_id) = queue_item_id else {
            return Err(SyncError::internal("Failed update has no linked queue item"));
        };

        let item = queue_store::get(&self.pool, &queue_item_id).await?;
        if item.blocked_by_conflict.is_some() {
            return Err(SyncError::conflict(
                "Entity has a pending conflict; resolve it before retrying",
            ));
        }

        queue_store::reset_for_retry(&self.pool, &queue_item_id, now).await?;

        if let Some(update) = self.updates.write().await.get_mut(update_id) {
            update.status = OptimisticStatus::Pending;
            update.error = None;
        }

        self.set_entity_state(&kind, &entity_id, |state| {
            state.sync_status = SyncState::Pending;
            state.last_update = now;
            state.error_message = None;
            state.can_retry = false;
            state.can_rollback = true;
        })
        .await;

        self.emit_update_event(update_id, kind, &entity_id, OptimisticStatus::Pending, None);

        Ok(())
    }

    /// Roll back an update.
    ///
    /// Forbidden for CONFIRMED updates. Removes the linked queue item; if
    /// the server already applied it, the update is still marked rolled back
    /// locally and `AlreadyApplied` is surfaced to the caller. For UPDATE
    /// operations the original data rides on the emitted event so the UI can
    /// restore it.
    pub async fn rollback(&self, update_id: &str, reason: &str) -> Result<(), SyncError> {
        let (kind, entity_id, operation, original_data, queue_item_id) = {
            let mut updates = self.updates.write().await;
            let update = updates
                .get_mut(update_id)
                .ok_or_else(|| SyncError::not_found_with_id("OptimisticUpdate", update_id))?;

            match update.status {
                OptimisticStatus::Confirmed => {
                    return Err(SyncError::invalid_input(
                        "Cannot roll back a confirmed update",
                    ));
                }
                OptimisticStatus::RolledBack => return Ok(()),
                OptimisticStatus::Pending | OptimisticStatus::Failed => {}
            }

            update.status = OptimisticStatus::RolledBack;
            update.error = Some(reason.to_string());

            (
                update.entity_kind,
                update.entity_id.clone(),
                update.operation,
                update.original_data.clone(),
                update.linked_queue_item_id.clone(),
            )
        };

        // The entity state reverts to what it was before the update: gone.
        self.remove_entity_state_if_owned(&kind, &entity_id, update_id).await;

        let restored = match operation {
            ActionType::Update | ActionType::Delete => original_data,
            ActionType::Create => None,
        };
        self.emit_update_event(
            update_id,
            kind,
            &entity_id,
            OptimisticStatus::RolledBack,
            restored,
        );

        // Withdraw the queued mutation; a missing item means the sync
        // engine won the race and the server already applied it.
        if let Some(queue_item_id) = queue_item_id {
            match queue_store::get(&self.pool, &queue_item_id).await {
                Ok(_) => {
                    queue_store::remove(&self.pool, &queue_item_id).await?;
                    self.queue_index.write().await.remove(&queue_item_id);
                }
                Err(SyncError::NotFound { .. }) => {
                    log::warn!(
                        "Rollback of update {} raced a successful apply of item {}",
                        update_id,
                        queue_item_id
                    );
                    return Err(SyncError::already_applied(format!(
                        "Server already applied mutation {}; update rolled back locally",
                        queue_item_id
                    )));
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    /// Roll back every failed update, best-effort.
    ///
    /// # Returns
    /// Number of updates successfully rolled back.
    pub async fn rollback_all_failed(&self) -> usize {
        let failed: Vec<String> = {
            let updates = self.updates.read().await;
            updates
                .values()
                .filter(|u| u.status == OptimisticStatus::Failed)
                .map(|u| u.id.clone())
                .collect()
        };

        let mut rolled_back = 0;
        for update_id in failed {
            match self.rollback(&update_id, "bulk rollback of failed updates").await {
                Ok(()) => rolled_back += 1,
                Err(e) => log::warn!("Bulk rollback of {} failed: {}", update_id, e),
            }
        }

        rolled_back
    }

    /// Garbage-collect confirmed updates past the retention window.
    ///
    /// # Returns
    /// Number of updates removed.
    pub async fn gc_confirmed(&self) -> usize {
        let now = now_ms();
        let gc_after_ms = self.config.read().await.confirmed_gc_seconds * 1000;

        let expired: Vec<OptimisticUpdate> = {
            let updates = self.updates.read().await;
            updates
                .values()
                .filter(|u| {
                    u.status == OptimisticStatus::Confirmed
                        && u.confirmed_at.is_some_and(|t| now - t >= gc_after_ms)
                })
                .cloned()
                .collect()
        };

        for update in &expired {
            self.updates.write().await.remove(&update.id);
            if let Some(queue_item_id) = &update.linked_queue_item_id {
                self.queue_index.write().await.remove(queue_item_id);
            }
            self.remove_entity_state_if_owned(&update.entity_kind, &update.entity_id, &update.id)
                .await;
        }

        expired.len()
    }

    /// Fetch an update by id.
    pub async fn get_update(&self, update_id: &str) -> Option<OptimisticUpdate> {
        self.updates.read().await.get(update_id).cloned()
    }

    /// List all live updates.
    pub async fn list_updates(&self) -> Vec<OptimisticUpdate> {
        self.updates.read().await.values().cloned().collect()
    }

    /// Fetch the UI state for an entity, if any update references it.
    pub async fn entity_state(&self, kind: EntityKind, entity_id: &str) -> Option<EntityUiState> {
        self.entity_states
            .read()
            .await
            .get(&(kind.to_string(), entity_id.to_string()))
            .cloned()
    }

    async fn set_entity_state<F>(&self, kind: &EntityKind, entity_id: &str, f: F)
    where
        F: FnOnce(&mut EntityUiState),
    {
        let mut states = self.entity_states.write().await;
        if let Some(state) = states.get_mut(&(kind.to_string(), entity_id.to_string())) {
            f(state);
        }
    }

    /// Drop the entity state entry if this update is the one driving it and
    /// no other live update references the entity.
    async fn remove_entity_state_if_owned(
        &self,
        kind: &EntityKind,
        entity_id: &str,
        update_id: &str,
    ) {
        let other_references = {
            let updates = self.updates.read().await;
            updates.values().any(|u| {
                u.id != update_id
                    && u.entity_kind == *kind
                    && u.entity_id == entity_id
                    && !u.is_terminal()
            })
        };
        if other_references {
            return;
        }

        let key = (kind.to_string(), entity_id.to_string());
        let mut states = self.entity_states.write().await;
        if states
            .get(&key)
            .is_some_and(|s| s.active_update_id.as_deref() == Some(update_id))
        {
            states.remove(&key);
        }
    }

    fn emit_update_event(
        &self,
        update_id: &str,
        kind: EntityKind,
        entity_id: &str,
        status: OptimisticStatus,
        restored_data: Option<Value>,
    ) {
        self.events.emit(SyncEvent::OptimisticUpdated {
            update_id: update_id.to_string(),
            entity_kind: kind.to_string(),
            entity_id: entity_id.to_string(),
            status: status.to_string(),
            restored_data,
        });
    }
}
