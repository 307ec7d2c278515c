//! Rule registry.
//!
//! CRUD over priority rules plus coordinator priority overrides. The
//! priority engine consumes rules read-only through `list_active`.

use crate::db::pool::DbPool;
use crate::error::SyncError;
use crate::models::priority_rule::{Condition, PriorityRule};
use crate::models::queue_item::{EntityKind, ManualOverride, PriorityLabel};
use crate::services::{priority, queue_store};
use std::time::{SystemTime, UNIX_EPOCH};

/// Get the current Unix timestamp in milliseconds.
fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Input for creating a rule.
#[derive(Debug, Clone)]
pub struct NewRule {
    pub name: String,
    pub entity_kind: EntityKind,
    pub conditions: Vec<Condition>,
    pub score_modifier: i64,
    pub active: bool,
    pub created_by: String,
}

/// Create a rule at the end of the insertion order.
///
/// # Returns
/// The created rule with its id and position.
pub async fn create_rule(pool: &DbPool, input: NewRule) -> Result<PriorityRule, SyncError> {
    if input.name.trim().is_empty() {
        return Err(SyncError::invalid_input_field("Rule name is required", "name"));
    }

    let position: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(position) + 1, 0) FROM priority_rules")
        .fetch_one(pool)
        .await?;

    let rule = PriorityRule {
        id: uuid::Uuid::new_v4().to_string(),
        name: input.name,
        entity_kind: input.entity_kind.to_string(),
        conditions: serde_json::to_string(&input.conditions)?,
        score_modifier: input.score_modifier,
        active: input.active,
        created_by: input.created_by,
        created_at: now_ms(),
        position,
    };

    sqlx::query(
        r#"
        INSERT INTO priority_rules (id, name, entity_kind, conditions, score_modifier, active, created_by, created_at, position)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&rule.id)
    .bind(&rule.name)
    .bind(&rule.entity_kind)
    .bind(&rule.conditions)
    .bind(rule.score_modifier)
    .bind(rule.active)
    .bind(&rule.created_by)
    .bind(rule.created_at)
    .bind(rule.position)
    .execute(pool)
    .await?;

    Ok(rule)
}

/// Update a rule's name, conditions, and score modifier. Position and
/// creation metadata are immutable.
pub async fn update_rule(
    pool: &DbPool,
    id: &str,
    name: &str,
    conditions: &[Condition],
    score_modifier: i64,
) -> Result<(), SyncError> {
    let conditions_json = serde_json::to_string(conditions)?;
    let result = sqlx::query(
        "UPDATE priority_rules SET name = ?, conditions = ?, score_modifier = ? WHERE id = ?",
    )
    .bind(name)
    .bind(&conditions_json)
    .bind(score_modifier)
    .bind(id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(SyncError::not_found_with_id("PriorityRule", id));
    }

    Ok(())
}

/// Delete a rule.
pub async fn delete_rule(pool: &DbPool, id: &str) -> Result<(), SyncError> {
    let result = sqlx::query("DELETE FROM priority_rules WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(SyncError::not_found_with_id("PriorityRule", id));
    }

    Ok(())
}

/// Flip a rule's active flag.
///
/// # Returns
/// The new active state.
pub async fn toggle_active(pool: &DbPool, id: &str) -> Result<bool, SyncError> {
    let active: Option<bool> = sqlx::query_scalar(
        "UPDATE priority_rules SET active = NOT active WHERE id = ? RETURNING active",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    active.ok_or_else(|| SyncError::not_found_with_id("PriorityRule", id))
}

/// List the active rules for an entity kind, in insertion order.
pub async fn list_active(pool: &DbPool, kind: EntityKind) -> Result<Vec<PriorityRule>, SyncError> {
    let rules = sqlx::query_as::<_, PriorityRule>(
        r#"
        SELECT id, name, entity_kind, conditions, score_modifier, active, created_by, created_at, position
        FROM priority_rules
        WHERE entity_kind = ? AND active = 1
        ORDER BY position ASC
        "#,
    )
    .bind(kind.to_string())
    .fetch_all(pool)
    .await?;

    Ok(rules)
}

/// List every rule, in insertion order.
pub async fn list_all(pool: &DbPool) -> Result<Vec<PriorityRule>, SyncError> {
    let rules = sqlx::query_as::<_, PriorityRule>(
        r#"
        SELECT id, name, entity_kind, conditions, score_modifier, active, created_by, created_at, position
        FROM priority_rules
        ORDER BY position ASC
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rules)
}

/// Replace the computed priority of a queue item with a coordinator's score.
///
/// Idempotent for an identical stored override (same coordinator and score):
/// repeating the call is a no-op. The stored score and label are refreshed so
/// claim ordering sees the override immediately; the priority engine keeps
/// honoring it on every later recompute.
///
/// # Returns
/// The updated item.
pub async fn override_priority(
    pool: &DbPool,
    queue_item_id: &str,
    new_score: i64,
    coordinator_id: &str,
    justification: &str,
) -> Result<crate::models::queue_item::QueueItem, SyncError> {
    if !(0..=100).contains(&new_score) {
        return Err(SyncError::invalid_input_field(
            "Override score must be within [0, 100]",
            "new_score",
        ));
    }
    if justification.trim().is_empty() {
        return Err(SyncError::invalid_input_field(
            "Override justification is required",
            "justification",
        ));
    }

    let item = queue_store::get(pool, queue_item_id).await?;

    // Identical override already in place: nothing to do
    if let Some(existing) = item.manual_override_parsed() {
        if existing.coordinator_id == coordinator_id && existing.override_score == new_score {
            return Ok(item);
        }
    }

    let override_ = ManualOverride {
        coordinator_id: coordinator_id.to_string(),
        original_score: item.priority_score,
        override_score: new_score,
        justification: justification.to_string(),
        timestamp: now_ms(),
    };

    queue_store::update(pool, queue_item_id, |i| {
        i.manual_override = Some(serde_json::to_string(&override_).unwrap_or_default());
        i.priority_score = new_score;
        i.priority_label = PriorityLabel::from_score(new_score).to_string();
        i.priority_reason = format!(
            "{}; manual override: {}",
            i.priority_reason, override_.justification
        );
    })
    .await
}

/// Recompute stored priorities for items that are neither leased nor blocked.
///
/// Called after rule edits so the claim ordering reflects the new rule set
/// without waiting for each item's next read.
///
/// # Returns
/// Number of items whose score changed.
pub async fn reprioritize_pending(pool: &DbPool, now: i64) -> Result<u64, SyncError> {
    let items = queue_store::scan(pool, &Default::default(), now).await?;
    let mut changed = 0u64;

    for item in items {
        if item.blocked_by_conflict.is_some() || item.lease_expires_at.is_some_and(|t| t > now) {
            continue;
        }

        let kind = item.entity_kind_enum();
        let rules = list_active(pool, kind).await?;
        let payload = item.payload_json().unwrap_or_default();
        let outcome = priority::compute(
            kind,
            item.action_enum(),
            &payload,
            &rules,
            item.manual_override_parsed().as_ref(),
        );

        if outcome.score == item.priority_score && outcome.reason == item.priority_reason {
            continue;
        }

        match queue_store::update(pool, &item.id, |i| {
            i.priority_score = outcome.score;
            i.priority_label = outcome.label.to_string();
            i.priority_reason = outcome.reason.clone();
        })
        .await
        {
            Ok(_) => changed += 1,
            // A worker claimed or removed the item mid-pass; skip it
            Err(SyncError::StaleVersion { .. }) | Err(SyncError::NotFound { .. }) => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(changed)
}
