//! Durable queue store.
//!
//! Crash-safe persistence for queued mutations, with filtered iteration,
//! compare-and-set updates, and an atomic claim protocol that gives every
//! worker exclusive ownership of one item and one entity at a time.

use crate::db::pool::DbPool;
use crate::error::SyncError;
use crate::models::queue_item::{EntityKind, PriorityLabel, QueueItem, QueueItemStatus};
use serde::Serialize;
use sqlx::Row;

/// Column list shared by every SELECT/RETURNING against `sync_queue`.
const COLUMNS: &str = "id, entity_kind, action, entity_id, payload, priority_label, \
     priority_score, priority_reason, manual_override, estimated_sync_time, created_at, \
     last_attempt_at, retry_count, last_error, max_retries, next_attempt_at, \
     lease_expires_at, blocked_by_conflict, row_version";

/// Filter for `scan`.
#[derive(Debug, Clone, Default)]
pub struct QueueFilter {
    pub entity_kind: Option<EntityKind>,
    pub priority_label: Option<PriorityLabel>,
    pub status: Option<QueueItemStatus>,
}

/// Aggregate view of the queue for status displays.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSummary {
    pub total: i64,
    pub pending: i64,
    pub syncing: i64,
    pub failed: i64,
    pub blocked: i64,
    pub terminal_failed: i64,
    pub critical: i64,
    pub high: i64,
    pub normal: i64,
    pub low: i64,
    pub oldest_pending_created_at: Option<i64>,
    pub last_updated_at: Option<i64>,
}

/// Insert a new item.
///
/// # Arguments
/// * `pool` - Database connection pool
/// * `item` - Fully-formed item to persist
///
/// # Errors
/// `DuplicateId` if an item with the same id already exists.
pub async fn enqueue(pool: &DbPool, item: &QueueItem) -> Result<(), SyncError> {
    let result = sqlx::query(
        r#"
        INSERT INTO sync_queue (
            id, entity_kind, action, entity_id, payload, priority_label,
            priority_score, priority_reason, manual_override, estimated_sync_time,
            created_at, last_attempt_at, retry_count, last_error, max_retries,
            next_attempt_at, lease_expires_at, blocked_by_conflict, row_version
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&item.id)
    .bind(&item.entity_kind)
    .bind(&item.action)
    .bind(&item.entity_id)
    .bind(&item.payload)
    .bind(&item.priority_label)
    .bind(item.priority_score)
    .bind(&item.priority_reason)
    .bind(&item.manual_override)
    .bind(item.estimated_sync_time)
    .bind(item.created_at)
    .bind(item.last_attempt_at)
    .bind(item.retry_count)
    .bind(&item.last_error)
    .bind(item.max_retries)
    .bind(item.next_attempt_at)
    .bind(item.lease_expires_at)
    .bind(&item.blocked_by_conflict)
    .bind(item.row_version)
    .execute(pool)
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
            Err(SyncError::duplicate_id("QueueItem", &item.id))
        }
        Err(e) => Err(e.into()),
    }
}

/// Fetch an item by id.
///
/// # Errors
/// `NotFound` if no item with that id exists.
pub async fn get(pool: &DbPool, id: &str) -> Result<QueueItem, SyncError> {
    let query = format!("SELECT {} FROM sync_queue WHERE id = ?", COLUMNS);
    sqlx::query_as::<_, QueueItem>(&query)
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| SyncError::not_found_with_id("QueueItem", id))
}

/// Write back a previously-read item snapshot, guarded by its CAS counter.
///
/// The row's `row_version` must still equal the snapshot's; on success the
/// stored counter is bumped. Used by `update` and by callers that mutate a
/// snapshot across an await point.
///
/// # Errors
/// `StaleVersion` if the row changed since the snapshot was read;
/// `NotFound` if the row is gone.
pub async fn persist_cas(pool: &DbPool, item: &QueueItem) -> Result<QueueItem, SyncError> {
    let result = sqlx::query(
        r#"
        UPDATE sync_queue SET
            payload = ?, priority_label = ?, priority_score = ?, priority_reason = ?,
            manual_override = ?, estimated_sync_time = ?, last_attempt_at = ?,
            retry_count = ?, last_error = ?, max_retries = ?, next_attempt_at = ?,
            lease_expires_at = ?, blocked_by_conflict = ?, row_version = row_version + 1
        WHERE id = ? AND row_version = ?
        "#,
    )
    .bind(&item.payload)
    .bind(&item.priority_label)
    .bind(item.priority_score)
    .bind(&item.priority_reason)
    .bind(&item.manual_override)
    .bind(item.estimated_sync_time)
    .bind(item.last_attempt_at)
    .bind(item.retry_count)
    .bind(&item.last_error)
    .bind(item.max_retries)
    .bind(item.next_attempt_at)
    .bind(item.lease_expires_at)
    .bind(&item.blocked_by_conflict)
    .bind(&item.id)
    .bind(item.row_version)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        // Distinguish a lost race from a removed row
        let exists: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM sync_queue WHERE id = ?")
                .bind(&item.id)
                .fetch_optional(pool)
                .await?;
        return Err(match exists {
            Some(_) => SyncError::stale_version("QueueItem", &item.id),
            None => SyncError::not_found_with_id("QueueItem", &item.id),
        });
    }

    let mut updated = item.clone();
    updated.row_version += 1;
    Ok(updated)
}

/// Read-modify-write an item under compare-and-set.
///
/// # Errors
/// `StaleVersion` if a concurrent modification was observed; the caller
/// retries with a fresh read.
pub async fn update<F>(pool: &DbPool, id: &str, mutator: F) -> Result<QueueItem, SyncError>
where
    F: FnOnce(&mut QueueItem),
{
    let mut item = get(pool, id).await?;
    mutator(&mut item);
    persist_cas(pool, &item).await
}

/// Delete an item. Idempotent: removing a missing id succeeds.
pub async fn remove(pool: &DbPool, id: &str) -> Result<(), SyncError> {
    sqlx::query("DELETE FROM sync_queue WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;

    Ok(())
}

/// Return the items matching a filter. Ordering is unspecified; callers sort.
pub async fn scan(
    pool: &DbPool,
    filter: &QueueFilter,
    now_ms: i64,
) -> Result<Vec<QueueItem>, SyncError> {
    let mut query = format!("SELECT {} FROM sync_queue WHERE 1 = 1", COLUMNS);
    if filter.entity_kind.is_some() {
        query.push_str(" AND entity_kind = ?");
    }
    if filter.priority_label.is_some() {
        query.push_str(" AND priority_label = ?");
    }

    let mut q = sqlx::query_as::<_, QueueItem>(&query);
    if let Some(kind) = filter.entity_kind {
        q = q.bind(kind.to_string());
    }
    if let Some(label) = filter.priority_label {
        q = q.bind(label.to_string());
    }

    let mut items = q.fetch_all(pool).await?;

    // Status is derived, not stored; filter in memory
    if let Some(status) = filter.status {
        items.retain(|item| item.derived_status(now_ms) == status);
    }

    Ok(items)
}

/// Aggregate counts, oldest pending item, and last-updated timestamp.
pub async fn summary(pool: &DbPool, now_ms: i64) -> Result<QueueSummary, SyncError> {
    let query = format!("SELECT {} FROM sync_queue", COLUMNS);
    let items = sqlx::query_as::<_, QueueItem>(&query)
        .fetch_all(pool)
        .await?;

    let mut summary = QueueSummary {
        total: items.len() as i64,
        ..Default::default()
    };

    for item in &items {
        match item.derived_status(now_ms) {
            QueueItemStatus::Pending => {
                summary.pending += 1;
                summary.oldest_pending_created_at = Some(
                    summary
                        .oldest_pending_created_at
                        .map_or(item.created_at, |t| t.min(item.created_at)),
                );
            }
            QueueItemStatus::Syncing => summary.syncing += 1,
            QueueItemStatus::Failed => summary.failed += 1,
            QueueItemStatus::Blocked => summary.blocked += 1,
        }

        if item.is_terminal_failed() {
            summary.terminal_failed += 1;
        }

        match item.priority_label_enum() {
            PriorityLabel::Critical => summary.critical += 1,
            PriorityLabel::High => summary.high += 1,
            PriorityLabel::Normal => summary.normal += 1,
            PriorityLabel::Low => summary.low += 1,
        }

        let touched = item.last_attempt_at.unwrap_or(item.created_at);
        summary.last_updated_at = Some(
            summary
                .last_updated_at
                .map_or(touched, |t| t.max(touched)),
        );
    }

    Ok(summary)
}

/// Atomically claim the next runnable item.
///
/// An item is runnable when it is not blocked by a conflict, holds no live
/// lease, its backoff schedule is due, its attempt budget is not exhausted,
/// and its entity is idle: no sibling item of the same (entity_kind,
/// entity_id) is in flight or blocked, and no older runnable sibling exists
/// (per-entity insertion order). Candidates are ordered by priority score
/// descending, then age.
///
/// The claim stamps a lease, starts the attempt bookkeeping, and clears the
/// previous attempt's error in a single statement, so two workers can never
/// hold the same item or the same entity.
pub async fn claim_next(
    pool: &DbPool,
    now_ms: i64,
    lease_ms: i64,
) -> Result<Option<QueueItem>, SyncError> {
    let query = format!(
        r#"
        UPDATE sync_queue SET
            lease_expires_at = ?1 + ?2,
            last_attempt_at = ?1,
            retry_count = retry_count + 1,
            last_error = NULL,
            row_version = row_version + 1
        WHERE id = (
            SELECT q.id FROM sync_queue q
            WHERE q.blocked_by_conflict IS NULL
              AND (q.lease_expires_at IS NULL OR q.lease_expires_at <= ?1)
              AND q.next_attempt_at <= ?1
              AND q.retry_count < q.max_retries
              AND NOT EXISTS (
                  SELECT 1 FROM sync_queue h
                  WHERE h.entity_kind = q.entity_kind
                    AND h.entity_id = q.entity_id
                    AND h.id != q.id
                    AND (
                        h.lease_expires_at > ?1
                        OR h.blocked_by_conflict IS NOT NULL
                        OR (h.created_at < q.created_at AND h.retry_count < h.max_retries)
                    )
              )
            ORDER BY q.priority_score DESC, q.created_at ASC
            LIMIT 1
        )
        RETURNING {}
        "#,
        COLUMNS
    );

    let item = sqlx::query_as::<_, QueueItem>(&query)
        .bind(now_ms)
        .bind(lease_ms)
        .fetch_optional(pool)
        .await?;

    Ok(item)
}

/// Extend a live lease (long-running apply). Expired or absent leases are
/// not revived.
pub async fn extend_lease(
    pool: &DbPool,
    id: &str,
    now_ms: i64,
    lease_ms: i64,
) -> Result<bool, SyncError> {
    let result = sqlx::query(
        r#"
        UPDATE sync_queue SET
            lease_expires_at = ?1 + ?2,
            row_version = row_version + 1
        WHERE id = ?3 AND lease_expires_at > ?1
        "#,
    )
    .bind(now_ms)
    .bind(lease_ms)
    .bind(id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Release a claim without counting the attempt (cancellation path).
///
/// Restores the pre-claim attempt bookkeeping so an aborted attempt does not
/// burn retry budget.
pub async fn release_claim(pool: &DbPool, id: &str) -> Result<(), SyncError> {
    sqlx::query(
        r#"
        UPDATE sync_queue SET
            lease_expires_at = NULL,
            retry_count = MAX(0, retry_count - 1),
            row_version = row_version + 1
        WHERE id = ?
        "#,
    )
    .bind(id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Record a failed attempt: store the error, schedule the next attempt, and
/// release the lease.
pub async fn mark_attempt_failed(
    pool: &DbPool,
    id: &str,
    error: &str,
    next_attempt_at: i64,
) -> Result<(), SyncError> {
    sqlx::query(
        r#"
        UPDATE sync_queue SET
            last_error = ?,
            next_attempt_at = ?,
            lease_expires_at = NULL,
            row_version = row_version + 1
        WHERE id = ?
        "#,
    )
    .bind(error)
    .bind(next_attempt_at)
    .bind(id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Mark an item terminally failed regardless of remaining budget
/// (non-retryable errors such as a missing server entity).
pub async fn mark_terminal_failed(pool: &DbPool, id: &str, error: &str) -> Result<(), SyncError> {
    sqlx::query(
        r#"
        UPDATE sync_queue SET
            last_error = ?,
            retry_count = max_retries,
            lease_expires_at = NULL,
            row_version = row_version + 1
        WHERE id = ?
        "#,
    )
    .bind(error)
    .bind(id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Block an item behind a conflict and release its lease. The item stays in
/// the queue but is never claimed until the conflict is resolved.
pub async fn mark_blocked(pool: &DbPool, id: &str, conflict_id: &str) -> Result<(), SyncError> {
    sqlx::query(
        r#"
        UPDATE sync_queue SET
            blocked_by_conflict = ?,
            lease_expires_at = NULL,
            row_version = row_version + 1
        WHERE id = ?
        "#,
    )
    .bind(conflict_id)
    .bind(id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Remove the item blocked behind a conflict (the resolution superseded it).
///
/// # Returns
/// The removed item's id, if one was blocked on that conflict.
pub async fn remove_blocked_by(
    pool: &DbPool,
    conflict_id: &str,
) -> Result<Option<String>, SyncError> {
    let row = sqlx::query("DELETE FROM sync_queue WHERE blocked_by_conflict = ? RETURNING id")
        .bind(conflict_id)
        .fetch_optional(pool)
        .await?;

    Ok(row.map(|r| r.get("id")))
}

/// Reset a failed item for an operator-triggered retry: fresh attempt
/// budget, cleared error, immediately runnable.
///
/// # Errors
/// `NotFound` if no item with that id exists.
pub async fn reset_for_retry(pool: &DbPool, id: &str, now_ms: i64) -> Result<(), SyncError> {
    let result = sqlx::query(
        r#"
        UPDATE sync_queue SET
            retry_count = 0,
            last_error = NULL,
            next_attempt_at = ?,
            lease_expires_at = NULL,
            row_version = row_version + 1
        WHERE id = ?
        "#,
    )
    .bind(now_ms)
    .bind(id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(SyncError::not_found_with_id("QueueItem", id));
    }

    Ok(())
}

/// Count pending items with a strictly higher priority score (for sync-time
/// estimation).
pub async fn count_higher_priority(pool: &DbPool, score: i64) -> Result<i64, SyncError> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM sync_queue WHERE priority_score > ? AND blocked_by_conflict IS NULL",
    )
    .bind(score)
    .fetch_one(pool)
    .await?;

    Ok(row.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::queue_item::ActionType;
    use serde_json::json;
    use tempfile::tempdir;

    async fn setup_test_db() -> DbPool {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        // Keep the dir alive by leaking it (for test purposes)
        std::mem::forget(dir);

        crate::db::initialize(&db_path).await.unwrap()
    }

    fn item(entity_id: &str, score: i64, created_at: i64) -> QueueItem {
        let mut item = QueueItem::new(
            EntityKind::Assessment,
            ActionType::Update,
            entity_id,
            &json!({"status": "DRAFT"}),
            10,
            created_at,
        );
        item.priority_score = score;
        item.priority_label = PriorityLabel::from_score(score).to_string();
        item
    }

    #[tokio::test]
    async fn test_enqueue_get_remove() {
        let pool = setup_test_db().await;

        let queued = item("a1", 50, 1_000);
        enqueue(&pool, &queued).await.unwrap();

        let fetched = get(&pool, &queued.id).await.unwrap();
        assert_eq!(fetched.entity_id, "a1");
        assert_eq!(fetched.priority_score, 50);
        assert_eq!(fetched.retry_count, 0);

        remove(&pool, &queued.id).await.unwrap();
        assert!(matches!(
            get(&pool, &queued.id).await,
            Err(SyncError::NotFound { .. })
        ));

        // Idempotent delete
        remove(&pool, &queued.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_enqueue_duplicate_id() {
        let pool = setup_test_db().await;

        let queued = item("a1", 50, 1_000);
        enqueue(&pool, &queued).await.unwrap();

        let result = enqueue(&pool, &queued).await;
        assert!(matches!(result, Err(SyncError::DuplicateId { .. })));
    }

    #[tokio::test]
    async fn test_update_cas() {
        let pool = setup_test_db().await;

        let queued = item("a1", 50, 1_000);
        enqueue(&pool, &queued).await.unwrap();

        let updated = update(&pool, &queued.id, |i| i.priority_score = 80)
            .await
            .unwrap();
        assert_eq!(updated.priority_score, 80);
        assert_eq!(updated.row_version, 1);

        // A snapshot that lost the race gets StaleVersion
        let stale = queued.clone();
        let result = persist_cas(&pool, &stale).await;
        assert!(matches!(result, Err(SyncError::StaleVersion { .. })));
    }

    #[tokio::test]
    async fn test_persist_cas_missing_row() {
        let pool = setup_test_db().await;

        let queued = item("a1", 50, 1_000);
        let result = persist_cas(&pool, &queued).await;
        assert!(matches!(result, Err(SyncError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_scan_filters() {
        let pool = setup_test_db().await;

        enqueue(&pool, &item("a1", 80, 1_000)).await.unwrap();
        enqueue(&pool, &item("a2", 30, 1_100)).await.unwrap();

        let mut incident = QueueItem::new(
            EntityKind::Incident,
            ActionType::Create,
            "i1",
            &json!({}),
            10,
            1_200,
        );
        incident.priority_score = 60;
        incident.priority_label = PriorityLabel::from_score(60).to_string();
        enqueue(&pool, &incident).await.unwrap();

        let assessments = scan(
            &pool,
            &QueueFilter {
                entity_kind: Some(EntityKind::Assessment),
                ..Default::default()
            },
            2_000,
        )
        .await
        .unwrap();
        assert_eq!(assessments.len(), 2);

        let critical = scan(
            &pool,
            &QueueFilter {
                priority_label: Some(PriorityLabel::Critical),
                ..Default::default()
            },
            2_000,
        )
        .await
        .unwrap();
        assert_eq!(critical.len(), 1);
        assert_eq!(critical[0].entity_id, "a1");

        let pending = scan(
            &pool,
            &QueueFilter {
                status: Some(QueueItemStatus::Pending),
                ..Default::default()
            },
            2_000,
        )
        .await
        .unwrap();
        assert_eq!(pending.len(), 3);
    }

    #[tokio::test]
    async fn test_claim_orders_by_priority() {
        let pool = setup_test_db().await;

        enqueue(&pool, &item("a1", 40, 1_000)).await.unwrap();
        enqueue(&pool, &item("a2", 90, 1_100)).await.unwrap();
        enqueue(&pool, &item("a3", 60, 1_200)).await.unwrap();

        let first = claim_next(&pool, 2_000, 60_000).await.unwrap().unwrap();
        assert_eq!(first.entity_id, "a2");
        assert_eq!(first.retry_count, 1);
        assert!(first.lease_expires_at.unwrap() > 2_000);

        let second = claim_next(&pool, 2_000, 60_000).await.unwrap().unwrap();
        assert_eq!(second.entity_id, "a3");

        let third = claim_next(&pool, 2_000, 60_000).await.unwrap().unwrap();
        assert_eq!(third.entity_id, "a1");

        // Everything is leased now
        assert!(claim_next(&pool, 2_000, 60_000).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_single_flight_per_entity() {
        let pool = setup_test_db().await;

        // Two queued mutations against the same entity
        enqueue(&pool, &item("a1", 90, 1_000)).await.unwrap();
        enqueue(&pool, &item("a1", 95, 1_100)).await.unwrap();

        // Per-entity insertion order wins over priority within the entity
        let first = claim_next(&pool, 2_000, 60_000).await.unwrap().unwrap();
        assert_eq!(first.created_at, 1_000);

        // Second item must wait for the sibling's lease
        assert!(claim_next(&pool, 2_000, 60_000).await.unwrap().is_none());

        // Completed sibling releases the entity
        remove(&pool, &first.id).await.unwrap();
        let second = claim_next(&pool, 2_000, 60_000).await.unwrap().unwrap();
        assert_eq!(second.created_at, 1_100);
    }

    #[tokio::test]
    async fn test_expired_lease_reclaimable() {
        let pool = setup_test_db().await;

        enqueue(&pool, &item("a1", 50, 1_000)).await.unwrap();

        let first = claim_next(&pool, 2_000, 10_000).await.unwrap().unwrap();
        assert!(claim_next(&pool, 2_000, 10_000).await.unwrap().is_none());

        // Lease expired: the item is claimable again and the attempt counts
        let reclaimed = claim_next(&pool, 13_000, 10_000).await.unwrap().unwrap();
        assert_eq!(reclaimed.id, first.id);
        assert_eq!(reclaimed.retry_count, 2);
    }

    #[tokio::test]
    async fn test_claim_honors_backoff_and_budget() {
        let pool = setup_test_db().await;

        let queued = item("a1", 50, 1_000);
        enqueue(&pool, &queued).await.unwrap();

        let claimed = claim_next(&pool, 2_000, 10_000).await.unwrap().unwrap();
        mark_attempt_failed(&pool, &claimed.id, "Network timeout", 60_000)
            .await
            .unwrap();

        // Backoff not yet due
        assert!(claim_next(&pool, 30_000, 10_000).await.unwrap().is_none());

        // Due again
        let again = claim_next(&pool, 61_000, 10_000).await.unwrap().unwrap();
        assert_eq!(again.retry_count, 2);
        assert!(again.last_error.is_none(), "claim clears the previous error");

        // Exhaust the budget
        mark_terminal_failed(&pool, &again.id, "HTTP 500").await.unwrap();
        assert!(claim_next(&pool, 120_000, 10_000).await.unwrap().is_none());

        let terminal = get(&pool, &again.id).await.unwrap();
        assert!(terminal.is_terminal_failed());
    }

    #[tokio::test]
    async fn test_blocked_entity_not_claimable() {
        let pool = setup_test_db().await;

        let first = item("a1", 50, 1_000);
        enqueue(&pool, &first).await.unwrap();
        enqueue(&pool, &item("a1", 50, 1_100)).await.unwrap();

        mark_blocked(&pool, &first.id, "c1").await.unwrap();

        // Neither the blocked item nor its sibling is claimable
        assert!(claim_next(&pool, 2_000, 10_000).await.unwrap().is_none());

        // Resolution removes the blocked item and frees the entity
        let removed = remove_blocked_by(&pool, "c1").await.unwrap();
        assert_eq!(removed, Some(first.id));

        let next = claim_next(&pool, 2_000, 10_000).await.unwrap().unwrap();
        assert_eq!(next.created_at, 1_100);
    }

    #[tokio::test]
    async fn test_extend_lease() {
        let pool = setup_test_db().await;

        enqueue(&pool, &item("a1", 50, 1_000)).await.unwrap();

        let claimed = claim_next(&pool, 2_000, 10_000).await.unwrap().unwrap();
        assert!(extend_lease(&pool, &claimed.id, 11_000, 10_000).await.unwrap());

        let extended = get(&pool, &claimed.id).await.unwrap();
        assert_eq!(extended.lease_expires_at, Some(21_000));

        // An expired lease cannot be revived
        assert!(!extend_lease(&pool, &claimed.id, 30_000, 10_000).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_claim_refunds_attempt() {
        let pool = setup_test_db().await;

        enqueue(&pool, &item("a1", 50, 1_000)).await.unwrap();

        let claimed = claim_next(&pool, 2_000, 10_000).await.unwrap().unwrap();
        assert_eq!(claimed.retry_count, 1);

        release_claim(&pool, &claimed.id).await.unwrap();

        let released = get(&pool, &claimed.id).await.unwrap();
        assert_eq!(released.retry_count, 0);
        assert!(released.lease_expires_at.is_none());
    }

    #[tokio::test]
    async fn test_reset_for_retry() {
        let pool = setup_test_db().await;

        let queued = item("a1", 50, 1_000);
        enqueue(&pool, &queued).await.unwrap();

        let claimed = claim_next(&pool, 2_000, 10_000).await.unwrap().unwrap();
        mark_terminal_failed(&pool, &claimed.id, "HTTP 500").await.unwrap();

        reset_for_retry(&pool, &queued.id, 3_000).await.unwrap();

        let reset = get(&pool, &queued.id).await.unwrap();
        assert_eq!(reset.retry_count, 0);
        assert!(reset.last_error.is_none());

        assert!(matches!(
            reset_for_retry(&pool, "missing", 3_000).await,
            Err(SyncError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_summary() {
        let pool = setup_test_db().await;

        enqueue(&pool, &item("a1", 80, 1_000)).await.unwrap();
        enqueue(&pool, &item("a2", 30, 1_500)).await.unwrap();
        let failed = item("a3", 50, 2_000);
        enqueue(&pool, &failed).await.unwrap();

        let claimed = claim_next(&pool, 3_000, 10_000).await.unwrap().unwrap();
        assert_eq!(claimed.entity_id, "a1");
        mark_attempt_failed(&pool, &claimed.id, "Network timeout", 10_000)
            .await
            .unwrap();

        let blocked = claim_next(&pool, 3_000, 10_000).await.unwrap().unwrap();
        mark_blocked(&pool, &blocked.id, "c1").await.unwrap();

        let s = summary(&pool, 3_500).await.unwrap();
        assert_eq!(s.total, 3);
        assert_eq!(s.failed, 1);
        assert_eq!(s.blocked, 1);
        assert_eq!(s.pending, 1);
        assert_eq!(s.oldest_pending_created_at, Some(1_500));
        assert_eq!(s.last_updated_at, Some(3_000));
    }

    #[tokio::test]
    async fn test_count_higher_priority() {
        let pool = setup_test_db().await;

        enqueue(&pool, &item("a1", 80, 1_000)).await.unwrap();
        enqueue(&pool, &item("a2", 60, 1_100)).await.unwrap();
        enqueue(&pool, &item("a3", 40, 1_200)).await.unwrap();

        assert_eq!(count_higher_priority(&pool, 50).await.unwrap(), 2);
        assert_eq!(count_higher_priority(&pool, 80).await.unwrap(), 0);
    }
}
