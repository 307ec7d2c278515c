//! Conflict store and resolver.
//!
//! Indexed set of open and historical conflicts with an append-only audit
//! trail. Resolution builds the winning record per strategy, applies it to
//! the server, and supersedes the queue item blocked behind the conflict.

use crate::db::pool::DbPool;
use crate::error::SyncError;
use crate::models::conflict::{
    AuditEntry, Conflict, ConflictSeverity, ConflictStatus, ResolutionStrategy,
    AUDIT_CONFLICT_DETECTED, AUDIT_CONFLICT_ESCALATED, AUDIT_CONFLICT_RESOLVED,
    AUDIT_RESOLUTION_APPLY_FAILED,
};
use crate::models::queue_item::EntityKind;
use crate::services::api_client::{
    format_updated_at, record_version, ResolutionReport, ServerApi,
};
use crate::services::conflict_detect::DetectionOutcome;
use crate::services::{queue_store, sync_events};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Get the current Unix timestamp in milliseconds.
fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

const CONFLICT_COLUMNS: &str = "id, entity_kind, entity_id, conflict_type, severity, \
     local_version, server_version, conflict_fields, detected_at, detected_by, status, \
     resolution_strategy, resolved_by, resolved_at, justification, archived";

/// Filter for `list_pending`.
#[derive(Debug, Clone, Default)]
pub struct ConflictFilter {
    pub entity_kind: Option<EntityKind>,
    pub severity: Option<ConflictSeverity>,
}

/// Register a conflict detected by the sync engine.
///
/// Persists the conflict and appends the initial `CONFLICT_DETECTED` audit
/// entry.
///
/// # Returns
/// The stored conflict.
pub async fn register(
    pool: &DbPool,
    kind: EntityKind,
    entity_id: &str,
    local: &Value,
    server: &Value,
    outcome: &DetectionOutcome,
    detected_by: &str,
) -> Result<Conflict, SyncError> {
    let conflict = Conflict {
        id: uuid::Uuid::new_v4().to_string(),
        entity_kind: kind.to_string(),
        entity_id: entity_id.to_string(),
        conflict_type: outcome.conflict_type.to_string(),
        severity: outcome.severity.to_string(),
        local_version: local.to_string(),
        server_version: server.to_string(),
        conflict_fields: serde_json::to_string(&outcome.conflict_fields)?,
        detected_at: now_ms(),
        detected_by: detected_by.to_string(),
        status: ConflictStatus::Pending.to_string(),
        resolution_strategy: None,
        resolved_by: None,
        resolved_at: None,
        justification: None,
        archived: false,
    };

    sqlx::query(
        r#"
        INSERT INTO conflicts (
            id, entity_kind, entity_id, conflict_type, severity, local_version,
            server_version, conflict_fields, detected_at, detected_by, status, archived
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)
        "#,
    )
    .bind(&conflict.id)
    .bind(&conflict.entity_kind)
    .bind(&conflict.entity_id)
    .bind(&conflict.conflict_type)
    .bind(&conflict.severity)
    .bind(&conflict.local_version)
    .bind(&conflict.server_version)
    .bind(&conflict.conflict_fields)
    .bind(conflict.detected_at)
    .bind(&conflict.detected_by)
    .bind(&conflict.status)
    .execute(pool)
    .await?;

    append_audit(
        pool,
        &conflict.id,
        AUDIT_CONFLICT_DETECTED,
        detected_by,
        &serde_json::json!({
            "type": conflict.conflict_type,
            "severity": conflict.severity,
            "fieldsAffected": outcome.conflict_fields,
        }),
    )
    .await?;

    Ok(conflict)
}

/// Fetch a conflict by id.
pub async fn get(pool: &DbPool, id: &str) -> Result<Conflict, SyncError> {
    let query = format!("SELECT {} FROM conflicts WHERE id = ?", CONFLICT_COLUMNS);
    sqlx::query_as::<_, Conflict>(&query)
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| SyncError::not_found_with_id("Conflict", id))
}

/// List pending conflicts, most severe first, newest within a severity.
pub async fn list_pending(
    pool: &DbPool,
    filter: &ConflictFilter,
) -> Result<Vec<Conflict>, SyncError> {
    let mut query = format!(
        r#"
        SELECT {} FROM conflicts
        WHERE status = 'PENDING' AND archived = 0
        "#,
        CONFLICT_COLUMNS
    );
    if filter.entity_kind.is_some() {
        query.push_str(" AND entity_kind = ?");
    }
    if filter.severity.is_some() {
        query.push_str(" AND severity = ?");
    }
    query.push_str(
        r#"
        ORDER BY CASE severity
            WHEN 'CRITICAL' THEN 3
            WHEN 'HIGH' THEN 2
            WHEN 'MEDIUM' THEN 1
            ELSE 0
        END DESC, detected_at DESC
        "#,
    );

    let mut q = sqlx::query_as::<_, Conflict>(&query);
    if let Some(kind) = filter.entity_kind {
        q = q.bind(kind.to_string());
    }
    if let Some(severity) = filter.severity {
        q = q.bind(severity.to_string());
    }

    Ok(q.fetch_all(pool).await?)
}

/// Counts of non-archived conflicts grouped by a column.
async fn stats_by(pool: &DbPool, column: &str) -> Result<HashMap<String, i64>, SyncError> {
    let query = format!(
        "SELECT {}, COUNT(*) as n FROM conflicts WHERE archived = 0 GROUP BY {}",
        column, column
    );
    let rows: Vec<(String, i64)> = sqlx::query_as(&query).fetch_all(pool).await?;

    Ok(rows.into_iter().collect())
}

/// Conflict counts by type.
pub async fn stats_by_type(pool: &DbPool) -> Result<HashMap<String, i64>, SyncError> {
    stats_by(pool, "conflict_type").await
}

/// Conflict counts by severity.
pub async fn stats_by_severity(pool: &DbPool) -> Result<HashMap<String, i64>, SyncError> {
    stats_by(pool, "severity").await
}

/// Conflict counts by status.
pub async fn stats_by_status(pool: &DbPool) -> Result<HashMap<String, i64>, SyncError> {
    stats_by(pool, "status").await
}

/// Read the append-only audit trail for a conflict, oldest first.
pub async fn audit_trail(pool: &DbPool, conflict_id: &str) -> Result<Vec<AuditEntry>, SyncError> {
    let entries = sqlx::query_as::<_, AuditEntry>(
        r#"
        SELECT id, conflict_id, timestamp, action, performed_by, details
        FROM conflict_audit
        WHERE conflict_id = ?
        ORDER BY id ASC
        "#,
    )
    .bind(conflict_id)
    .fetch_all(pool)
    .await?;

    Ok(entries)
}

/// Append one audit entry. Entries are never updated or deleted.
async fn append_audit(
    pool: &DbPool,
    conflict_id: &str,
    action: &str,
    performed_by: &str,
    details: &Value,
) -> Result<(), SyncError> {
    sqlx::query(
        r#"
        INSERT INTO conflict_audit (conflict_id, timestamp, action, performed_by, details)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(conflict_id)
    .bind(now_ms())
    .bind(action)
    .bind(performed_by)
    .bind(details.to_string())
    .execute(pool)
    .await?;

    Ok(())
}

/// Union two JSON arrays without duplicates, server elements first.
/// Elements are compared structurally.
fn union_arrays(server: &[Value], local: &[Value]) -> Vec<Value> {
    let mut merged: Vec<Value> = server.to_vec();
    for value in local {
        if !merged.contains(value) {
            merged.push(value.clone());
        }
    }
    merged
}

/// Build the resolved record for a strategy.
///
/// Always starts from the server version; `version` is bumped past the
/// server's and `updatedAt` is stamped fresh.
fn build_resolution(
    strategy: ResolutionStrategy,
    local: &Value,
    server: &Value,
    conflict_fields: &[String],
    merged_data: Option<&Value>,
    now: i64,
) -> Result<Value, SyncError> {
    let server_map = server
        .as_object()
        .cloned()
        .ok_or_else(|| SyncError::internal("Server version is not an object"))?;
    let empty = Map::new();
    let local_map = local.as_object().unwrap_or(&empty);

    let mut resolved = server_map;

    match strategy {
        ResolutionStrategy::ServerWins => {}
        ResolutionStrategy::LocalWins => {
            for (key, value) in local_map {
                resolved.insert(key.clone(), value.clone());
            }
        }
        ResolutionStrategy::Merge => {
            for (key, local_value) in local_map {
                match resolved.get(key).cloned() {
                    // Arrays on both sides are unioned without duplicates
                    Some(Value::Array(server_items)) => {
                        if let Value::Array(local_items) = local_value {
                            resolved.insert(
                                key.clone(),
                                Value::Array(union_arrays(&server_items, local_items)),
                            );
                        }
                        // non-array local against a server array: server wins
                    }
                    // array local against a non-array server value: server wins
                    Some(_) if local_value.is_array() => {}
                    // Non-conflicting local fields overlay the server base
                    _ => {
                        if !conflict_fields.iter().any(|f| f == key) {
                            resolved.insert(key.clone(), local_value.clone());
                        }
                    }
                }
            }
            // Optional partial overlay on top of the mechanical merge
            if let Some(overlay) = merged_data.and_then(Value::as_object) {
                for (key, value) in overlay {
                    resolved.insert(key.clone(), value.clone());
                }
            }
        }
        ResolutionStrategy::Manual => {
            let overlay = merged_data
                .and_then(Value::as_object)
                .ok_or_else(|| {
                    SyncError::invalid_input_field(
                        "MANUAL resolution requires merged data",
                        "merged_data",
                    )
                })?;
            for (key, value) in overlay {
                resolved.insert(key.clone(), value.clone());
            }
        }
    }

    resolved.insert(
        "updatedAt".to_string(),
        Value::String(format_updated_at(now)),
    );
    resolved.insert(
        "version".to_string(),
        Value::from(record_version(server) + 1),
    );

    Ok(Value::Object(resolved))
}

/// Resolve a pending conflict.
///
/// Builds the resolved record, PUTs it to the entity collection, marks the
/// conflict resolved, appends the resolution audit entry, removes the queue
/// item blocked behind the conflict, and reports the resolution to the
/// server (best-effort).
///
/// # Errors
/// - `NotFound` for an unknown conflict id
/// - `InvalidInput` for MANUAL without merged data
/// - `Conflict` when the conflict is already resolved (no state change)
/// - `ResolutionApplyFailed` when the server PUT fails; the conflict stays
///   pending and a failed audit entry is appended
///
/// # Returns
/// The record accepted by the server.
pub async fn resolve(
    pool: &DbPool,
    api: &dyn ServerApi,
    events: &sync_events::EventBus,
    id: &str,
    strategy: ResolutionStrategy,
    merged_data: Option<Value>,
    coordinator_id: &str,
    justification: Option<&str>,
) -> Result<Value, SyncError> {
    let conflict = get(pool, id).await?;

    match conflict.status_enum() {
        ConflictStatus::Resolved => {
            return Err(SyncError::conflict_with_id(
                "Conflict is already resolved",
                id,
            ));
        }
        ConflictStatus::Pending | ConflictStatus::Escalated => {}
    }

    let local = conflict.local_version_json()?;
    let server = conflict.server_version_json()?;
    let conflict_fields = conflict.conflict_fields_parsed();
    let now = now_ms();

    let resolved_record = build_resolution(
        strategy,
        &local,
        &server,
        &conflict_fields,
        merged_data.as_ref(),
        now,
    )?;

    let kind = EntityKind::from(conflict.entity_kind.as_str());

    // Apply to the server; the conflict id doubles as the idempotency key
    // so a replayed apply is deduplicated.
    let applied = match api
        .update_record(kind, &conflict.entity_id, &conflict.id, &resolved_record)
        .await
    {
        Ok(record) => record,
        Err(e) => {
            append_audit(
                pool,
                id,
                AUDIT_RESOLUTION_APPLY_FAILED,
                coordinator_id,
                &serde_json::json!({
                    "strategy": strategy.to_string(),
                    "error": e.to_string(),
                }),
            )
            .await?;
            return Err(SyncError::resolution_apply_failed(e.to_string(), id));
        }
    };

    // The server's authoritative version takes precedence if present
    let final_version = record_version(&applied).max(record_version(&resolved_record));

    sqlx::query(
        r#"
        UPDATE conflicts SET
            status = 'RESOLVED',
            resolution_strategy = ?,
            resolved_by = ?,
            resolved_at = ?,
            justification = ?
        WHERE id = ?
        "#,
    )
    .bind(strategy.to_string())
    .bind(coordinator_id)
    .bind(now)
    .bind(justification)
    .bind(id)
    .execute(pool)
    .await?;

    append_audit(
        pool,
        id,
        AUDIT_CONFLICT_RESOLVED,
        coordinator_id,
        &serde_json::json!({
            "strategy": strategy.to_string(),
            "justification": justification,
            "finalVersion": final_version,
        }),
    )
    .await?;

    // The resolution supersedes the blocked mutation
    if let Some(item_id) = queue_store::remove_blocked_by(pool, id).await? {
        log::debug!("Removed queue item {} superseded by conflict {}", item_id, id);
    }

    events.emit(sync_events::SyncEvent::ConflictResolved {
        conflict_id: id.to_string(),
        entity_kind: conflict.entity_kind.clone(),
        entity_id: conflict.entity_id.clone(),
        strategy: strategy.to_string(),
    });

    // Non-fatal: the entity record already carries the resolution
    if let Err(e) = api
        .report_resolution(&ResolutionReport {
            conflict_id: id.to_string(),
            entity_kind: kind,
            entity_id: conflict.entity_id.clone(),
            strategy: strategy.to_string(),
            resolved_by: coordinator_id.to_string(),
            justification: justification.map(str::to_string),
            final_version,
        })
        .await
    {
        log::warn!("Failed to report resolution for conflict {}: {}", id, e);
    }

    Ok(applied)
}

/// Escalate a pending conflict to a coordinator with more context.
pub async fn escalate(
    pool: &DbPool,
    id: &str,
    coordinator_id: &str,
    reason: &str,
) -> Result<(), SyncError> {
    let conflict = get(pool, id).await?;
    if conflict.status_enum() != ConflictStatus::Pending {
        return Err(SyncError::conflict_with_id(
            "Only pending conflicts can be escalated",
            id,
        ));
    }

    sqlx::query("UPDATE conflicts SET status = 'ESCALATED' WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;

    append_audit(
        pool,
        id,
        AUDIT_CONFLICT_ESCALATED,
        coordinator_id,
        &serde_json::json!({ "reason": reason }),
    )
    .await?;

    Ok(())
}

/// Tombstone resolved conflicts older than the given number of days.
///
/// The audit trail is retained; only the conflict row is archived.
///
/// # Returns
/// Number of conflicts archived.
pub async fn archive_resolved_older_than(pool: &DbPool, days: i64) -> Result<u64, SyncError> {
    let cutoff = now_ms() - days * 24 * 60 * 60 * 1000;

    let result = sqlx::query(
        "UPDATE conflicts SET archived = 1 WHERE status = 'RESOLVED' AND resolved_at < ? AND archived = 0",
    )
    .bind(cutoff)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::conflict::ConflictType;
    use serde_json::json;
    use tempfile::tempdir;

    async fn setup_test_db() -> DbPool {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        std::mem::forget(dir);

        crate::db::initialize(&db_path).await.unwrap()
    }

    fn outcome(fields: &[&str]) -> DetectionOutcome {
        DetectionOutcome {
            conflict_type: ConflictType::FieldLevel,
            severity: ConflictSeverity::High,
            conflict_fields: fields.iter().map(|f| f.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_register_appends_detected_audit() {
        let pool = setup_test_db().await;

        let conflict = register(
            &pool,
            EntityKind::Assessment,
            "a1",
            &json!({"status": "DRAFT"}),
            &json!({"status": "APPROVED", "version": 1}),
            &outcome(&["status"]),
            "sync-worker",
        )
        .await
        .unwrap();

        assert_eq!(conflict.status, "PENDING");

        let trail = audit_trail(&pool, &conflict.id).await.unwrap();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].action, AUDIT_CONFLICT_DETECTED);
        assert!(trail[0].details.contains("fieldsAffected"));
    }

    #[tokio::test]
    async fn test_list_pending_sorted_by_severity_then_recency() {
        let pool = setup_test_db().await;

        let mut medium = outcome(&["score"]);
        medium.severity = ConflictSeverity::Medium;
        register(&pool, EntityKind::Assessment, "a1", &json!({}), &json!({}), &medium, "w")
            .await
            .unwrap();

        let mut critical = outcome(&["id"]);
        critical.severity = ConflictSeverity::Critical;
        register(&pool, EntityKind::Assessment, "a2", &json!({}), &json!({}), &critical, "w")
            .await
            .unwrap();

        let mut high = outcome(&["status"]);
        high.severity = ConflictSeverity::High;
        register(&pool, EntityKind::Incident, "i1", &json!({}), &json!({}), &high, "w")
            .await
            .unwrap();

        let pending = list_pending(&pool, &Default::default()).await.unwrap();
        assert_eq!(pending.len(), 3);
        assert_eq!(pending[0].severity, "CRITICAL");
        assert_eq!(pending[1].severity, "HIGH");
        assert_eq!(pending[2].severity, "MEDIUM");

        let incidents = list_pending(
            &pool,
            &ConflictFilter {
                entity_kind: Some(EntityKind::Incident),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(incidents.len(), 1);
    }

    #[tokio::test]
    async fn test_stats() {
        let pool = setup_test_db().await;

        register(&pool, EntityKind::Assessment, "a1", &json!({}), &json!({}), &outcome(&["status"]), "w")
            .await
            .unwrap();
        register(&pool, EntityKind::Assessment, "a2", &json!({}), &json!({}), &outcome(&["status"]), "w")
            .await
            .unwrap();

        let by_type = stats_by_type(&pool).await.unwrap();
        assert_eq!(by_type.get("FIELD_LEVEL"), Some(&2));

        let by_status = stats_by_status(&pool).await.unwrap();
        assert_eq!(by_status.get("PENDING"), Some(&2));

        let by_severity = stats_by_severity(&pool).await.unwrap();
        assert_eq!(by_severity.get("HIGH"), Some(&2));
    }

    #[test]
    fn test_union_arrays() {
        let server = vec![json!("a"), json!("b")];
        let local = vec![json!("b"), json!("c")];
        assert_eq!(
            union_arrays(&server, &local),
            vec![json!("a"), json!("b"), json!("c")]
        );

        // Structural comparison of object elements
        let server = vec![json!({"k": 1})];
        let local = vec![json!({"k": 1}), json!({"k": 2})];
        assert_eq!(union_arrays(&server, &local).len(), 2);
    }

    #[test]
    fn test_build_resolution_manual() {
        let local = json!({"score": 85, "status": "DRAFT"});
        let server = json!({"score": 90, "status": "APPROVED", "version": 3, "updatedAt": "2024-01-01T10:00:00Z"});

        let resolved = build_resolution(
            ResolutionStrategy::Manual,
            &local,
            &server,
            &["score".to_string(), "status".to_string()],
            Some(&json!({"score": 88, "status": "REVIEWED"})),
            1_704_103_200_000,
        )
        .unwrap();

        assert_eq!(resolved["score"], 88);
        assert_eq!(resolved["status"], "REVIEWED");
        assert_eq!(resolved["version"], 4);
        assert_ne!(resolved["updatedAt"], "2024-01-01T10:00:00Z");
    }

    #[test]
    fn test_build_resolution_manual_requires_data() {
        let result = build_resolution(
            ResolutionStrategy::Manual,
            &json!({}),
            &json!({"version": 1}),
            &[],
            None,
            0,
        );
        assert!(matches!(result, Err(SyncError::InvalidInput { .. })));
    }

    #[test]
    fn test_build_resolution_merge() {
        let local = json!({
            "status": "DRAFT",
            "notes": "site visited",
            "tags": ["flood", "urgent"],
        });
        let server = json!({
            "status": "APPROVED",
            "tags": ["flood", "reviewed"],
            "version": 2,
        });

        let resolved = build_resolution(
            ResolutionStrategy::Merge,
            &local,
            &server,
            &["status".to_string()],
            None,
            0,
        )
        .unwrap();

        // Conflicting field keeps the server value
        assert_eq!(resolved["status"], "APPROVED");
        // Non-conflicting local-only field overlays
        assert_eq!(resolved["notes"], "site visited");
        // Arrays on both sides are unioned without duplicates
        assert_eq!(resolved["tags"], json!(["flood", "reviewed", "urgent"]));
        assert_eq!(resolved["version"], 3);
    }

    #[test]
    fn test_build_resolution_local_and_server_wins() {
        let local = json!({"status": "DRAFT"});
        let server = json!({"status": "APPROVED", "version": 1});

        let local_wins = build_resolution(
            ResolutionStrategy::LocalWins,
            &local,
            &server,
            &["status".to_string()],
            None,
            0,
        )
        .unwrap();
        assert_eq!(local_wins["status"], "DRAFT");

        let server_wins = build_resolution(
            ResolutionStrategy::ServerWins,
            &local,
            &server,
            &["status".to_string()],
            None,
            0,
        )
        .unwrap();
        assert_eq!(server_wins["status"], "APPROVED");
        assert_eq!(server_wins["version"], 2);
    }

    #[tokio::test]
    async fn test_archive_resolved_older_than() {
        let pool = setup_test_db().await;

        let conflict = register(
            &pool,
            EntityKind::Assessment,
            "a1",
            &json!({}),
            &json!({}),
            &outcome(&["status"]),
            "w",
        )
        .await
        .unwrap();

        // Mark resolved far in the past
        sqlx::query("UPDATE conflicts SET status = 'RESOLVED', resolved_by = 'coordA', resolved_at = 1000 WHERE id = ?")
            .bind(&conflict.id)
            .execute(&pool)
            .await
            .unwrap();

        let archived = archive_resolved_older_than(&pool, 30).await.unwrap();
        assert_eq!(archived, 1);

        // Archived conflicts drop out of listings but keep their audit trail
        assert!(list_pending(&pool, &Default::default()).await.unwrap().is_empty());
        assert_eq!(audit_trail(&pool, &conflict.id).await.unwrap().len(), 1);

        // Second pass archives nothing
        assert_eq!(archive_resolved_older_than(&pool, 30).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_escalate() {
        let pool = setup_test_db().await;

        let conflict = register(
            &pool,
            EntityKind::Incident,
            "i1",
            &json!({}),
            &json!({}),
            &outcome(&["status"]),
            "w",
        )
        .await
        .unwrap();

        escalate(&pool, &conflict.id, "coordB", "needs field lead").await.unwrap();

        let escalated = get(&pool, &conflict.id).await.unwrap();
        assert_eq!(escalated.status, "ESCALATED");

        let trail = audit_trail(&pool, &conflict.id).await.unwrap();
        assert_eq!(trail.last().unwrap().action, AUDIT_CONFLICT_ESCALATED);

        // Escalating twice is rejected
        assert!(matches!(
            escalate(&pool, &conflict.id, "coordB", "again").await,
            Err(SyncError::Conflict { .. })
        ));
    }
}
