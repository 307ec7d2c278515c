//! Schema migrations for the sync core database.
//!
//! Statements are idempotent (`IF NOT EXISTS`) and applied in order on every
//! startup. The queue table carries both the interop columns surfaced to
//! consumers and internal scheduling columns (lease, backoff, CAS counter)
//! that never leave the store.

use super::pool::DbPool;
use crate::error::SyncError;

/// All schema statements, applied in order.
const MIGRATIONS: &[&str] = &[
    // Durable mutation queue
    r#"
    CREATE TABLE IF NOT EXISTS sync_queue (
        id TEXT PRIMARY KEY,
        entity_kind TEXT NOT NULL,
        action TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        payload TEXT NOT NULL,
        priority_label TEXT NOT NULL,
        priority_score INTEGER NOT NULL,
        priority_reason TEXT NOT NULL DEFAULT '',
        manual_override TEXT,
        estimated_sync_time INTEGER,
        created_at INTEGER NOT NULL,
        last_attempt_at INTEGER,
        retry_count INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        max_retries INTEGER NOT NULL,
        next_attempt_at INTEGER NOT NULL DEFAULT 0,
        lease_expires_at INTEGER,
        blocked_by_conflict TEXT,
        row_version INTEGER NOT NULL DEFAULT 0
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_sync_queue_entity ON sync_queue(entity_kind, entity_id)",
    "CREATE INDEX IF NOT EXISTS idx_sync_queue_order ON sync_queue(priority_score DESC, created_at ASC)",
    // Priority rules
    r#"
    CREATE TABLE IF NOT EXISTS priority_rules (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        entity_kind TEXT NOT NULL,
        conditions TEXT NOT NULL DEFAULT '[]',
        score_modifier INTEGER NOT NULL DEFAULT 0,
        active INTEGER NOT NULL DEFAULT 1,
        created_by TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        position INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_priority_rules_kind ON priority_rules(entity_kind, active)",
    // Conflicts
    r#"
    CREATE TABLE IF NOT EXISTS conflicts (
        id TEXT PRIMARY KEY,
        entity_kind TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        conflict_type TEXT NOT NULL,
        severity TEXT NOT NULL,
        local_version TEXT NOT NULL,
        server_version TEXT NOT NULL,
        conflict_fields TEXT NOT NULL DEFAULT '[]',
        detected_at INTEGER NOT NULL,
        detected_by TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'PENDING',
        resolution_strategy TEXT,
        resolved_by TEXT,
        resolved_at INTEGER,
        justification TEXT,
        archived INTEGER NOT NULL DEFAULT 0
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_conflicts_status ON conflicts(status, archived)",
    "CREATE INDEX IF NOT EXISTS idx_conflicts_entity ON conflicts(entity_kind, entity_id)",
    // Append-only audit trail. Rows are inserted, never updated or deleted;
    // archiving a conflict tombstones the conflict row only.
    r#"
    CREATE TABLE IF NOT EXISTS conflict_audit (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        conflict_id TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        action TEXT NOT NULL,
        performed_by TEXT NOT NULL,
        details TEXT NOT NULL DEFAULT '{}',
        FOREIGN KEY (conflict_id) REFERENCES conflicts(id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_conflict_audit_conflict ON conflict_audit(conflict_id, id)",
    // Recent sync operation log for status display
    r#"
    CREATE TABLE IF NOT EXISTS sync_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        operation TEXT NOT NULL,
        status TEXT NOT NULL,
        item_id TEXT,
        message TEXT,
        duration_ms INTEGER,
        timestamp INTEGER NOT NULL
    )
    "#,
];

/// Apply all migrations to the database.
pub async fn run_migrations(pool: &DbPool) -> Result<(), SyncError> {
    for statement in MIGRATIONS {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| SyncError::database_with_op(e.to_string(), "run_migrations"))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::pool::create_pool;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_migrations_apply() {
        let dir = tempdir().unwrap();
        let pool = create_pool(&dir.path().join("test.db")).await.unwrap();

        run_migrations(&pool).await.unwrap();

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();

        let names: Vec<&str> = tables.iter().map(|t| t.0.as_str()).collect();
        assert!(names.contains(&"sync_queue"));
        assert!(names.contains(&"priority_rules"));
        assert!(names.contains(&"conflicts"));
        assert!(names.contains(&"conflict_audit"));
        assert!(names.contains(&"sync_log"));
    }

    #[tokio::test]
    async fn test_migrations_idempotent() {
        let dir = tempdir().unwrap();
        let pool = create_pool(&dir.path().join("test.db")).await.unwrap();

        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();
    }
}
