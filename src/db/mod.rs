//! Database layer for local SQLite storage.
//!
//! This module handles all database operations including:
//! - Connection pool management with WAL mode
//! - Schema migrations

pub mod migrations;
pub mod pool;

pub use pool::DbPool;

use crate::error::SyncError;
use std::path::{Path, PathBuf};

/// Get the path to the SQLite database file inside a data directory.
pub fn get_db_path(data_dir: &Path) -> PathBuf {
    data_dir.join("fieldsync.db")
}

/// Create the connection pool and apply schema migrations.
pub async fn initialize(db_path: &Path) -> Result<DbPool, SyncError> {
    let pool = pool::create_pool(db_path)
        .await
        .map_err(|e| SyncError::database_with_op(e.to_string(), "create_pool"))?;

    migrations::run_migrations(&pool).await?;

    Ok(pool)
}
