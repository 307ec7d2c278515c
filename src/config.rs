//! Sync core configuration.

use serde::{Deserialize, Serialize};

/// Default scheduler cadence in seconds (5 minutes).
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 300;

/// Configuration for the sync core.
///
/// Serializable so embedders can persist it in their settings store and
/// feed it back on startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncCoreConfig {
    /// Base URL of the central server (e.g. `https://dms.example.org`).
    pub base_url: String,

    /// Maximum sync attempts for queue items created directly.
    pub max_retries_core: i64,

    /// Maximum sync attempts for queue items linked to an optimistic update.
    pub max_retries_optimistic: i64,

    /// Per-request timeout in milliseconds.
    pub request_timeout_ms: u64,

    /// Lease duration for a claimed queue item, in milliseconds.
    /// Expired leases are re-claimable by any worker.
    pub lease_timeout_ms: i64,

    /// Number of concurrent sync workers (each holds at most one entity).
    pub concurrent_entity_syncs: usize,

    /// Base delay for exponential backoff, in milliseconds.
    pub backoff_base_ms: i64,

    /// Backoff delay cap, in milliseconds.
    pub backoff_max_ms: i64,

    /// Seconds a confirmed optimistic update is retained before garbage
    /// collection.
    pub confirmed_gc_seconds: i64,

    /// Resolved conflicts older than this many days are tombstoned.
    pub conflict_archive_days: i64,

    /// Window within which a newer server edit classifies as a concurrent
    /// edit, in milliseconds.
    pub concurrent_edit_threshold_ms: i64,

    /// Background scheduler interval in seconds.
    pub sync_interval_secs: u64,
}

impl Default for SyncCoreConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            max_retries_core: 10,
            max_retries_optimistic: 3,
            request_timeout_ms: 30_000,
            // Lease outlives the slowest request by 2x so a wedged worker
            // cannot strand an item.
            lease_timeout_ms: 60_000,
            concurrent_entity_syncs: 4,
            backoff_base_ms: 500,
            backoff_max_ms: 60_000,
            confirmed_gc_seconds: 30,
            conflict_archive_days: 30,
            concurrent_edit_threshold_ms: 300_000,
            sync_interval_secs: DEFAULT_SYNC_INTERVAL_SECS,
        }
    }
}
