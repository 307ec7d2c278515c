//! Background sync engine.
//!
//! Drives queued mutations to terminal states:
//! - Workers claim items through the queue store's lease protocol
//! - Each item is fetched against the server, checked for conflicts, and
//!   applied, blocked, or scheduled for retry with backoff
//! - A scheduler loop runs the pipeline at a configurable interval and on
//!   demand via a command channel
//! - Outcomes are reported to the optimistic coordinator and published on
//!   the event bus

use crate::config::SyncCoreConfig;
use crate::db::pool::DbPool;
use crate::error::SyncError;
use crate::models::conflict::{ConflictSeverity, ConflictType};
use crate::models::queue_item::{ActionType, QueueItem};
use crate::services::api_client::{format_updated_at, record_version, ServerApi};
use crate::services::conflict_detect::{self, DetectionOutcome};
use crate::services::optimistic::OptimisticCoordinator;
use crate::services::sync_events::{EventBus, SyncEvent, SyncPhase};
use crate::services::{conflict_store, queue_store};
use rand::Rng;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, RwLock};
use tokio::time;
use tokio_util::sync::CancellationToken;

/// Maximum number of sync log entries to keep.
const MAX_LOG_ENTRIES: i64 = 50;

/// Get the current Unix timestamp in milliseconds.
fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Terminal disposition of one processing attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    /// Applied to the server and removed from the queue.
    Applied,

    /// A conflict was registered; the item is blocked until resolution.
    Conflicted(String),

    /// Transient failure; another attempt is scheduled.
    RetryScheduled,

    /// No attempts remain (or the error is not retryable).
    TerminalFailed,

    /// The run was cancelled; the claim was released without burning budget.
    Cancelled,
}

/// Commands accepted by the background engine.
#[derive(Debug)]
pub enum SyncCommand {
    /// Run the pipeline immediately.
    TriggerSync,

    /// Replace the configuration.
    UpdateConfig(SyncCoreConfig),

    /// Stop the engine and cancel in-flight work.
    Stop,
}

/// Snapshot of engine state for status displays.
#[derive(Debug, Clone, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    /// Whether a run is in progress.
    pub is_syncing: bool,

    /// Completion time of the last run (Unix millis).
    pub last_sync_time: Option<i64>,

    /// Errors from the last run, if any.
    pub last_error: Option<String>,

    /// Pending items at the end of the last run.
    pub pending_items: i64,

    /// Failed items at the end of the last run.
    pub failed_items: i64,

    /// Conflict-blocked items at the end of the last run.
    pub blocked_items: i64,

    /// Items applied by the last run.
    pub last_run_applied: i64,
}

/// Result of one pipeline run.
#[derive(Debug, Default)]
pub struct SyncResult {
    /// Items applied to the server.
    pub applied: i64,

    /// Conflicts registered.
    pub conflicts: i64,

    /// Attempts that scheduled a retry.
    pub retries: i64,

    /// Items that reached terminal failure.
    pub failed: i64,

    /// Errors encountered outside per-item bookkeeping.
    pub errors: Vec<String>,

    /// Run duration in milliseconds.
    pub duration_ms: i64,
}

/// Sync log entry matching the `sync_log` table.
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct SyncLogEntry {
    pub id: i64,
    pub operation: String,
    pub status: String,
    pub item_id: Option<String>,
    pub message: Option<String>,
    pub duration_ms: Option<i64>,
    pub timestamp: i64,
}

/// Lightweight handle for controlling the background engine.
///
/// Communicates with the scheduler loop over an mpsc channel, avoiding lock
/// contention with the workers.
#[derive(Clone)]
pub struct SyncHandle {
    command_tx: mpsc::Sender<SyncCommand>,
    config: Arc<RwLock<SyncCoreConfig>>,
    status: Arc<RwLock<SyncStatus>>,
}

impl SyncHandle {
    /// Trigger an immediate sync run.
    pub async fn trigger_sync(&self) -> Result<(), SyncError> {
        self.command_tx
            .send(SyncCommand::TriggerSync)
            .await
            .map_err(|_| SyncError::internal("Sync engine not running"))
    }

    /// Replace the engine configuration.
    pub async fn update_config(&self, config: SyncCoreConfig) -> Result<(), SyncError> {
        self.command_tx
            .send(SyncCommand::UpdateConfig(config))
            .await
            .map_err(|_| SyncError::internal("Sync engine not running"))
    }

    /// Stop the engine.
    pub async fn stop(&self) -> Result<(), SyncError> {
        self.command_tx
            .send(SyncCommand::Stop)
            .await
            .map_err(|_| SyncError::internal("Sync engine not running"))
    }

    /// Get the current configuration.
    pub async fn get_config(&self) -> SyncCoreConfig {
        self.config.read().await.clone()
    }

    /// Get the latest status snapshot.
    pub async fn status(&self) -> SyncStatus {
        self.status.read().await.clone()
    }
}

/// Exponential backoff delay for a 1-based attempt number, with jitter in
/// the upper half of the exponential window.
fn backoff_delay_ms(base_ms: i64, max_ms: i64, attempt: i64) -> i64 {
    let exponent = (attempt - 1).clamp(0, 20) as u32;
    let window = base_ms
        .saturating_mul(1i64 << exponent)
        .min(max_ms)
        .max(1);
    let half = window / 2;
    half + rand::thread_rng().gen_range(0..=window - half)
}

/// Build the PUT body for a non-conflicting apply: server record overlaid
/// with the local payload, fresh `updatedAt`, bumped `version`.
fn build_merged_record(server: &Value, payload: &Value, now: i64) -> Value {
    let mut merged = server.as_object().cloned().unwrap_or_default();
    if let Some(local) = payload.as_object() {
        for (key, value) in local {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged.insert("updatedAt".to_string(), Value::String(format_updated_at(now)));
    merged.insert("version".to_string(), Value::from(record_version(server) + 1));
    Value::Object(merged)
}

/// Process one claimed queue item through the per-item protocol.
///
/// The caller must hold the item's lease (fresh from `claim_next`). Every
/// path releases or consumes the lease before returning.
pub async fn process_item(
    pool: &DbPool,
    api: &dyn ServerApi,
    config: &SyncCoreConfig,
    events: &EventBus,
    coordinator: Option<&OptimisticCoordinator>,
    item: &QueueItem,
    cancel: &CancellationToken,
) -> Result<ItemOutcome, SyncError> {
    let start = Instant::now();
    let kind = item.entity_kind_enum();

    let payload = match item.payload_json() {
        Ok(payload) => payload,
        Err(e) => {
            // Corrupt payloads can never apply; fail immediately
            return fail_terminal(pool, events, coordinator, item, &e.to_string()).await;
        }
    };

    if cancel.is_cancelled() {
        queue_store::release_claim(pool, &item.id).await?;
        return Ok(ItemOutcome::Cancelled);
    }

    // Suspension point: server fetch
    let fetch_result = api.get_record(kind, &item.entity_id).await;

    // Re-validate ownership after suspending: a stalled worker whose lease
    // expired and was re-claimed (or whose item was applied by the new
    // holder) must not act on the superseded claim.
    if !still_owns(pool, item).await? {
        return Ok(ItemOutcome::Cancelled);
    }

    let server = match fetch_result {
        Ok(server) => server,
        Err(e) => return handle_apply_error(pool, config, events, coordinator, item, e).await,
    };

    if cancel.is_cancelled() {
        queue_store::release_claim(pool, &item.id).await?;
        return Ok(ItemOutcome::Cancelled);
    }

    let outcome = match (server, item.action_enum()) {
        (None, ActionType::Create) => {
            // Suspension point: server apply
            match api.create_record(kind, &item.id, &payload).await {
                Ok(_) => complete_applied(pool, events, coordinator, item, start).await?,
                Err(e) => {
                    return handle_apply_error(pool, config, events, coordinator, item, e).await
                }
            }
        }
        (None, ActionType::Update) | (None, ActionType::Delete) => {
            let message = format!(
                "Entity {}/{} not found on server",
                kind.collection(),
                item.entity_id
            );
            return fail_terminal(pool, events, coordinator, item, &message).await;
        }
        (Some(server), action) => {
            if let Some(detected) =
                conflict_detect::detect(kind, &payload, &server, config.concurrent_edit_threshold_ms)
            {
                return register_conflict(pool, events, coordinator, item, &payload, &server, detected)
                    .await;
            }

            // Suspension point: server apply
            let apply_result = match action {
                ActionType::Delete => api.delete_record(kind, &item.entity_id, &item.id).await,
                ActionType::Create | ActionType::Update => {
                    let merged = build_merged_record(&server, &payload, now_ms());
                    api.update_record(kind, &item.entity_id, &item.id, &merged)
                        .await
                        .map(|_| ())
                }
            };

            match apply_result {
                Ok(()) => complete_applied(pool, events, coordinator, item, start).await?,
                Err(e) if e.is_version_conflict() => {
                    // The server moved between fetch and apply
                    let detected = DetectionOutcome {
                        conflict_type: ConflictType::ConcurrentEdit,
                        severity: ConflictSeverity::Medium,
                        conflict_fields: Vec::new(),
                    };
                    return register_conflict(
                        pool, events, coordinator, item, &payload, &server, detected,
                    )
                    .await;
                }
                Err(e) => {
                    return handle_apply_error(pool, config, events, coordinator, item, e).await
                }
            }
        }
    };

    Ok(outcome)
}

/// Whether this worker's claim is still the live one: the row exists and
/// its CAS counter matches the claimed snapshot.
async fn still_owns(pool: &DbPool, item: &QueueItem) -> Result<bool, SyncError> {
    match queue_store::get(pool, &item.id).await {
        Ok(current) => Ok(current.row_version == item.row_version),
        Err(SyncError::NotFound { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Success path: remove the item only after the server ack, then notify.
async fn complete_applied(
    pool: &DbPool,
    events: &EventBus,
    coordinator: Option<&OptimisticCoordinator>,
    item: &QueueItem,
    start: Instant,
) -> Result<ItemOutcome, SyncError> {
    queue_store::remove(pool, &item.id).await?;

    events.emit(SyncEvent::ItemSynced {
        item_id: item.id.clone(),
        entity_kind: item.entity_kind.clone(),
        entity_id: item.entity_id.clone(),
    });

    if let Some(coordinator) = coordinator {
        coordinator.confirm_queue_item(&item.id).await;
    }

    log_operation(
        pool,
        "sync_item",
        "success",
        Some(&item.id),
        None,
        Some(start.elapsed().as_millis() as i64),
    )
    .await?;

    Ok(ItemOutcome::Applied)
}

/// Register a conflict, block the item, and notify.
async fn register_conflict(
    pool: &DbPool,
    events: &EventBus,
    coordinator: Option<&OptimisticCoordinator>,
    item: &QueueItem,
    payload: &Value,
    server: &Value,
    detected: DetectionOutcome,
) -> Result<ItemOutcome, SyncError> {
    let kind = item.entity_kind_enum();
    let conflict = conflict_store::register(
        pool,
        kind,
        &item.entity_id,
        payload,
        server,
        &detected,
        "sync-engine",
    )
    .await?;

    queue_store::mark_blocked(pool, &item.id, &conflict.id).await?;

    events.emit(SyncEvent::ConflictDetected {
        conflict_id: conflict.id.clone(),
        entity_kind: conflict.entity_kind.clone(),
        entity_id: conflict.entity_id.clone(),
        conflict_type: conflict.conflict_type.clone(),
        severity: conflict.severity.clone(),
    });

    if let Some(coordinator) = coordinator {
        coordinator
            .fail_queue_item(
                &item.id,
                &format!("Conflict detected ({})", conflict.conflict_type),
                item.retry_count,
            )
            .await;
    }

    log_operation(
        pool,
        "conflict_detected",
        "error",
        Some(&item.id),
        Some(format!(
            "{} conflict on {}/{}",
            conflict.conflict_type, conflict.entity_kind, conflict.entity_id
        )),
        None,
    )
    .await?;

    Ok(ItemOutcome::Conflicted(conflict.id))
}

/// Route a failed fetch/apply into retry scheduling or terminal failure.
async fn handle_apply_error(
    pool: &DbPool,
    config: &SyncCoreConfig,
    events: &EventBus,
    coordinator: Option<&OptimisticCoordinator>,
    item: &QueueItem,
    error: SyncError,
) -> Result<ItemOutcome, SyncError> {
    let message = error.to_string();

    if error.is_retryable() && item.retry_count < item.max_retries {
        let delay = backoff_delay_ms(config.backoff_base_ms, config.backoff_max_ms, item.retry_count);
        queue_store::mark_attempt_failed(pool, &item.id, &message, now_ms() + delay).await?;

        events.emit(SyncEvent::ItemFailed {
            item_id: item.id.clone(),
            entity_kind: item.entity_kind.clone(),
            entity_id: item.entity_id.clone(),
            error: message.clone(),
            terminal: false,
        });

        log_operation(pool, "sync_item", "error", Some(&item.id), Some(message), None).await?;

        return Ok(ItemOutcome::RetryScheduled);
    }

    if error.is_retryable() {
        // Budget exhausted on a transient error: record it without touching
        // the attempt count, which already equals the budget
        queue_store::mark_attempt_failed(pool, &item.id, &message, now_ms()).await?;
        finish_terminal(pool, events, coordinator, item, &message).await?;
        Ok(ItemOutcome::TerminalFailed)
    } else {
        fail_terminal(pool, events, coordinator, item, &message).await
    }
}

/// Non-retryable failure: close out the budget and notify.
async fn fail_terminal(
    pool: &DbPool,
    events: &EventBus,
    coordinator: Option<&OptimisticCoordinator>,
    item: &QueueItem,
    message: &str,
) -> Result<ItemOutcome, SyncError> {
    queue_store::mark_terminal_failed(pool, &item.id, message).await?;
    finish_terminal(pool, events, coordinator, item, message).await?;
    Ok(ItemOutcome::TerminalFailed)
}

async fn finish_terminal(
    pool: &DbPool,
    events: &EventBus,
    coordinator: Option<&OptimisticCoordinator>,
    item: &QueueItem,
    message: &str,
) -> Result<(), SyncError> {
    events.emit(SyncEvent::ItemFailed {
        item_id: item.id.clone(),
        entity_kind: item.entity_kind.clone(),
        entity_id: item.entity_id.clone(),
        error: message.to_string(),
        terminal: true,
    });

    if let Some(coordinator) = coordinator {
        coordinator
            .fail_queue_item(&item.id, message, item.retry_count)
            .await;
    }

    log_operation(
        pool,
        "sync_item",
        "error",
        Some(&item.id),
        Some(format!("terminal: {}", message)),
        None,
    )
    .await
}

/// Background sync engine.
pub struct SyncEngine {
    pool: DbPool,
    api: Arc<dyn ServerApi>,
    coordinator: Option<Arc<OptimisticCoordinator>>,
    config: Arc<RwLock<SyncCoreConfig>>,
    status: Arc<RwLock<SyncStatus>>,
    events: EventBus,
    cancel: CancellationToken,
}

impl SyncEngine {
    /// Create an engine for direct (foreground) use.
    pub fn new(
        pool: DbPool,
        api: Arc<dyn ServerApi>,
        coordinator: Option<Arc<OptimisticCoordinator>>,
        config: Arc<RwLock<SyncCoreConfig>>,
        events: EventBus,
    ) -> Self {
        Self {
            pool,
            api,
            coordinator,
            config,
            status: Arc::new(RwLock::new(SyncStatus::default())),
            events,
            cancel: CancellationToken::new(),
        }
    }

    /// Cancellation token honored at suspension points.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Start the background scheduler.
    ///
    /// Spawns a task that owns the engine and runs the pipeline at the
    /// configured interval (first run immediately). Returns a `SyncHandle`
    /// for sending commands without holding any engine lock.
    pub fn start_background(
        pool: DbPool,
        api: Arc<dyn ServerApi>,
        coordinator: Option<Arc<OptimisticCoordinator>>,
        config: SyncCoreConfig,
        events: EventBus,
    ) -> SyncHandle {
        let (tx, mut rx) = mpsc::channel::<SyncCommand>(16);
        let config_shared = Arc::new(RwLock::new(config));
        let status_shared = Arc::new(RwLock::new(SyncStatus::default()));

        let engine = SyncEngine {
            pool,
            api,
            coordinator,
            config: config_shared.clone(),
            status: status_shared.clone(),
            events,
            cancel: CancellationToken::new(),
        };

        tokio::spawn(async move {
            let interval_secs = { engine.config.read().await.sync_interval_secs };
            let mut interval = time::interval(Duration::from_secs(interval_secs.max(1)));

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = engine.run_sync().await {
                            log::warn!("Periodic sync failed: {}", e);
                        }
                        engine.housekeeping().await;
                    }
                    Some(cmd) = rx.recv() => {
                        match cmd {
                            SyncCommand::TriggerSync => {
                                if let Err(e) = engine.run_sync().await {
                                    log::warn!("Triggered sync failed: {}", e);
                                }
                            }
                            SyncCommand::UpdateConfig(new_config) => {
                                log::info!(
                                    "Sync config updated, interval={}s",
                                    new_config.sync_interval_secs
                                );
                                interval = time::interval(Duration::from_secs(
                                    new_config.sync_interval_secs.max(1),
                                ));
                                *engine.config.write().await = new_config;
                            }
                            SyncCommand::Stop => {
                                engine.cancel.cancel();
                                break;
                            }
                        }
                    }
                }
            }
            log::info!("Sync engine stopped");
        });

        SyncHandle {
            command_tx: tx,
            config: config_shared,
            status: status_shared,
        }
    }

    /// Run one pipeline pass: workers drain the queue until no item is
    /// claimable.
    pub async fn run_sync(&self) -> Result<SyncResult, SyncError> {
        let start = Instant::now();
        let config = self.config.read().await.clone();

        {
            let mut status = self.status.write().await;
            status.is_syncing = true;
        }
        self.events.emit(SyncEvent::Progress {
            phase: SyncPhase::Starting,
            message: "Starting sync".to_string(),
            processed: None,
        });
        self.events.emit(SyncEvent::Progress {
            phase: SyncPhase::ProcessingQueue,
            message: "Processing queue".to_string(),
            processed: None,
        });

        let workers = config.concurrent_entity_syncs.max(1);
        let mut handles = Vec::with_capacity(workers);

        for _ in 0..workers {
            let pool = self.pool.clone();
            let api = self.api.clone();
            let events = self.events.clone();
            let coordinator = self.coordinator.clone();
            let cancel = self.cancel.clone();
            let config = config.clone();

            handles.push(tokio::spawn(async move {
                let mut result = SyncResult::default();
                loop {
                    if cancel.is_cancelled() {
                        break;
                    }

                    let claimed =
                        match queue_store::claim_next(&pool, now_ms(), config.lease_timeout_ms)
                            .await
                        {
                            Ok(Some(item)) => item,
                            Ok(None) => break,
                            Err(e) => {
                                result.errors.push(format!("claim failed: {}", e));
                                break;
                            }
                        };

                    match process_item(
                        &pool,
                        api.as_ref(),
                        &config,
                        &events,
                        coordinator.as_deref(),
                        &claimed,
                        &cancel,
                    )
                    .await
                    {
                        Ok(ItemOutcome::Applied) => result.applied += 1,
                        Ok(ItemOutcome::Conflicted(_)) => result.conflicts += 1,
                        Ok(ItemOutcome::RetryScheduled) => result.retries += 1,
                        Ok(ItemOutcome::TerminalFailed) => result.failed += 1,
                        Ok(ItemOutcome::Cancelled) => break,
                        Err(e) => {
                            result
                                .errors
                                .push(format!("item {}: {}", claimed.id, e));
                        }
                    }
                }
                result
            }));
        }

        let mut result = SyncResult::default();
        for joined in futures::future::join_all(handles).await {
            match joined {
                Ok(worker_result) => {
                    result.applied += worker_result.applied;
                    result.conflicts += worker_result.conflicts;
                    result.retries += worker_result.retries;
                    result.failed += worker_result.failed;
                    result.errors.extend(worker_result.errors);
                }
                Err(e) => result.errors.push(format!("worker panicked: {}", e)),
            }
        }

        result.duration_ms = start.elapsed().as_millis() as i64;

        // Refresh the status snapshot from the queue
        let queue = queue_store::summary(&self.pool, now_ms()).await?;
        {
            let mut status = self.status.write().await;
            status.is_syncing = false;
            status.last_sync_time = Some(now_ms());
            status.pending_items = queue.pending;
            status.failed_items = queue.failed;
            status.blocked_items = queue.blocked;
            status.last_run_applied = result.applied;
            status.last_error = if result.errors.is_empty() {
                None
            } else {
                Some(result.errors.join("; "))
            };
        }

        if result.errors.is_empty() {
            self.events.emit(SyncEvent::Progress {
                phase: SyncPhase::Complete,
                message: format!(
                    "Sync complete: {} applied, {} conflicts, {} retries in {}ms",
                    result.applied, result.conflicts, result.retries, result.duration_ms
                ),
                processed: Some(result.applied),
            });
        } else {
            self.events.emit(SyncEvent::Progress {
                phase: SyncPhase::Failed,
                message: result.errors.join("; "),
                processed: Some(result.applied),
            });
        }

        log_operation(
            &self.pool,
            "sync_complete",
            if result.errors.is_empty() { "success" } else { "error" },
            None,
            Some(format!(
                "Applied {}, {} conflicts, {} retries, {} failed",
                result.applied, result.conflicts, result.retries, result.failed
            )),
            Some(result.duration_ms),
        )
        .await?;

        Ok(result)
    }

    /// Periodic maintenance: GC confirmed optimistic updates and tombstone
    /// old resolved conflicts.
    async fn housekeeping(&self) {
        if let Some(coordinator) = &self.coordinator {
            let removed = coordinator.gc_confirmed().await;
            if removed > 0 {
                log::debug!("Garbage-collected {} confirmed updates", removed);
            }
        }

        let archive_days = { self.config.read().await.conflict_archive_days };
        match conflict_store::archive_resolved_older_than(&self.pool, archive_days).await {
            Ok(0) => {}
            Ok(archived) => log::debug!("Archived {} resolved conflicts", archived),
            Err(e) => log::warn!("Conflict archiving failed: {}", e),
        }
    }
}

/// Append a sync log entry and prune old ones.
pub async fn log_operation(
    pool: &DbPool,
    operation: &str,
    status: &str,
    item_id: Option<&str>,
    message: Option<String>,
    duration_ms: Option<i64>,
) -> Result<(), SyncError> {
    sqlx::query(
        r#"
        INSERT INTO sync_log (operation, status, item_id, message, duration_ms, timestamp)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(operation)
    .bind(status)
    .bind(item_id)
    .bind(&message)
    .bind(duration_ms)
    .bind(now_ms())
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        DELETE FROM sync_log WHERE id NOT IN (
            SELECT id FROM sync_log ORDER BY timestamp DESC, id DESC LIMIT ?
        )
        "#,
    )
    .bind(MAX_LOG_ENTRIES)
    .execute(pool)
    .await?;

    Ok(())
}

/// Read recent sync log entries, newest first.
pub async fn get_sync_log(pool: &DbPool, limit: i64) -> Result<Vec<SyncLogEntry>, SyncError> {
    let entries = sqlx::query_as::<_, SyncLogEntry>(
        "SELECT id, operation, status, item_id, message, duration_ms, timestamp FROM sync_log ORDER BY timestamp DESC, id DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(entries)
}
