//! fieldsync - Offline sync core for humanitarian data-collection clients.
//!
//! The core durably queues local mutations in SQLite, orders them by a
//! rule-driven priority policy with coordinator overrides, detects and
//! classifies field-level conflicts against the central server, coordinates
//! resolution with an append-only audit trail, and drives optimistic UI
//! state with safe rollback.
//!
//! Embedders wire the pieces together with explicit handles (no global
//! state):
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokio::sync::RwLock;
//! use fieldsync::config::SyncCoreConfig;
//! use fieldsync::services::api_client::HttpServerApi;
//! use fieldsync::services::optimistic::OptimisticCoordinator;
//! use fieldsync::services::sync_engine::SyncEngine;
//! use fieldsync::services::sync_events::EventBus;
//!
//! # async fn run() -> Result<(), fieldsync::error::SyncError> {
//! let config = SyncCoreConfig {
//!     base_url: "https://dms.example.org".to_string(),
//!     ..Default::default()
//! };
//! let pool = fieldsync::db::initialize(std::path::Path::new("fieldsync.db")).await?;
//! let events = EventBus::new();
//! let api = Arc::new(HttpServerApi::new(&config)?);
//! let shared_config = Arc::new(RwLock::new(config.clone()));
//! let coordinator = Arc::new(OptimisticCoordinator::new(
//!     pool.clone(),
//!     shared_config,
//!     events.clone(),
//! ));
//! let handle = SyncEngine::start_background(pool, api, Some(coordinator), config, events);
//! handle.trigger_sync().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;

pub use config::SyncCoreConfig;
pub use error::SyncError;
pub use models::{
    ActionType, AuditEntry, Condition, ConditionOperator, Conflict, ConflictSeverity,
    ConflictStatus, ConflictType, EntityKind, EntityUiState, ManualOverride, OptimisticStatus,
    OptimisticUpdate, PriorityLabel, PriorityRule, QueueItem, QueueItemStatus, ResolutionStrategy,
    SyncState,
};
pub use services::sync_engine::{SyncHandle, SyncStatus};
pub use services::sync_events::{EventBus, SyncEvent};
