//! Core services: queue persistence, priority scoring, conflict handling,
//! the background sync engine, and the optimistic coordinator.

pub mod api_client;
pub mod conflict_detect;
pub mod conflict_store;
pub mod field_path;
pub mod optimistic;
pub mod priority;
pub mod queue_store;
pub mod rules;
pub mod sync_engine;
pub mod sync_events;
