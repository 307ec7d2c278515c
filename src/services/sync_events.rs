//! Sync event types and broadcast bus.
//!
//! Events are published during sync operations so embedding UIs can
//! reactively update queue badges, conflict lists, and entity state without
//! polling. Consumers subscribe to a broadcast channel; a lagging or absent
//! consumer never blocks the pipeline.

use serde::Serialize;
use tokio::sync::broadcast;

/// Buffered events per subscriber before lagging consumers drop messages.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Phase of a sync run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    /// Run starting.
    Starting,

    /// Workers draining the queue.
    ProcessingQueue,

    /// Run completed.
    Complete,

    /// Run failed.
    Failed,
}

/// Events published by the sync core.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    /// Progress of the current sync run.
    Progress {
        phase: SyncPhase,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        processed: Option<i64>,
    },

    /// A queue item was applied to the server and removed.
    ItemSynced {
        item_id: String,
        entity_kind: String,
        entity_id: String,
    },

    /// A queue item attempt failed (retry scheduled or terminal).
    ItemFailed {
        item_id: String,
        entity_kind: String,
        entity_id: String,
        error: String,
        terminal: bool,
    },

    /// A conflict was detected and registered.
    ConflictDetected {
        conflict_id: String,
        entity_kind: String,
        entity_id: String,
        conflict_type: String,
        severity: String,
    },

    /// A conflict was resolved and applied.
    ConflictResolved {
        conflict_id: String,
        entity_kind: String,
        entity_id: String,
        strategy: String,
    },

    /// An optimistic update changed state.
    OptimisticUpdated {
        update_id: String,
        entity_kind: String,
        entity_id: String,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        restored_data: Option<serde_json::Value>,
    },
}

/// Broadcast bus for sync events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. A send with no subscribers is a no-op.
    pub fn emit(&self, event: SyncEvent) {
        if self.tx.send(event).is_err() {
            log::debug!("No event subscribers; event dropped");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_and_receive() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(SyncEvent::ItemSynced {
            item_id: "q1".to_string(),
            entity_kind: "ASSESSMENT".to_string(),
            entity_id: "a1".to_string(),
        });

        match rx.recv().await.unwrap() {
            SyncEvent::ItemSynced { item_id, .. } => assert_eq!(item_id, "q1"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_emit_without_subscribers_is_noop() {
        let bus = EventBus::new();
        bus.emit(SyncEvent::Progress {
            phase: SyncPhase::Starting,
            message: "Starting sync...".to_string(),
            processed: None,
        });
    }

    #[test]
    fn test_event_serialization() {
        let event = SyncEvent::ConflictDetected {
            conflict_id: "c1".to_string(),
            entity_kind: "ASSESSMENT".to_string(),
            entity_id: "a1".to_string(),
            conflict_type: "FIELD_LEVEL".to_string(),
            severity: "HIGH".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"conflict_detected\""));
        assert!(json.contains("\"severity\":\"HIGH\""));
    }
}
