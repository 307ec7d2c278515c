//! End-to-end pipeline verification.
//!
//! Drives the full offline flow: an optimistic mutation enters the
//! coordinator, lands in the durable queue with a computed priority, a sync
//! run applies it to the server, and the entity UI state settles. Also
//! exercises at-most-once delivery under a duplicated lease and
//! override-driven claim ordering.

mod common;

use common::{setup_test_db, MockServer};
use fieldsync::config::SyncCoreConfig;
use fieldsync::models::{ActionType, EntityKind, OptimisticStatus, SyncState};
use fieldsync::services::optimistic::OptimisticCoordinator;
use fieldsync::services::sync_engine::{self, ItemOutcome, SyncEngine};
use fieldsync::services::sync_events::EventBus;
use fieldsync::services::{queue_store, rules};
use serde_json::json;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn fast_config() -> SyncCoreConfig {
    SyncCoreConfig {
        backoff_base_ms: 1,
        backoff_max_ms: 2,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_non_conflicting_update_end_to_end() {
    let pool = setup_test_db().await;
    let server = Arc::new(MockServer::new());
    let config = fast_config();
    let events = EventBus::new();

    server.insert(
        EntityKind::Assessment,
        "a1",
        json!({"status": "DRAFT", "score": 85, "updatedAt": "2024-01-01T10:00:00Z", "version": 1}),
    );

    let shared_config = Arc::new(RwLock::new(config.clone()));
    let coordinator = Arc::new(OptimisticCoordinator::new(
        pool.clone(),
        shared_config.clone(),
        events.clone(),
    ));

    let update_id = coordinator
        .apply(
            EntityKind::Assessment,
            "a1",
            ActionType::Update,
            json!({"status": "DRAFT", "score": 87, "updatedAt": "2024-01-01T10:05:00Z"}),
            Some(json!({"status": "DRAFT", "score": 85})),
        )
        .await
        .unwrap();

    let engine = SyncEngine::new(
        pool.clone(),
        server.clone(),
        Some(coordinator.clone()),
        shared_config,
        events,
    );
    let result = engine.run_sync().await.unwrap();
    assert_eq!(result.applied, 1);
    assert!(result.errors.is_empty());

    // PUT body carries the merged record with a bumped version
    let applies = server.applies();
    assert_eq!(applies.len(), 1);
    assert_eq!(applies[0]["status"], "DRAFT");
    assert_eq!(applies[0]["score"], 87);
    assert_eq!(applies[0]["version"], 2);

    // Queue drained
    assert_eq!(queue_store::summary(&pool, now_ms()).await.unwrap().total, 0);

    // Entity surfaced as synced
    let state = coordinator
        .entity_state(EntityKind::Assessment, "a1")
        .await
        .unwrap();
    assert_eq!(state.sync_status, SyncState::Synced);

    let update = coordinator.get_update(&update_id).await.unwrap();
    assert_eq!(update.status, OptimisticStatus::Confirmed);
}

#[tokio::test]
async fn test_duplicate_lease_applies_at_most_once() {
    let pool = setup_test_db().await;
    let server = MockServer::new();
    let config = fast_config();

    server.insert(
        EntityKind::Assessment,
        "a1",
        json!({"status": "DRAFT", "updatedAt": "2024-01-01T10:00:00Z", "version": 1}),
    );

    let item = fieldsync::models::QueueItem::new(
        EntityKind::Assessment,
        ActionType::Update,
        "a1",
        &json!({"status": "DRAFT", "notes": "visit", "updatedAt": "2024-01-01T10:05:00Z"}),
        10,
        now_ms(),
    );
    queue_store::enqueue(&pool, &item).await.unwrap();

    // Worker A claims with a short lease, stalls, and the lease expires
    let now = now_ms();
    let snapshot_a = queue_store::claim_next(&pool, now, 10).await.unwrap().unwrap();

    // Worker B re-claims after expiry
    let snapshot_b = queue_store::claim_next(&pool, now + 20, 60_000)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(snapshot_a.id, snapshot_b.id);

    // Both workers push their attempt; the idempotency key dedups server-side
    let events = EventBus::new();
    let cancel = CancellationToken::new();
    let outcome_b = sync_engine::process_item(
        &pool, &server, &config, &events, None, &snapshot_b, &cancel,
    )
    .await
    .unwrap();
    assert_eq!(outcome_b, ItemOutcome::Applied);

    // Worker A resumes with its stale claim and stands down
    let outcome_a = sync_engine::process_item(
        &pool, &server, &config, &events, None, &snapshot_a, &cancel,
    )
    .await
    .unwrap();
    assert_eq!(outcome_a, ItemOutcome::Cancelled);

    // A single server apply was observed
    assert_eq!(server.applies().len(), 1);
    assert_eq!(queue_store::summary(&pool, now_ms()).await.unwrap().total, 0);
}

#[tokio::test]
async fn test_priority_override_reorders_claims() {
    let pool = setup_test_db().await;

    // Three pending mutations on distinct entities with computed scores
    let mut ids = Vec::new();
    for (entity, score) in [("a1", 55i64), ("a2", 60), ("a3", 50)] {
        let mut item = fieldsync::models::QueueItem::new(
            EntityKind::Assessment,
            ActionType::Update,
            entity,
            &json!({"status": "DRAFT"}),
            10,
            now_ms(),
        );
        item.priority_score = score;
        item.priority_label = fieldsync::models::PriorityLabel::from_score(score).to_string();
        queue_store::enqueue(&pool, &item).await.unwrap();
        ids.push(item.id);
    }

    // Coordinator bumps the lowest-priority item to the front
    let overridden = rules::override_priority(&pool, &ids[2], 95, "coordA", "Emergency")
        .await
        .unwrap();
    assert_eq!(overridden.priority_score, 95);
    assert_eq!(overridden.priority_label, "CRITICAL");
    assert!(overridden.priority_reason.contains("manual override: Emergency"));

    // Claim order: overridden item first, then by computed score
    let first = queue_store::claim_next(&pool, now_ms(), 60_000).await.unwrap().unwrap();
    assert_eq!(first.entity_id, "a3");
    let second = queue_store::claim_next(&pool, now_ms(), 60_000).await.unwrap().unwrap();
    assert_eq!(second.entity_id, "a2");
    let third = queue_store::claim_next(&pool, now_ms(), 60_000).await.unwrap().unwrap();
    assert_eq!(third.entity_id, "a1");
}

#[tokio::test]
async fn test_create_flows_through_pipeline() {
    let pool = setup_test_db().await;
    let server = Arc::new(MockServer::new());
    let config = fast_config();
    let events = EventBus::new();

    let shared_config = Arc::new(RwLock::new(config));
    let coordinator = Arc::new(OptimisticCoordinator::new(
        pool.clone(),
        shared_config.clone(),
        events.clone(),
    ));

    coordinator
        .apply(
            EntityKind::Incident,
            "i1",
            ActionType::Create,
            json!({"id": "i1", "severity": "HIGH", "status": "OPEN", "updatedAt": "2024-01-01T10:00:00Z"}),
            None,
        )
        .await
        .unwrap();

    let engine = SyncEngine::new(
        pool.clone(),
        server.clone(),
        Some(coordinator.clone()),
        shared_config,
        events,
    );
    let result = engine.run_sync().await.unwrap();
    assert_eq!(result.applied, 1);

    // The record exists server-side now
    let created = server.get(EntityKind::Incident, "i1").unwrap();
    assert_eq!(created["severity"], "HIGH");

    let state = coordinator
        .entity_state(EntityKind::Incident, "i1")
        .await
        .unwrap();
    assert_eq!(state.sync_status, SyncState::Synced);
}
