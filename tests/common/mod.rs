//! Shared test fixtures: tempdir-backed database setup and an in-memory
//! server fake with scriptable failures and idempotency-key deduplication.

use async_trait::async_trait;
use fieldsync::db::DbPool;
use fieldsync::error::SyncError;
use fieldsync::models::EntityKind;
use fieldsync::services::api_client::{ResolutionReport, ServerApi};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use tempfile::tempdir;

/// Create an initialized database in a leaked tempdir.
pub async fn setup_test_db() -> DbPool {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("test.db");
    // Keep the dir alive by leaking it (for test purposes)
    std::mem::forget(dir);

    fieldsync::db::initialize(&db_path).await.unwrap()
}

/// In-memory stand-in for the central server.
///
/// Records are keyed by `collection/id`. Failures are scripted per call
/// class and popped FIFO. Mutating calls deduplicate on the idempotency key,
/// mirroring the server-side contract, so `applies()` counts distinct
/// applies even when a request is replayed.
#[derive(Default)]
pub struct MockServer {
    records: Mutex<HashMap<String, Value>>,
    fail_gets: Mutex<VecDeque<u16>>,
    fail_applies: Mutex<VecDeque<u16>>,
    seen_request_ids: Mutex<HashSet<String>>,
    applies: Mutex<Vec<Value>>,
    resolutions: Mutex<Vec<ResolutionReport>>,
}

impl MockServer {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(kind: EntityKind, id: &str) -> String {
        format!("{}/{}", kind.collection(), id)
    }

    pub fn insert(&self, kind: EntityKind, id: &str, record: Value) {
        self.records
            .lock()
            .unwrap()
            .insert(Self::key(kind, id), record);
    }

    pub fn get(&self, kind: EntityKind, id: &str) -> Option<Value> {
        self.records.lock().unwrap().get(&Self::key(kind, id)).cloned()
    }

    /// Script the next fetches to fail with the given HTTP statuses.
    pub fn fail_next_gets(&self, statuses: &[u16]) {
        self.fail_gets.lock().unwrap().extend(statuses);
    }

    /// Script the next applies (POST/PUT/DELETE) to fail.
    pub fn fail_next_applies(&self, statuses: &[u16]) {
        self.fail_applies.lock().unwrap().extend(statuses);
    }

    /// Bodies of distinct (deduplicated) applies, in order.
    pub fn applies(&self) -> Vec<Value> {
        self.applies.lock().unwrap().clone()
    }

    /// Resolution reports received.
    pub fn resolution_count(&self) -> usize {
        self.resolutions.lock().unwrap().len()
    }

    fn pop_failure(queue: &Mutex<VecDeque<u16>>) -> Option<SyncError> {
        queue
            .lock()
            .unwrap()
            .pop_front()
            .map(|status| SyncError::server_api_full(format!("HTTP {}", status), status, "/mock"))
    }

    /// Record an apply unless the request id was already seen.
    fn record_apply(&self, request_id: &str, body: Value) -> bool {
        let mut seen = self.seen_request_ids.lock().unwrap();
        if !seen.insert(request_id.to_string()) {
            return false;
        }
        self.applies.lock().unwrap().push(body);
        true
    }
}

#[async_trait]
impl ServerApi for MockServer {
    async fn get_record(&self, kind: EntityKind, id: &str) -> Result<Option<Value>, SyncError> {
        if let Some(e) = Self::pop_failure(&self.fail_gets) {
            return Err(e);
        }
        Ok(self.get(kind, id))
    }

    async fn create_record(
        &self,
        kind: EntityKind,
        request_id: &str,
        payload: &Value,
    ) -> Result<Value, SyncError> {
        if let Some(e) = Self::pop_failure(&self.fail_applies) {
            return Err(e);
        }

        let id = payload
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or(request_id)
            .to_string();
        let mut record = payload.clone();
        if let Some(map) = record.as_object_mut() {
            map.entry("version").or_insert(json!(1));
        }

        if self.record_apply(request_id, record.clone()) {
            self.insert(kind, &id, record.clone());
        }
        Ok(record)
    }

    async fn update_record(
        &self,
        kind: EntityKind,
        id: &str,
        request_id: &str,
        payload: &Value,
    ) -> Result<Value, SyncError> {
        if let Some(e) = Self::pop_failure(&self.fail_applies) {
            return Err(e);
        }

        if self.record_apply(request_id, payload.clone()) {
            self.insert(kind, id, payload.clone());
        }
        Ok(self.get(kind, id).unwrap_or_else(|| payload.clone()))
    }

    async fn delete_record(
        &self,
        kind: EntityKind,
        id: &str,
        request_id: &str,
    ) -> Result<(), SyncError> {
        if let Some(e) = Self::pop_failure(&self.fail_applies) {
            return Err(e);
        }

        if self.record_apply(request_id, json!({"deleted": Self::key(kind, id)})) {
            self.records.lock().unwrap().remove(&Self::key(kind, id));
        }
        Ok(())
    }

    async fn report_resolution(&self, report: &ResolutionReport) -> Result<(), SyncError> {
        self.resolutions.lock().unwrap().push(report.clone());
        Ok(())
    }
}
