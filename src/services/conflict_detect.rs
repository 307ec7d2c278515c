//! Field-level conflict detection.
//!
//! Compares a local mutation payload with the server record over the
//! entity kind's critical fields, classifies the conflict type from the
//! timestamp relationship, and assigns a triage severity. Deterministic for
//! a fixed (local, server, threshold) triple.

use crate::models::conflict::{ConflictSeverity, ConflictType};
use crate::models::queue_item::EntityKind;
use crate::services::api_client::record_updated_at_ms;
use crate::services::field_path;
use serde_json::Value;

/// Fields whose divergence always classifies as CRITICAL.
const CRITICAL_FIELDS: &[&str] = &["entityId", "entityType", "id", "userId"];

/// Fields whose divergence classifies as HIGH.
const HIGH_FIELDS: &[&str] = &["status", "priority", "assignedTo", "approvalStatus", "severity"];

/// Fields whose divergence classifies as MEDIUM.
const MEDIUM_FIELDS: &[&str] = &["score", "riskLevel", "responseType", "resources", "timeline"];

/// Outcome of conflict detection.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionOutcome {
    pub conflict_type: ConflictType,
    pub severity: ConflictSeverity,
    /// Critical fields that differ, in the kind's declared field order.
    pub conflict_fields: Vec<String>,
}

/// Compare local and server versions of an entity.
///
/// Returns `None` when the local change can be applied as-is. A conflict
/// exists only when the server record is newer than the state the local
/// edit was based on; a local edit stamped at or after the server's
/// `updatedAt` simply overlays it. A missing local timestamp is treated as
/// arbitrarily old, so it never masks a server-side edit.
pub fn detect(
    kind: EntityKind,
    local: &Value,
    server: &Value,
    concurrent_edit_threshold_ms: i64,
) -> Option<DetectionOutcome> {
    let local_ms = record_updated_at_ms(local).unwrap_or(0);
    let server_ms = record_updated_at_ms(server)?;

    if server_ms <= local_ms {
        return None;
    }
    let dt = server_ms - local_ms;

    let conflict_fields: Vec<String> = kind
        .critical_fields()
        .iter()
        .filter(|field| {
            !field_path::field_equal(
                field_path::get(local, field),
                field_path::get(server, field),
            )
        })
        .map(|field| field.to_string())
        .collect();

    // A newer server edit inside the window is a concurrent edit even when
    // fields diverge; outside the window divergent fields win.
    let conflict_type = if dt <= concurrent_edit_threshold_ms {
        ConflictType::ConcurrentEdit
    } else if !conflict_fields.is_empty() {
        ConflictType::FieldLevel
    } else {
        ConflictType::Timestamp
    };

    let severity = classify_severity(conflict_type, &conflict_fields);

    Some(DetectionOutcome {
        conflict_type,
        severity,
        conflict_fields,
    })
}

/// First matching severity rule wins.
fn classify_severity(conflict_type: ConflictType, conflict_fields: &[String]) -> ConflictSeverity {
    let any_in = |set: &[&str]| conflict_fields.iter().any(|f| set.contains(&f.as_str()));

    if any_in(CRITICAL_FIELDS) {
        ConflictSeverity::Critical
    } else if any_in(HIGH_FIELDS) {
        ConflictSeverity::High
    } else if any_in(MEDIUM_FIELDS) {
        ConflictSeverity::Medium
    } else if conflict_type == ConflictType::ConcurrentEdit {
        if conflict_fields.len() > 3 {
            ConflictSeverity::High
        } else {
            ConflictSeverity::Medium
        }
    } else {
        ConflictSeverity::Low
    }
}
