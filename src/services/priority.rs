//! Priority engine.
//!
//! Pure computation: given a mutation and the active rules, produce a score,
//! a reason string, and an estimated sync time. Idempotent for a fixed
//! (item, rule set) pair.

use crate::models::priority_rule::{Condition, ConditionOperator, PriorityRule};
use crate::models::queue_item::{ActionType, EntityKind, ManualOverride, PriorityLabel};
use crate::services::field_path;
use serde_json::Value;

/// Minimum baseline score before rules apply.
const BASELINE_FLOOR: i64 = 50;

/// Pacing assumption for the sync-time estimate: one queue slot ahead costs
/// roughly this long.
const PER_ITEM_PACING_MS: i64 = 2_000;

/// Result of a priority computation.
#[derive(Debug, Clone, PartialEq)]
pub struct PriorityOutcome {
    /// Score clamped to [0, 100].
    pub score: i64,

    /// Label derived from the score.
    pub label: PriorityLabel,

    /// Contributing rule names and signed deltas, in rule insertion order.
    pub reason: String,
}

/// Baseline contribution of the action kind.
fn action_score(action: ActionType) -> i64 {
    match action {
        ActionType::Create => 20,
        ActionType::Update => 10,
        ActionType::Delete => 30,
    }
}

/// Baseline contribution of the entity kind.
fn kind_score(kind: EntityKind) -> i64 {
    match kind {
        EntityKind::Incident => 30,
        EntityKind::Assessment => 20,
        EntityKind::Response => 15,
        EntityKind::Entity | EntityKind::Media => 0,
    }
}

/// Evaluate a single condition against a payload.
///
/// A missing field path is false, never an error. GREATER_THAN compares
/// numerically, or lexicographically when both sides are strings; any other
/// type pairing is false.
pub fn condition_holds(condition: &Condition, payload: &Value) -> bool {
    let Some(actual) = field_path::get(payload, &condition.field) else {
        return false;
    };

    match condition.operator {
        ConditionOperator::Equals => actual == &condition.value,
        ConditionOperator::GreaterThan => match (actual, &condition.value) {
            (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
                (Some(a), Some(b)) => a > b,
                _ => false,
            },
            (Value::String(a), Value::String(b)) => a > b,
            _ => false,
        },
        ConditionOperator::Contains => match (actual, &condition.value) {
            (Value::String(haystack), Value::String(needle)) => haystack.contains(needle.as_str()),
            (Value::Array(items), needle) => items.iter().any(|v| v == needle),
            _ => false,
        },
        ConditionOperator::InArray => match &condition.value {
            Value::Array(allowed) => allowed.iter().any(|v| v == actual),
            _ => false,
        },
    }
}

/// Compute the score delta a rule contributes, or `None` when it does not
/// match.
///
/// A rule matches when at least one of its conditions holds (a rule with no
/// conditions always matches). The delta is the rule's modifier plus the
/// per-condition modifiers of every condition that individually holds.
fn rule_delta(rule: &PriorityRule, payload: &Value) -> Option<i64> {
    let conditions = rule.conditions_parsed().unwrap_or_default();

    if conditions.is_empty() {
        return Some(rule.score_modifier);
    }

    let mut held_any = false;
    let mut condition_sum = 0i64;
    for condition in &conditions {
        if condition_holds(condition, payload) {
            held_any = true;
            condition_sum += condition.modifier;
        }
    }

    held_any.then_some(rule.score_modifier + condition_sum)
}

/// Compute `(score, label, reason)` for a mutation.
///
/// Rules are applied in insertion order; only rules scoped to `kind` and
/// flagged active contribute. A manual override replaces the computed score
/// entirely.
pub fn compute(
    kind: EntityKind,
    action: ActionType,
    payload: &Value,
    rules: &[PriorityRule],
    manual_override: Option<&ManualOverride>,
) -> PriorityOutcome {
    if let Some(override_) = manual_override {
        let score = override_.override_score.clamp(0, 100);
        return PriorityOutcome {
            score,
            label: PriorityLabel::from_score(score),
            reason: format!("manual override: {}", override_.justification),
        };
    }

    let baseline = (action_score(action) + kind_score(kind)).max(BASELINE_FLOOR);
    let mut score = baseline;
    let mut reason = format!("base {}", baseline);

    for rule in rules {
        if !rule.active || EntityKind::from(rule.entity_kind.as_str()) != kind {
            continue;
        }
        if let Some(delta) = rule_delta(rule, payload) {
            score += delta;
            reason.push_str(&format!("; {} {:+}", rule.name, delta));
        }
    }

    let score = score.clamp(0, 100);
    PriorityOutcome {
        score,
        label: PriorityLabel::from_score(score),
        reason,
    }
}

/// Estimate when an item will sync, given the number of strictly
/// higher-priority items currently pending.
///
/// Monotone in `higher_priority_count`.
pub fn estimate_sync_time(now_ms: i64, higher_priority_count: i64) -> i64 {
    now_ms + (higher_priority_count + 1) * PER_ITEM_PACING_MS
}
