//! Priority rule and condition models.

use crate::error::SyncError;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Comparison operator for a rule condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConditionOperator {
    Equals,
    GreaterThan,
    Contains,
    InArray,
}

/// A single condition evaluated against a mutation payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    /// Dotted field path into the payload (e.g. `location.region`).
    pub field: String,

    /// Comparison operator.
    pub operator: ConditionOperator,

    /// Value the payload field is compared against.
    pub value: serde_json::Value,

    /// Score delta contributed when this condition holds.
    #[serde(default)]
    pub modifier: i64,
}

/// A named, toggled computation contributing to an item's priority score.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PriorityRule {
    /// Rule id (UUID).
    pub id: String,

    /// Display name; appears in priority reason strings.
    pub name: String,

    /// Entity kind this rule applies to.
    pub entity_kind: String,

    /// Ordered condition list, stored as JSON.
    pub conditions: String,

    /// Score delta contributed when the rule matches.
    pub score_modifier: i64,

    /// Whether the rule participates in scoring.
    pub active: bool,

    /// Coordinator who created the rule.
    pub created_by: String,

    /// When the rule was created (Unix millis).
    pub created_at: i64,

    /// Insertion order; reason strings list rules in this order.
    pub position: i64,
}

impl PriorityRule {
    /// Parse the stored condition list.
    pub fn conditions_parsed(&self) -> Result<Vec<Condition>, SyncError> {
        Ok(serde_json::from_str(&self.conditions)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_condition_serde() {
        let json = r#"{"field": "severity", "operator": "GREATER_THAN", "value": 3, "modifier": 10}"#;
        let cond: Condition = serde_json::from_str(json).unwrap();
        assert_eq!(cond.field, "severity");
        assert_eq!(cond.operator, ConditionOperator::GreaterThan);
        assert_eq!(cond.value, json!(3));
        assert_eq!(cond.modifier, 10);
    }

    #[test]
    fn test_condition_modifier_defaults_to_zero() {
        let json = r#"{"field": "status", "operator": "EQUALS", "value": "OPEN"}"#;
        let cond: Condition = serde_json::from_str(json).unwrap();
        assert_eq!(cond.modifier, 0);
    }

    #[test]
    fn test_rule_conditions_parsed() {
        let rule = PriorityRule {
            id: "r1".to_string(),
            name: "urgent incidents".to_string(),
            entity_kind: "INCIDENT".to_string(),
            conditions: r#"[{"field": "severity", "operator": "IN_ARRAY", "value": ["HIGH", "CRITICAL"], "modifier": 5}]"#.to_string(),
            score_modifier: 15,
            active: true,
            created_by: "coordA".to_string(),
            created_at: 0,
            position: 0,
        };

        let conditions = rule.conditions_parsed().unwrap();
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].operator, ConditionOperator::InArray);
    }
}
