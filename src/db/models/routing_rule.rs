use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Declarative routing rule. `conditions` and `actions` are JSON blobs
/// validated at the boundary into [`RuleConditions`] / [`RuleActions`];
/// rows with malformed blobs are skipped during evaluation.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct RoutingRule {
    pub id: String,
    pub organization_id: String,
    pub name: String,
    /// Lower value evaluates earlier. Unique within an org after reorder.
    pub priority: i64,
    pub conditions: String,
    pub actions: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionMatch {
    All,
    Any,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConditions {
    #[serde(rename = "match")]
    pub match_mode: ConditionMatch,
    #[serde(default)]
    pub conditions: Vec<RuleCondition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleCondition {
    /// `source`, `priority`, `message`, `tags`, or a custom-field name.
    pub field: String,
    pub operator: ConditionOperator,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    Regex,
    Gte,
    Lte,
    StartsWith,
    EndsWith,
}

/// Actions applied by the first matching rule. Unknown fields in the
/// stored blob are ignored for forward compatibility.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleActions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assign_user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assign_team: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_priority: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub add_tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_policy: Option<String>,
    #[serde(default)]
    pub suppress: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateRoutingRule {
    pub name: String,
    pub priority: i64,
    pub conditions: RuleConditions,
    pub actions: RuleActions,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

fn enabled_default() -> bool {
    true
}
