use crate::db::models::{
    ConditionMatch, ConditionOperator, RoutingRule, RuleActions, RuleCondition, RuleConditions,
};

/// The alert attributes routing conditions can reference.
#[derive(Debug, Clone)]
pub struct RoutingInput {
    pub source: String,
    pub priority: String,
    pub message: String,
    pub tags: Vec<String>,
    pub custom_fields: serde_json::Map<String, serde_json::Value>,
}

/// The winning rule's id together with its parsed actions.
#[derive(Debug, Clone)]
pub struct RoutingMatch {
    pub rule_id: String,
    pub actions: RuleActions,
}

/// Evaluate the org's rules against one alert. Rules must arrive in
/// evaluation order (ascending priority, then created_at); the first
/// match wins. Rules whose stored conditions or actions fail to parse
/// are skipped.
pub fn evaluate(input: &RoutingInput, rules: &[RoutingRule]) -> Option<RoutingMatch> {
    for rule in rules {
        let conditions: RuleConditions = match serde_json::from_str(&rule.conditions) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!("Skipping routing rule {} with bad conditions: {}", rule.id, e);
                continue;
            }
        };

        if !matches(input, &conditions) {
            continue;
        }

        let actions: RuleActions = match serde_json::from_str(&rule.actions) {
            Ok(a) => a,
            Err(e) => {
                tracing::warn!("Skipping routing rule {} with bad actions: {}", rule.id, e);
                continue;
            }
        };

        return Some(RoutingMatch {
            rule_id: rule.id.clone(),
            actions,
        });
    }

    None
}

fn matches(input: &RoutingInput, conditions: &RuleConditions) -> bool {
    match conditions.match_mode {
        // Empty condition list matches everything in both modes.
        ConditionMatch::All => conditions.conditions.iter().all(|c| check(input, c)),
        ConditionMatch::Any => {
            conditions.conditions.is_empty()
                || conditions.conditions.iter().any(|c| check(input, c))
        }
    }
}

/// The value a condition field resolves to on the alert.
enum FieldValue {
    Scalar(String),
    Many(Vec<String>),
}

fn resolve_field(input: &RoutingInput, field: &str) -> Option<FieldValue> {
    match field {
        "source" => Some(FieldValue::Scalar(input.source.clone())),
        "priority" => Some(FieldValue::Scalar(input.priority.clone())),
        "message" => Some(FieldValue::Scalar(input.message.clone())),
        "tags" => Some(FieldValue::Many(input.tags.clone())),
        other => {
            let value = input.custom_fields.get(other)?;
            match value {
                serde_json::Value::Array(items) => Some(FieldValue::Many(
                    items.iter().filter_map(scalar_to_string).collect(),
                )),
                scalar => scalar_to_string(scalar).map(FieldValue::Scalar),
            }
        }
    }
}

/// Scalars only; nested objects and arrays never participate in comparisons.
fn scalar_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn check(input: &RoutingInput, condition: &RuleCondition) -> bool {
    let field = match resolve_field(input, &condition.field) {
        Some(f) => f,
        // Missing field never matches.
        None => return false,
    };
    let expected = match scalar_to_string(&condition.value) {
        Some(v) => v,
        None => return false,
    };

    match &field {
        FieldValue::Scalar(actual) => check_scalar(actual, condition.operator, &expected),
        FieldValue::Many(items) => check_many(items, condition.operator, &expected),
    }
}

fn check_scalar(actual: &str, operator: ConditionOperator, expected: &str) -> bool {
    match operator {
        ConditionOperator::Equals => actual == expected,
        ConditionOperator::NotEquals => actual != expected,
        ConditionOperator::Contains => actual.contains(expected),
        ConditionOperator::NotContains => !actual.contains(expected),
        ConditionOperator::Regex => match regex::Regex::new(expected) {
            Ok(re) => re.is_match(actual),
            // Invalid pattern is a non-match, never an error.
            Err(_) => false,
        },
        ConditionOperator::Gte => compare(actual, expected).map_or(false, |o| o.is_ge()),
        ConditionOperator::Lte => compare(actual, expected).map_or(false, |o| o.is_le()),
        ConditionOperator::StartsWith => actual.starts_with(expected),
        ConditionOperator::EndsWith => actual.ends_with(expected),
    }
}

/// Set semantics: membership for contains, any-element for the ordering
/// and affix operators, all-elements for the negations.
fn check_many(items: &[String], operator: ConditionOperator, expected: &str) -> bool {
    match operator {
        ConditionOperator::Equals | ConditionOperator::Contains => {
            items.iter().any(|i| i == expected)
        }
        ConditionOperator::NotEquals | ConditionOperator::NotContains => {
            items.iter().all(|i| i != expected)
        }
        ConditionOperator::Regex => match regex::Regex::new(expected) {
            Ok(re) => items.iter().any(|i| re.is_match(i)),
            Err(_) => false,
        },
        ConditionOperator::Gte => items
            .iter()
            .any(|i| compare(i, expected).map_or(false, |o| o.is_ge())),
        ConditionOperator::Lte => items
            .iter()
            .any(|i| compare(i, expected).map_or(false, |o| o.is_le())),
        ConditionOperator::StartsWith => items.iter().any(|i| i.starts_with(expected)),
        ConditionOperator::EndsWith => items.iter().any(|i| i.ends_with(expected)),
    }
}

/// Numeric comparison when both sides parse as f64, lexicographic otherwise.
fn compare(actual: &str, expected: &str) -> Option<std::cmp::Ordering> {
    match (actual.parse::<f64>(), expected.parse::<f64>()) {
        (Ok(a), Ok(b)) => a.partial_cmp(&b),
        _ => Some(actual.cmp(expected)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn input() -> RoutingInput {
        let mut custom_fields = serde_json::Map::new();
        custom_fields.insert("region".to_string(), json!("eu-west-1"));
        custom_fields.insert("error_rate".to_string(), json!(12.5));
        custom_fields.insert("hosts".to_string(), json!(["db-1", "db-2"]));

        RoutingInput {
            source: "prometheus".to_string(),
            priority: "P2".to_string(),
            message: "CPU usage above 90%".to_string(),
            tags: vec!["prod".to_string(), "api".to_string()],
            custom_fields,
        }
    }

    fn rule(id: &str, priority: i64, conditions: serde_json::Value, actions: serde_json::Value) -> RoutingRule {
        let now = Utc::now();
        RoutingRule {
            id: id.to_string(),
            organization_id: "org".to_string(),
            name: id.to_string(),
            priority,
            conditions: conditions.to_string(),
            actions: actions.to_string(),
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn empty_condition_list_matches() {
        let rules = vec![rule(
            "r1",
            0,
            json!({"match": "all", "conditions": []}),
            json!({"set_priority": "P1"}),
        )];

        let m = evaluate(&input(), &rules).unwrap();
        assert_eq!(m.rule_id, "r1");
        assert_eq!(m.actions.set_priority.as_deref(), Some("P1"));
    }

    #[test]
    fn first_match_wins() {
        let rules = vec![
            rule(
                "r1",
                0,
                json!({"match": "all", "conditions": [
                    {"field": "source", "operator": "equals", "value": "datadog"}
                ]}),
                json!({"suppress": true}),
            ),
            rule(
                "r2",
                1,
                json!({"match": "all", "conditions": [
                    {"field": "source", "operator": "equals", "value": "prometheus"}
                ]}),
                json!({"set_priority": "P1"}),
            ),
            rule(
                "r3",
                2,
                json!({"match": "any", "conditions": []}),
                json!({"set_priority": "P5"}),
            ),
        ];

        let m = evaluate(&input(), &rules).unwrap();
        assert_eq!(m.rule_id, "r2");
    }

    #[test]
    fn tags_use_set_membership() {
        let rules = vec![rule(
            "r1",
            0,
            json!({"match": "any", "conditions": [
                {"field": "tags", "operator": "contains", "value": "prod"}
            ]}),
            json!({"suppress": true}),
        )];

        assert!(evaluate(&input(), &rules).is_some());

        let rules = vec![rule(
            "r1",
            0,
            json!({"match": "any", "conditions": [
                {"field": "tags", "operator": "contains", "value": "staging"}
            ]}),
            json!({"suppress": true}),
        )];

        assert!(evaluate(&input(), &rules).is_none());
    }

    #[test]
    fn missing_custom_field_never_matches() {
        let rules = vec![rule(
            "r1",
            0,
            json!({"match": "all", "conditions": [
                {"field": "cluster", "operator": "equals", "value": "a"}
            ]}),
            json!({"suppress": true}),
        )];

        assert!(evaluate(&input(), &rules).is_none());
    }

    #[test]
    fn numeric_comparison_when_both_parse() {
        let rules = vec![rule(
            "r1",
            0,
            json!({"match": "all", "conditions": [
                {"field": "error_rate", "operator": "gte", "value": "10"}
            ]}),
            json!({"set_priority": "P1"}),
        )];

        assert!(evaluate(&input(), &rules).is_some());

        // "9" > "12.5" lexicographically, but 9 < 12.5 numerically;
        // numeric comparison must win.
        let rules = vec![rule(
            "r1",
            0,
            json!({"match": "all", "conditions": [
                {"field": "error_rate", "operator": "lte", "value": "9"}
            ]}),
            json!({"set_priority": "P1"}),
        )];

        assert!(evaluate(&input(), &rules).is_none());
    }

    #[test]
    fn invalid_regex_is_non_match() {
        let rules = vec![rule(
            "r1",
            0,
            json!({"match": "any", "conditions": [
                {"field": "message", "operator": "regex", "value": "([unclosed"}
            ]}),
            json!({"suppress": true}),
        )];

        assert!(evaluate(&input(), &rules).is_none());
    }

    #[test]
    fn regex_matches_message() {
        let rules = vec![rule(
            "r1",
            0,
            json!({"match": "any", "conditions": [
                {"field": "message", "operator": "regex", "value": "CPU.*9[0-9]%"}
            ]}),
            json!({"assign_team": "team-1"}),
        )];

        let m = evaluate(&input(), &rules).unwrap();
        assert_eq!(m.actions.assign_team.as_deref(), Some("team-1"));
    }

    #[test]
    fn malformed_rule_is_skipped_not_fatal() {
        let now = Utc::now();
        let broken = RoutingRule {
            id: "broken".to_string(),
            organization_id: "org".to_string(),
            name: "broken".to_string(),
            priority: 0,
            conditions: "not json at all".to_string(),
            actions: "{}".to_string(),
            enabled: true,
            created_at: now,
            updated_at: now,
        };
        let rules = vec![
            broken,
            rule(
                "good",
                1,
                json!({"match": "any", "conditions": []}),
                json!({"set_priority": "P4"}),
            ),
        ];

        let m = evaluate(&input(), &rules).unwrap();
        assert_eq!(m.rule_id, "good");
    }

    #[test]
    fn match_any_short_circuits() {
        let rules = vec![rule(
            "r1",
            0,
            json!({"match": "any", "conditions": [
                {"field": "source", "operator": "equals", "value": "prometheus"},
                {"field": "cluster", "operator": "equals", "value": "missing"}
            ]}),
            json!({"suppress": true}),
        )];

        assert!(evaluate(&input(), &rules).is_some());
    }

    #[test]
    fn custom_field_array_uses_membership() {
        let rules = vec![rule(
            "r1",
            0,
            json!({"match": "all", "conditions": [
                {"field": "hosts", "operator": "contains", "value": "db-2"}
            ]}),
            json!({"add_tags": ["database"]}),
        )];

        let m = evaluate(&input(), &rules).unwrap();
        assert_eq!(m.actions.add_tags, vec!["database".to_string()]);
    }
}
