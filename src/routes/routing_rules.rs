use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use crate::auth::AuthContext;
use crate::db::models::{ConditionOperator, CreateRoutingRule, RoutingRule};
use crate::db::repository::RoutingRuleRepository;
use crate::error::{AppError, AppResult};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(create_rule).get(list_rules))
        .route("/reorder", post(reorder_rules))
        .route("/:id", get(get_rule).delete(delete_rule))
        .route("/:id/enabled", post(set_enabled))
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ReorderRequest {
    /// Full desired order; every rule of the org must appear once.
    pub rule_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct SetEnabledRequest {
    pub enabled: bool,
}

// ============================================================================
// Handlers
// ============================================================================

async fn create_rule(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Json(body): Json<CreateRoutingRule>,
) -> AppResult<(StatusCode, Json<RoutingRule>)> {
    auth.require_scope("routing-rules:write")?;
    validate_rule(&body)?;

    let rule = RoutingRuleRepository::create(&state.db, &auth.organization_id, body).await?;
    Ok((StatusCode::CREATED, Json(rule)))
}

fn validate_rule(body: &CreateRoutingRule) -> AppResult<()> {
    if body.name.trim().is_empty() {
        return Err(AppError::Validation("name must not be empty".to_string()));
    }

    for condition in &body.conditions.conditions {
        if condition.field.trim().is_empty() {
            return Err(AppError::Validation(
                "condition field must not be empty".to_string(),
            ));
        }
        // Regex patterns are validated here so broken ones are caught at
        // admin time; the evaluator still treats them as non-matching.
        if condition.operator == ConditionOperator::Regex {
            if let Some(pattern) = condition.value.as_str() {
                regex::Regex::new(pattern).map_err(|e| {
                    AppError::Validation(format!("invalid regex {pattern:?}: {e}"))
                })?;
            }
        }
    }

    if let Some(priority) = &body.actions.set_priority {
        if crate::db::models::AlertPriority::parse(priority).is_none() {
            return Err(AppError::Validation(format!(
                "invalid priority {priority:?}"
            )));
        }
    }

    Ok(())
}

async fn list_rules(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
) -> AppResult<Json<Vec<RoutingRule>>> {
    auth.require_scope("routing-rules:read")?;

    let rules = RoutingRuleRepository::list_for_org(&state.db, &auth.organization_id).await?;
    Ok(Json(rules))
}

async fn get_rule(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> AppResult<Json<RoutingRule>> {
    auth.require_scope("routing-rules:read")?;

    let rule = load_owned(&state, &auth, &id).await?;
    Ok(Json(rule))
}

/// Reassign all rule priorities in one transaction; afterwards the
/// priorities are exactly the indexes of `rule_ids`.
async fn reorder_rules(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Json(body): Json<ReorderRequest>,
) -> AppResult<Json<Vec<RoutingRule>>> {
    auth.require_scope("routing-rules:write")?;

    let existing = RoutingRuleRepository::list_for_org(&state.db, &auth.organization_id).await?;
    if existing.len() != body.rule_ids.len() {
        return Err(AppError::Validation(format!(
            "reorder must list all {} rules",
            existing.len()
        )));
    }
    for rule in &existing {
        if !body.rule_ids.contains(&rule.id) {
            return Err(AppError::Validation(format!(
                "reorder is missing rule {}",
                rule.id
            )));
        }
    }

    RoutingRuleRepository::reorder(&state.db, &auth.organization_id, &body.rule_ids).await?;

    let rules = RoutingRuleRepository::list_for_org(&state.db, &auth.organization_id).await?;
    Ok(Json(rules))
}

async fn set_enabled(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(id): Path<String>,
    Json(body): Json<SetEnabledRequest>,
) -> AppResult<Json<RoutingRule>> {
    auth.require_scope("routing-rules:write")?;

    load_owned(&state, &auth, &id).await?;
    RoutingRuleRepository::set_enabled(&state.db, &id, body.enabled).await?;
    let rule = load_owned(&state, &auth, &id).await?;
    Ok(Json(rule))
}

async fn delete_rule(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    auth.require_scope("routing-rules:write")?;

    let rule = load_owned(&state, &auth, &id).await?;
    RoutingRuleRepository::delete(&state.db, &rule.id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn load_owned(state: &Arc<AppState>, auth: &AuthContext, id: &str) -> AppResult<RoutingRule> {
    RoutingRuleRepository::find_by_id(&state.db, id)
        .await?
        .filter(|r| r.organization_id == auth.organization_id)
        .ok_or_else(|| AppError::NotFound(format!("routing rule {id}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{ConditionMatch, RuleActions, RuleCondition, RuleConditions};
    use serde_json::json;

    fn rule_with(conditions: Vec<RuleCondition>, actions: RuleActions) -> CreateRoutingRule {
        CreateRoutingRule {
            name: "rule".to_string(),
            priority: 0,
            conditions: RuleConditions {
                match_mode: ConditionMatch::All,
                conditions,
            },
            actions,
            enabled: true,
        }
    }

    #[test]
    fn broken_regex_is_rejected_at_create_time() {
        let body = rule_with(
            vec![RuleCondition {
                field: "message".to_string(),
                operator: ConditionOperator::Regex,
                value: json!("(unclosed"),
            }],
            RuleActions::default(),
        );
        assert!(validate_rule(&body).is_err());
    }

    #[test]
    fn bad_priority_action_is_rejected() {
        let body = rule_with(
            vec![],
            RuleActions {
                set_priority: Some("P9".to_string()),
                ..Default::default()
            },
        );
        assert!(validate_rule(&body).is_err());
    }
}
