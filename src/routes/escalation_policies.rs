use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;

use crate::auth::AuthContext;
use crate::db::models::{
    CreateEscalationPolicy, EscalationPolicy, EscalationRule, EscalationTarget, TargetKind,
};
use crate::db::repository::EscalationPolicyRepository;
use crate::error::{AppError, AppResult};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(create_policy).get(list_policies))
        .route("/:id", get(get_policy).delete(delete_policy))
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct PolicyDetail {
    #[serde(flatten)]
    pub policy: EscalationPolicy,
    pub rules: Vec<RuleDetail>,
}

#[derive(Debug, Serialize)]
pub struct RuleDetail {
    #[serde(flatten)]
    pub rule: EscalationRule,
    pub targets: Vec<EscalationTarget>,
}

// ============================================================================
// Handlers
// ============================================================================

async fn create_policy(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Json(body): Json<CreateEscalationPolicy>,
) -> AppResult<(StatusCode, Json<EscalationPolicy>)> {
    auth.require_scope("escalation-policies:write")?;
    validate_policy(&body)?;

    let policy =
        EscalationPolicyRepository::create(&state.db, &auth.organization_id, body).await?;
    Ok((StatusCode::CREATED, Json(policy)))
}

fn validate_policy(body: &CreateEscalationPolicy) -> AppResult<()> {
    if body.name.trim().is_empty() {
        return Err(AppError::Validation("name must not be empty".to_string()));
    }
    if let Some(count) = body.repeat_count {
        if count < 0 {
            return Err(AppError::Validation(
                "repeat_count must not be negative".to_string(),
            ));
        }
    }

    for (index, rule) in body.rules.iter().enumerate() {
        if rule.position != index as i64 {
            return Err(AppError::Validation(
                "rule positions must be dense starting at 0".to_string(),
            ));
        }
        if rule.delay_minutes < 0 {
            return Err(AppError::Validation(
                "delay_minutes must not be negative".to_string(),
            ));
        }
        for target in &rule.targets {
            if TargetKind::parse(&target.kind).is_none() {
                return Err(AppError::Validation(format!(
                    "invalid target kind {:?}",
                    target.kind
                )));
            }
        }
    }

    Ok(())
}

async fn list_policies(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
) -> AppResult<Json<Vec<EscalationPolicy>>> {
    auth.require_scope("escalation-policies:read")?;

    let policies =
        EscalationPolicyRepository::list_for_org(&state.db, &auth.organization_id).await?;
    Ok(Json(policies))
}

async fn get_policy(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> AppResult<Json<PolicyDetail>> {
    auth.require_scope("escalation-policies:read")?;

    let policy = EscalationPolicyRepository::find_by_id(&state.db, &id)
        .await?
        .filter(|p| p.organization_id == auth.organization_id)
        .ok_or_else(|| AppError::NotFound(format!("escalation policy {id}")))?;

    let rules = EscalationPolicyRepository::rules(&state.db, &policy.id).await?;
    let mut details = Vec::with_capacity(rules.len());
    for rule in rules {
        let targets = EscalationPolicyRepository::targets(&state.db, &rule.id).await?;
        details.push(RuleDetail { rule, targets });
    }

    Ok(Json(PolicyDetail {
        policy,
        rules: details,
    }))
}

async fn delete_policy(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    auth.require_scope("escalation-policies:write")?;

    let policy = EscalationPolicyRepository::find_by_id(&state.db, &id)
        .await?
        .filter(|p| p.organization_id == auth.organization_id)
        .ok_or_else(|| AppError::NotFound(format!("escalation policy {id}")))?;

    EscalationPolicyRepository::delete(&state.db, &policy.id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{CreateEscalationRule, CreateEscalationTarget};

    fn policy(rules: Vec<CreateEscalationRule>) -> CreateEscalationPolicy {
        CreateEscalationPolicy {
            name: "standard".to_string(),
            description: None,
            repeat_enabled: false,
            repeat_count: None,
            rules,
        }
    }

    #[test]
    fn positions_must_be_dense() {
        let body = policy(vec![CreateEscalationRule {
            position: 1,
            delay_minutes: 5,
            targets: vec![],
        }]);
        assert!(validate_policy(&body).is_err());

        let body = policy(vec![
            CreateEscalationRule {
                position: 0,
                delay_minutes: 5,
                targets: vec![],
            },
            CreateEscalationRule {
                position: 1,
                delay_minutes: 10,
                targets: vec![],
            },
        ]);
        assert!(validate_policy(&body).is_ok());
    }

    #[test]
    fn target_kind_is_checked() {
        let body = policy(vec![CreateEscalationRule {
            position: 0,
            delay_minutes: 5,
            targets: vec![CreateEscalationTarget {
                kind: "pager".to_string(),
                target_id: "x".to_string(),
                channels: None,
                urgent: false,
            }],
        }]);
        assert!(validate_policy(&body).is_err());
    }
}
