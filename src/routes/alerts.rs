use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::AuthContext;
use crate::db::models::{Alert, AlertFilter, SourceAlert};
use crate::db::repository::{AlertRepository, EscalationEventRepository, NotificationLogRepository};
use crate::error::{AppError, AppResult};
use crate::services::alerts::AlertService;
use crate::services::ingest::IngestService;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(ingest_alert).get(list_alerts))
        .route("/:id", get(get_alert))
        .route("/:id/acknowledge", post(acknowledge_alert))
        .route("/:id/close", post(close_alert))
        .route("/:id/snooze", post(snooze_alert))
        .route("/:id/assign", post(assign_alert))
        .route("/:id/escalations", get(list_escalations))
        .route("/:id/notifications", get(list_notifications))
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub alert: Alert,
    /// "created" | "deduped" | "suppressed"
    pub result: String,
}

#[derive(Debug, Deserialize)]
pub struct ListAlertsQuery {
    pub status: Option<String>,
    pub priority: Option<String>,
    pub assigned_user: Option<String>,
    pub assigned_team: Option<String>,
    pub source: Option<String>,
    pub search: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct AlertListResponse {
    pub items: Vec<Alert>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Deserialize)]
pub struct CloseRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SnoozeRequest {
    pub snoozed_until: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct AssignRequest {
    pub user_id: Option<String>,
    pub team_id: Option<String>,
}

// ============================================================================
// Handlers
// ============================================================================

/// Ingest one alert in the canonical shape.
async fn ingest_alert(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Json(body): Json<SourceAlert>,
) -> AppResult<Json<IngestResponse>> {
    auth.require_scope("alerts:write")?;

    let (alert, outcome) = IngestService::new(&state)
        .ingest(&auth.organization_id, body)
        .await?;

    Ok(Json(IngestResponse {
        alert,
        result: outcome.as_str().to_string(),
    }))
}

async fn list_alerts(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Query(query): Query<ListAlertsQuery>,
) -> AppResult<Json<AlertListResponse>> {
    auth.require_scope("alerts:read")?;

    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    let offset = query.offset.unwrap_or(0).max(0);
    let filter = AlertFilter {
        status: query.status,
        priority: query.priority,
        assigned_user_id: query.assigned_user,
        assigned_team_id: query.assigned_team,
        source: query.source,
        search: query.search,
    };

    let items =
        AlertRepository::list(&state.db, &auth.organization_id, &filter, limit, offset).await?;
    let total = AlertRepository::count(&state.db, &auth.organization_id, &filter).await?;

    Ok(Json(AlertListResponse {
        items,
        total,
        limit,
        offset,
    }))
}

async fn get_alert(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> AppResult<Json<Alert>> {
    auth.require_scope("alerts:read")?;

    let alert = load_owned(&state, &auth, &id).await?;
    Ok(Json(alert))
}

async fn acknowledge_alert(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> AppResult<Json<Alert>> {
    auth.require_scope("alerts:write")?;

    let alert = AlertService::new(&state)
        .acknowledge(&auth.organization_id, &id)
        .await?;
    Ok(Json(alert))
}

async fn close_alert(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(id): Path<String>,
    Json(body): Json<CloseRequest>,
) -> AppResult<Json<Alert>> {
    auth.require_scope("alerts:write")?;

    let alert = AlertService::new(&state)
        .close(&auth.organization_id, &id, body.reason.as_deref())
        .await?;
    Ok(Json(alert))
}

async fn snooze_alert(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(id): Path<String>,
    Json(body): Json<SnoozeRequest>,
) -> AppResult<Json<Alert>> {
    auth.require_scope("alerts:write")?;

    let alert = AlertService::new(&state)
        .snooze(&auth.organization_id, &id, body.snoozed_until)
        .await?;
    Ok(Json(alert))
}

async fn assign_alert(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(id): Path<String>,
    Json(body): Json<AssignRequest>,
) -> AppResult<Json<Alert>> {
    auth.require_scope("alerts:write")?;

    let alert = AlertService::new(&state)
        .assign(
            &auth.organization_id,
            &id,
            body.user_id.as_deref(),
            body.team_id.as_deref(),
        )
        .await?;
    Ok(Json(alert))
}

/// Escalation event history for an alert.
async fn list_escalations(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> AppResult<Json<Vec<crate::db::models::AlertEscalationEvent>>> {
    auth.require_scope("alerts:read")?;

    load_owned(&state, &auth, &id).await?;
    let events = EscalationEventRepository::list_for_alert(&state.db, &id).await?;
    Ok(Json(events))
}

async fn list_notifications(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> AppResult<Json<Vec<crate::db::models::NotificationLog>>> {
    auth.require_scope("alerts:read")?;

    load_owned(&state, &auth, &id).await?;
    let logs = NotificationLogRepository::list_for_alert(&state.db, &id).await?;
    Ok(Json(logs))
}

async fn load_owned(state: &Arc<AppState>, auth: &AuthContext, id: &str) -> AppResult<Alert> {
    let alert = AlertRepository::find_by_id(&state.db, id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("alert {id}")))?;
    if alert.organization_id != auth.organization_id {
        return Err(AppError::NotFound(format!("alert {id}")));
    }
    Ok(alert)
}
