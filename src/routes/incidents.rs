use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;

use crate::auth::AuthContext;
use crate::db::models::{
    CreateIncident, Incident, IncidentAlertLink, IncidentResponder, IncidentSeverity,
    IncidentStatus, IncidentTimelineEvent,
};
use crate::db::repository::IncidentRepository;
use crate::error::{AppError, AppResult};
use crate::services::incidents::IncidentService;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(create_incident).get(list_incidents))
        .route("/:id", get(get_incident))
        .route("/:id/status", post(set_status))
        .route("/:id/severity", post(set_severity))
        .route("/:id/timeline", post(add_note).get(get_timeline))
        .route("/:id/responders", post(add_responder).get(list_responders))
        .route("/:id/responders/:user_id", delete(remove_responder))
        .route("/:id/alerts", post(link_alert).get(list_links))
        .route("/:id/alerts/:alert_id", delete(unlink_alert))
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ListIncidentsQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct SetStatusRequest {
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct SetSeverityRequest {
    pub severity: String,
}

#[derive(Debug, Deserialize)]
pub struct AddNoteRequest {
    pub note: String,
}

#[derive(Debug, Deserialize)]
pub struct AddResponderRequest {
    pub user_id: String,
    #[serde(default = "default_role")]
    pub role: String,
}

fn default_role() -> String {
    "responder".to_string()
}

#[derive(Debug, Deserialize)]
pub struct LinkAlertRequest {
    pub alert_id: String,
}

// ============================================================================
// Handlers
// ============================================================================

async fn create_incident(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Json(body): Json<CreateIncident>,
) -> AppResult<(StatusCode, Json<Incident>)> {
    auth.require_scope("incidents:write")?;

    let incident = IncidentService::new(&state)
        .create(&auth.organization_id, auth.user_id(), body)
        .await?;
    Ok((StatusCode::CREATED, Json(incident)))
}

async fn list_incidents(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Query(query): Query<ListIncidentsQuery>,
) -> AppResult<Json<Vec<Incident>>> {
    auth.require_scope("incidents:read")?;

    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    let offset = query.offset.unwrap_or(0).max(0);

    let incidents = IncidentRepository::list_for_org(
        &state.db,
        &auth.organization_id,
        query.status.as_deref(),
        limit,
        offset,
    )
    .await?;
    Ok(Json(incidents))
}

async fn get_incident(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> AppResult<Json<Incident>> {
    auth.require_scope("incidents:read")?;

    let incident = load_owned(&state, &auth, &id).await?;
    Ok(Json(incident))
}

async fn set_status(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(id): Path<String>,
    Json(body): Json<SetStatusRequest>,
) -> AppResult<Json<Incident>> {
    auth.require_scope("incidents:write")?;

    let status = IncidentStatus::parse(&body.status)
        .ok_or_else(|| AppError::Validation(format!("invalid status {:?}", body.status)))?;

    let incident = IncidentService::new(&state)
        .set_status(&auth.organization_id, &id, status, auth.user_id())
        .await?;
    Ok(Json(incident))
}

async fn set_severity(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(id): Path<String>,
    Json(body): Json<SetSeverityRequest>,
) -> AppResult<Json<Incident>> {
    auth.require_scope("incidents:write")?;

    let severity = IncidentSeverity::parse(&body.severity)
        .ok_or_else(|| AppError::Validation(format!("invalid severity {:?}", body.severity)))?;

    let incident = IncidentService::new(&state)
        .set_severity(&auth.organization_id, &id, severity, auth.user_id())
        .await?;
    Ok(Json(incident))
}

async fn add_note(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(id): Path<String>,
    Json(body): Json<AddNoteRequest>,
) -> AppResult<(StatusCode, Json<IncidentTimelineEvent>)> {
    auth.require_scope("incidents:write")?;

    let entry = IncidentService::new(&state)
        .add_note(&auth.organization_id, &id, auth.user_id(), &body.note)
        .await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

async fn get_timeline(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> AppResult<Json<Vec<IncidentTimelineEvent>>> {
    auth.require_scope("incidents:read")?;

    load_owned(&state, &auth, &id).await?;
    let timeline = IncidentRepository::timeline(&state.db, &id).await?;
    Ok(Json(timeline))
}

async fn add_responder(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(id): Path<String>,
    Json(body): Json<AddResponderRequest>,
) -> AppResult<StatusCode> {
    auth.require_scope("incidents:write")?;

    IncidentService::new(&state)
        .add_responder(
            &auth.organization_id,
            &id,
            &body.user_id,
            &body.role,
            auth.user_id(),
        )
        .await?;
    Ok(StatusCode::CREATED)
}

async fn list_responders(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> AppResult<Json<Vec<IncidentResponder>>> {
    auth.require_scope("incidents:read")?;

    load_owned(&state, &auth, &id).await?;
    let responders = IncidentRepository::responders(&state.db, &id).await?;
    Ok(Json(responders))
}

async fn remove_responder(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path((id, user_id)): Path<(String, String)>,
) -> AppResult<StatusCode> {
    auth.require_scope("incidents:write")?;

    IncidentService::new(&state)
        .remove_responder(&auth.organization_id, &id, &user_id, auth.user_id())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn link_alert(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(id): Path<String>,
    Json(body): Json<LinkAlertRequest>,
) -> AppResult<StatusCode> {
    auth.require_scope("incidents:write")?;

    IncidentService::new(&state)
        .link_alert(&auth.organization_id, &id, &body.alert_id, auth.user_id())
        .await?;
    Ok(StatusCode::CREATED)
}

async fn list_links(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> AppResult<Json<Vec<IncidentAlertLink>>> {
    auth.require_scope("incidents:read")?;

    load_owned(&state, &auth, &id).await?;
    let links = IncidentRepository::linked_alerts(&state.db, &id).await?;
    Ok(Json(links))
}

async fn unlink_alert(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path((id, alert_id)): Path<(String, String)>,
) -> AppResult<StatusCode> {
    auth.require_scope("incidents:write")?;

    IncidentService::new(&state)
        .unlink_alert(&auth.organization_id, &id, &alert_id, auth.user_id())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn load_owned(state: &Arc<AppState>, auth: &AuthContext, id: &str) -> AppResult<Incident> {
    IncidentRepository::find_by_id(&state.db, id)
        .await?
        .filter(|i| i.organization_id == auth.organization_id)
        .ok_or_else(|| AppError::NotFound(format!("incident {id}")))
}
