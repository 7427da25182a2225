use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::AuthContext;
use crate::db::models::{
    CreateOverride, CreateRotation, CreateSchedule, RotationParticipant, RotationType, Schedule,
    ScheduleOverride, ScheduleRotation,
};
use crate::db::repository::ScheduleRepository;
use crate::error::{AppError, AppResult};
use crate::services::oncall::OnCallResolver;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(create_schedule).get(list_schedules))
        .route("/:id", get(get_schedule).delete(delete_schedule))
        .route("/:id/rotations", post(create_rotation).get(list_rotations))
        .route("/:id/overrides", post(create_override).get(list_overrides))
        .route("/:id/overrides/:override_id", delete(delete_override))
        .route("/:id/on-call", get(whos_on_call))
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct RotationDetail {
    #[serde(flatten)]
    pub rotation: ScheduleRotation,
    pub participants: Vec<RotationParticipant>,
}

#[derive(Debug, Deserialize)]
pub struct OnCallQuery {
    /// Defaults to now.
    pub at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct OnCallResponse {
    pub user_id: Option<String>,
    pub is_override: bool,
    pub at: DateTime<Utc>,
}

// ============================================================================
// Handlers
// ============================================================================

async fn create_schedule(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Json(body): Json<CreateSchedule>,
) -> AppResult<(StatusCode, Json<Schedule>)> {
    auth.require_scope("schedules:write")?;

    if body.timezone.parse::<chrono_tz::Tz>().is_err() {
        return Err(AppError::Validation(format!(
            "invalid IANA timezone {:?}",
            body.timezone
        )));
    }

    let schedule = ScheduleRepository::create(&state.db, &auth.organization_id, body).await?;
    Ok((StatusCode::CREATED, Json(schedule)))
}

async fn list_schedules(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
) -> AppResult<Json<Vec<Schedule>>> {
    auth.require_scope("schedules:read")?;

    let schedules = ScheduleRepository::list_for_org(&state.db, &auth.organization_id).await?;
    Ok(Json(schedules))
}

async fn get_schedule(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> AppResult<Json<Schedule>> {
    auth.require_scope("schedules:read")?;

    let schedule = load_owned(&state, &auth, &id).await?;
    Ok(Json(schedule))
}

async fn delete_schedule(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    auth.require_scope("schedules:write")?;

    let schedule = load_owned(&state, &auth, &id).await?;
    ScheduleRepository::delete(&state.db, &schedule.id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_rotation(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(id): Path<String>,
    Json(body): Json<CreateRotation>,
) -> AppResult<(StatusCode, Json<ScheduleRotation>)> {
    auth.require_scope("schedules:write")?;

    let schedule = load_owned(&state, &auth, &id).await?;

    let Some(rotation_type) = RotationType::parse(&body.rotation_type) else {
        return Err(AppError::Validation(format!(
            "invalid rotation type {:?}",
            body.rotation_type
        )));
    };
    if body.rotation_length < 1 {
        return Err(AppError::Validation(
            "rotation_length must be at least 1".to_string(),
        ));
    }
    if rotation_type == RotationType::Weekly {
        match body.handoff_day {
            Some(day) if (0..=6).contains(&day) => {}
            _ => {
                return Err(AppError::Validation(
                    "weekly rotations need handoff_day 0..6".to_string(),
                ))
            }
        }
    }
    if body.participants.is_empty() {
        return Err(AppError::Validation(
            "rotation needs at least one participant".to_string(),
        ));
    }

    let rotation = ScheduleRepository::create_rotation(&state.db, &schedule.id, body).await?;
    Ok((StatusCode::CREATED, Json(rotation)))
}

async fn list_rotations(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> AppResult<Json<Vec<RotationDetail>>> {
    auth.require_scope("schedules:read")?;

    let schedule = load_owned(&state, &auth, &id).await?;
    let rotations = ScheduleRepository::rotations(&state.db, &schedule.id).await?;

    let mut details = Vec::with_capacity(rotations.len());
    for rotation in rotations {
        let participants = ScheduleRepository::participants(&state.db, &rotation.id).await?;
        details.push(RotationDetail {
            rotation,
            participants,
        });
    }

    Ok(Json(details))
}

async fn create_override(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(id): Path<String>,
    Json(body): Json<CreateOverride>,
) -> AppResult<(StatusCode, Json<ScheduleOverride>)> {
    auth.require_scope("schedules:write")?;

    let schedule = load_owned(&state, &auth, &id).await?;
    let created = ScheduleRepository::create_override(&state.db, &schedule.id, body).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn list_overrides(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> AppResult<Json<Vec<ScheduleOverride>>> {
    auth.require_scope("schedules:read")?;

    let schedule = load_owned(&state, &auth, &id).await?;
    let overrides = ScheduleRepository::list_overrides(&state.db, &schedule.id).await?;
    Ok(Json(overrides))
}

async fn delete_override(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path((id, override_id)): Path<(String, String)>,
) -> AppResult<StatusCode> {
    auth.require_scope("schedules:write")?;

    load_owned(&state, &auth, &id).await?;
    let removed = ScheduleRepository::delete_override(&state.db, &override_id).await?;
    if !removed {
        return Err(AppError::NotFound(format!("override {override_id}")));
    }
    Ok(StatusCode::NO_CONTENT)
}

/// Resolve the on-call user, optionally at a specific instant.
async fn whos_on_call(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(id): Path<String>,
    Query(query): Query<OnCallQuery>,
) -> AppResult<Json<OnCallResponse>> {
    auth.require_scope("schedules:read")?;

    let schedule = load_owned(&state, &auth, &id).await?;
    let at = query.at.unwrap_or_else(|| state.clock.now());
    let oncall = OnCallResolver::who_is_on_call(&state.db, &schedule.id, at).await?;

    Ok(Json(OnCallResponse {
        user_id: oncall.as_ref().map(|o| o.user_id.clone()),
        is_override: oncall.map(|o| o.is_override).unwrap_or(false),
        at,
    }))
}

async fn load_owned(state: &Arc<AppState>, auth: &AuthContext, id: &str) -> AppResult<Schedule> {
    ScheduleRepository::find_by_id(&state.db, id)
        .await?
        .filter(|s| s.organization_id == auth.organization_id)
        .ok_or_else(|| AppError::NotFound(format!("schedule {id}")))
}
