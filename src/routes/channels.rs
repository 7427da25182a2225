use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use crate::auth::AuthContext;
use crate::db::models::{CreateNotificationChannel, NotificationChannel, NotificationLog};
use crate::db::repository::{NotificationChannelRepository, NotificationLogRepository};
use crate::error::{AppError, AppResult};
use crate::services::notifications::validate_channel_config;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/channels", post(create_channel).get(list_channels))
        .route("/channels/:id", get(get_channel).delete(delete_channel))
        .route("/logs", get(list_logs))
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ListLogsQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, serde::Serialize)]
pub struct LogListResponse {
    pub items: Vec<NotificationLog>,
    pub total: i64,
}

// ============================================================================
// Handlers
// ============================================================================

async fn create_channel(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Json(body): Json<CreateNotificationChannel>,
) -> AppResult<(StatusCode, Json<NotificationChannel>)> {
    auth.require_scope("notifications:write")?;

    // The provider owns the config schema.
    validate_channel_config(&body.channel_type, &body.config)?;

    let channel =
        NotificationChannelRepository::create(&state.db, &auth.organization_id, body).await?;
    Ok((StatusCode::CREATED, Json(channel)))
}

async fn list_channels(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
) -> AppResult<Json<Vec<NotificationChannel>>> {
    auth.require_scope("notifications:read")?;

    let channels =
        NotificationChannelRepository::list_for_org(&state.db, &auth.organization_id).await?;
    Ok(Json(channels))
}

async fn get_channel(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> AppResult<Json<NotificationChannel>> {
    auth.require_scope("notifications:read")?;

    let channel = NotificationChannelRepository::find_by_id(&state.db, &id)
        .await?
        .filter(|c| c.organization_id == auth.organization_id)
        .ok_or_else(|| AppError::NotFound(format!("channel {id}")))?;
    Ok(Json(channel))
}

async fn delete_channel(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    auth.require_scope("notifications:write")?;

    let channel = NotificationChannelRepository::find_by_id(&state.db, &id)
        .await?
        .filter(|c| c.organization_id == auth.organization_id)
        .ok_or_else(|| AppError::NotFound(format!("channel {id}")))?;

    NotificationChannelRepository::delete(&state.db, &channel.id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Notification audit log for the org.
async fn list_logs(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Query(query): Query<ListLogsQuery>,
) -> AppResult<Json<LogListResponse>> {
    auth.require_scope("notifications:read")?;

    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    let offset = query.offset.unwrap_or(0).max(0);

    let items = NotificationLogRepository::list_for_org(
        &state.db,
        &auth.organization_id,
        query.status.as_deref(),
        limit,
        offset,
    )
    .await?;
    let total = NotificationLogRepository::count_for_org(
        &state.db,
        &auth.organization_id,
        query.status.as_deref(),
    )
    .await?;

    Ok(Json(LogListResponse { items, total }))
}
