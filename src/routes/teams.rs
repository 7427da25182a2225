use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;

use crate::auth::AuthContext;
use crate::db::models::{CreateTeam, Team, User};
use crate::db::repository::TeamRepository;
use crate::error::{AppError, AppResult};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(create_team).get(list_teams))
        .route("/:id", get(get_team).delete(delete_team))
        .route("/:id/members", post(add_member).get(list_members))
        .route("/:id/members/:user_id", delete(remove_member))
}

#[derive(Debug, Deserialize)]
pub struct AddMemberRequest {
    pub user_id: String,
    #[serde(default = "default_role")]
    pub role: String,
}

fn default_role() -> String {
    "member".to_string()
}

async fn create_team(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Json(body): Json<CreateTeam>,
) -> AppResult<(StatusCode, Json<Team>)> {
    auth.require_scope("teams:write")?;

    if body.name.trim().is_empty() {
        return Err(AppError::Validation("name must not be empty".to_string()));
    }

    let team = TeamRepository::create(&state.db, &auth.organization_id, body).await?;
    Ok((StatusCode::CREATED, Json(team)))
}

async fn list_teams(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
) -> AppResult<Json<Vec<Team>>> {
    auth.require_scope("teams:read")?;

    let teams = TeamRepository::list_for_org(&state.db, &auth.organization_id).await?;
    Ok(Json(teams))
}

async fn get_team(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> AppResult<Json<Team>> {
    auth.require_scope("teams:read")?;

    let team = load_owned(&state, &auth, &id).await?;
    Ok(Json(team))
}

async fn delete_team(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    auth.require_scope("teams:write")?;

    let team = load_owned(&state, &auth, &id).await?;
    TeamRepository::delete(&state.db, &team.id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn add_member(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(id): Path<String>,
    Json(body): Json<AddMemberRequest>,
) -> AppResult<StatusCode> {
    auth.require_scope("teams:write")?;

    let team = load_owned(&state, &auth, &id).await?;
    TeamRepository::add_member(&state.db, &team.id, &body.user_id, &body.role).await?;
    Ok(StatusCode::CREATED)
}

async fn list_members(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> AppResult<Json<Vec<User>>> {
    auth.require_scope("teams:read")?;

    let team = load_owned(&state, &auth, &id).await?;
    let members = TeamRepository::member_users(&state.db, &team.id).await?;
    Ok(Json(members))
}

async fn remove_member(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path((id, user_id)): Path<(String, String)>,
) -> AppResult<StatusCode> {
    auth.require_scope("teams:write")?;

    let team = load_owned(&state, &auth, &id).await?;
    let removed = TeamRepository::remove_member(&state.db, &team.id, &user_id).await?;
    if !removed {
        return Err(AppError::NotFound(format!(
            "member {user_id} in team {id}"
        )));
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn load_owned(state: &Arc<AppState>, auth: &AuthContext, id: &str) -> AppResult<Team> {
    TeamRepository::find_by_id(&state.db, id)
        .await?
        .filter(|t| t.organization_id == auth.organization_id)
        .ok_or_else(|| AppError::NotFound(format!("team {id}")))
}
