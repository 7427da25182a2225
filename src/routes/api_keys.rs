use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use serde::{Deserialize, Serialize};

use crate::auth::{generate_api_key, AuthContext};
use crate::db::repository::api_key::ApiKey;
use crate::db::repository::ApiKeyRepository;
use crate::error::{AppError, AppResult};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/", post(create_key))
}

#[derive(Debug, Deserialize)]
pub struct CreateKeyRequest {
    pub name: String,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
}

fn default_scopes() -> Vec<String> {
    vec!["*".to_string()]
}

/// The plaintext key appears here and nowhere else.
#[derive(Debug, Serialize)]
pub struct CreateKeyResponse {
    #[serde(flatten)]
    pub record: ApiKey,
    pub key: String,
}

async fn create_key(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Json(body): Json<CreateKeyRequest>,
) -> AppResult<(StatusCode, Json<CreateKeyResponse>)> {
    // Only interactive sessions may mint keys; a key cannot mint keys.
    if auth.scopes.is_some() {
        return Err(AppError::Forbidden);
    }
    if body.name.trim().is_empty() {
        return Err(AppError::Validation("name must not be empty".to_string()));
    }
    for scope in &body.scopes {
        let ok = scope == "*"
            || scope
                .split_once(':')
                .map(|(family, action)| {
                    !family.is_empty() && matches!(action, "read" | "write" | "*")
                })
                .unwrap_or(false);
        if !ok {
            return Err(AppError::Validation(format!("invalid scope {scope:?}")));
        }
    }

    let generated = generate_api_key();
    let record = ApiKeyRepository::create(
        &state.db,
        &auth.organization_id,
        auth.user_id(),
        &body.name,
        &generated.hash,
        &generated.prefix,
        &body.scopes,
    )
    .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateKeyResponse {
            record,
            key: generated.plaintext,
        }),
    ))
}
