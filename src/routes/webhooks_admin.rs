use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::auth::{generate_incoming_token, AuthContext};
use crate::db::models::{
    CreateIncomingToken, CreateWebhookEndpoint, IncomingWebhookToken, WebhookDelivery,
    WebhookEndpoint,
};
use crate::db::repository::{
    IncomingTokenRepository, WebhookDeliveryRepository, WebhookEndpointRepository,
};
use crate::error::{AppError, AppResult};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/endpoints", post(create_endpoint).get(list_endpoints))
        .route("/endpoints/:id", get(get_endpoint).delete(delete_endpoint))
        .route("/endpoints/:id/deliveries", get(list_deliveries))
        .route("/incoming", post(create_token).get(list_tokens))
        .route("/incoming/:id", axum::routing::delete(delete_token))
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// The signing secret is included exactly once, in the create response.
#[derive(Debug, Serialize)]
pub struct CreatedEndpointResponse {
    #[serde(flatten)]
    pub endpoint: WebhookEndpoint,
    pub secret: String,
}

/// The token value is included exactly once, in the create response.
#[derive(Debug, Serialize)]
pub struct CreatedTokenResponse {
    #[serde(flatten)]
    pub token_record: IncomingWebhookToken,
    pub token: String,
    pub ingest_url: String,
}

#[derive(Debug, Deserialize)]
pub struct ListDeliveriesQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

// ============================================================================
// Handlers
// ============================================================================

async fn create_endpoint(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Json(body): Json<CreateWebhookEndpoint>,
) -> AppResult<(StatusCode, Json<CreatedEndpointResponse>)> {
    auth.require_scope("webhooks:write")?;

    let url = url::Url::parse(&body.url)
        .map_err(|e| AppError::Validation(format!("invalid url: {e}")))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(AppError::Validation(
            "webhook url must be http or https".to_string(),
        ));
    }
    if body.timeout_seconds < 1 || body.timeout_seconds > 120 {
        return Err(AppError::Validation(
            "timeout_seconds must be between 1 and 120".to_string(),
        ));
    }
    if body.max_retries < 0 || body.retry_delay_seconds < 1 {
        return Err(AppError::Validation(
            "retry settings out of range".to_string(),
        ));
    }

    // 256 bits of entropy, hex encoded.
    let secret = {
        use rand::RngCore;
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        hex::encode(bytes)
    };

    let endpoint =
        WebhookEndpointRepository::create(&state.db, &auth.organization_id, secret.clone(), body)
            .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreatedEndpointResponse { endpoint, secret }),
    ))
}

async fn list_endpoints(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
) -> AppResult<Json<Vec<WebhookEndpoint>>> {
    auth.require_scope("webhooks:read")?;

    let endpoints =
        WebhookEndpointRepository::list_for_org(&state.db, &auth.organization_id).await?;
    Ok(Json(endpoints))
}

async fn get_endpoint(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> AppResult<Json<WebhookEndpoint>> {
    auth.require_scope("webhooks:read")?;

    let endpoint = load_owned(&state, &auth, &id).await?;
    Ok(Json(endpoint))
}

async fn delete_endpoint(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    auth.require_scope("webhooks:write")?;

    let endpoint = load_owned(&state, &auth, &id).await?;
    WebhookEndpointRepository::delete(&state.db, &endpoint.id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_deliveries(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(id): Path<String>,
    Query(query): Query<ListDeliveriesQuery>,
) -> AppResult<Json<Vec<WebhookDelivery>>> {
    auth.require_scope("webhooks:read")?;

    let endpoint = load_owned(&state, &auth, &id).await?;
    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    let offset = query.offset.unwrap_or(0).max(0);

    let deliveries =
        WebhookDeliveryRepository::list_for_endpoint(&state.db, &endpoint.id, limit, offset)
            .await?;
    Ok(Json(deliveries))
}

async fn create_token(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Json(body): Json<CreateIncomingToken>,
) -> AppResult<(StatusCode, Json<CreatedTokenResponse>)> {
    auth.require_scope("webhooks:write")?;

    match body.integration_type.as_str() {
        "generic" | "prometheus" | "grafana" | "datadog" => {}
        other => {
            return Err(AppError::Validation(format!(
                "unknown integration type {other:?}"
            )))
        }
    }
    if let Some(priority) = &body.default_priority {
        if crate::db::models::AlertPriority::parse(priority).is_none() {
            return Err(AppError::Validation(format!(
                "invalid default priority {priority:?}"
            )));
        }
    }

    let token = generate_incoming_token();
    let record =
        IncomingTokenRepository::create(&state.db, &auth.organization_id, token.clone(), body)
            .await?;

    let ingest_url = format!("/webhook/{token}");
    Ok((
        StatusCode::CREATED,
        Json(CreatedTokenResponse {
            token_record: record,
            token,
            ingest_url,
        }),
    ))
}

async fn list_tokens(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
) -> AppResult<Json<Vec<IncomingWebhookToken>>> {
    auth.require_scope("webhooks:read")?;

    let tokens = IncomingTokenRepository::list_for_org(&state.db, &auth.organization_id).await?;
    Ok(Json(tokens))
}

async fn delete_token(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    auth.require_scope("webhooks:write")?;

    let tokens = IncomingTokenRepository::list_for_org(&state.db, &auth.organization_id).await?;
    if !tokens.iter().any(|t| t.id == id) {
        return Err(AppError::NotFound(format!("incoming token {id}")));
    }

    IncomingTokenRepository::delete(&state.db, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn load_owned(
    state: &Arc<AppState>,
    auth: &AuthContext,
    id: &str,
) -> AppResult<WebhookEndpoint> {
    WebhookEndpointRepository::find_by_id(&state.db, id)
        .await?
        .filter(|e| e.organization_id == auth.organization_id)
        .ok_or_else(|| AppError::NotFound(format!("webhook endpoint {id}")))
}
