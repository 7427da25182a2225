use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use serde::Serialize;

use crate::auth::constant_time_eq;
use crate::db::repository::IncomingTokenRepository;
use crate::error::AppResult;
use crate::services::ingest::{self, IngestService};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/:token", post(ingest_webhook))
}

#[derive(Debug, Serialize)]
struct IngestSummary {
    accepted: usize,
    results: Vec<String>,
}

/// Public unauthenticated ingest for monitoring systems. The token
/// selects the org and the payload adapter. An invalid token yields a
/// bare 401 with no body, leaking nothing about token existence.
async fn ingest_webhook(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    Json(payload): Json<serde_json::Value>,
) -> AppResult<axum::response::Response> {
    let record = IncomingTokenRepository::find_enabled_by_token(&state.db, &token)
        .await
        .map_err(|e| {
            tracing::error!("Token lookup failed: {:?}", e);
            e
        })?;

    // Re-verify the fetched row against the presented token in constant
    // time so the comparison itself cannot be used as an oracle. An
    // invalid token yields a bare 401 with no body.
    let record = match record {
        Some(record) if constant_time_eq(&record.token, &token) => record,
        _ => return Ok(StatusCode::UNAUTHORIZED.into_response()),
    };

    let alerts = ingest::normalize(&record, &payload)?;
    if alerts.is_empty() {
        return Ok((
            StatusCode::ACCEPTED,
            Json(IngestSummary {
                accepted: 0,
                results: Vec::new(),
            }),
        )
            .into_response());
    }

    let service = IngestService::new(&state);
    let mut results = Vec::with_capacity(alerts.len());
    for alert in alerts {
        match service.ingest(&record.organization_id, alert).await {
            Ok((_, outcome)) => results.push(outcome.as_str().to_string()),
            Err(e) => {
                // One bad alert in a batch does not reject the rest.
                tracing::warn!(token = %record.id, "Inbound alert rejected: {:?}", e);
                results.push("rejected".to_string());
            }
        }
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(IngestSummary {
            accepted: results.iter().filter(|r| r.as_str() != "rejected").count(),
            results,
        }),
    )
        .into_response())
}
