use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use serde::Deserialize;

use crate::auth::AuthContext;
use crate::error::AppResult;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/", get(ws_upgrade))
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Requested per-connection buffer; clamped server-side.
    pub capacity: Option<usize>,
}

/// Upgrade to a live event stream for the caller's organization.
async fn ws_upgrade(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> AppResult<impl IntoResponse> {
    auth.require_scope("events:read")?;

    let capacity = query
        .capacity
        .unwrap_or(state.config.event_bus.default_capacity)
        .clamp(8, 4096);
    let org_id = auth.organization_id.clone();

    Ok(ws.on_upgrade(move |socket| handle_socket(state, socket, org_id, capacity)))
}

/// Pump bus events for one org to the client, interleaved with pings.
/// The bus drops messages if this task falls behind; the socket is torn
/// down on any send failure.
async fn handle_socket(state: Arc<AppState>, mut socket: WebSocket, org_id: String, capacity: usize) {
    let (subscriber_id, mut events) = state.bus.subscribe(&org_id, capacity);
    tracing::debug!(org = %org_id, "WebSocket subscriber connected");

    let mut ping = tokio::time::interval(std::time::Duration::from_secs(
        state.config.event_bus.ping_interval_seconds.max(1),
    ));
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let Ok(text) = serde_json::to_string(&event) else { continue };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            _ = ping.tick() => {
                if socket.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    // Clients may send pings/pongs or text we ignore.
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.bus.unsubscribe(&org_id, subscriber_id);
    tracing::debug!(org = %org_id, "WebSocket subscriber disconnected");
}
