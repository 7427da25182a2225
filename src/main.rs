use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
mod middleware;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use axum::body::Body;
use http::{HeaderValue, StatusCode};
use tower_governor::governor::GovernorConfigBuilder;
use tower_governor::key_extractor::SmartIpKeyExtractor;
use tower_governor::{GovernorError, GovernorLayer};

mod auth;
mod clock;
mod config;
mod db;
mod error;
mod routes;
mod services;
#[cfg(test)]
mod test_support;

use clock::{Clock, SystemClock};
use config::Config;
use services::events::EventBus;
use services::locks::KeyedLocks;

pub struct AppState {
    pub db: sqlx::SqlitePool,
    pub config: Config,
    pub bus: Arc<EventBus>,
    pub clock: Arc<dyn Clock>,
    pub http: reqwest::Client,
    pub alert_locks: KeyedLocks,
    pub incident_locks: KeyedLocks,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pulsar=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!("Starting Pulsar incident management service");

    // Initialize database
    let pool = services::init::init_db(&config).await?;

    let http = reqwest::Client::builder()
        .user_agent(concat!("pulsar/", env!("CARGO_PKG_VERSION")))
        .build()?;

    let app_state = Arc::new(AppState {
        db: pool,
        config: config.clone(),
        bus: Arc::new(EventBus::new()),
        clock: Arc::new(SystemClock),
        http,
        alert_locks: KeyedLocks::new(),
        incident_locks: KeyedLocks::new(),
    });

    // Spawn background workers (escalation, webhook delivery/enqueue,
    // snooze expiry) with a broadcast shutdown channel.
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    let worker_handles =
        services::init::spawn_background_workers(app_state.clone(), shutdown_tx.clone());

    // Rate limiter for the public ingest endpoint.
    let mut ingest_builder = GovernorConfigBuilder::default();
    ingest_builder.per_second(config.rate_limit.ingest_per_second.into());
    ingest_builder.burst_size(config.rate_limit.ingest_burst.into());
    ingest_builder.key_extractor(SmartIpKeyExtractor);
    ingest_builder.error_handler(|error: GovernorError| -> http::Response<Body> {
        match error {
            GovernorError::TooManyRequests { wait_time, headers } => {
                let retry_after = wait_time;
                let body = serde_json::json!({
                    "error": {
                        "code": "RATE_LIMITED",
                        "message": "Rate limit exceeded",
                        "details": { "retry_after_seconds": retry_after }
                    }
                })
                .to_string();

                let mut resp = http::Response::new(Body::from(body));
                *resp.status_mut() = StatusCode::TOO_MANY_REQUESTS;
                resp.headers_mut().insert(
                    http::header::CONTENT_TYPE,
                    http::HeaderValue::from_static("application/json"),
                );
                if let Some(hmap) = headers {
                    for (name, value) in hmap.iter() {
                        resp.headers_mut().append(name.clone(), value.clone());
                    }
                }
                resp.headers_mut().insert(
                    http::header::RETRY_AFTER,
                    http::HeaderValue::from_str(&retry_after.to_string()).unwrap(),
                );
                resp
            }
            GovernorError::UnableToExtractKey => {
                let mut resp = http::Response::new(Body::from(
                    "Unable to determine client IP for rate limiting",
                ));
                *resp.status_mut() = StatusCode::BAD_REQUEST;
                resp
            }
            GovernorError::Other { code, msg, headers } => {
                let body = msg.unwrap_or_else(|| "Rate limiting error".to_string());
                let mut resp = http::Response::new(Body::from(body));
                let status = StatusCode::from_u16(code.as_u16())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                *resp.status_mut() = status;
                if let Some(hmap) = headers {
                    for (name, value) in hmap.iter() {
                        resp.headers_mut().append(name.clone(), value.clone());
                    }
                }
                resp
            }
        }
    });
    let ingest_gov_conf = Arc::new(
        ingest_builder
            .finish()
            .ok_or_else(|| anyhow::anyhow!("Failed to build ingest governor config"))?,
    );

    // Background cleanup for the limiter storage
    {
        let limiter = ingest_gov_conf.limiter().clone();
        let interval = Duration::from_secs(60);
        std::thread::spawn(move || loop {
            std::thread::sleep(interval);
            tracing::debug!("ingest rate limiter size: {}", limiter.len());
            limiter.retain_recent();
        });
    }

    let ingest_rate_layer = GovernorLayer {
        config: ingest_gov_conf.clone(),
    };

    // Build router
    let app = Router::new()
        // Health check
        .route("/health", get(routes::health::health_check))
        // Alert ingest + lifecycle
        .nest("/api/alerts", routes::alerts::router())
        // API keys
        .nest("/api/api-keys", routes::api_keys::router())
        // Teams
        .nest("/api/teams", routes::teams::router())
        // On-call schedules
        .nest("/api/schedules", routes::schedules::router())
        // Escalation policies
        .nest("/api/escalation-policies", routes::escalation_policies::router())
        // Routing rules
        .nest("/api/routing-rules", routes::routing_rules::router())
        // Notification channels + audit log
        .nest("/api/notifications", routes::channels::router())
        // Per-user DND settings
        .nest("/api/dnd", routes::dnd::router())
        // Outgoing webhook endpoints + incoming tokens
        .nest("/api/webhooks", routes::webhooks_admin::router())
        // Incidents
        .nest("/api/incidents", routes::incidents::router())
        // Live event stream
        .nest("/ws", routes::ws::router())
        // Public inbound monitoring webhook (rate limited)
        .nest(
            "/webhook",
            routes::ingest::router().layer(ingest_rate_layer),
        )
        // Add shared state
        .with_state(app_state.clone())
        // Correlation id on every request/response
        .layer(axum::middleware::from_fn(
            middleware::request_id::request_id_middleware,
        ))
        // Add middleware
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(
                    config
                        .server
                        .frontend_url
                        .parse::<HeaderValue>()
                        .expect("Invalid FRONTEND_URL for CORS"),
                )
                .allow_methods([
                    http::Method::GET,
                    http::Method::POST,
                    http::Method::PUT,
                    http::Method::DELETE,
                    http::Method::OPTIONS,
                    http::Method::PATCH,
                ])
                .allow_headers([
                    http::header::CONTENT_TYPE,
                    http::header::AUTHORIZATION,
                    http::header::ACCEPT,
                ])
                .allow_credentials(true),
        );

    // Start server
    let host = config.server.host.clone();
    let port = config.server.port;
    let addr = format!("{}:{}", host, port);

    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Signal workers, then give them a grace period before abandoning.
    tracing::info!("Shutting down background workers");
    let _ = shutdown_tx.send(());
    let grace = Duration::from_secs(config.server.shutdown_grace_seconds);
    if tokio::time::timeout(grace, async {
        for handle in worker_handles {
            let _ = handle.await;
        }
    })
    .await
    .is_err()
    {
        tracing::warn!("Workers did not stop within the grace period; aborting");
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
