//! Shared fixtures for in-process integration tests: an in-memory
//! database with migrations applied, a manual clock, and a throwaway
//! HTTP receiver for provider and webhook targets.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::any, Router};
use chrono::{DateTime, Utc};

use crate::clock::ManualClock;
use crate::config::Config;
use crate::db::models::CreateOrganization;
use crate::db::repository::{OrganizationRepository, UserRepository};
use crate::services::events::EventBus;
use crate::services::locks::KeyedLocks;
use crate::AppState;

pub async fn memory_pool() -> sqlx::SqlitePool {
    // A single connection keeps every query on the same :memory: database.
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("open in-memory sqlite");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("run migrations");

    pool
}

pub fn manual_clock(start: &str) -> Arc<ManualClock> {
    Arc::new(ManualClock::new(start.parse().expect("clock start")))
}

pub async fn state_with_clock(clock: Arc<ManualClock>) -> Arc<AppState> {
    let pool = memory_pool().await;

    Arc::new(AppState {
        db: pool,
        config: Config::default(),
        bus: Arc::new(EventBus::new()),
        clock,
        http: reqwest::Client::new(),
        alert_locks: KeyedLocks::new(),
        incident_locks: KeyedLocks::new(),
    })
}

pub async fn seed_org(state: &Arc<AppState>, slug: &str) -> String {
    OrganizationRepository::create(
        &state.db,
        CreateOrganization {
            slug: slug.to_string(),
            name: slug.to_string(),
            plan: None,
        },
    )
    .await
    .expect("seed org")
    .id
}

pub async fn seed_user(state: &Arc<AppState>, org_id: &str, email: &str) -> String {
    UserRepository::create(
        &state.db,
        org_id,
        crate::db::models::CreateUser {
            email: email.to_string(),
            name: email.split('@').next().unwrap_or(email).to_string(),
            timezone: Some("UTC".to_string()),
        },
    )
    .await
    .expect("seed user")
    .id
}

/// Scripted HTTP receiver. Responds with the next status from `script`
/// (repeating the last one) and counts hits.
pub struct Receiver {
    pub url: String,
    pub hits: Arc<AtomicUsize>,
}

pub async fn spawn_receiver(script: Vec<u16>) -> Receiver {
    let hits = Arc::new(AtomicUsize::new(0));

    #[derive(Clone)]
    struct Script {
        statuses: Arc<Vec<u16>>,
        hits: Arc<AtomicUsize>,
    }

    async fn respond(State(script): State<Script>) -> StatusCode {
        let n = script.hits.fetch_add(1, Ordering::SeqCst);
        let status = *script
            .statuses
            .get(n)
            .or_else(|| script.statuses.last())
            .unwrap_or(&200);
        StatusCode::from_u16(status).unwrap_or(StatusCode::OK)
    }

    let app = Router::new()
        .route("/", any(respond))
        .route("/*path", any(respond))
        .with_state(Script {
            statuses: Arc::new(script),
            hits: hits.clone(),
        });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind receiver");
    let addr: SocketAddr = listener.local_addr().expect("receiver addr");

    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    Receiver {
        url: format!("http://{addr}/hook"),
        hits,
    }
}

pub fn at(s: &str) -> DateTime<Utc> {
    s.parse().expect("timestamp")
}
