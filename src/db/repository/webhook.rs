use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{
    CreateIncomingToken, CreateWebhookEndpoint, IncomingWebhookToken, WebhookDelivery,
    WebhookEndpoint,
};
use crate::error::{AppError, AppResult};

const ENDPOINT_COLUMNS: &str = "id, organization_id, name, url, secret, enabled, \
     on_alert_created, on_alert_updated, on_alert_acknowledged, on_alert_closed, \
     on_alert_escalated, on_incident_events, headers, timeout_seconds, max_retries, \
     retry_delay_seconds, created_at, updated_at";

const DELIVERY_COLUMNS: &str = "id, endpoint_id, organization_id, event_type, event_id, \
     payload, status, attempts, last_attempt_at, next_retry_at, response_code, response_body, \
     error, created_at, updated_at";

const TOKEN_COLUMNS: &str = "id, organization_id, name, token, integration_type, \
     default_priority, default_tags, enabled, created_at";

pub struct WebhookEndpointRepository;

impl WebhookEndpointRepository {
    pub async fn create(
        pool: &SqlitePool,
        org_id: &str,
        secret: String,
        input: CreateWebhookEndpoint,
    ) -> AppResult<WebhookEndpoint> {
        let now = Utc::now();
        let headers = serde_json::to_string(&input.headers)
            .map_err(|e| AppError::Validation(format!("invalid headers: {e}")))?;

        let row = sqlx::query_as::<_, WebhookEndpoint>(&format!(
            r#"
            INSERT INTO webhook_endpoints
                (id, organization_id, name, url, secret, enabled,
                 on_alert_created, on_alert_updated, on_alert_acknowledged, on_alert_closed,
                 on_alert_escalated, on_incident_events, headers, timeout_seconds,
                 max_retries, retry_delay_seconds, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING {ENDPOINT_COLUMNS}
            "#,
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(org_id)
        .bind(input.name)
        .bind(input.url)
        .bind(secret)
        .bind(input.enabled)
        .bind(input.on_alert_created)
        .bind(input.on_alert_updated)
        .bind(input.on_alert_acknowledged)
        .bind(input.on_alert_closed)
        .bind(input.on_alert_escalated)
        .bind(input.on_incident_events)
        .bind(headers)
        .bind(input.timeout_seconds)
        .bind(input.max_retries)
        .bind(input.retry_delay_seconds)
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> AppResult<Option<WebhookEndpoint>> {
        let row = sqlx::query_as::<_, WebhookEndpoint>(&format!(
            "SELECT {ENDPOINT_COLUMNS} FROM webhook_endpoints WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn list_for_org(pool: &SqlitePool, org_id: &str) -> AppResult<Vec<WebhookEndpoint>> {
        let rows = sqlx::query_as::<_, WebhookEndpoint>(&format!(
            "SELECT {ENDPOINT_COLUMNS} FROM webhook_endpoints WHERE organization_id = ? ORDER BY name"
        ))
        .bind(org_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }

    /// Enabled endpoints for an org; the enqueuer filters by event type
    /// via [`WebhookEndpoint::accepts`].
    pub async fn list_enabled_for_org(
        pool: &SqlitePool,
        org_id: &str,
    ) -> AppResult<Vec<WebhookEndpoint>> {
        let rows = sqlx::query_as::<_, WebhookEndpoint>(&format!(
            "SELECT {ENDPOINT_COLUMNS} FROM webhook_endpoints \
             WHERE organization_id = ? AND enabled = 1"
        ))
        .bind(org_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }

    pub async fn delete(pool: &SqlitePool, id: &str) -> AppResult<bool> {
        let res = sqlx::query("DELETE FROM webhook_endpoints WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(res.rows_affected() > 0)
    }
}

pub struct WebhookDeliveryRepository;

impl WebhookDeliveryRepository {
    pub async fn create_pending(
        pool: &SqlitePool,
        endpoint_id: &str,
        org_id: &str,
        event_type: &str,
        event_id: &str,
        payload: &str,
    ) -> AppResult<WebhookDelivery> {
        let now = Utc::now();

        let row = sqlx::query_as::<_, WebhookDelivery>(&format!(
            r#"
            INSERT INTO webhook_deliveries
                (id, endpoint_id, organization_id, event_type, event_id, payload, status,
                 attempts, last_attempt_at, next_retry_at, response_code, response_body,
                 error, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, 'pending', 0, NULL, NULL, NULL, NULL, NULL, ?, ?)
            RETURNING {DELIVERY_COLUMNS}
            "#,
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(endpoint_id)
        .bind(org_id)
        .bind(event_type)
        .bind(event_id)
        .bind(payload)
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Pending deliveries whose retry time is unset or due, oldest first.
    pub async fn fetch_due(
        pool: &SqlitePool,
        now: DateTime<Utc>,
        limit: i64,
    ) -> AppResult<Vec<WebhookDelivery>> {
        let rows = sqlx::query_as::<_, WebhookDelivery>(&format!(
            r#"
            SELECT {DELIVERY_COLUMNS} FROM webhook_deliveries
            WHERE status = 'pending' AND (next_retry_at IS NULL OR next_retry_at <= ?)
            ORDER BY created_at ASC
            LIMIT ?
            "#,
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }

    pub async fn record_success(
        pool: &SqlitePool,
        id: &str,
        attempts: i64,
        response_code: i64,
        response_body: &str,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        sqlx::query(
            "UPDATE webhook_deliveries \
             SET status = 'success', attempts = ?, last_attempt_at = ?, next_retry_at = NULL, \
                 response_code = ?, response_body = ?, error = NULL, updated_at = ? \
             WHERE id = ?",
        )
        .bind(attempts)
        .bind(now)
        .bind(response_code)
        .bind(response_body)
        .bind(now)
        .bind(id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }

    /// Record a failed attempt: either schedule the retry or mark the
    /// delivery terminally failed when `next_retry_at` is None.
    pub async fn record_failure(
        pool: &SqlitePool,
        id: &str,
        attempts: i64,
        next_retry_at: Option<DateTime<Utc>>,
        response_code: Option<i64>,
        response_body: Option<&str>,
        error: &str,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        let status = if next_retry_at.is_some() {
            "pending"
        } else {
            "failed"
        };

        sqlx::query(
            "UPDATE webhook_deliveries \
             SET status = ?, attempts = ?, last_attempt_at = ?, next_retry_at = ?, \
                 response_code = ?, response_body = ?, error = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(status)
        .bind(attempts)
        .bind(now)
        .bind(next_retry_at)
        .bind(response_code)
        .bind(response_body)
        .bind(error)
        .bind(now)
        .bind(id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }

    pub async fn list_for_endpoint(
        pool: &SqlitePool,
        endpoint_id: &str,
        limit: i64,
        offset: i64,
    ) -> AppResult<Vec<WebhookDelivery>> {
        let rows = sqlx::query_as::<_, WebhookDelivery>(&format!(
            "SELECT {DELIVERY_COLUMNS} FROM webhook_deliveries WHERE endpoint_id = ? \
             ORDER BY created_at DESC LIMIT ? OFFSET ?"
        ))
        .bind(endpoint_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }
}

pub struct IncomingTokenRepository;

impl IncomingTokenRepository {
    pub async fn create(
        pool: &SqlitePool,
        org_id: &str,
        token: String,
        input: CreateIncomingToken,
    ) -> AppResult<IncomingWebhookToken> {
        let default_tags = serde_json::to_string(&input.default_tags)
            .map_err(|e| AppError::Validation(format!("invalid default_tags: {e}")))?;

        let row = sqlx::query_as::<_, IncomingWebhookToken>(&format!(
            r#"
            INSERT INTO incoming_webhook_tokens
                (id, organization_id, name, token, integration_type, default_priority,
                 default_tags, enabled, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?)
            RETURNING {TOKEN_COLUMNS}
            "#,
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(org_id)
        .bind(input.name)
        .bind(token)
        .bind(input.integration_type)
        .bind(input.default_priority)
        .bind(default_tags)
        .bind(Utc::now())
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Lookup by token value. Callers must re-verify the returned row's
    /// token against the presented one in constant time before use.
    pub async fn find_enabled_by_token(
        pool: &SqlitePool,
        token: &str,
    ) -> AppResult<Option<IncomingWebhookToken>> {
        let row = sqlx::query_as::<_, IncomingWebhookToken>(&format!(
            "SELECT {TOKEN_COLUMNS} FROM incoming_webhook_tokens WHERE token = ? AND enabled = 1"
        ))
        .bind(token)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn list_for_org(
        pool: &SqlitePool,
        org_id: &str,
    ) -> AppResult<Vec<IncomingWebhookToken>> {
        let rows = sqlx::query_as::<_, IncomingWebhookToken>(&format!(
            "SELECT {TOKEN_COLUMNS} FROM incoming_webhook_tokens WHERE organization_id = ? \
             ORDER BY created_at"
        ))
        .bind(org_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }

    pub async fn delete(pool: &SqlitePool, id: &str) -> AppResult<bool> {
        let res = sqlx::query("DELETE FROM incoming_webhook_tokens WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(res.rows_affected() > 0)
    }
}
