use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// An outgoing webhook destination. Event-filter flags gate which bus
/// events are fanned out to it; `headers` is a JSON object of extra
/// request headers merged into each delivery.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct WebhookEndpoint {
    pub id: String,
    pub organization_id: String,
    pub name: String,
    pub url: String,
    /// HMAC secret, >= 256 bits of entropy. Never serialized to clients.
    #[serde(skip_serializing)]
    pub secret: String,
    pub enabled: bool,
    pub on_alert_created: bool,
    pub on_alert_updated: bool,
    pub on_alert_acknowledged: bool,
    pub on_alert_closed: bool,
    pub on_alert_escalated: bool,
    pub on_incident_events: bool,
    /// JSON object of custom headers.
    pub headers: String,
    pub timeout_seconds: i64,
    pub max_retries: i64,
    pub retry_delay_seconds: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookEndpoint {
    pub fn header_map(&self) -> std::collections::HashMap<String, String> {
        serde_json::from_str(&self.headers).unwrap_or_default()
    }

    /// Whether this endpoint wants the given bus event type.
    pub fn accepts(&self, event_type: &str) -> bool {
        match event_type {
            "alert.created" => self.on_alert_created,
            "alert.updated" | "alert.deleted" => self.on_alert_updated,
            "alert.acknowledged" => self.on_alert_acknowledged,
            "alert.closed" => self.on_alert_closed,
            "alert.escalated" => self.on_alert_escalated,
            t if t.starts_with("incident.") => self.on_incident_events,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateWebhookEndpoint {
    pub name: String,
    pub url: String,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
    #[serde(default = "enabled_default")]
    pub on_alert_created: bool,
    #[serde(default = "enabled_default")]
    pub on_alert_updated: bool,
    #[serde(default = "enabled_default")]
    pub on_alert_acknowledged: bool,
    #[serde(default = "enabled_default")]
    pub on_alert_closed: bool,
    #[serde(default = "enabled_default")]
    pub on_alert_escalated: bool,
    #[serde(default)]
    pub on_incident_events: bool,
    #[serde(default)]
    pub headers: std::collections::HashMap<String, String>,
    #[serde(default = "timeout_default")]
    pub timeout_seconds: i64,
    #[serde(default = "retries_default")]
    pub max_retries: i64,
    #[serde(default = "retry_delay_default")]
    pub retry_delay_seconds: i64,
}

fn enabled_default() -> bool {
    true
}

fn timeout_default() -> i64 {
    10
}

fn retries_default() -> i64 {
    3
}

fn retry_delay_default() -> i64 {
    60
}

/// One delivery job: a single event envelope bound for a single endpoint,
/// retried with exponential backoff until success or attempt exhaustion.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: String,
    pub endpoint_id: String,
    pub organization_id: String,
    pub event_type: String,
    pub event_id: String,
    /// JSON payload (the `data` member of the envelope).
    pub payload: String,
    /// 'pending' | 'success' | 'failed'
    pub status: String,
    pub attempts: i64,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub response_code: Option<i64>,
    pub response_body: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Token for the public, unauthenticated ingest route. Compared in
/// constant time; >= 192 bits of entropy.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct IncomingWebhookToken {
    pub id: String,
    pub organization_id: String,
    pub name: String,
    #[serde(skip_serializing)]
    pub token: String,
    /// 'generic' | 'prometheus' | 'grafana' | 'datadog'
    pub integration_type: String,
    pub default_priority: Option<String>,
    /// JSON array of tags stamped onto every alert from this token.
    pub default_tags: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateIncomingToken {
    pub name: String,
    pub integration_type: String,
    pub default_priority: Option<String>,
    #[serde(default)]
    pub default_tags: Vec<String>,
}
