use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A configured delivery channel. `config` is an opaque JSON blob
/// validated by the matching provider adapter on create/update.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct NotificationChannel {
    pub id: String,
    pub organization_id: String,
    /// 'email' | 'slack' | 'teams' | 'webhook'
    pub channel_type: String,
    pub name: String,
    pub config: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateNotificationChannel {
    pub channel_type: String,
    pub name: String,
    pub config: serde_json::Value,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

fn enabled_default() -> bool {
    true
}

/// Audit record of one notification attempt to one recipient.
/// Transitions pending -> sent or pending -> failed; terminal either way.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct NotificationLog {
    pub id: String,
    pub organization_id: String,
    pub channel_id: Option<String>,
    pub user_id: Option<String>,
    pub alert_id: Option<String>,
    pub recipient: String,
    pub subject: Option<String>,
    pub message: String,
    /// 'pending' | 'sent' | 'failed'
    pub status: String,
    pub error: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateNotificationLog {
    pub organization_id: String,
    pub channel_id: Option<String>,
    pub user_id: Option<String>,
    pub alert_id: Option<String>,
    pub recipient: String,
    pub subject: Option<String>,
    pub message: String,
}
