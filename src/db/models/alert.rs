use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Alert priority, P1 (most urgent) through P5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AlertPriority {
    P1,
    P2,
    P3,
    P4,
    P5,
}

impl AlertPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertPriority::P1 => "P1",
            AlertPriority::P2 => "P2",
            AlertPriority::P3 => "P3",
            AlertPriority::P4 => "P4",
            AlertPriority::P5 => "P5",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "P1" => Some(AlertPriority::P1),
            "P2" => Some(AlertPriority::P2),
            "P3" => Some(AlertPriority::P3),
            "P4" => Some(AlertPriority::P4),
            "P5" => Some(AlertPriority::P5),
            _ => None,
        }
    }
}

/// Alert lifecycle status. `closed` is terminal; `snoozed` flips back to
/// `open` when the snooze window expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertStatus {
    Open,
    Acknowledged,
    Closed,
    Snoozed,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Open => "open",
            AlertStatus::Acknowledged => "acknowledged",
            AlertStatus::Closed => "closed",
            AlertStatus::Snoozed => "snoozed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(AlertStatus::Open),
            "acknowledged" => Some(AlertStatus::Acknowledged),
            "closed" => Some(AlertStatus::Closed),
            "snoozed" => Some(AlertStatus::Snoozed),
            _ => None,
        }
    }
}

/// A normalized, deduplicated observation from a monitoring source.
///
/// `tags` and `custom_fields` are stored as JSON text; at most one
/// non-closed alert exists per (organization_id, dedup_key), enforced by a
/// partial unique index.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub organization_id: String,
    pub source: String,
    pub source_id: Option<String>,
    pub priority: String,
    pub status: String,
    pub message: String,
    pub description: Option<String>,
    /// JSON array of strings.
    pub tags: String,
    /// JSON object of scalar / array-of-scalar values.
    pub custom_fields: String,
    pub dedup_key: Option<String>,
    pub dedup_count: i64,
    pub assigned_user_id: Option<String>,
    pub assigned_team_id: Option<String>,
    pub escalation_policy_id: Option<String>,
    pub escalation_level: i64,
    pub close_reason: Option<String>,
    pub snoozed_until: Option<DateTime<Utc>>,
    pub first_occurrence_at: DateTime<Utc>,
    pub last_occurrence_at: DateTime<Utc>,
    pub last_escalated_at: Option<DateTime<Utc>>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Alert {
    pub fn tag_list(&self) -> Vec<String> {
        serde_json::from_str(&self.tags).unwrap_or_default()
    }

    pub fn custom_field_map(&self) -> serde_json::Map<String, serde_json::Value> {
        serde_json::from_str(&self.custom_fields).unwrap_or_default()
    }
}

/// Canonical inbound alert shape. Transport adapters (Prometheus, Grafana,
/// Datadog, generic) convert their payloads into this before ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceAlert {
    pub source: String,
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
    pub message: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub custom_fields: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub dedup_key: Option<String>,
}

/// Filters for the alert listing endpoint.
#[derive(Debug, Clone, Default)]
pub struct AlertFilter {
    pub status: Option<String>,
    pub priority: Option<String>,
    pub assigned_user_id: Option<String>,
    pub assigned_team_id: Option<String>,
    pub source: Option<String>,
    pub search: Option<String>,
}
