use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct EscalationPolicy {
    pub id: String,
    pub organization_id: String,
    pub name: String,
    pub description: Option<String>,
    pub repeat_enabled: bool,
    /// None means repeat forever while `repeat_enabled`.
    pub repeat_count: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One step of a policy; unique (policy_id, position).
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct EscalationRule {
    pub id: String,
    pub policy_id: String,
    pub position: i64,
    pub delay_minutes: i64,
    pub created_at: DateTime<Utc>,
}

/// Kind of recipient an escalation rule step points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    User,
    Team,
    Schedule,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::User => "user",
            TargetKind::Team => "team",
            TargetKind::Schedule => "schedule",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(TargetKind::User),
            "team" => Some(TargetKind::Team),
            "schedule" => Some(TargetKind::Schedule),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct EscalationTarget {
    pub id: String,
    pub rule_id: String,
    /// 'user' | 'team' | 'schedule'
    pub kind: String,
    pub target_id: String,
    /// Optional JSON array of channel type names overriding the
    /// recipient's own preferences for this target.
    pub channels: Option<String>,
    pub urgent: bool,
    pub created_at: DateTime<Utc>,
}

impl EscalationTarget {
    pub fn channel_list(&self) -> Option<Vec<String>> {
        self.channels
            .as_deref()
            .and_then(|c| serde_json::from_str(c).ok())
    }
}

/// Escalation event lifecycle. The latest `triggered` row with a non-null
/// `next_escalation_at` is the single active event for an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationEventType {
    Triggered,
    Acknowledged,
    Completed,
    Stopped,
}

impl EscalationEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationEventType::Triggered => "triggered",
            EscalationEventType::Acknowledged => "acknowledged",
            EscalationEventType::Completed => "completed",
            EscalationEventType::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct AlertEscalationEvent {
    pub id: String,
    pub alert_id: String,
    pub policy_id: String,
    pub rule_id: Option<String>,
    /// 'triggered' | 'acknowledged' | 'completed' | 'stopped'
    pub event_type: String,
    pub current_level: i64,
    pub repeat_count: i64,
    pub next_escalation_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateEscalationPolicy {
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub repeat_enabled: bool,
    pub repeat_count: Option<i64>,
    #[serde(default)]
    pub rules: Vec<CreateEscalationRule>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateEscalationRule {
    pub position: i64,
    pub delay_minutes: i64,
    #[serde(default)]
    pub targets: Vec<CreateEscalationTarget>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateEscalationTarget {
    pub kind: String,
    pub target_id: String,
    pub channels: Option<Vec<String>>,
    #[serde(default)]
    pub urgent: bool,
}
