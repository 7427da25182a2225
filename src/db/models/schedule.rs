use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub organization_id: String,
    pub name: String,
    /// IANA timezone the rotation math is computed in.
    pub timezone: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationType {
    Daily,
    Weekly,
    Custom,
}

impl RotationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RotationType::Daily => "daily",
            RotationType::Weekly => "weekly",
            RotationType::Custom => "custom",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "daily" => Some(RotationType::Daily),
            "weekly" => Some(RotationType::Weekly),
            "custom" => Some(RotationType::Custom),
            _ => None,
        }
    }
}

/// Rotation definition. `start_date`, `start_time` and the handoff fields
/// are wall-clock values interpreted in the schedule's timezone.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ScheduleRotation {
    pub id: String,
    pub schedule_id: String,
    /// 'daily' | 'weekly' | 'custom'
    pub rotation_type: String,
    /// Days for daily/custom, weeks for weekly. Always >= 1.
    pub rotation_length: i64,
    pub start_date: NaiveDate,
    pub start_time: NaiveTime,
    /// 0=Sunday .. 6=Saturday; only used by weekly rotations.
    pub handoff_day: Option<i64>,
    pub handoff_time: NaiveTime,
    pub created_at: DateTime<Utc>,
}

/// Participant positions are unique and dense (0..n-1) within a rotation.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct RotationParticipant {
    pub rotation_id: String,
    pub user_id: String,
    pub position: i64,
}

/// A manual override window; overrides for a schedule never overlap.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ScheduleOverride {
    pub id: String,
    pub schedule_id: String,
    pub user_id: String,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSchedule {
    pub name: String,
    pub timezone: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateRotation {
    pub rotation_type: String,
    pub rotation_length: i64,
    pub start_date: NaiveDate,
    #[serde(default = "midnight")]
    pub start_time: NaiveTime,
    pub handoff_day: Option<i64>,
    pub handoff_time: NaiveTime,
    #[serde(default)]
    pub participants: Vec<String>,
}

fn midnight() -> NaiveTime {
    NaiveTime::from_hms_opt(0, 0, 0).unwrap()
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateOverride {
    pub user_id: String,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
}
