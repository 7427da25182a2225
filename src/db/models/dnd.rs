use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Per-user do-not-disturb settings; one row per user. `schedule` and
/// `overrides` are JSON blobs validated into the typed forms below.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct UserDndSettings {
    pub user_id: String,
    pub enabled: bool,
    /// JSON [`DndSchedule`].
    pub schedule: String,
    /// JSON array of [`DndOverride`].
    pub overrides: String,
    pub allow_p1_override: bool,
    pub updated_at: DateTime<Utc>,
}

impl UserDndSettings {
    pub fn parsed_schedule(&self) -> Option<DndSchedule> {
        serde_json::from_str(&self.schedule).ok()
    }

    pub fn parsed_overrides(&self) -> Vec<DndOverride> {
        serde_json::from_str(&self.overrides).unwrap_or_default()
    }
}

/// Weekly quiet-hours definition. Times are "HH:MM" wall clock in
/// `timezone` (falling back to the user's timezone when absent).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DndSchedule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(default)]
    pub slots: Vec<DndSlot>,
}

/// One weekly slot; `end < start` means the window crosses midnight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DndSlot {
    /// 0=Sunday .. 6=Saturday
    pub day: u8,
    /// "HH:MM"
    pub start: String,
    /// "HH:MM"
    pub end: String,
}

/// An absolute suppression window, e.g. vacation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DndOverride {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpsertDndSettings {
    pub enabled: bool,
    #[serde(default)]
    pub schedule: DndSchedule,
    #[serde(default)]
    pub overrides: Vec<DndOverride>,
    #[serde(default)]
    pub allow_p1_override: bool,
}
