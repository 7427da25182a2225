use chrono::Utc;
use sqlx::SqlitePool;

use crate::db::models::{UpsertDndSettings, UserDndSettings};
use crate::error::{AppError, AppResult};

const DND_COLUMNS: &str = "user_id, enabled, schedule, overrides, allow_p1_override, updated_at";

pub struct DndSettingsRepository;

impl DndSettingsRepository {
    pub async fn get(pool: &SqlitePool, user_id: &str) -> AppResult<Option<UserDndSettings>> {
        let row = sqlx::query_as::<_, UserDndSettings>(&format!(
            "SELECT {DND_COLUMNS} FROM user_dnd_settings WHERE user_id = ?"
        ))
        .bind(user_id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// One row per user; insert or fully replace.
    pub async fn upsert(
        pool: &SqlitePool,
        user_id: &str,
        input: UpsertDndSettings,
    ) -> AppResult<UserDndSettings> {
        let schedule = serde_json::to_string(&input.schedule)
            .map_err(|e| AppError::Validation(format!("invalid schedule: {e}")))?;
        let overrides = serde_json::to_string(&input.overrides)
            .map_err(|e| AppError::Validation(format!("invalid overrides: {e}")))?;

        let row = sqlx::query_as::<_, UserDndSettings>(&format!(
            r#"
            INSERT INTO user_dnd_settings (user_id, enabled, schedule, overrides, allow_p1_override, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (user_id) DO UPDATE SET
                enabled = excluded.enabled,
                schedule = excluded.schedule,
                overrides = excluded.overrides,
                allow_p1_override = excluded.allow_p1_override,
                updated_at = excluded.updated_at
            RETURNING {DND_COLUMNS}
            "#,
        ))
        .bind(user_id)
        .bind(input.enabled)
        .bind(schedule)
        .bind(overrides)
        .bind(input.allow_p1_override)
        .bind(Utc::now())
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }
}
