use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{
    CreateOverride, CreateRotation, CreateSchedule, RotationParticipant, Schedule,
    ScheduleOverride, ScheduleRotation,
};
use crate::error::{AppError, AppResult};

const ROTATION_COLUMNS: &str = "id, schedule_id, rotation_type, rotation_length, start_date, \
     start_time, handoff_day, handoff_time, created_at";

pub struct ScheduleRepository;

impl ScheduleRepository {
    pub async fn create(
        pool: &SqlitePool,
        org_id: &str,
        input: CreateSchedule,
    ) -> AppResult<Schedule> {
        let now = Utc::now();

        let row = sqlx::query_as::<_, Schedule>(
            r#"
            INSERT INTO schedules (id, organization_id, name, timezone, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING id, organization_id, name, timezone, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(org_id)
        .bind(input.name)
        .bind(input.timezone)
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> AppResult<Option<Schedule>> {
        let row = sqlx::query_as::<_, Schedule>(
            "SELECT id, organization_id, name, timezone, created_at, updated_at \
             FROM schedules WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn list_for_org(pool: &SqlitePool, org_id: &str) -> AppResult<Vec<Schedule>> {
        let rows = sqlx::query_as::<_, Schedule>(
            "SELECT id, organization_id, name, timezone, created_at, updated_at \
             FROM schedules WHERE organization_id = ? ORDER BY name",
        )
        .bind(org_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }

    pub async fn delete(pool: &SqlitePool, id: &str) -> AppResult<bool> {
        let res = sqlx::query("DELETE FROM schedules WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(res.rows_affected() > 0)
    }

    /// Create a rotation with its participants (positions assigned densely
    /// in the order given) in one transaction.
    pub async fn create_rotation(
        pool: &SqlitePool,
        schedule_id: &str,
        input: CreateRotation,
    ) -> AppResult<ScheduleRotation> {
        let mut tx = pool.begin().await.map_err(AppError::Database)?;
        let now = Utc::now();
        let rotation_id = Uuid::new_v4().to_string();

        let rotation = sqlx::query_as::<_, ScheduleRotation>(&format!(
            r#"
            INSERT INTO schedule_rotations
                (id, schedule_id, rotation_type, rotation_length, start_date, start_time,
                 handoff_day, handoff_time, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING {ROTATION_COLUMNS}
            "#,
        ))
        .bind(&rotation_id)
        .bind(schedule_id)
        .bind(&input.rotation_type)
        .bind(input.rotation_length.max(1))
        .bind(input.start_date)
        .bind(input.start_time)
        .bind(input.handoff_day)
        .bind(input.handoff_time)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(AppError::Database)?;

        for (position, user_id) in input.participants.iter().enumerate() {
            sqlx::query(
                "INSERT INTO rotation_participants (rotation_id, user_id, position) VALUES (?, ?, ?)",
            )
            .bind(&rotation_id)
            .bind(user_id)
            .bind(position as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(db) if db.is_unique_violation() => {
                    AppError::Conflict("duplicate rotation participant".to_string())
                }
                _ => AppError::Database(e),
            })?;
        }

        tx.commit().await.map_err(AppError::Database)?;

        Ok(rotation)
    }

    /// Rotations for a schedule, first by creation (the resolver uses the
    /// first one).
    pub async fn rotations(pool: &SqlitePool, schedule_id: &str) -> AppResult<Vec<ScheduleRotation>> {
        let rows = sqlx::query_as::<_, ScheduleRotation>(&format!(
            "SELECT {ROTATION_COLUMNS} FROM schedule_rotations WHERE schedule_id = ? ORDER BY created_at"
        ))
        .bind(schedule_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }

    pub async fn participants(
        pool: &SqlitePool,
        rotation_id: &str,
    ) -> AppResult<Vec<RotationParticipant>> {
        let rows = sqlx::query_as::<_, RotationParticipant>(
            "SELECT rotation_id, user_id, position \
             FROM rotation_participants WHERE rotation_id = ? ORDER BY position",
        )
        .bind(rotation_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }

    /// Insert an override after verifying it does not overlap an existing
    /// one on the same schedule.
    pub async fn create_override(
        pool: &SqlitePool,
        schedule_id: &str,
        input: CreateOverride,
    ) -> AppResult<ScheduleOverride> {
        if input.end_at <= input.start_at {
            return Err(AppError::Validation("end must be after start".to_string()));
        }

        let mut tx = pool.begin().await.map_err(AppError::Database)?;

        let overlapping: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM schedule_overrides \
             WHERE schedule_id = ? AND start_at < ? AND end_at > ?",
        )
        .bind(schedule_id)
        .bind(input.end_at)
        .bind(input.start_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(AppError::Database)?;

        if overlapping > 0 {
            return Err(AppError::Conflict(
                "override overlaps an existing override".to_string(),
            ));
        }

        let row = sqlx::query_as::<_, ScheduleOverride>(
            r#"
            INSERT INTO schedule_overrides (id, schedule_id, user_id, start_at, end_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING id, schedule_id, user_id, start_at, end_at, created_at
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(schedule_id)
        .bind(input.user_id)
        .bind(input.start_at)
        .bind(input.end_at)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await
        .map_err(AppError::Database)?;

        tx.commit().await.map_err(AppError::Database)?;

        Ok(row)
    }

    /// Overrides covering the given instant (start <= at < end).
    pub async fn overrides_at(
        pool: &SqlitePool,
        schedule_id: &str,
        at: DateTime<Utc>,
    ) -> AppResult<Vec<ScheduleOverride>> {
        let rows = sqlx::query_as::<_, ScheduleOverride>(
            "SELECT id, schedule_id, user_id, start_at, end_at, created_at \
             FROM schedule_overrides WHERE schedule_id = ? AND start_at <= ? AND end_at > ? \
             ORDER BY start_at",
        )
        .bind(schedule_id)
        .bind(at)
        .bind(at)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }

    pub async fn list_overrides(
        pool: &SqlitePool,
        schedule_id: &str,
    ) -> AppResult<Vec<ScheduleOverride>> {
        let rows = sqlx::query_as::<_, ScheduleOverride>(
            "SELECT id, schedule_id, user_id, start_at, end_at, created_at \
             FROM schedule_overrides WHERE schedule_id = ? ORDER BY start_at",
        )
        .bind(schedule_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }

    pub async fn delete_override(pool: &SqlitePool, id: &str) -> AppResult<bool> {
        let res = sqlx::query("DELETE FROM schedule_overrides WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(res.rows_affected() > 0)
    }
}
