use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{
    CreateNotificationChannel, CreateNotificationLog, NotificationChannel, NotificationLog,
};
use crate::error::{AppError, AppResult};

const CHANNEL_COLUMNS: &str =
    "id, organization_id, channel_type, name, config, enabled, created_at, updated_at";

const LOG_COLUMNS: &str = "id, organization_id, channel_id, user_id, alert_id, recipient, \
     subject, message, status, error, sent_at, created_at";

pub struct NotificationChannelRepository;

impl NotificationChannelRepository {
    pub async fn create(
        pool: &SqlitePool,
        org_id: &str,
        input: CreateNotificationChannel,
    ) -> AppResult<NotificationChannel> {
        let now = Utc::now();
        let config = serde_json::to_string(&input.config)
            .map_err(|e| AppError::Validation(format!("invalid config: {e}")))?;

        let row = sqlx::query_as::<_, NotificationChannel>(&format!(
            r#"
            INSERT INTO notification_channels
                (id, organization_id, channel_type, name, config, enabled, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING {CHANNEL_COLUMNS}
            "#,
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(org_id)
        .bind(input.channel_type)
        .bind(input.name)
        .bind(config)
        .bind(input.enabled)
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> AppResult<Option<NotificationChannel>> {
        let row = sqlx::query_as::<_, NotificationChannel>(&format!(
            "SELECT {CHANNEL_COLUMNS} FROM notification_channels WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn list_for_org(
        pool: &SqlitePool,
        org_id: &str,
    ) -> AppResult<Vec<NotificationChannel>> {
        let rows = sqlx::query_as::<_, NotificationChannel>(&format!(
            "SELECT {CHANNEL_COLUMNS} FROM notification_channels WHERE organization_id = ? ORDER BY name"
        ))
        .bind(org_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }

    /// Enabled channels for an org, used by the dispatcher to pick
    /// concrete providers per recipient.
    pub async fn list_enabled(
        pool: &SqlitePool,
        org_id: &str,
    ) -> AppResult<Vec<NotificationChannel>> {
        let rows = sqlx::query_as::<_, NotificationChannel>(&format!(
            "SELECT {CHANNEL_COLUMNS} FROM notification_channels \
             WHERE organization_id = ? AND enabled = 1 ORDER BY name"
        ))
        .bind(org_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }

    pub async fn delete(pool: &SqlitePool, id: &str) -> AppResult<bool> {
        let res = sqlx::query("DELETE FROM notification_channels WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(res.rows_affected() > 0)
    }
}

pub struct NotificationLogRepository;

impl NotificationLogRepository {
    /// Insert a pending log row; the dispatcher settles it to sent/failed
    /// after the provider call.
    pub async fn create_pending(
        pool: &SqlitePool,
        log: CreateNotificationLog,
    ) -> AppResult<NotificationLog> {
        let row = sqlx::query_as::<_, NotificationLog>(&format!(
            r#"
            INSERT INTO notification_logs
                (id, organization_id, channel_id, user_id, alert_id, recipient, subject,
                 message, status, error, sent_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'pending', NULL, NULL, ?)
            RETURNING {LOG_COLUMNS}
            "#,
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(log.organization_id)
        .bind(log.channel_id)
        .bind(log.user_id)
        .bind(log.alert_id)
        .bind(log.recipient)
        .bind(log.subject)
        .bind(log.message)
        .bind(Utc::now())
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn mark_sent(
        pool: &SqlitePool,
        id: &str,
        sent_at: DateTime<Utc>,
    ) -> AppResult<()> {
        sqlx::query("UPDATE notification_logs SET status = 'sent', sent_at = ? WHERE id = ?")
            .bind(sent_at)
            .bind(id)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(())
    }

    pub async fn mark_failed(pool: &SqlitePool, id: &str, error: &str) -> AppResult<()> {
        sqlx::query("UPDATE notification_logs SET status = 'failed', error = ? WHERE id = ?")
            .bind(error)
            .bind(id)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(())
    }

    pub async fn list_for_org(
        pool: &SqlitePool,
        org_id: &str,
        status: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> AppResult<Vec<NotificationLog>> {
        let mut sql = format!(
            "SELECT {LOG_COLUMNS} FROM notification_logs WHERE organization_id = ?"
        );
        if status.is_some() {
            sql.push_str(" AND status = ?");
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT ? OFFSET ?");

        let mut query = sqlx::query_as::<_, NotificationLog>(&sql).bind(org_id);
        if let Some(status) = status {
            query = query.bind(status);
        }
        let rows = query
            .bind(limit)
            .bind(offset)
            .fetch_all(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(rows)
    }

    pub async fn count_for_org(
        pool: &SqlitePool,
        org_id: &str,
        status: Option<&str>,
    ) -> AppResult<i64> {
        let mut sql = "SELECT COUNT(*) FROM notification_logs WHERE organization_id = ?".to_string();
        if status.is_some() {
            sql.push_str(" AND status = ?");
        }

        let mut query = sqlx::query_scalar::<_, i64>(&sql).bind(org_id);
        if let Some(status) = status {
            query = query.bind(status);
        }
        let count = query.fetch_one(pool).await.map_err(AppError::Database)?;

        Ok(count)
    }

    pub async fn list_for_alert(
        pool: &SqlitePool,
        alert_id: &str,
    ) -> AppResult<Vec<NotificationLog>> {
        let rows = sqlx::query_as::<_, NotificationLog>(&format!(
            "SELECT {LOG_COLUMNS} FROM notification_logs WHERE alert_id = ? ORDER BY created_at"
        ))
        .bind(alert_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }
}
