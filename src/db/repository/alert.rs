use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{Alert, AlertFilter};
use crate::error::{AppError, AppResult};

const ALERT_COLUMNS: &str = "id, organization_id, source, source_id, priority, status, message, \
     description, tags, custom_fields, dedup_key, dedup_count, assigned_user_id, \
     assigned_team_id, escalation_policy_id, escalation_level, close_reason, snoozed_until, \
     first_occurrence_at, last_occurrence_at, last_escalated_at, acknowledged_at, closed_at, \
     created_at, updated_at";

/// Fields the ingestor persists for a fresh alert, after routing actions
/// have been applied.
#[derive(Debug, Clone)]
pub struct NewAlert {
    pub organization_id: String,
    pub source: String,
    pub source_id: Option<String>,
    pub priority: String,
    pub status: String,
    pub message: String,
    pub description: Option<String>,
    pub tags: String,
    pub custom_fields: String,
    pub dedup_key: String,
    pub assigned_user_id: Option<String>,
    pub assigned_team_id: Option<String>,
    pub escalation_policy_id: Option<String>,
    pub close_reason: Option<String>,
}

pub struct AlertRepository;

impl AlertRepository {
    /// Atomically bump the open alert for (org, dedup_key) if one exists.
    ///
    /// Single-statement UPDATE with a subselect so concurrent ingests of
    /// the same key cannot both miss; returns the bumped row or None when
    /// no open alert carries the key.
    pub async fn try_dedup_bump(
        pool: &SqlitePool,
        org_id: &str,
        dedup_key: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Option<Alert>> {
        let row = sqlx::query_as::<_, Alert>(&format!(
            r#"
            UPDATE alerts
            SET dedup_count = dedup_count + 1,
                last_occurrence_at = ?,
                updated_at = ?
            WHERE id = (
                SELECT id FROM alerts
                WHERE organization_id = ? AND dedup_key = ? AND status != 'closed'
                LIMIT 1
            )
            RETURNING {ALERT_COLUMNS}
            "#,
        ))
        .bind(now)
        .bind(now)
        .bind(org_id)
        .bind(dedup_key)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Insert a fresh alert. A unique-violation on the partial dedup index
    /// means a concurrent ingest won the race; callers retry as a bump.
    pub async fn insert(
        pool: &SqlitePool,
        alert: NewAlert,
        now: DateTime<Utc>,
    ) -> Result<Alert, sqlx::Error> {
        let id = Uuid::new_v4().to_string();
        let closed_at = if alert.status == "closed" {
            Some(now)
        } else {
            None
        };

        sqlx::query_as::<_, Alert>(&format!(
            r#"
            INSERT INTO alerts (
                id, organization_id, source, source_id, priority, status, message,
                description, tags, custom_fields, dedup_key, dedup_count,
                assigned_user_id, assigned_team_id, escalation_policy_id,
                escalation_level, close_reason, snoozed_until,
                first_occurrence_at, last_occurrence_at, last_escalated_at,
                acknowledged_at, closed_at, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?, ?, 0, ?, NULL, ?, ?, NULL, NULL, ?, ?, ?)
            RETURNING {ALERT_COLUMNS}
            "#,
        ))
        .bind(id)
        .bind(alert.organization_id)
        .bind(alert.source)
        .bind(alert.source_id)
        .bind(alert.priority)
        .bind(alert.status)
        .bind(alert.message)
        .bind(alert.description)
        .bind(alert.tags)
        .bind(alert.custom_fields)
        .bind(alert.dedup_key)
        .bind(alert.assigned_user_id)
        .bind(alert.assigned_team_id)
        .bind(alert.escalation_policy_id)
        .bind(alert.close_reason)
        .bind(now)
        .bind(now)
        .bind(closed_at)
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await
    }

    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> AppResult<Option<Alert>> {
        let row =
            sqlx::query_as::<_, Alert>(&format!("SELECT {ALERT_COLUMNS} FROM alerts WHERE id = ?"))
                .bind(id)
                .fetch_optional(pool)
                .await
                .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn acknowledge(
        pool: &SqlitePool,
        id: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Option<Alert>> {
        let row = sqlx::query_as::<_, Alert>(&format!(
            r#"
            UPDATE alerts
            SET status = 'acknowledged', acknowledged_at = ?, updated_at = ?
            WHERE id = ? AND status IN ('open', 'snoozed')
            RETURNING {ALERT_COLUMNS}
            "#,
        ))
        .bind(now)
        .bind(now)
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn close(
        pool: &SqlitePool,
        id: &str,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> AppResult<Option<Alert>> {
        let row = sqlx::query_as::<_, Alert>(&format!(
            r#"
            UPDATE alerts
            SET status = 'closed', close_reason = ?, closed_at = ?, snoozed_until = NULL, updated_at = ?
            WHERE id = ? AND status != 'closed'
            RETURNING {ALERT_COLUMNS}
            "#,
        ))
        .bind(reason)
        .bind(now)
        .bind(now)
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn snooze(
        pool: &SqlitePool,
        id: &str,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> AppResult<Option<Alert>> {
        let row = sqlx::query_as::<_, Alert>(&format!(
            r#"
            UPDATE alerts
            SET status = 'snoozed', snoozed_until = ?, updated_at = ?
            WHERE id = ? AND status IN ('open', 'acknowledged')
            RETURNING {ALERT_COLUMNS}
            "#,
        ))
        .bind(until)
        .bind(now)
        .bind(now)
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn assign(
        pool: &SqlitePool,
        id: &str,
        user_id: Option<&str>,
        team_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> AppResult<Option<Alert>> {
        let row = sqlx::query_as::<_, Alert>(&format!(
            r#"
            UPDATE alerts
            SET assigned_user_id = ?, assigned_team_id = ?, updated_at = ?
            WHERE id = ? AND status != 'closed'
            RETURNING {ALERT_COLUMNS}
            "#,
        ))
        .bind(user_id)
        .bind(team_id)
        .bind(now)
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Record an escalation step on the alert row.
    pub async fn record_escalation(
        pool: &SqlitePool,
        id: &str,
        level: i64,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        sqlx::query(
            "UPDATE alerts SET escalation_level = ?, last_escalated_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(level)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }

    /// Snoozed alerts whose window has ended, oldest expiry first.
    pub async fn list_expired_snoozed(
        pool: &SqlitePool,
        now: DateTime<Utc>,
        limit: i64,
    ) -> AppResult<Vec<Alert>> {
        let rows = sqlx::query_as::<_, Alert>(&format!(
            r#"
            SELECT {ALERT_COLUMNS} FROM alerts
            WHERE status = 'snoozed' AND snoozed_until IS NOT NULL AND snoozed_until <= ?
            ORDER BY snoozed_until ASC
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

    /// Flip one snoozed alert back to open. Guarded on the current status
    /// so a concurrent acknowledge or close wins.
    pub async fn reopen_snoozed(
        pool: &SqlitePool,
        id: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Option<Alert>> {
        let row = sqlx::query_as::<_, Alert>(&format!(
            r#"
            UPDATE alerts
            SET status = 'open', snoozed_until = NULL, updated_at = ?
            WHERE id = ? AND status = 'snoozed'
            RETURNING {ALERT_COLUMNS}
            "#,
        ))
        .bind(now)
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn list(
        pool: &SqlitePool,
        org_id: &str,
        filter: &AlertFilter,
        limit: i64,
        offset: i64,
    ) -> AppResult<Vec<Alert>> {
        let (clause, binds) = Self::filter_clause(filter);
        let sql = format!(
            "SELECT {ALERT_COLUMNS} FROM alerts WHERE organization_id = ?{clause} \
             ORDER BY last_occurrence_at DESC LIMIT ? OFFSET ?"
        );

        let mut query = sqlx::query_as::<_, Alert>(&sql).bind(org_id);
        for bind in binds {
            query = query.bind(bind);
        }
        let rows = query
            .bind(limit)
            .bind(offset)
            .fetch_all(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(rows)
    }

    pub async fn count(pool: &SqlitePool, org_id: &str, filter: &AlertFilter) -> AppResult<i64> {
        let (clause, binds) = Self::filter_clause(filter);
        let sql = format!("SELECT COUNT(*) FROM alerts WHERE organization_id = ?{clause}");

        let mut query = sqlx::query_scalar::<_, i64>(&sql).bind(org_id);
        for bind in binds {
            query = query.bind(bind);
        }
        let count = query.fetch_one(pool).await.map_err(AppError::Database)?;

        Ok(count)
    }

    fn filter_clause(filter: &AlertFilter) -> (String, Vec<String>) {
        let mut clause = String::new();
        let mut binds = Vec::new();

        if let Some(status) = &filter.status {
            clause.push_str(" AND status = ?");
            binds.push(status.clone());
        }
        if let Some(priority) = &filter.priority {
            clause.push_str(" AND priority = ?");
            binds.push(priority.clone());
        }
        if let Some(user) = &filter.assigned_user_id {
            clause.push_str(" AND assigned_user_id = ?");
            binds.push(user.clone());
        }
        if let Some(team) = &filter.assigned_team_id {
            clause.push_str(" AND assigned_team_id = ?");
            binds.push(team.clone());
        }
        if let Some(source) = &filter.source {
            clause.push_str(" AND source = ?");
            binds.push(source.clone());
        }
        if let Some(search) = &filter.search {
            clause.push_str(" AND (message LIKE ? OR description LIKE ?)");
            let pattern = format!("%{}%", search);
            binds.push(pattern.clone());
            binds.push(pattern);
        }

        (clause, binds)
    }
}
