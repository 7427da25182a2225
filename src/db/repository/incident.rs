use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{
    CreateIncident, Incident, IncidentAlertLink, IncidentResponder, IncidentTimelineEvent,
};
use crate::error::{AppError, AppResult};

const INCIDENT_COLUMNS: &str = "id, organization_id, title, description, severity, status, \
     priority, created_by, started_at, resolved_at, created_at, updated_at";

const TIMELINE_COLUMNS: &str =
    "id, incident_id, event_type, user_id, description, metadata, created_at";

pub struct IncidentRepository;

impl IncidentRepository {
    pub async fn create(
        pool: &SqlitePool,
        org_id: &str,
        created_by: Option<&str>,
        input: CreateIncident,
        now: DateTime<Utc>,
    ) -> AppResult<Incident> {
        let row = sqlx::query_as::<_, Incident>(&format!(
            r#"
            INSERT INTO incidents
                (id, organization_id, title, description, severity, status, priority,
                 created_by, started_at, resolved_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, 'investigating', ?, ?, ?, NULL, ?, ?)
            RETURNING {INCIDENT_COLUMNS}
            "#,
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(org_id)
        .bind(input.title)
        .bind(input.description)
        .bind(input.severity)
        .bind(input.priority)
        .bind(created_by)
        .bind(now)
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> AppResult<Option<Incident>> {
        let row = sqlx::query_as::<_, Incident>(&format!(
            "SELECT {INCIDENT_COLUMNS} FROM incidents WHERE id = ?"
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
        status: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> AppResult<Vec<Incident>> {
        let mut sql = format!("SELECT {INCIDENT_COLUMNS} FROM incidents WHERE organization_id = ?");
        if status.is_some() {
            sql.push_str(" AND status = ?");
        }
        sql.push_str(" ORDER BY started_at DESC LIMIT ? OFFSET ?");

        let mut query = sqlx::query_as::<_, Incident>(&sql).bind(org_id);
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

    pub async fn update_status(
        pool: &SqlitePool,
        id: &str,
        status: &str,
        resolved_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> AppResult<Option<Incident>> {
        let row = sqlx::query_as::<_, Incident>(&format!(
            r#"
            UPDATE incidents SET status = ?, resolved_at = ?, updated_at = ?
            WHERE id = ?
            RETURNING {INCIDENT_COLUMNS}
            "#,
        ))
        .bind(status)
        .bind(resolved_at)
        .bind(now)
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn update_severity(
        pool: &SqlitePool,
        id: &str,
        severity: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Option<Incident>> {
        let row = sqlx::query_as::<_, Incident>(&format!(
            r#"
            UPDATE incidents SET severity = ?, updated_at = ?
            WHERE id = ?
            RETURNING {INCIDENT_COLUMNS}
            "#,
        ))
        .bind(severity)
        .bind(now)
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Append one timeline event. Timeline rows are never updated or
    /// deleted; ordering is by created_at within the incident.
    pub async fn append_timeline(
        pool: &SqlitePool,
        incident_id: &str,
        event_type: &str,
        user_id: Option<&str>,
        description: &str,
        metadata: serde_json::Value,
        now: DateTime<Utc>,
    ) -> AppResult<IncidentTimelineEvent> {
        let row = sqlx::query_as::<_, IncidentTimelineEvent>(&format!(
            r#"
            INSERT INTO incident_timeline_events
                (id, incident_id, event_type, user_id, description, metadata, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            RETURNING {TIMELINE_COLUMNS}
            "#,
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(incident_id)
        .bind(event_type)
        .bind(user_id)
        .bind(description)
        .bind(metadata.to_string())
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn timeline(
        pool: &SqlitePool,
        incident_id: &str,
    ) -> AppResult<Vec<IncidentTimelineEvent>> {
        let rows = sqlx::query_as::<_, IncidentTimelineEvent>(&format!(
            "SELECT {TIMELINE_COLUMNS} FROM incident_timeline_events \
             WHERE incident_id = ? ORDER BY created_at ASC"
        ))
        .bind(incident_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }

    pub async fn add_responder(
        pool: &SqlitePool,
        incident_id: &str,
        user_id: &str,
        role: &str,
        now: DateTime<Utc>,
    ) -> AppResult<IncidentResponder> {
        let row = sqlx::query_as::<_, IncidentResponder>(
            r#"
            INSERT INTO incident_responders (incident_id, user_id, role, added_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (incident_id, user_id) DO UPDATE SET role = excluded.role
            RETURNING incident_id, user_id, role, added_at
            "#,
        )
        .bind(incident_id)
        .bind(user_id)
        .bind(role)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn remove_responder(
        pool: &SqlitePool,
        incident_id: &str,
        user_id: &str,
    ) -> AppResult<bool> {
        let res = sqlx::query(
            "DELETE FROM incident_responders WHERE incident_id = ? AND user_id = ?",
        )
        .bind(incident_id)
        .bind(user_id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(res.rows_affected() > 0)
    }

    pub async fn responders(
        pool: &SqlitePool,
        incident_id: &str,
    ) -> AppResult<Vec<IncidentResponder>> {
        let rows = sqlx::query_as::<_, IncidentResponder>(
            "SELECT incident_id, user_id, role, added_at \
             FROM incident_responders WHERE incident_id = ? ORDER BY added_at",
        )
        .bind(incident_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }

    pub async fn link_alert(
        pool: &SqlitePool,
        incident_id: &str,
        alert_id: &str,
        linked_by: Option<&str>,
        now: DateTime<Utc>,
    ) -> AppResult<IncidentAlertLink> {
        let row = sqlx::query_as::<_, IncidentAlertLink>(
            r#"
            INSERT INTO incident_alert_links (incident_id, alert_id, linked_by, linked_at)
            VALUES (?, ?, ?, ?)
            RETURNING incident_id, alert_id, linked_by, linked_at
            "#,
        )
        .bind(incident_id)
        .bind(alert_id)
        .bind(linked_by)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                AppError::Conflict("alert already linked to incident".to_string())
            }
            _ => AppError::Database(e),
        })?;

        Ok(row)
    }

    pub async fn unlink_alert(
        pool: &SqlitePool,
        incident_id: &str,
        alert_id: &str,
    ) -> AppResult<bool> {
        let res = sqlx::query(
            "DELETE FROM incident_alert_links WHERE incident_id = ? AND alert_id = ?",
        )
        .bind(incident_id)
        .bind(alert_id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(res.rows_affected() > 0)
    }

    pub async fn linked_alerts(
        pool: &SqlitePool,
        incident_id: &str,
    ) -> AppResult<Vec<IncidentAlertLink>> {
        let rows = sqlx::query_as::<_, IncidentAlertLink>(
            "SELECT incident_id, alert_id, linked_by, linked_at \
             FROM incident_alert_links WHERE incident_id = ? ORDER BY linked_at",
        )
        .bind(incident_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }
}
