use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{
    AlertEscalationEvent, CreateEscalationPolicy, EscalationPolicy, EscalationRule,
    EscalationTarget,
};
use crate::error::{AppError, AppResult};

const POLICY_COLUMNS: &str = "id, organization_id, name, description, repeat_enabled, \
     repeat_count, created_at, updated_at";

const EVENT_COLUMNS: &str = "id, alert_id, policy_id, rule_id, event_type, current_level, \
     repeat_count, next_escalation_at, created_at, updated_at";

pub struct EscalationPolicyRepository;

impl EscalationPolicyRepository {
    /// Create the policy with its ordered rules and their targets in one
    /// transaction.
    pub async fn create(
        pool: &SqlitePool,
        org_id: &str,
        input: CreateEscalationPolicy,
    ) -> AppResult<EscalationPolicy> {
        let mut tx = pool.begin().await.map_err(AppError::Database)?;
        let now = Utc::now();
        let policy_id = Uuid::new_v4().to_string();

        let policy = sqlx::query_as::<_, EscalationPolicy>(&format!(
            r#"
            INSERT INTO escalation_policies
                (id, organization_id, name, description, repeat_enabled, repeat_count, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING {POLICY_COLUMNS}
            "#,
        ))
        .bind(&policy_id)
        .bind(org_id)
        .bind(&input.name)
        .bind(&input.description)
        .bind(input.repeat_enabled)
        .bind(input.repeat_count)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(AppError::Database)?;

        for rule in &input.rules {
            let rule_id = Uuid::new_v4().to_string();
            sqlx::query(
                "INSERT INTO escalation_rules (id, policy_id, position, delay_minutes, created_at) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&rule_id)
            .bind(&policy_id)
            .bind(rule.position)
            .bind(rule.delay_minutes)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(db) if db.is_unique_violation() => {
                    AppError::Conflict("duplicate rule position".to_string())
                }
                _ => AppError::Database(e),
            })?;

            for target in &rule.targets {
                let channels = target
                    .channels
                    .as_ref()
                    .map(|c| serde_json::to_string(c).unwrap_or_else(|_| "[]".to_string()));
                sqlx::query(
                    "INSERT INTO escalation_targets (id, rule_id, kind, target_id, channels, urgent, created_at) \
                     VALUES (?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(Uuid::new_v4().to_string())
                .bind(&rule_id)
                .bind(&target.kind)
                .bind(&target.target_id)
                .bind(channels)
                .bind(target.urgent)
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(AppError::Database)?;
            }
        }

        tx.commit().await.map_err(AppError::Database)?;

        Ok(policy)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> AppResult<Option<EscalationPolicy>> {
        let row = sqlx::query_as::<_, EscalationPolicy>(&format!(
            "SELECT {POLICY_COLUMNS} FROM escalation_policies WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn list_for_org(pool: &SqlitePool, org_id: &str) -> AppResult<Vec<EscalationPolicy>> {
        let rows = sqlx::query_as::<_, EscalationPolicy>(&format!(
            "SELECT {POLICY_COLUMNS} FROM escalation_policies WHERE organization_id = ? ORDER BY name"
        ))
        .bind(org_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }

    /// Rules sorted by position; the scheduler indexes into this list by
    /// the event's current_level.
    pub async fn rules(pool: &SqlitePool, policy_id: &str) -> AppResult<Vec<EscalationRule>> {
        let rows = sqlx::query_as::<_, EscalationRule>(
            "SELECT id, policy_id, position, delay_minutes, created_at \
             FROM escalation_rules WHERE policy_id = ? ORDER BY position",
        )
        .bind(policy_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }

    pub async fn targets(pool: &SqlitePool, rule_id: &str) -> AppResult<Vec<EscalationTarget>> {
        let rows = sqlx::query_as::<_, EscalationTarget>(
            "SELECT id, rule_id, kind, target_id, channels, urgent, created_at \
             FROM escalation_targets WHERE rule_id = ? ORDER BY created_at",
        )
        .bind(rule_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }

    pub async fn delete(pool: &SqlitePool, id: &str) -> AppResult<bool> {
        let res = sqlx::query("DELETE FROM escalation_policies WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(res.rows_affected() > 0)
    }
}

pub struct EscalationEventRepository;

impl EscalationEventRepository {
    /// Insert a new `triggered` event row scheduled at `next_at`.
    pub async fn create_triggered(
        pool: &SqlitePool,
        alert_id: &str,
        policy_id: &str,
        rule_id: Option<&str>,
        current_level: i64,
        repeat_count: i64,
        next_at: DateTime<Utc>,
    ) -> AppResult<AlertEscalationEvent> {
        let now = Utc::now();

        let row = sqlx::query_as::<_, AlertEscalationEvent>(&format!(
            r#"
            INSERT INTO alert_escalation_events
                (id, alert_id, policy_id, rule_id, event_type, current_level, repeat_count,
                 next_escalation_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, 'triggered', ?, ?, ?, ?, ?)
            RETURNING {EVENT_COLUMNS}
            "#,
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(alert_id)
        .bind(policy_id)
        .bind(rule_id)
        .bind(current_level)
        .bind(repeat_count)
        .bind(next_at)
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Due triggered events, oldest first, bounded by `limit`.
    pub async fn fetch_due(
        pool: &SqlitePool,
        now: DateTime<Utc>,
        limit: i64,
    ) -> AppResult<Vec<AlertEscalationEvent>> {
        let rows = sqlx::query_as::<_, AlertEscalationEvent>(&format!(
            r#"
            SELECT {EVENT_COLUMNS} FROM alert_escalation_events
            WHERE event_type = 'triggered' AND next_escalation_at IS NOT NULL AND next_escalation_at <= ?
            ORDER BY next_escalation_at ASC
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

    /// Transition one event out of `triggered`. Guarded on the current
    /// state so two workers cannot both advance the same event.
    pub async fn transition(
        pool: &SqlitePool,
        id: &str,
        to_event_type: &str,
    ) -> AppResult<Option<AlertEscalationEvent>> {
        let now = Utc::now();

        let row = sqlx::query_as::<_, AlertEscalationEvent>(&format!(
            r#"
            UPDATE alert_escalation_events
            SET event_type = ?, next_escalation_at = NULL, updated_at = ?
            WHERE id = ? AND event_type = 'triggered'
            RETURNING {EVENT_COLUMNS}
            "#,
        ))
        .bind(to_event_type)
        .bind(now)
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// End every active (triggered) event for an alert, e.g. on
    /// acknowledge or close. Returns the number of rows transitioned.
    pub async fn terminate_active_for_alert(
        pool: &SqlitePool,
        alert_id: &str,
        to_event_type: &str,
    ) -> AppResult<u64> {
        let now = Utc::now();

        let res = sqlx::query(
            "UPDATE alert_escalation_events \
             SET event_type = ?, next_escalation_at = NULL, updated_at = ? \
             WHERE alert_id = ? AND event_type = 'triggered'",
        )
        .bind(to_event_type)
        .bind(now)
        .bind(alert_id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(res.rows_affected())
    }

    /// The single active event for an alert, if any.
    pub async fn find_active_for_alert(
        pool: &SqlitePool,
        alert_id: &str,
    ) -> AppResult<Option<AlertEscalationEvent>> {
        let row = sqlx::query_as::<_, AlertEscalationEvent>(&format!(
            r#"
            SELECT {EVENT_COLUMNS} FROM alert_escalation_events
            WHERE alert_id = ? AND event_type = 'triggered' AND next_escalation_at IS NOT NULL
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        ))
        .bind(alert_id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn list_for_alert(
        pool: &SqlitePool,
        alert_id: &str,
    ) -> AppResult<Vec<AlertEscalationEvent>> {
        let rows = sqlx::query_as::<_, AlertEscalationEvent>(&format!(
            "SELECT {EVENT_COLUMNS} FROM alert_escalation_events WHERE alert_id = ? ORDER BY created_at"
        ))
        .bind(alert_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }
}
