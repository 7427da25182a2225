use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{CreateRoutingRule, RoutingRule};
use crate::error::{AppError, AppResult};

const RULE_COLUMNS: &str =
    "id, organization_id, name, priority, conditions, actions, enabled, created_at, updated_at";

pub struct RoutingRuleRepository;

impl RoutingRuleRepository {
    pub async fn create(
        pool: &SqlitePool,
        org_id: &str,
        input: CreateRoutingRule,
    ) -> AppResult<RoutingRule> {
        let now = Utc::now();
        let conditions = serde_json::to_string(&input.conditions)
            .map_err(|e| AppError::Validation(format!("invalid conditions: {e}")))?;
        let actions = serde_json::to_string(&input.actions)
            .map_err(|e| AppError::Validation(format!("invalid actions: {e}")))?;

        let row = sqlx::query_as::<_, RoutingRule>(&format!(
            r#"
            INSERT INTO routing_rules
                (id, organization_id, name, priority, conditions, actions, enabled, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING {RULE_COLUMNS}
            "#,
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(org_id)
        .bind(input.name)
        .bind(input.priority)
        .bind(conditions)
        .bind(actions)
        .bind(input.enabled)
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> AppResult<Option<RoutingRule>> {
        let row = sqlx::query_as::<_, RoutingRule>(&format!(
            "SELECT {RULE_COLUMNS} FROM routing_rules WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Enabled rules in evaluation order: ascending priority, then
    /// ascending created_at as the tie-break.
    pub async fn list_enabled_sorted(
        pool: &SqlitePool,
        org_id: &str,
    ) -> AppResult<Vec<RoutingRule>> {
        let rows = sqlx::query_as::<_, RoutingRule>(&format!(
            "SELECT {RULE_COLUMNS} FROM routing_rules \
             WHERE organization_id = ? AND enabled = 1 \
             ORDER BY priority ASC, created_at ASC"
        ))
        .bind(org_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }

    pub async fn list_for_org(pool: &SqlitePool, org_id: &str) -> AppResult<Vec<RoutingRule>> {
        let rows = sqlx::query_as::<_, RoutingRule>(&format!(
            "SELECT {RULE_COLUMNS} FROM routing_rules WHERE organization_id = ? \
             ORDER BY priority ASC, created_at ASC"
        ))
        .bind(org_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }

    pub async fn set_enabled(pool: &SqlitePool, id: &str, enabled: bool) -> AppResult<bool> {
        let res = sqlx::query("UPDATE routing_rules SET enabled = ?, updated_at = ? WHERE id = ?")
            .bind(enabled)
            .bind(Utc::now())
            .bind(id)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(res.rows_affected() > 0)
    }

    /// Reassign all priorities for an org in one transaction. `ordered_ids`
    /// is the full desired order; each rule gets priority = its index.
    pub async fn reorder(
        pool: &SqlitePool,
        org_id: &str,
        ordered_ids: &[String],
    ) -> AppResult<()> {
        let mut tx = pool.begin().await.map_err(AppError::Database)?;
        let now = Utc::now();

        for (index, id) in ordered_ids.iter().enumerate() {
            let res = sqlx::query(
                "UPDATE routing_rules SET priority = ?, updated_at = ? \
                 WHERE id = ? AND organization_id = ?",
            )
            .bind(index as i64)
            .bind(now)
            .bind(id)
            .bind(org_id)
            .execute(&mut *tx)
            .await
            .map_err(AppError::Database)?;

            if res.rows_affected() == 0 {
                return Err(AppError::NotFound(format!("routing rule {id}")));
            }
        }

        tx.commit().await.map_err(AppError::Database)?;

        Ok(())
    }

    pub async fn delete(pool: &SqlitePool, id: &str) -> AppResult<bool> {
        let res = sqlx::query("DELETE FROM routing_rules WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(res.rows_affected() > 0)
    }
}
