use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{CreateOrganization, Organization};
use crate::error::{AppError, AppResult};

pub struct OrganizationRepository;

impl OrganizationRepository {
    pub async fn create(pool: &SqlitePool, input: CreateOrganization) -> AppResult<Organization> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        let row = sqlx::query_as::<_, Organization>(
            r#"
            INSERT INTO organizations (id, slug, name, plan, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING id, slug, name, plan, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(input.slug)
        .bind(input.name)
        .bind(input.plan.unwrap_or_else(|| "free".to_string()))
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                AppError::Conflict("organization slug already exists".to_string())
            }
            _ => AppError::Database(e),
        })?;

        Ok(row)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> AppResult<Option<Organization>> {
        let row = sqlx::query_as::<_, Organization>(
            "SELECT id, slug, name, plan, created_at, updated_at FROM organizations WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn find_by_slug(pool: &SqlitePool, slug: &str) -> AppResult<Option<Organization>> {
        let row = sqlx::query_as::<_, Organization>(
            "SELECT id, slug, name, plan, created_at, updated_at FROM organizations WHERE slug = ?",
        )
        .bind(slug)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Deletes the organization; every owned row goes with it via
    /// ON DELETE CASCADE.
    pub async fn delete(pool: &SqlitePool, id: &str) -> AppResult<bool> {
        let res = sqlx::query("DELETE FROM organizations WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(res.rows_affected() > 0)
    }
}
