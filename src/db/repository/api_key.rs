use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: String,
    pub organization_id: String,
    pub user_id: Option<String>,
    pub name: String,
    /// SHA-256 hex of the full key; the plaintext is shown once at creation.
    #[serde(skip_serializing)]
    pub key_hash: String,
    /// "pls_" + first 8 hex chars, kept for display.
    pub key_prefix: String,
    /// JSON array of scope strings.
    pub scopes: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

const KEY_COLUMNS: &str =
    "id, organization_id, user_id, name, key_hash, key_prefix, scopes, created_at, last_used_at";

pub struct ApiKeyRepository;

impl ApiKeyRepository {
    pub async fn create(
        pool: &SqlitePool,
        org_id: &str,
        user_id: Option<&str>,
        name: &str,
        key_hash: &str,
        key_prefix: &str,
        scopes: &[String],
    ) -> AppResult<ApiKey> {
        let scopes_json = serde_json::to_string(scopes)
            .map_err(|e| AppError::Validation(format!("invalid scopes: {e}")))?;

        let row = sqlx::query_as::<_, ApiKey>(&format!(
            r#"
            INSERT INTO api_keys
                (id, organization_id, user_id, name, key_hash, key_prefix, scopes, created_at, last_used_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, NULL)
            RETURNING {KEY_COLUMNS}
            "#,
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(org_id)
        .bind(user_id)
        .bind(name)
        .bind(key_hash)
        .bind(key_prefix)
        .bind(scopes_json)
        .bind(Utc::now())
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn find_by_hash(pool: &SqlitePool, key_hash: &str) -> AppResult<Option<ApiKey>> {
        let row = sqlx::query_as::<_, ApiKey>(&format!(
            "SELECT {KEY_COLUMNS} FROM api_keys WHERE key_hash = ?"
        ))
        .bind(key_hash)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn touch_last_used(pool: &SqlitePool, id: &str) -> AppResult<()> {
        sqlx::query("UPDATE api_keys SET last_used_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(())
    }
}
