use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{CreateTeam, CreateUser, Team, TeamMember, User};
use crate::error::{AppError, AppResult};

const USER_COLUMNS: &str =
    "id, organization_id, email, name, timezone, email_verified, created_at, updated_at";

pub struct UserRepository;

impl UserRepository {
    pub async fn create(pool: &SqlitePool, org_id: &str, input: CreateUser) -> AppResult<User> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        let row = sqlx::query_as::<_, User>(&format!(
            r#"
            INSERT INTO users (id, organization_id, email, name, timezone, email_verified, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, 0, ?, ?)
            RETURNING {USER_COLUMNS}
            "#,
        ))
        .bind(id)
        .bind(org_id)
        .bind(input.email)
        .bind(input.name)
        .bind(input.timezone.unwrap_or_else(|| "UTC".to_string()))
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                AppError::Conflict("email already registered".to_string())
            }
            _ => AppError::Database(e),
        })?;

        Ok(row)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> AppResult<Option<User>> {
        let row =
            sqlx::query_as::<_, User>(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?"))
                .bind(id)
                .fetch_optional(pool)
                .await
                .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn find_many(pool: &SqlitePool, ids: &[String]) -> AppResult<Vec<User>> {
        let mut users = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(user) = Self::find_by_id(pool, id).await? {
                users.push(user);
            }
        }
        Ok(users)
    }

    pub async fn list_for_org(pool: &SqlitePool, org_id: &str) -> AppResult<Vec<User>> {
        let rows = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE organization_id = ? ORDER BY created_at"
        ))
        .bind(org_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }
}

const TEAM_COLUMNS: &str = "id, organization_id, name, description, created_at, updated_at";

pub struct TeamRepository;

impl TeamRepository {
    pub async fn create(pool: &SqlitePool, org_id: &str, input: CreateTeam) -> AppResult<Team> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        let row = sqlx::query_as::<_, Team>(&format!(
            r#"
            INSERT INTO teams (id, organization_id, name, description, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING {TEAM_COLUMNS}
            "#,
        ))
        .bind(id)
        .bind(org_id)
        .bind(input.name)
        .bind(input.description)
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> AppResult<Option<Team>> {
        let row =
            sqlx::query_as::<_, Team>(&format!("SELECT {TEAM_COLUMNS} FROM teams WHERE id = ?"))
                .bind(id)
                .fetch_optional(pool)
                .await
                .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn list_for_org(pool: &SqlitePool, org_id: &str) -> AppResult<Vec<Team>> {
        let rows = sqlx::query_as::<_, Team>(&format!(
            "SELECT {TEAM_COLUMNS} FROM teams WHERE organization_id = ? ORDER BY name"
        ))
        .bind(org_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }

    pub async fn add_member(
        pool: &SqlitePool,
        team_id: &str,
        user_id: &str,
        role: &str,
    ) -> AppResult<TeamMember> {
        let now = Utc::now();

        let row = sqlx::query_as::<_, TeamMember>(
            r#"
            INSERT INTO team_members (team_id, user_id, role, added_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (team_id, user_id) DO UPDATE SET role = excluded.role
            RETURNING team_id, user_id, role, added_at
            "#,
        )
        .bind(team_id)
        .bind(user_id)
        .bind(role)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn remove_member(pool: &SqlitePool, team_id: &str, user_id: &str) -> AppResult<bool> {
        let res = sqlx::query("DELETE FROM team_members WHERE team_id = ? AND user_id = ?")
            .bind(team_id)
            .bind(user_id)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(res.rows_affected() > 0)
    }

    /// Active members of a team, used to resolve `team` escalation targets.
    pub async fn member_users(pool: &SqlitePool, team_id: &str) -> AppResult<Vec<User>> {
        let rows = sqlx::query_as::<_, User>(&format!(
            r#"
            SELECT u.id, u.organization_id, u.email, u.name, u.timezone, u.email_verified,
                   u.created_at, u.updated_at
            FROM users u
            JOIN team_members tm ON tm.user_id = u.id
            WHERE tm.team_id = ?
            ORDER BY tm.added_at
            "#,
        ))
        .bind(team_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }

    pub async fn delete(pool: &SqlitePool, id: &str) -> AppResult<bool> {
        let res = sqlx::query("DELETE FROM teams WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(res.rows_affected() > 0)
    }
}
