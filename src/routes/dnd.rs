use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use chrono::NaiveTime;

use crate::auth::AuthContext;
use crate::db::models::{UpsertDndSettings, UserDndSettings};
use crate::db::repository::DndSettingsRepository;
use crate::error::{AppError, AppResult};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/", get(get_settings).put(upsert_settings))
}

/// Current user's DND settings; defaults when none are stored yet.
async fn get_settings(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
) -> AppResult<Json<UserDndSettings>> {
    let user_id = auth
        .user_id()
        .ok_or_else(|| AppError::BadRequest("DND settings require a user session".to_string()))?;

    let settings = DndSettingsRepository::get(&state.db, user_id).await?;
    match settings {
        Some(settings) => Ok(Json(settings)),
        None => Ok(Json(UserDndSettings {
            user_id: user_id.to_string(),
            enabled: false,
            schedule: "{}".to_string(),
            overrides: "[]".to_string(),
            allow_p1_override: false,
            updated_at: state.clock.now(),
        })),
    }
}

async fn upsert_settings(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Json(body): Json<UpsertDndSettings>,
) -> AppResult<Json<UserDndSettings>> {
    let user_id = auth
        .user_id()
        .ok_or_else(|| AppError::BadRequest("DND settings require a user session".to_string()))?
        .to_string();

    validate_settings(&body)?;

    let settings = DndSettingsRepository::upsert(&state.db, &user_id, body).await?;
    Ok(Json(settings))
}

fn validate_settings(body: &UpsertDndSettings) -> AppResult<()> {
    if let Some(tz) = &body.schedule.timezone {
        tz.parse::<chrono_tz::Tz>()
            .map_err(|_| AppError::Validation(format!("invalid IANA timezone {tz:?}")))?;
    }

    for slot in &body.schedule.slots {
        if slot.day > 6 {
            return Err(AppError::Validation(format!(
                "slot day {} out of range 0..6",
                slot.day
            )));
        }
        for time in [&slot.start, &slot.end] {
            NaiveTime::parse_from_str(time, "%H:%M").map_err(|_| {
                AppError::Validation(format!("slot time {time:?} must be HH:MM"))
            })?;
        }
    }

    for window in &body.overrides {
        if window.end <= window.start {
            return Err(AppError::Validation(
                "override end must be after start".to_string(),
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{DndOverride, DndSchedule, DndSlot};

    #[test]
    fn slot_times_must_be_hhmm() {
        let body = UpsertDndSettings {
            enabled: true,
            schedule: DndSchedule {
                timezone: None,
                slots: vec![DndSlot {
                    day: 1,
                    start: "22:00:00".to_string(),
                    end: "08:00".to_string(),
                }],
            },
            overrides: vec![],
            allow_p1_override: false,
        };
        assert!(validate_settings(&body).is_err());
    }

    #[test]
    fn override_windows_must_be_ordered() {
        let now = chrono::Utc::now();
        let body = UpsertDndSettings {
            enabled: true,
            schedule: DndSchedule::default(),
            overrides: vec![DndOverride {
                start: now,
                end: now,
                reason: None,
            }],
            allow_p1_override: false,
        };
        assert!(validate_settings(&body).is_err());
    }
}
