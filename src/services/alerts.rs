use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::db::models::Alert;
use crate::db::repository::{AlertRepository, EscalationEventRepository};
use crate::error::{AppError, AppResult};
use crate::services::events::{event_types, Event};
use crate::AppState;

/// Alert lifecycle operations. Every mutation runs under the alert's
/// keyed lock so it never interleaves with the escalation scheduler.
pub struct AlertService {
    state: Arc<AppState>,
}

impl AlertService {
    pub fn new(state: &Arc<AppState>) -> Self {
        Self {
            state: state.clone(),
        }
    }

    async fn load_owned(&self, org_id: &str, alert_id: &str) -> AppResult<Alert> {
        let alert = AlertRepository::find_by_id(&self.state.db, alert_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("alert {alert_id}")))?;
        if alert.organization_id != org_id {
            return Err(AppError::NotFound(format!("alert {alert_id}")));
        }
        Ok(alert)
    }

    /// Acknowledge: stops all future escalation for the alert.
    pub async fn acknowledge(&self, org_id: &str, alert_id: &str) -> AppResult<Alert> {
        let _guard = self.state.alert_locks.acquire(alert_id).await;
        self.load_owned(org_id, alert_id).await?;

        let now = self.state.clock.now();
        let alert = AlertRepository::acknowledge(&self.state.db, alert_id, now)
            .await?
            .ok_or_else(|| {
                AppError::Conflict("alert cannot be acknowledged in its current state".to_string())
            })?;

        EscalationEventRepository::terminate_active_for_alert(
            &self.state.db,
            alert_id,
            "acknowledged",
        )
        .await?;

        self.publish(event_types::ALERT_ACKNOWLEDGED, &alert);
        Ok(alert)
    }

    pub async fn close(
        &self,
        org_id: &str,
        alert_id: &str,
        reason: Option<&str>,
    ) -> AppResult<Alert> {
        let _guard = self.state.alert_locks.acquire(alert_id).await;
        self.load_owned(org_id, alert_id).await?;

        let now = self.state.clock.now();
        let alert = AlertRepository::close(&self.state.db, alert_id, reason, now)
            .await?
            .ok_or_else(|| AppError::Conflict("alert is already closed".to_string()))?;

        EscalationEventRepository::terminate_active_for_alert(&self.state.db, alert_id, "stopped")
            .await?;

        self.publish(event_types::ALERT_CLOSED, &alert);
        Ok(alert)
    }

    /// Snooze suspends escalation; the snooze sweep resumes it when the
    /// window ends.
    pub async fn snooze(
        &self,
        org_id: &str,
        alert_id: &str,
        until: DateTime<Utc>,
    ) -> AppResult<Alert> {
        let now = self.state.clock.now();
        if until <= now {
            return Err(AppError::Validation(
                "snoozed_until must be in the future".to_string(),
            ));
        }

        let _guard = self.state.alert_locks.acquire(alert_id).await;
        self.load_owned(org_id, alert_id).await?;

        let alert = AlertRepository::snooze(&self.state.db, alert_id, until, now)
            .await?
            .ok_or_else(|| {
                AppError::Conflict("alert cannot be snoozed in its current state".to_string())
            })?;

        EscalationEventRepository::terminate_active_for_alert(&self.state.db, alert_id, "stopped")
            .await?;

        self.publish(event_types::ALERT_UPDATED, &alert);
        Ok(alert)
    }

    pub async fn assign(
        &self,
        org_id: &str,
        alert_id: &str,
        user_id: Option<&str>,
        team_id: Option<&str>,
    ) -> AppResult<Alert> {
        if user_id.is_none() && team_id.is_none() {
            return Err(AppError::Validation(
                "assign requires a user or a team".to_string(),
            ));
        }

        let _guard = self.state.alert_locks.acquire(alert_id).await;
        self.load_owned(org_id, alert_id).await?;

        let now = self.state.clock.now();
        let alert = AlertRepository::assign(&self.state.db, alert_id, user_id, team_id, now)
            .await?
            .ok_or_else(|| AppError::Conflict("closed alerts cannot be assigned".to_string()))?;

        self.publish(event_types::ALERT_UPDATED, &alert);
        Ok(alert)
    }

    fn publish(&self, event_type: &str, alert: &Alert) {
        self.state.bus.publish(Event::new(
            event_type,
            &alert.organization_id,
            serde_json::to_value(alert).unwrap_or_default(),
        ));
    }
}
