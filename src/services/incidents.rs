use std::sync::Arc;

use crate::db::models::{
    CreateIncident, Incident, IncidentSeverity, IncidentStatus, IncidentTimelineEvent,
};
use crate::db::repository::{AlertRepository, IncidentRepository};
use crate::error::{AppError, AppResult};
use crate::services::events::{event_types, Event};
use crate::AppState;

/// Incident lifecycle. Every mutation appends a timeline event under the
/// incident's keyed lock (keeping the timeline totally ordered) and
/// emits the matching bus event.
pub struct IncidentService {
    state: Arc<AppState>,
}

impl IncidentService {
    pub fn new(state: &Arc<AppState>) -> Self {
        Self {
            state: state.clone(),
        }
    }

    async fn load_owned(&self, org_id: &str, incident_id: &str) -> AppResult<Incident> {
        let incident = IncidentRepository::find_by_id(&self.state.db, incident_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("incident {incident_id}")))?;
        if incident.organization_id != org_id {
            return Err(AppError::NotFound(format!("incident {incident_id}")));
        }
        Ok(incident)
    }

    pub async fn create(
        &self,
        org_id: &str,
        created_by: Option<&str>,
        input: CreateIncident,
    ) -> AppResult<Incident> {
        if IncidentSeverity::parse(&input.severity).is_none() {
            return Err(AppError::Validation(format!(
                "invalid severity {:?}",
                input.severity
            )));
        }

        let now = self.state.clock.now();
        let incident =
            IncidentRepository::create(&self.state.db, org_id, created_by, input, now).await?;

        IncidentRepository::append_timeline(
            &self.state.db,
            &incident.id,
            "created",
            created_by,
            "Incident created",
            serde_json::json!({ "severity": incident.severity, "status": incident.status }),
            now,
        )
        .await?;

        self.publish(event_types::INCIDENT_CREATED, &incident);
        Ok(incident)
    }

    /// Status change; moving to resolved stamps `resolved_at`.
    pub async fn set_status(
        &self,
        org_id: &str,
        incident_id: &str,
        status: IncidentStatus,
        user_id: Option<&str>,
    ) -> AppResult<Incident> {
        let _guard = self.state.incident_locks.acquire(incident_id).await;
        let before = self.load_owned(org_id, incident_id).await?;

        let now = self.state.clock.now();
        let resolved_at = match status {
            IncidentStatus::Resolved => Some(now),
            _ => None,
        };

        let incident =
            IncidentRepository::update_status(&self.state.db, incident_id, status.as_str(), resolved_at, now)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("incident {incident_id}")))?;

        IncidentRepository::append_timeline(
            &self.state.db,
            incident_id,
            "status_changed",
            user_id,
            &format!("Status changed from {} to {}", before.status, incident.status),
            serde_json::json!({ "from": before.status, "to": incident.status }),
            now,
        )
        .await?;

        self.publish(event_types::INCIDENT_UPDATED, &incident);
        Ok(incident)
    }

    pub async fn set_severity(
        &self,
        org_id: &str,
        incident_id: &str,
        severity: IncidentSeverity,
        user_id: Option<&str>,
    ) -> AppResult<Incident> {
        let _guard = self.state.incident_locks.acquire(incident_id).await;
        let before = self.load_owned(org_id, incident_id).await?;

        let now = self.state.clock.now();
        let incident =
            IncidentRepository::update_severity(&self.state.db, incident_id, severity.as_str(), now)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("incident {incident_id}")))?;

        IncidentRepository::append_timeline(
            &self.state.db,
            incident_id,
            "severity_changed",
            user_id,
            &format!(
                "Severity changed from {} to {}",
                before.severity, incident.severity
            ),
            serde_json::json!({ "from": before.severity, "to": incident.severity }),
            now,
        )
        .await?;

        self.publish(event_types::INCIDENT_UPDATED, &incident);
        Ok(incident)
    }

    /// Free-form timeline note.
    pub async fn add_note(
        &self,
        org_id: &str,
        incident_id: &str,
        user_id: Option<&str>,
        note: &str,
    ) -> AppResult<IncidentTimelineEvent> {
        if note.trim().is_empty() {
            return Err(AppError::Validation("note must not be empty".to_string()));
        }

        let _guard = self.state.incident_locks.acquire(incident_id).await;
        let incident = self.load_owned(org_id, incident_id).await?;

        let now = self.state.clock.now();
        let entry = IncidentRepository::append_timeline(
            &self.state.db,
            incident_id,
            "note",
            user_id,
            note,
            serde_json::json!({}),
            now,
        )
        .await?;

        self.publish_payload(
            event_types::INCIDENT_TIMELINE_ADDED,
            &incident,
            serde_json::to_value(&entry).unwrap_or_default(),
        );
        Ok(entry)
    }

    pub async fn add_responder(
        &self,
        org_id: &str,
        incident_id: &str,
        user_id: &str,
        role: &str,
        added_by: Option<&str>,
    ) -> AppResult<()> {
        if role != "incident_commander" && role != "responder" {
            return Err(AppError::Validation(format!("invalid role {role:?}")));
        }

        let _guard = self.state.incident_locks.acquire(incident_id).await;
        let incident = self.load_owned(org_id, incident_id).await?;

        let now = self.state.clock.now();
        IncidentRepository::add_responder(&self.state.db, incident_id, user_id, role, now).await?;

        IncidentRepository::append_timeline(
            &self.state.db,
            incident_id,
            "responder_added",
            added_by,
            &format!("Responder added with role {role}"),
            serde_json::json!({ "user_id": user_id, "role": role }),
            now,
        )
        .await?;

        self.publish_payload(
            event_types::INCIDENT_RESPONDER_ADDED,
            &incident,
            serde_json::json!({ "incident_id": incident_id, "user_id": user_id, "role": role }),
        );
        Ok(())
    }

    pub async fn remove_responder(
        &self,
        org_id: &str,
        incident_id: &str,
        user_id: &str,
        removed_by: Option<&str>,
    ) -> AppResult<()> {
        let _guard = self.state.incident_locks.acquire(incident_id).await;
        let incident = self.load_owned(org_id, incident_id).await?;

        let removed =
            IncidentRepository::remove_responder(&self.state.db, incident_id, user_id).await?;
        if !removed {
            return Err(AppError::NotFound(format!(
                "responder {user_id} on incident {incident_id}"
            )));
        }

        let now = self.state.clock.now();
        IncidentRepository::append_timeline(
            &self.state.db,
            incident_id,
            "responder_removed",
            removed_by,
            "Responder removed",
            serde_json::json!({ "user_id": user_id }),
            now,
        )
        .await?;

        self.publish_payload(
            event_types::INCIDENT_RESPONDER_REMOVED,
            &incident,
            serde_json::json!({ "incident_id": incident_id, "user_id": user_id }),
        );
        Ok(())
    }

    pub async fn link_alert(
        &self,
        org_id: &str,
        incident_id: &str,
        alert_id: &str,
        linked_by: Option<&str>,
    ) -> AppResult<()> {
        let _guard = self.state.incident_locks.acquire(incident_id).await;
        let incident = self.load_owned(org_id, incident_id).await?;

        let alert = AlertRepository::find_by_id(&self.state.db, alert_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("alert {alert_id}")))?;
        if alert.organization_id != org_id {
            return Err(AppError::NotFound(format!("alert {alert_id}")));
        }

        let now = self.state.clock.now();
        IncidentRepository::link_alert(&self.state.db, incident_id, alert_id, linked_by, now)
            .await?;

        IncidentRepository::append_timeline(
            &self.state.db,
            incident_id,
            "alert_linked",
            linked_by,
            &format!("Alert linked: {}", alert.message),
            serde_json::json!({ "alert_id": alert_id }),
            now,
        )
        .await?;

        self.publish_payload(
            event_types::INCIDENT_ALERT_LINKED,
            &incident,
            serde_json::json!({ "incident_id": incident_id, "alert_id": alert_id }),
        );
        Ok(())
    }

    pub async fn unlink_alert(
        &self,
        org_id: &str,
        incident_id: &str,
        alert_id: &str,
        unlinked_by: Option<&str>,
    ) -> AppResult<()> {
        let _guard = self.state.incident_locks.acquire(incident_id).await;
        let incident = self.load_owned(org_id, incident_id).await?;

        let removed =
            IncidentRepository::unlink_alert(&self.state.db, incident_id, alert_id).await?;
        if !removed {
            return Err(AppError::NotFound(format!(
                "link between incident {incident_id} and alert {alert_id}"
            )));
        }

        let now = self.state.clock.now();
        IncidentRepository::append_timeline(
            &self.state.db,
            incident_id,
            "alert_unlinked",
            unlinked_by,
            "Alert unlinked",
            serde_json::json!({ "alert_id": alert_id }),
            now,
        )
        .await?;

        self.publish_payload(
            event_types::INCIDENT_ALERT_UNLINKED,
            &incident,
            serde_json::json!({ "incident_id": incident_id, "alert_id": alert_id }),
        );
        Ok(())
    }

    fn publish(&self, event_type: &str, incident: &Incident) {
        self.publish_payload(
            event_type,
            incident,
            serde_json::to_value(incident).unwrap_or_default(),
        );
    }

    fn publish_payload(&self, event_type: &str, incident: &Incident, payload: serde_json::Value) {
        self.state.bus.publish(Event::new(
            event_type,
            &incident.organization_id,
            payload,
        ));
    }
}
