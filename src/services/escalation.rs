use std::sync::Arc;

use chrono::Duration;

use crate::db::models::{
    Alert, AlertEscalationEvent, AlertPriority, AlertStatus, EscalationRule, TargetKind,
};
use crate::db::repository::{
    AlertRepository, EscalationEventRepository, EscalationPolicyRepository, TeamRepository,
    UserRepository,
};
use crate::error::{AppError, AppResult};
use crate::services::events::{event_types, Event};
use crate::services::notifications::{NotificationDispatcher, Recipient};
use crate::services::oncall::OnCallResolver;
use crate::AppState;

/// Timer-driven escalation: sweeps due events, advances the per-alert
/// state machine, resolves targets and hands recipients to the
/// dispatcher. A companion sweep reopens expired snoozes.
pub struct EscalationService {
    state: Arc<AppState>,
}

impl EscalationService {
    pub fn new(state: &Arc<AppState>) -> Self {
        Self {
            state: state.clone(),
        }
    }

    /// One scheduler tick. Per-item failures are logged and never abort
    /// the sweep.
    pub async fn run_tick(&self) -> AppResult<usize> {
        let now = self.state.clock.now();
        let due = EscalationEventRepository::fetch_due(
            &self.state.db,
            now,
            self.state.config.escalation.batch_size,
        )
        .await?;

        let mut processed = 0;
        for event in due {
            if let Err(e) = self.process_due_event(&event).await {
                tracing::warn!(
                    event = %event.id,
                    alert = %event.alert_id,
                    "Escalation event failed: {:?}",
                    e
                );
            } else {
                processed += 1;
            }
        }

        Ok(processed)
    }

    /// Advance one due event under the alert's lock.
    async fn process_due_event(&self, event: &AlertEscalationEvent) -> AppResult<()> {
        let _guard = self.state.alert_locks.acquire(&event.alert_id).await;

        let Some(alert) = AlertRepository::find_by_id(&self.state.db, &event.alert_id).await?
        else {
            EscalationEventRepository::transition(&self.state.db, &event.id, "stopped").await?;
            return Ok(());
        };

        let status = AlertStatus::parse(&alert.status)
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("bad status {:?}", alert.status)))?;

        match status {
            AlertStatus::Acknowledged => {
                EscalationEventRepository::transition(&self.state.db, &event.id, "acknowledged")
                    .await?;
                return Ok(());
            }
            AlertStatus::Closed | AlertStatus::Snoozed => {
                // The snooze sweep re-creates the chain once the window ends.
                EscalationEventRepository::transition(&self.state.db, &event.id, "stopped").await?;
                return Ok(());
            }
            AlertStatus::Open => {}
        }

        // Claim the event; losing the race means another worker advanced it.
        let Some(claimed) =
            EscalationEventRepository::transition(&self.state.db, &event.id, "completed").await?
        else {
            return Ok(());
        };

        let rules = EscalationPolicyRepository::rules(&self.state.db, &event.policy_id).await?;
        let level = claimed.current_level;
        let Some(rule) = rules.get(level as usize) else {
            tracing::warn!(
                event = %event.id,
                level,
                "Escalation level has no rule; policy changed underneath"
            );
            return Ok(());
        };

        let recipients = self.resolve_rule_targets(&rule.id).await?;
        if recipients.is_empty() {
            tracing::warn!(alert = %alert.id, level, "Escalation step resolved no recipients");
        } else {
            let priority =
                AlertPriority::parse(&alert.priority).unwrap_or(AlertPriority::P3);
            let subject = format!("[{}] {}", alert.priority, alert.message);
            let body = escalation_message(&alert, level);

            let dispatcher = NotificationDispatcher::new(&self.state);
            dispatcher
                .dispatch(
                    &alert.organization_id,
                    &recipients,
                    Some(subject.as_str()),
                    &body,
                    priority,
                    Some(alert.id.as_str()),
                )
                .await?;
        }

        let now = self.state.clock.now();
        AlertRepository::record_escalation(&self.state.db, &alert.id, level, now).await?;

        self.schedule_next(&claimed, &rules).await?;

        let payload = serde_json::json!({
            "alert_id": alert.id,
            "policy_id": event.policy_id,
            "level": level,
            "repeat": claimed.repeat_count,
        });
        self.state.bus.publish(Event::new(
            event_types::ALERT_ESCALATED,
            &alert.organization_id,
            payload,
        ));

        Ok(())
    }

    /// Compute the follow-up event: next rule, a repeat of the chain, or
    /// nothing when the policy is exhausted.
    async fn schedule_next(
        &self,
        completed: &AlertEscalationEvent,
        rules: &[EscalationRule],
    ) -> AppResult<()> {
        let now = self.state.clock.now();
        let next_level = completed.current_level + 1;

        if let Some(next_rule) = rules.get(next_level as usize) {
            let next_at = now + Duration::minutes(next_rule.delay_minutes);
            EscalationEventRepository::create_triggered(
                &self.state.db,
                &completed.alert_id,
                &completed.policy_id,
                Some(next_rule.id.as_str()),
                next_level,
                completed.repeat_count,
                next_at,
            )
            .await?;
            return Ok(());
        }

        let policy =
            EscalationPolicyRepository::find_by_id(&self.state.db, &completed.policy_id).await?;
        let Some(policy) = policy else {
            return Ok(());
        };

        let repeats_left = policy.repeat_enabled
            && policy
                .repeat_count
                .map_or(true, |max| completed.repeat_count + 1 <= max);

        if repeats_left {
            if let Some(first) = rules.first() {
                let next_at = now + Duration::minutes(first.delay_minutes);
                EscalationEventRepository::create_triggered(
                    &self.state.db,
                    &completed.alert_id,
                    &completed.policy_id,
                    Some(first.id.as_str()),
                    0,
                    completed.repeat_count + 1,
                    next_at,
                )
                .await?;
            }
        }

        Ok(())
    }

    /// Resolve a rule's targets into concrete users, honoring per-target
    /// channel overrides.
    async fn resolve_rule_targets(&self, rule_id: &str) -> AppResult<Vec<Recipient>> {
        let targets = EscalationPolicyRepository::targets(&self.state.db, rule_id).await?;
        let now = self.state.clock.now();

        let mut recipients: Vec<Recipient> = Vec::new();
        for target in targets {
            let Some(kind) = TargetKind::parse(&target.kind) else {
                tracing::warn!(target = %target.id, kind = %target.kind, "Unknown target kind");
                continue;
            };

            let users = match kind {
                TargetKind::User => {
                    match UserRepository::find_by_id(&self.state.db, &target.target_id).await? {
                        Some(user) => vec![user],
                        None => {
                            tracing::warn!(target = %target.target_id, "Target user not found");
                            Vec::new()
                        }
                    }
                }
                TargetKind::Team => {
                    TeamRepository::member_users(&self.state.db, &target.target_id).await?
                }
                TargetKind::Schedule => {
                    match OnCallResolver::who_is_on_call(&self.state.db, &target.target_id, now)
                        .await?
                    {
                        Some(oncall) => {
                            match UserRepository::find_by_id(&self.state.db, &oncall.user_id)
                                .await?
                            {
                                Some(user) => vec![user],
                                None => Vec::new(),
                            }
                        }
                        None => {
                            tracing::warn!(
                                schedule = %target.target_id,
                                "Nobody on call for schedule target; skipping"
                            );
                            Vec::new()
                        }
                    }
                }
            };

            let channel_types = target.channel_list();
            for user in users {
                if recipients.iter().any(|r| r.user.id == user.id) {
                    continue;
                }
                recipients.push(Recipient {
                    user,
                    channel_types: channel_types.clone(),
                    urgent: target.urgent,
                });
            }
        }

        Ok(recipients)
    }

    /// Reopen expired snoozes and resume their escalation chains from the
    /// snooze expiry instant.
    pub async fn run_snooze_sweep(&self) -> AppResult<usize> {
        let now = self.state.clock.now();
        let expired = AlertRepository::list_expired_snoozed(
            &self.state.db,
            now,
            self.state.config.escalation.batch_size,
        )
        .await?;

        let mut reopened = 0;
        for alert in expired {
            if let Err(e) = self.reopen_one(&alert).await {
                tracing::warn!(alert = %alert.id, "Snooze reopen failed: {:?}", e);
            } else {
                reopened += 1;
            }
        }

        Ok(reopened)
    }

    async fn reopen_one(&self, snoozed: &Alert) -> AppResult<()> {
        let _guard = self.state.alert_locks.acquire(&snoozed.id).await;

        let now = self.state.clock.now();
        let Some(alert) = AlertRepository::reopen_snoozed(&self.state.db, &snoozed.id, now).await?
        else {
            // A concurrent acknowledge or close got there first.
            return Ok(());
        };

        self.state.bus.publish(Event::new(
            event_types::ALERT_UPDATED,
            &alert.organization_id,
            serde_json::to_value(&alert).unwrap_or_default(),
        ));

        let Some(policy_id) = alert.escalation_policy_id.clone() else {
            return Ok(());
        };

        // Resume only when no chain is already live.
        if EscalationEventRepository::find_active_for_alert(&self.state.db, &alert.id)
            .await?
            .is_some()
        {
            return Ok(());
        }

        let rules = EscalationPolicyRepository::rules(&self.state.db, &policy_id).await?;
        let level = alert
            .escalation_level
            .clamp(0, rules.len().saturating_sub(1) as i64);
        let Some(rule) = rules.get(level as usize) else {
            return Ok(());
        };

        // The delay counts from the end of the snooze window, not from
        // whenever the sweep happened to run.
        let base = snoozed.snoozed_until.unwrap_or(now);
        let next_at = base + Duration::minutes(rule.delay_minutes);
        EscalationEventRepository::create_triggered(
            &self.state.db,
            &alert.id,
            &policy_id,
            Some(rule.id.as_str()),
            level,
            0,
            next_at,
        )
        .await?;

        Ok(())
    }
}

fn escalation_message(alert: &Alert, level: i64) -> String {
    let mut body = format!(
        "Alert from {} requires attention (escalation level {}).\n\n{}",
        alert.source, level, alert.message
    );
    if let Some(description) = &alert.description {
        body.push_str("\n\n");
        body.push_str(description);
    }
    let tags = alert.tag_list();
    if !tags.is_empty() {
        body.push_str("\n\nTags: ");
        body.push_str(&tags.join(", "));
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn alert_with(message: &str, description: Option<&str>, tags: &[&str]) -> Alert {
        let now = Utc::now();
        Alert {
            id: "a1".to_string(),
            organization_id: "org".to_string(),
            source: "prometheus".to_string(),
            source_id: None,
            priority: "P2".to_string(),
            status: "open".to_string(),
            message: message.to_string(),
            description: description.map(|s| s.to_string()),
            tags: serde_json::to_string(tags).unwrap(),
            custom_fields: "{}".to_string(),
            dedup_key: None,
            dedup_count: 1,
            assigned_user_id: None,
            assigned_team_id: None,
            escalation_policy_id: None,
            escalation_level: 0,
            close_reason: None,
            snoozed_until: None,
            first_occurrence_at: now,
            last_occurrence_at: now,
            last_escalated_at: None,
            acknowledged_at: None,
            closed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn escalation_message_includes_context() {
        let alert = alert_with("CPU high", Some("web tier"), &["prod", "api"]);
        let body = escalation_message(&alert, 1);

        assert!(body.contains("escalation level 1"));
        assert!(body.contains("CPU high"));
        assert!(body.contains("web tier"));
        assert!(body.contains("prod, api"));
    }

    #[test]
    fn escalation_message_without_optionals() {
        let alert = alert_with("disk full", None, &[]);
        let body = escalation_message(&alert, 0);

        assert!(body.contains("disk full"));
        assert!(!body.contains("Tags:"));
    }
}

#[cfg(test)]
mod scheduler_tests {
    use super::*;
    use crate::db::models::{
        CreateEscalationPolicy, CreateEscalationRule, CreateEscalationTarget,
        CreateNotificationChannel, CreateTeam, SourceAlert,
    };
    use crate::db::repository::{NotificationChannelRepository, RoutingRuleRepository};
    use crate::services::alerts::AlertService;
    use crate::services::ingest::IngestService;
    use crate::test_support;
    use serde_json::json;

    struct Fixture {
        state: std::sync::Arc<crate::AppState>,
        clock: std::sync::Arc<crate::clock::ManualClock>,
        org: String,
        user: String,
        team_member: String,
        alert_id: String,
    }

    /// Org with one webhook channel (always 200), a two-step policy
    /// (user at level 0 after 5 min, team at level 1 after 10 more) and
    /// one open alert routed onto it.
    async fn fixture(repeat_enabled: bool) -> Fixture {
        let clock = test_support::manual_clock("2024-06-01T00:00:00Z");
        let state = test_support::state_with_clock(clock.clone()).await;
        let org = test_support::seed_org(&state, "acme").await;
        let user = test_support::seed_user(&state, &org, "primary@acme.io").await;
        let team_member = test_support::seed_user(&state, &org, "backup@acme.io").await;

        let team = crate::db::repository::TeamRepository::create(
            &state.db,
            &org,
            CreateTeam {
                name: "platform".to_string(),
                description: None,
            },
        )
        .await
        .unwrap();
        crate::db::repository::TeamRepository::add_member(
            &state.db,
            &team.id,
            &team_member,
            "member",
        )
        .await
        .unwrap();

        let receiver = test_support::spawn_receiver(vec![200]).await;
        NotificationChannelRepository::create(
            &state.db,
            &org,
            CreateNotificationChannel {
                channel_type: "webhook".to_string(),
                name: "pager".to_string(),
                config: json!({"url": receiver.url}),
                enabled: true,
            },
        )
        .await
        .unwrap();

        let policy = EscalationPolicyRepository::create(
            &state.db,
            &org,
            CreateEscalationPolicy {
                name: "standard".to_string(),
                description: None,
                repeat_enabled,
                repeat_count: None,
                rules: vec![
                    CreateEscalationRule {
                        position: 0,
                        delay_minutes: 5,
                        targets: vec![CreateEscalationTarget {
                            kind: "user".to_string(),
                            target_id: user.clone(),
                            channels: None,
                            urgent: false,
                        }],
                    },
                    CreateEscalationRule {
                        position: 1,
                        delay_minutes: 10,
                        targets: vec![CreateEscalationTarget {
                            kind: "team".to_string(),
                            target_id: team.id.clone(),
                            channels: None,
                            urgent: true,
                        }],
                    },
                ],
            },
        )
        .await
        .unwrap();

        RoutingRuleRepository::create(
            &state.db,
            &org,
            crate::db::models::CreateRoutingRule {
                name: "attach policy".to_string(),
                priority: 0,
                conditions: crate::db::models::RuleConditions {
                    match_mode: crate::db::models::ConditionMatch::Any,
                    conditions: vec![],
                },
                actions: crate::db::models::RuleActions {
                    escalation_policy: Some(policy.id.clone()),
                    ..Default::default()
                },
                enabled: true,
            },
        )
        .await
        .unwrap();

        let (alert, _) = IngestService::new(&state)
            .ingest(
                &org,
                SourceAlert {
                    source: "prom".to_string(),
                    source_id: None,
                    priority: Some("P2".to_string()),
                    message: "CPU high".to_string(),
                    description: None,
                    tags: vec![],
                    custom_fields: serde_json::Map::new(),
                    dedup_key: None,
                },
            )
            .await
            .unwrap();

        Fixture {
            state,
            clock,
            org,
            user,
            team_member,
            alert_id: alert.id,
        }
    }

    async fn logs_for_user(state: &crate::AppState, user_id: &str) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM notification_logs WHERE user_id = ? AND status = 'sent'")
            .bind(user_id)
            .fetch_one(&state.db)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn chain_advances_through_levels_then_terminates() {
        let f = fixture(false).await;
        let service = EscalationService::new(&f.state);

        // Nothing due yet.
        assert_eq!(service.run_tick().await.unwrap(), 0);

        // t = 5 min: level 0 fires, the user is notified.
        f.clock.advance(Duration::minutes(5));
        assert_eq!(service.run_tick().await.unwrap(), 1);
        assert_eq!(logs_for_user(&f.state, &f.user).await, 1);
        assert_eq!(logs_for_user(&f.state, &f.team_member).await, 0);

        let alert = AlertRepository::find_by_id(&f.state.db, &f.alert_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(alert.escalation_level, 0);
        assert_eq!(
            alert.last_escalated_at.unwrap(),
            test_support::at("2024-06-01T00:05:00Z")
        );

        let next = EscalationEventRepository::find_active_for_alert(&f.state.db, &f.alert_id)
            .await
            .unwrap()
            .expect("level 1 scheduled");
        assert_eq!(next.current_level, 1);
        assert_eq!(
            next.next_escalation_at.unwrap(),
            test_support::at("2024-06-01T00:15:00Z")
        );

        // t = 15 min: level 1 fires, the team member is notified.
        f.clock.advance(Duration::minutes(10));
        assert_eq!(service.run_tick().await.unwrap(), 1);
        assert_eq!(logs_for_user(&f.state, &f.team_member).await, 1);

        // Policy has no more rules and repeat is off: chain is done.
        assert!(
            EscalationEventRepository::find_active_for_alert(&f.state.db, &f.alert_id)
                .await
                .unwrap()
                .is_none()
        );

        // t = 16 min: nothing further fires.
        f.clock.advance(Duration::minutes(1));
        assert_eq!(service.run_tick().await.unwrap(), 0);
        assert_eq!(logs_for_user(&f.state, &f.user).await, 1);
        assert_eq!(logs_for_user(&f.state, &f.team_member).await, 1);
    }

    #[tokio::test]
    async fn repeat_restarts_the_chain_at_level_zero() {
        let f = fixture(true).await;
        let service = EscalationService::new(&f.state);

        f.clock.advance(Duration::minutes(5));
        service.run_tick().await.unwrap();
        f.clock.advance(Duration::minutes(10));
        service.run_tick().await.unwrap();

        // Chain wrapped: a fresh level-0 event with repeat_count = 1.
        let event = EscalationEventRepository::find_active_for_alert(&f.state.db, &f.alert_id)
            .await
            .unwrap()
            .expect("repeat scheduled");
        assert_eq!(event.current_level, 0);
        assert_eq!(event.repeat_count, 1);
        assert_eq!(
            event.next_escalation_at.unwrap(),
            test_support::at("2024-06-01T00:20:00Z")
        );
    }

    #[tokio::test]
    async fn acknowledge_stops_future_escalation() {
        let f = fixture(false).await;
        let service = EscalationService::new(&f.state);

        AlertService::new(&f.state)
            .acknowledge(&f.org, &f.alert_id)
            .await
            .unwrap();

        f.clock.advance(Duration::minutes(5));
        service.run_tick().await.unwrap();

        assert_eq!(logs_for_user(&f.state, &f.user).await, 0);
        let events = EscalationEventRepository::list_for_alert(&f.state.db, &f.alert_id)
            .await
            .unwrap();
        assert!(events.iter().all(|e| e.event_type == "acknowledged"));
    }

    #[tokio::test]
    async fn snooze_suspends_and_expiry_resumes_escalation() {
        let f = fixture(false).await;
        let service = EscalationService::new(&f.state);

        let until = test_support::at("2024-06-01T00:30:00Z");
        AlertService::new(&f.state)
            .snooze(&f.org, &f.alert_id, until)
            .await
            .unwrap();

        // Due time passes inside the snooze window: nothing fires.
        f.clock.advance(Duration::minutes(10));
        service.run_tick().await.unwrap();
        assert_eq!(logs_for_user(&f.state, &f.user).await, 0);

        // Window ends: the sweep reopens the alert and reschedules from
        // snoozed_until plus the current rule's delay.
        f.clock.advance(Duration::minutes(25));
        assert_eq!(service.run_snooze_sweep().await.unwrap(), 1);

        let alert = AlertRepository::find_by_id(&f.state.db, &f.alert_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(alert.status, "open");

        let event = EscalationEventRepository::find_active_for_alert(&f.state.db, &f.alert_id)
            .await
            .unwrap()
            .expect("escalation resumed");
        assert_eq!(
            event.next_escalation_at.unwrap(),
            test_support::at("2024-06-01T00:35:00Z")
        );
    }
}
