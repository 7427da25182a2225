use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::db::models::{Alert, AlertPriority, IncomingWebhookToken, SourceAlert};
use crate::db::repository::alert::NewAlert;
use crate::db::repository::{
    AlertRepository, EscalationEventRepository, EscalationPolicyRepository, RoutingRuleRepository,
};
use crate::error::{AppError, AppResult};
use crate::services::events::{event_types, Event};
use crate::services::routing::{self, RoutingInput};
use crate::AppState;

/// What happened to an ingested signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Created,
    Deduped,
    Suppressed,
}

impl IngestOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestOutcome::Created => "created",
            IngestOutcome::Deduped => "deduped",
            IngestOutcome::Suppressed => "suppressed",
        }
    }
}

/// Stable digest of (source, message, sorted tags), used when the caller
/// does not supply a dedup key.
pub fn fingerprint(source: &str, message: &str, tags: &[String]) -> String {
    let mut sorted: Vec<&str> = tags.iter().map(|t| t.as_str()).collect();
    sorted.sort_unstable();
    sorted.dedup();

    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update(b"\n");
    hasher.update(message.as_bytes());
    for tag in sorted {
        hasher.update(b"\n");
        hasher.update(tag.as_bytes());
    }

    hex::encode(hasher.finalize())
}

/// Ingestion pipeline: normalize, dedup, route, persist, emit, and
/// bootstrap escalation.
pub struct IngestService {
    state: Arc<AppState>,
}

impl IngestService {
    pub fn new(state: &Arc<AppState>) -> Self {
        Self {
            state: state.clone(),
        }
    }

    pub async fn ingest(
        &self,
        org_id: &str,
        source_alert: SourceAlert,
    ) -> AppResult<(Alert, IngestOutcome)> {
        if source_alert.message.trim().is_empty() {
            return Err(AppError::Validation("message must not be empty".to_string()));
        }
        if source_alert.source.trim().is_empty() {
            return Err(AppError::Validation("source must not be empty".to_string()));
        }

        let priority = match &source_alert.priority {
            Some(p) => AlertPriority::parse(p)
                .ok_or_else(|| AppError::Validation(format!("invalid priority {p:?}")))?,
            None => AlertPriority::P3,
        };

        let dedup_key = source_alert.dedup_key.clone().unwrap_or_else(|| {
            fingerprint(
                &source_alert.source,
                &source_alert.message,
                &source_alert.tags,
            )
        });

        let now = self.state.clock.now();

        // Fast path: an open alert with this key already exists.
        if let Some(alert) =
            AlertRepository::try_dedup_bump(&self.state.db, org_id, &dedup_key, now).await?
        {
            self.publish(event_types::ALERT_UPDATED, &alert);
            return Ok((alert, IngestOutcome::Deduped));
        }

        // Fresh alert: run routing before persisting so actions land in
        // the inserted row.
        let rules = RoutingRuleRepository::list_enabled_sorted(&self.state.db, org_id).await?;
        let routing_input = RoutingInput {
            source: source_alert.source.clone(),
            priority: priority.as_str().to_string(),
            message: source_alert.message.clone(),
            tags: source_alert.tags.clone(),
            custom_fields: source_alert.custom_fields.clone(),
        };
        let routed = routing::evaluate(&routing_input, &rules);

        let mut tags = source_alert.tags.clone();
        let mut final_priority = priority.as_str().to_string();
        let mut assigned_user_id = None;
        let mut assigned_team_id = None;
        let mut escalation_policy_id = None;
        let mut suppressed_by = None;

        if let Some(matched) = &routed {
            let actions = &matched.actions;
            if actions.suppress {
                suppressed_by = Some(matched.rule_id.clone());
            }
            if let Some(p) = &actions.set_priority {
                if let Some(parsed) = AlertPriority::parse(p) {
                    final_priority = parsed.as_str().to_string();
                }
            }
            for tag in &actions.add_tags {
                if !tags.contains(tag) {
                    tags.push(tag.clone());
                }
            }
            assigned_user_id = actions.assign_user.clone();
            assigned_team_id = actions.assign_team.clone();
            escalation_policy_id = actions.escalation_policy.clone();
        }

        let suppressed = suppressed_by.is_some();
        let new_alert = NewAlert {
            organization_id: org_id.to_string(),
            source: source_alert.source,
            source_id: source_alert.source_id,
            priority: final_priority,
            status: if suppressed { "closed" } else { "open" }.to_string(),
            message: source_alert.message,
            description: source_alert.description,
            tags: serde_json::to_string(&tags)
                .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?,
            custom_fields: serde_json::to_string(&source_alert.custom_fields)
                .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?,
            dedup_key: dedup_key.clone(),
            assigned_user_id,
            assigned_team_id,
            escalation_policy_id: if suppressed {
                None
            } else {
                escalation_policy_id
            },
            close_reason: suppressed_by
                .as_ref()
                .map(|rule_id| format!("suppressed by rule {rule_id}")),
        };

        let alert = match AlertRepository::insert(&self.state.db, new_alert, now).await {
            Ok(alert) => alert,
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                // Lost the dedup race; the winner's row is there now.
                let alert = AlertRepository::try_dedup_bump(&self.state.db, org_id, &dedup_key, now)
                    .await?
                    .ok_or_else(|| {
                        AppError::Internal(anyhow::anyhow!(
                            "dedup race on {dedup_key} left no open alert"
                        ))
                    })?;
                self.publish(event_types::ALERT_UPDATED, &alert);
                return Ok((alert, IngestOutcome::Deduped));
            }
            Err(e) => return Err(AppError::Database(e)),
        };

        self.publish(event_types::ALERT_CREATED, &alert);

        if suppressed {
            tracing::info!(alert = %alert.id, "Alert suppressed by routing rule");
            return Ok((alert, IngestOutcome::Suppressed));
        }

        if let Some(policy_id) = alert.escalation_policy_id.clone() {
            self.bootstrap_escalation(&alert, &policy_id).await?;
        }

        Ok((alert, IngestOutcome::Created))
    }

    /// Schedule the first escalation step for a freshly routed alert.
    async fn bootstrap_escalation(&self, alert: &Alert, policy_id: &str) -> AppResult<()> {
        let rules = EscalationPolicyRepository::rules(&self.state.db, policy_id).await?;
        let Some(first) = rules.first() else {
            tracing::warn!(policy = policy_id, "Escalation policy has no rules");
            return Ok(());
        };

        let next_at = self.state.clock.now() + chrono::Duration::minutes(first.delay_minutes);
        EscalationEventRepository::create_triggered(
            &self.state.db,
            &alert.id,
            policy_id,
            Some(first.id.as_str()),
            0,
            0,
            next_at,
        )
        .await?;

        Ok(())
    }

    fn publish(&self, event_type: &str, alert: &Alert) {
        let payload = serde_json::to_value(alert).unwrap_or_default();
        self.state
            .bus
            .publish(Event::new(event_type, &alert.organization_id, payload));
    }
}

// ---------------------------------------------------------------------------
// Inbound payload adapters
// ---------------------------------------------------------------------------

/// Convert an integration-specific payload into canonical alerts, applying
/// the token's defaults. Unknown fields are ignored.
pub fn normalize(
    token: &IncomingWebhookToken,
    payload: &serde_json::Value,
) -> AppResult<Vec<SourceAlert>> {
    let mut alerts = match token.integration_type.as_str() {
        "prometheus" => normalize_prometheus(payload),
        "grafana" => normalize_grafana(payload),
        "datadog" => normalize_datadog(payload),
        _ => normalize_generic(payload),
    }?;

    let default_tags: Vec<String> =
        serde_json::from_str(&token.default_tags).unwrap_or_default();

    for alert in &mut alerts {
        if alert.priority.is_none() {
            alert.priority = token.default_priority.clone();
        }
        for tag in &default_tags {
            if !alert.tags.contains(tag) {
                alert.tags.push(tag.clone());
            }
        }
    }

    Ok(alerts)
}

fn normalize_generic(payload: &serde_json::Value) -> AppResult<Vec<SourceAlert>> {
    let alert: SourceAlert = serde_json::from_value(payload.clone())
        .map_err(|e| AppError::Validation(format!("invalid alert payload: {e}")))?;
    Ok(vec![alert])
}

/// Alertmanager webhook: `{"alerts": [{labels, annotations, ...}]}`.
fn normalize_prometheus(payload: &serde_json::Value) -> AppResult<Vec<SourceAlert>> {
    let items = payload
        .get("alerts")
        .and_then(|a| a.as_array())
        .ok_or_else(|| AppError::Validation("missing alerts array".to_string()))?;

    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let labels = item.get("labels").and_then(|l| l.as_object());
        let annotations = item.get("annotations").and_then(|a| a.as_object());

        let name = labels
            .and_then(|l| l.get("alertname"))
            .and_then(|v| v.as_str())
            .unwrap_or("prometheus alert");
        let message = annotations
            .and_then(|a| a.get("summary").or_else(|| a.get("description")))
            .and_then(|v| v.as_str())
            .unwrap_or(name);

        let mut tags = Vec::new();
        let mut custom_fields = serde_json::Map::new();
        if let Some(labels) = labels {
            for (key, value) in labels {
                if key == "alertname" {
                    continue;
                }
                if let Some(v) = value.as_str() {
                    if key == "severity" {
                        tags.push(v.to_string());
                    }
                    custom_fields.insert(key.clone(), serde_json::Value::String(v.to_string()));
                }
            }
        }

        let priority = labels
            .and_then(|l| l.get("severity"))
            .and_then(|v| v.as_str())
            .map(severity_to_priority);

        out.push(SourceAlert {
            source: "prometheus".to_string(),
            source_id: item
                .get("fingerprint")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            priority,
            message: message.to_string(),
            description: annotations
                .and_then(|a| a.get("description"))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            tags,
            custom_fields,
            dedup_key: item
                .get("fingerprint")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
        });
    }

    Ok(out)
}

/// Grafana unified alerting: `{"alerts": [...]}` with `labels` and a
/// top-level `title`/`message` fallback.
fn normalize_grafana(payload: &serde_json::Value) -> AppResult<Vec<SourceAlert>> {
    if payload.get("alerts").is_some() {
        // Unified alerting uses the same shape as Alertmanager.
        let mut alerts = normalize_prometheus(payload)?;
        for alert in &mut alerts {
            alert.source = "grafana".to_string();
        }
        return Ok(alerts);
    }

    // Legacy dashboard alerts.
    let title = payload
        .get("title")
        .or_else(|| payload.get("ruleName"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| AppError::Validation("missing title".to_string()))?;

    Ok(vec![SourceAlert {
        source: "grafana".to_string(),
        source_id: payload
            .get("ruleId")
            .map(|v| v.to_string().trim_matches('"').to_string()),
        priority: None,
        message: title.to_string(),
        description: payload
            .get("message")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        tags: Vec::new(),
        custom_fields: serde_json::Map::new(),
        dedup_key: payload
            .get("ruleId")
            .map(|v| format!("grafana-rule-{}", v.to_string().trim_matches('"'))),
    }])
}

fn normalize_datadog(payload: &serde_json::Value) -> AppResult<Vec<SourceAlert>> {
    let title = payload
        .get("title")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AppError::Validation("missing title".to_string()))?;

    let tags = payload
        .get("tags")
        .and_then(|v| v.as_str())
        .map(|s| {
            s.split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let priority = payload
        .get("alert_type")
        .and_then(|v| v.as_str())
        .map(severity_to_priority);

    Ok(vec![SourceAlert {
        source: "datadog".to_string(),
        source_id: payload
            .get("alert_id")
            .map(|v| v.to_string().trim_matches('"').to_string()),
        priority,
        message: title.to_string(),
        description: payload
            .get("body")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        tags,
        custom_fields: serde_json::Map::new(),
        dedup_key: payload
            .get("alert_id")
            .map(|v| format!("datadog-{}", v.to_string().trim_matches('"'))),
    }])
}

fn severity_to_priority(severity: &str) -> String {
    match severity.to_lowercase().as_str() {
        "critical" | "error" | "page" => "P1",
        "high" => "P2",
        "warning" | "warn" => "P3",
        "info" | "information" => "P4",
        "low" | "success" => "P5",
        other => AlertPriority::parse(other)
            .map(|p| p.as_str())
            .unwrap_or("P3"),
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn fingerprint_is_stable_under_tag_order() {
        let a = fingerprint("prom", "CPU high", &["prod".into(), "api".into()]);
        let b = fingerprint("prom", "CPU high", &["api".into(), "prod".into()]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn fingerprint_differs_by_content() {
        let a = fingerprint("prom", "CPU high", &[]);
        let b = fingerprint("prom", "CPU low", &[]);
        let c = fingerprint("datadog", "CPU high", &[]);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn fingerprint_is_not_confused_by_joined_fields() {
        // (source="a", message="b\nc") must differ from (source="a\nb", message="c").
        let a = fingerprint("a", "b\nc", &[]);
        let b = fingerprint("a\nb", "c", &[]);
        assert_ne!(a, b);
    }

    fn token(integration_type: &str) -> IncomingWebhookToken {
        IncomingWebhookToken {
            id: "tok".to_string(),
            organization_id: "org".to_string(),
            name: "monitor".to_string(),
            token: "secret".to_string(),
            integration_type: integration_type.to_string(),
            default_priority: Some("P2".to_string()),
            default_tags: json!(["ingested"]).to_string(),
            enabled: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn prometheus_payload_normalizes_labels_and_severity() {
        let payload = json!({
            "alerts": [{
                "labels": {
                    "alertname": "HighCPU",
                    "severity": "critical",
                    "instance": "web-1"
                },
                "annotations": {"summary": "CPU above 90%"},
                "fingerprint": "abc123"
            }]
        });

        let alerts = normalize(&token("prometheus"), &payload).unwrap();
        assert_eq!(alerts.len(), 1);
        let alert = &alerts[0];
        assert_eq!(alert.source, "prometheus");
        assert_eq!(alert.message, "CPU above 90%");
        assert_eq!(alert.priority.as_deref(), Some("P1"));
        assert_eq!(alert.dedup_key.as_deref(), Some("abc123"));
        assert!(alert.tags.contains(&"critical".to_string()));
        assert!(alert.tags.contains(&"ingested".to_string()));
        assert_eq!(alert.custom_fields.get("instance"), Some(&json!("web-1")));
    }

    #[test]
    fn generic_payload_gets_token_defaults() {
        let payload = json!({
            "source": "custom",
            "message": "disk almost full"
        });

        let alerts = normalize(&token("generic"), &payload).unwrap();
        let alert = &alerts[0];
        assert_eq!(alert.priority.as_deref(), Some("P2"));
        assert_eq!(alert.tags, vec!["ingested".to_string()]);
    }

    #[test]
    fn explicit_priority_beats_token_default() {
        let payload = json!({
            "source": "custom",
            "message": "disk almost full",
            "priority": "P5"
        });

        let alerts = normalize(&token("generic"), &payload).unwrap();
        assert_eq!(alerts[0].priority.as_deref(), Some("P5"));
    }

    #[test]
    fn datadog_tags_are_split() {
        let payload = json!({
            "title": "Monitor triggered",
            "alert_type": "error",
            "tags": "env:prod, service:api",
            "alert_id": 42
        });

        let alerts = normalize(&token("datadog"), &payload).unwrap();
        let alert = &alerts[0];
        assert_eq!(alert.source, "datadog");
        assert_eq!(alert.priority.as_deref(), Some("P1"));
        assert_eq!(alert.tags, vec!["env:prod".to_string(), "service:api".to_string()]);
        assert_eq!(alert.dedup_key.as_deref(), Some("datadog-42"));
    }

    #[test]
    fn grafana_unified_payload_uses_alertmanager_shape() {
        let payload = json!({
            "alerts": [{
                "labels": {"alertname": "Latency", "severity": "warning"},
                "annotations": {"summary": "p99 latency high"}
            }]
        });

        let alerts = normalize(&token("grafana"), &payload).unwrap();
        assert_eq!(alerts[0].source, "grafana");
        assert_eq!(alerts[0].priority.as_deref(), Some("P3"));
    }

    #[test]
    fn invalid_generic_payload_is_rejected() {
        let payload = json!({"nope": true});
        assert!(normalize(&token("generic"), &payload).is_err());
    }
}

#[cfg(test)]
mod pipeline_tests {
    use super::*;
    use crate::db::models::{
        ConditionMatch, ConditionOperator, CreateEscalationPolicy, CreateEscalationRule,
        CreateEscalationTarget, CreateRoutingRule, RuleActions, RuleCondition, RuleConditions,
    };
    use crate::db::repository::RoutingRuleRepository;
    use crate::test_support;
    use serde_json::json;

    fn source_alert(message: &str, tags: &[&str]) -> SourceAlert {
        SourceAlert {
            source: "prom".to_string(),
            source_id: None,
            priority: None,
            message: message.to_string(),
            description: None,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            custom_fields: serde_json::Map::new(),
            dedup_key: None,
        }
    }

    #[tokio::test]
    async fn identical_alerts_collapse_into_one_row() {
        let clock = test_support::manual_clock("2024-06-01T00:00:00Z");
        let state = test_support::state_with_clock(clock.clone()).await;
        let org = test_support::seed_org(&state, "acme").await;
        let (_sub, mut events) = state.bus.subscribe(&org, 16);

        let service = IngestService::new(&state);

        let (first, outcome) = service
            .ingest(&org, source_alert("CPU high", &["prod", "api"]))
            .await
            .unwrap();
        assert_eq!(outcome, IngestOutcome::Created);
        assert_eq!(first.dedup_count, 1);

        clock.advance(chrono::Duration::seconds(30));
        let (second, outcome) = service
            .ingest(&org, source_alert("CPU high", &["api", "prod"]))
            .await
            .unwrap();
        assert_eq!(outcome, IngestOutcome::Deduped);
        assert_eq!(second.id, first.id);
        assert_eq!(second.dedup_count, 2);
        assert!(second.last_occurrence_at > first.last_occurrence_at);

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM alerts")
            .fetch_one(&state.db)
            .await
            .unwrap();
        assert_eq!(total, 1);

        assert_eq!(events.recv().await.unwrap().event_type, "alert.created");
        assert_eq!(events.recv().await.unwrap().event_type, "alert.updated");
    }

    #[tokio::test]
    async fn closed_alerts_do_not_absorb_new_signals() {
        let clock = test_support::manual_clock("2024-06-01T00:00:00Z");
        let state = test_support::state_with_clock(clock).await;
        let org = test_support::seed_org(&state, "acme").await;
        let service = IngestService::new(&state);

        let (first, _) = service
            .ingest(&org, source_alert("disk full", &[]))
            .await
            .unwrap();
        crate::db::repository::AlertRepository::close(
            &state.db,
            &first.id,
            Some("done"),
            state.clock.now(),
        )
        .await
        .unwrap();

        let (second, outcome) = service
            .ingest(&org, source_alert("disk full", &[]))
            .await
            .unwrap();
        assert_eq!(outcome, IngestOutcome::Created);
        assert_ne!(second.id, first.id);
    }

    #[tokio::test]
    async fn suppression_rule_closes_alert_without_escalation() {
        let clock = test_support::manual_clock("2024-06-01T00:00:00Z");
        let state = test_support::state_with_clock(clock).await;
        let org = test_support::seed_org(&state, "acme").await;

        let rule = RoutingRuleRepository::create(
            &state.db,
            &org,
            CreateRoutingRule {
                name: "drop test alerts".to_string(),
                priority: 0,
                conditions: RuleConditions {
                    match_mode: ConditionMatch::Any,
                    conditions: vec![RuleCondition {
                        field: "tags".to_string(),
                        operator: ConditionOperator::Contains,
                        value: json!("test"),
                    }],
                },
                actions: RuleActions {
                    suppress: true,
                    ..Default::default()
                },
                enabled: true,
            },
        )
        .await
        .unwrap();

        let service = IngestService::new(&state);
        let (alert, outcome) = service
            .ingest(&org, source_alert("synthetic check", &["test"]))
            .await
            .unwrap();

        assert_eq!(outcome, IngestOutcome::Suppressed);
        assert_eq!(alert.status, "closed");
        let reason = alert.close_reason.unwrap();
        assert!(reason.contains("suppressed"));
        assert!(reason.contains(&rule.id));

        let events = EscalationEventRepository::list_for_alert(&state.db, &alert.id)
            .await
            .unwrap();
        assert!(events.is_empty());

        let logs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM notification_logs")
            .fetch_one(&state.db)
            .await
            .unwrap();
        assert_eq!(logs, 0);
    }

    #[tokio::test]
    async fn routing_actions_shape_the_new_alert() {
        let clock = test_support::manual_clock("2024-06-01T00:00:00Z");
        let state = test_support::state_with_clock(clock).await;
        let org = test_support::seed_org(&state, "acme").await;
        let user = test_support::seed_user(&state, &org, "oncall@acme.io").await;

        let policy = EscalationPolicyRepository::create(
            &state.db,
            &org,
            CreateEscalationPolicy {
                name: "standard".to_string(),
                description: None,
                repeat_enabled: false,
                repeat_count: None,
                rules: vec![CreateEscalationRule {
                    position: 0,
                    delay_minutes: 5,
                    targets: vec![CreateEscalationTarget {
                        kind: "user".to_string(),
                        target_id: user.clone(),
                        channels: None,
                        urgent: false,
                    }],
                }],
            },
        )
        .await
        .unwrap();

        RoutingRuleRepository::create(
            &state.db,
            &org,
            CreateRoutingRule {
                name: "prod pages".to_string(),
                priority: 0,
                conditions: RuleConditions {
                    match_mode: ConditionMatch::All,
                    conditions: vec![RuleCondition {
                        field: "tags".to_string(),
                        operator: ConditionOperator::Contains,
                        value: json!("prod"),
                    }],
                },
                actions: RuleActions {
                    set_priority: Some("P1".to_string()),
                    add_tags: vec!["routed".to_string()],
                    assign_user: Some(user.clone()),
                    escalation_policy: Some(policy.id.clone()),
                    ..Default::default()
                },
                enabled: true,
            },
        )
        .await
        .unwrap();

        let service = IngestService::new(&state);
        let (alert, outcome) = service
            .ingest(&org, source_alert("CPU high", &["prod"]))
            .await
            .unwrap();

        assert_eq!(outcome, IngestOutcome::Created);
        assert_eq!(alert.priority, "P1");
        assert_eq!(alert.assigned_user_id.as_deref(), Some(user.as_str()));
        assert_eq!(alert.escalation_policy_id.as_deref(), Some(policy.id.as_str()));
        assert!(alert.tag_list().contains(&"routed".to_string()));

        let event = EscalationEventRepository::find_active_for_alert(&state.db, &alert.id)
            .await
            .unwrap()
            .expect("escalation bootstrapped");
        assert_eq!(event.current_level, 0);
        assert_eq!(
            event.next_escalation_at.unwrap(),
            test_support::at("2024-06-01T00:05:00Z")
        );
    }
}
