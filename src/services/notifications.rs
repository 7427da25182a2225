use std::sync::Arc;

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use crate::db::models::{
    AlertPriority, CreateNotificationLog, NotificationChannel, NotificationLog, User,
};
use crate::db::repository::{
    DndSettingsRepository, NotificationChannelRepository, NotificationLogRepository,
};
use crate::error::{AppError, AppResult};
use crate::services::dnd;
use crate::AppState;

/// A resolved notification target: the user plus any per-escalation-target
/// channel restriction.
#[derive(Debug, Clone)]
pub struct Recipient {
    pub user: User,
    /// When set, only channels of these types are used for this recipient
    /// instead of every enabled org channel.
    pub channel_types: Option<Vec<String>>,
    pub urgent: bool,
}

impl Recipient {
    pub fn new(user: User) -> Self {
        Self {
            user,
            channel_types: None,
            urgent: false,
        }
    }
}

/// Capability set every concrete channel implements.
#[async_trait]
pub trait NotificationProvider: Send + Sync {
    async fn send(&self, recipient: &str, subject: Option<&str>, message: &str) -> AppResult<()>;
}

/// Validate an opaque channel config blob against its type-specific
/// schema. Called on channel create/update.
pub fn validate_channel_config(channel_type: &str, config: &serde_json::Value) -> AppResult<()> {
    match channel_type {
        "email" => {
            if let Some(from) = config.get("from") {
                let from = from
                    .as_str()
                    .ok_or_else(|| AppError::Validation("email.from must be a string".into()))?;
                from.parse::<Mailbox>()
                    .map_err(|e| AppError::Validation(format!("email.from invalid: {e}")))?;
            }
            Ok(())
        }
        "slack" | "teams" | "webhook" => {
            let url = config
                .get("url")
                .and_then(|u| u.as_str())
                .ok_or_else(|| AppError::Validation(format!("{channel_type}.url is required")))?;
            url::Url::parse(url)
                .map_err(|e| AppError::Validation(format!("{channel_type}.url invalid: {e}")))?;
            Ok(())
        }
        other => Err(AppError::Validation(format!(
            "unknown channel type {other:?}"
        ))),
    }
}

/// SMTP email delivery via lettre.
pub struct EmailProvider {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl EmailProvider {
    pub fn from_state(state: &AppState, config: &serde_json::Value) -> AppResult<Self> {
        let smtp = &state.config.smtp;
        let host = smtp
            .host
            .as_deref()
            .ok_or_else(|| AppError::Config("SMTP_HOST is not configured".to_string()))?;

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
            .map_err(|e| AppError::Config(format!("invalid SMTP relay: {e}")))?
            .port(smtp.port);
        if let (Some(user), Some(pass)) = (&smtp.username, &smtp.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        let from = config
            .get("from")
            .and_then(|f| f.as_str())
            .unwrap_or(&smtp.from_address)
            .parse::<Mailbox>()
            .map_err(|e| AppError::Config(format!("invalid from address: {e}")))?;

        Ok(Self {
            transport: builder.build(),
            from,
        })
    }
}

#[async_trait]
impl NotificationProvider for EmailProvider {
    async fn send(&self, recipient: &str, subject: Option<&str>, message: &str) -> AppResult<()> {
        let to = recipient
            .parse::<Mailbox>()
            .map_err(|e| AppError::Validation(format!("invalid recipient address: {e}")))?;

        let email = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(subject.unwrap_or("Pulsar notification"))
            .body(message.to_string())
            .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;

        self.transport
            .send(email)
            .await
            .map_err(|e| AppError::Upstream(format!("SMTP send failed: {e}")))?;

        Ok(())
    }
}

/// Slack incoming-webhook delivery.
pub struct SlackProvider {
    client: reqwest::Client,
    webhook_url: String,
}

#[async_trait]
impl NotificationProvider for SlackProvider {
    async fn send(&self, _recipient: &str, subject: Option<&str>, message: &str) -> AppResult<()> {
        let text = match subject {
            Some(subject) => format!("*{subject}*\n{message}"),
            None => message.to_string(),
        };

        let response = self
            .client
            .post(&self.webhook_url)
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AppError::Upstream(format!(
                "Slack webhook returned {}",
                response.status()
            )));
        }

        Ok(())
    }
}

/// Microsoft Teams connector delivery.
pub struct TeamsProvider {
    client: reqwest::Client,
    connector_url: String,
}

#[async_trait]
impl NotificationProvider for TeamsProvider {
    async fn send(&self, _recipient: &str, subject: Option<&str>, message: &str) -> AppResult<()> {
        let card = serde_json::json!({
            "@type": "MessageCard",
            "@context": "http://schema.org/extensions",
            "title": subject.unwrap_or("Pulsar notification"),
            "text": message,
        });

        let response = self.client.post(&self.connector_url).json(&card).send().await?;

        if !response.status().is_success() {
            return Err(AppError::Upstream(format!(
                "Teams connector returned {}",
                response.status()
            )));
        }

        Ok(())
    }
}

/// Generic POST delivery for bespoke receivers.
pub struct WebhookChannelProvider {
    client: reqwest::Client,
    url: String,
}

#[async_trait]
impl NotificationProvider for WebhookChannelProvider {
    async fn send(&self, recipient: &str, subject: Option<&str>, message: &str) -> AppResult<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({
                "recipient": recipient,
                "subject": subject,
                "message": message,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AppError::Upstream(format!(
                "webhook receiver returned {}",
                response.status()
            )));
        }

        Ok(())
    }
}

/// Build the provider for a stored channel row.
fn provider_for(
    state: &AppState,
    channel: &NotificationChannel,
) -> AppResult<Box<dyn NotificationProvider>> {
    let config: serde_json::Value = serde_json::from_str(&channel.config)
        .map_err(|e| AppError::Validation(format!("channel {} config invalid: {e}", channel.id)))?;

    match channel.channel_type.as_str() {
        "email" => Ok(Box::new(EmailProvider::from_state(state, &config)?)),
        "slack" => Ok(Box::new(SlackProvider {
            client: state.http.clone(),
            webhook_url: config
                .get("url")
                .and_then(|u| u.as_str())
                .ok_or_else(|| AppError::Validation("slack channel missing url".into()))?
                .to_string(),
        })),
        "teams" => Ok(Box::new(TeamsProvider {
            client: state.http.clone(),
            connector_url: config
                .get("url")
                .and_then(|u| u.as_str())
                .ok_or_else(|| AppError::Validation("teams channel missing url".into()))?
                .to_string(),
        })),
        "webhook" => Ok(Box::new(WebhookChannelProvider {
            client: state.http.clone(),
            url: config
                .get("url")
                .and_then(|u| u.as_str())
                .ok_or_else(|| AppError::Validation("webhook channel missing url".into()))?
                .to_string(),
        })),
        other => Err(AppError::Validation(format!("unknown channel type {other:?}"))),
    }
}

/// Fans one message out to recipients across the org's enabled channels,
/// applying DND per user and recording an audit log row per attempt.
pub struct NotificationDispatcher {
    state: Arc<AppState>,
}

impl NotificationDispatcher {
    pub fn new(state: &Arc<AppState>) -> Self {
        Self {
            state: state.clone(),
        }
    }

    /// Returns the settled log rows. Failures are isolated per recipient
    /// and channel; one broken channel never cancels the rest.
    pub async fn dispatch(
        &self,
        org_id: &str,
        recipients: &[Recipient],
        subject: Option<&str>,
        message: &str,
        priority: AlertPriority,
        alert_id: Option<&str>,
    ) -> AppResult<Vec<NotificationLog>> {
        let channels = NotificationChannelRepository::list_enabled(&self.state.db, org_id).await?;
        if channels.is_empty() {
            tracing::warn!(org = org_id, "No enabled notification channels");
            return Ok(Vec::new());
        }

        let now = self.state.clock.now();
        let mut logs = Vec::new();

        for recipient in recipients {
            if self.suppressed_by_dnd(recipient, priority, now).await? {
                tracing::debug!(
                    user = %recipient.user.id,
                    "Notification suppressed by DND"
                );
                continue;
            }

            let selected: Vec<&NotificationChannel> = match &recipient.channel_types {
                Some(types) => channels
                    .iter()
                    .filter(|c| types.iter().any(|t| t == &c.channel_type))
                    .collect(),
                None => channels.iter().collect(),
            };

            for channel in selected {
                let log = self
                    .send_one(org_id, recipient, channel, subject, message, alert_id)
                    .await;
                match log {
                    Ok(log) => logs.push(log),
                    Err(e) => {
                        tracing::warn!(
                            user = %recipient.user.id,
                            channel = %channel.id,
                            "Notification dispatch failed: {:?}",
                            e
                        );
                    }
                }
            }
        }

        Ok(logs)
    }

    async fn suppressed_by_dnd(
        &self,
        recipient: &Recipient,
        priority: AlertPriority,
        now: chrono::DateTime<chrono::Utc>,
    ) -> AppResult<bool> {
        let Some(settings) =
            DndSettingsRepository::get(&self.state.db, &recipient.user.id).await?
        else {
            return Ok(false);
        };

        Ok(dnd::is_suppressed(
            &settings,
            priority,
            now,
            &recipient.user.timezone,
        ))
    }

    async fn send_one(
        &self,
        org_id: &str,
        recipient: &Recipient,
        channel: &NotificationChannel,
        subject: Option<&str>,
        message: &str,
        alert_id: Option<&str>,
    ) -> AppResult<NotificationLog> {
        let log = NotificationLogRepository::create_pending(
            &self.state.db,
            CreateNotificationLog {
                organization_id: org_id.to_string(),
                channel_id: Some(channel.id.clone()),
                user_id: Some(recipient.user.id.clone()),
                alert_id: alert_id.map(|a| a.to_string()),
                recipient: recipient.user.email.clone(),
                subject: subject.map(|s| s.to_string()),
                message: message.to_string(),
            },
        )
        .await?;

        let result = match provider_for(&self.state, channel) {
            Ok(provider) => provider.send(&recipient.user.email, subject, message).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                let sent_at = self.state.clock.now();
                NotificationLogRepository::mark_sent(&self.state.db, &log.id, sent_at).await?;
                Ok(NotificationLog {
                    status: "sent".to_string(),
                    sent_at: Some(sent_at),
                    ..log
                })
            }
            Err(e) => {
                let error = e.to_string();
                NotificationLogRepository::mark_failed(&self.state.db, &log.id, &error).await?;
                Ok(NotificationLog {
                    status: "failed".to_string(),
                    error: Some(error),
                    ..log
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn slack_config_requires_url() {
        assert!(validate_channel_config("slack", &json!({})).is_err());
        assert!(validate_channel_config("slack", &json!({"url": "not a url"})).is_err());
        assert!(
            validate_channel_config("slack", &json!({"url": "https://hooks.slack.com/T/B/x"}))
                .is_ok()
        );
    }

    #[test]
    fn email_config_accepts_empty_and_validates_from() {
        assert!(validate_channel_config("email", &json!({})).is_ok());
        assert!(validate_channel_config("email", &json!({"from": "oncall@example.com"})).is_ok());
        assert!(validate_channel_config("email", &json!({"from": "not-an-address"})).is_err());
    }

    #[test]
    fn unknown_channel_type_is_rejected() {
        assert!(validate_channel_config("pager", &json!({})).is_err());
    }
}

#[cfg(test)]
mod dispatch_tests {
    use super::*;
    use crate::db::models::{CreateNotificationChannel, DndSchedule, DndSlot, UpsertDndSettings};
    use crate::db::repository::UserRepository;
    use crate::test_support;
    use serde_json::json;

    async fn setup(clock_at: &str) -> (std::sync::Arc<crate::AppState>, String, Recipient) {
        let clock = test_support::manual_clock(clock_at);
        let state = test_support::state_with_clock(clock).await;
        let org = test_support::seed_org(&state, "acme").await;
        let user_id = test_support::seed_user(&state, &org, "night-owl@acme.io").await;

        // Shift the user into New York so local quiet hours apply.
        sqlx::query("UPDATE users SET timezone = 'America/New_York' WHERE id = ?")
            .bind(&user_id)
            .execute(&state.db)
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

        // Mon-Fri 22:00-08:00 quiet hours with the P1 escape hatch.
        DndSettingsRepository::upsert(
            &state.db,
            &user_id,
            UpsertDndSettings {
                enabled: true,
                schedule: DndSchedule {
                    timezone: None,
                    slots: (1..=5)
                        .map(|day| DndSlot {
                            day,
                            start: "22:00".to_string(),
                            end: "08:00".to_string(),
                        })
                        .collect(),
                },
                overrides: vec![],
                allow_p1_override: true,
            },
        )
        .await
        .unwrap();

        let user = UserRepository::find_by_id(&state.db, &user_id)
            .await
            .unwrap()
            .unwrap();

        (state, org, Recipient::new(user))
    }

    #[tokio::test]
    async fn quiet_hours_suppress_p3_but_not_p1() {
        // 2024-06-04T03:00-04:00 local = 07:00 UTC, inside Mon night's window.
        let (state, org, recipient) = setup("2024-06-04T07:00:00Z").await;
        let dispatcher = NotificationDispatcher::new(&state);

        let logs = dispatcher
            .dispatch(
                &org,
                std::slice::from_ref(&recipient),
                Some("[P3] CPU high"),
                "CPU high",
                AlertPriority::P3,
                None,
            )
            .await
            .unwrap();
        assert!(logs.is_empty());

        let logs = dispatcher
            .dispatch(
                &org,
                std::slice::from_ref(&recipient),
                Some("[P1] CPU high"),
                "CPU high",
                AlertPriority::P1,
                None,
            )
            .await
            .unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, "sent");
        assert!(logs[0].sent_at.is_some());
    }

    #[tokio::test]
    async fn daytime_notifications_flow_normally() {
        // 12:00 local on Tuesday.
        let (state, org, recipient) = setup("2024-06-04T16:00:00Z").await;
        let dispatcher = NotificationDispatcher::new(&state);

        let logs = dispatcher
            .dispatch(
                &org,
                std::slice::from_ref(&recipient),
                None,
                "CPU high",
                AlertPriority::P3,
                None,
            )
            .await
            .unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, "sent");
    }

    #[tokio::test]
    async fn channel_type_override_restricts_fanout() {
        let (state, org, mut recipient) = setup("2024-06-04T16:00:00Z").await;
        // The org only has a webhook channel; restricting the recipient
        // to email must therefore produce nothing.
        recipient.channel_types = Some(vec!["email".to_string()]);

        let logs = NotificationDispatcher::new(&state)
            .dispatch(
                &org,
                std::slice::from_ref(&recipient),
                None,
                "CPU high",
                AlertPriority::P3,
                None,
            )
            .await
            .unwrap();
        assert!(logs.is_empty());
    }

    #[tokio::test]
    async fn provider_failure_is_recorded_not_propagated() {
        let (state, org, recipient) = setup("2024-06-04T16:00:00Z").await;

        // Add a second channel whose receiver always errors.
        let broken = test_support::spawn_receiver(vec![500]).await;
        NotificationChannelRepository::create(
            &state.db,
            &org,
            CreateNotificationChannel {
                channel_type: "webhook".to_string(),
                name: "broken pager".to_string(),
                config: json!({"url": broken.url}),
                enabled: true,
            },
        )
        .await
        .unwrap();

        let logs = NotificationDispatcher::new(&state)
            .dispatch(
                &org,
                std::slice::from_ref(&recipient),
                None,
                "CPU high",
                AlertPriority::P3,
                None,
            )
            .await
            .unwrap();

        // Both channels produced a settled log row.
        assert_eq!(logs.len(), 2);
        assert!(logs.iter().any(|l| l.status == "sent"));
        let failed: Vec<_> = logs.iter().filter(|l| l.status == "failed").collect();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].error.as_deref().unwrap_or("").contains("500"));
    }
}
