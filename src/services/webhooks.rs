use std::sync::Arc;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::value::RawValue;
use sha2::Sha256;

use crate::db::models::{WebhookDelivery, WebhookEndpoint};
use crate::db::repository::{WebhookDeliveryRepository, WebhookEndpointRepository};
use crate::error::{AppError, AppResult};
use crate::services::events::Event;
use crate::AppState;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Pulsar-Signature";
pub const EVENT_HEADER: &str = "X-Pulsar-Event";
pub const DELIVERY_HEADER: &str = "X-Pulsar-Delivery";

/// Canonical outgoing envelope. Field order here is the wire order.
#[derive(Debug, Serialize)]
struct Envelope<'a> {
    event_type: &'a str,
    event_id: &'a str,
    organization_id: &'a str,
    timestamp: String,
    data: &'a RawValue,
}

/// Render the envelope body for one delivery. The stored payload is
/// embedded verbatim so re-rendering yields byte-identical output.
pub fn render_envelope(
    event_type: &str,
    event_id: &str,
    organization_id: &str,
    timestamp: DateTime<Utc>,
    payload: &str,
) -> AppResult<String> {
    let data = RawValue::from_string(payload.to_string())
        .map_err(|e| AppError::Validation(format!("stored payload is not JSON: {e}")))?;

    let envelope = Envelope {
        event_type,
        event_id,
        organization_id,
        timestamp: timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
        data: &data,
    };

    serde_json::to_string(&envelope).map_err(|e| AppError::Internal(anyhow::anyhow!(e)))
}

/// Hex HMAC-SHA256 of the body under the endpoint secret.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Outcome classification for one HTTP attempt.
enum AttemptOutcome {
    Success {
        code: i64,
        body: String,
    },
    /// 4xx other than 408/429: retrying cannot help.
    Permanent {
        code: i64,
        body: String,
        error: String,
    },
    /// Network errors, 5xx, 408, 429.
    Transient {
        code: Option<i64>,
        body: Option<String>,
        error: String,
    },
}

/// Background webhook delivery: sweeps due jobs, signs and posts the
/// envelope, schedules exponential-backoff retries.
pub struct WebhookDeliverer {
    state: Arc<AppState>,
}

impl WebhookDeliverer {
    pub fn new(state: &Arc<AppState>) -> Self {
        Self {
            state: state.clone(),
        }
    }

    /// One sweep. Per-delivery failures never abort the batch.
    pub async fn run_tick(&self) -> AppResult<usize> {
        let now = self.state.clock.now();
        let due = WebhookDeliveryRepository::fetch_due(
            &self.state.db,
            now,
            self.state.config.webhook_delivery.batch_size,
        )
        .await?;

        let mut attempted = 0;
        for delivery in due {
            if let Err(e) = self.attempt(&delivery).await {
                tracing::warn!(delivery = %delivery.id, "Webhook attempt errored: {:?}", e);
            }
            attempted += 1;
        }

        Ok(attempted)
    }

    async fn attempt(&self, delivery: &WebhookDelivery) -> AppResult<()> {
        let now = self.state.clock.now();
        let attempts = delivery.attempts + 1;

        let Some(endpoint) =
            WebhookEndpointRepository::find_by_id(&self.state.db, &delivery.endpoint_id).await?
        else {
            WebhookDeliveryRepository::record_failure(
                &self.state.db,
                &delivery.id,
                attempts,
                None,
                None,
                None,
                "endpoint deleted",
                now,
            )
            .await?;
            return Ok(());
        };

        if !endpoint.enabled {
            WebhookDeliveryRepository::record_failure(
                &self.state.db,
                &delivery.id,
                attempts,
                None,
                None,
                None,
                "endpoint disabled",
                now,
            )
            .await?;
            return Ok(());
        }

        let body = render_envelope(
            &delivery.event_type,
            &delivery.event_id,
            &delivery.organization_id,
            delivery.created_at,
            &delivery.payload,
        )?;

        let outcome = self.post(&endpoint, delivery, body.as_bytes()).await;
        let limit = self.state.config.webhook_delivery.response_body_limit;

        match outcome {
            AttemptOutcome::Success { code, body } => {
                WebhookDeliveryRepository::record_success(
                    &self.state.db,
                    &delivery.id,
                    attempts,
                    code,
                    &truncate(&body, limit),
                    now,
                )
                .await?;
                tracing::info!(delivery = %delivery.id, attempts, "Webhook delivered");
            }
            AttemptOutcome::Permanent { code, body, error } => {
                let truncated = truncate(&body, limit);
                WebhookDeliveryRepository::record_failure(
                    &self.state.db,
                    &delivery.id,
                    attempts,
                    None,
                    Some(code),
                    Some(truncated.as_str()),
                    &error,
                    now,
                )
                .await?;
                tracing::warn!(delivery = %delivery.id, code, "Webhook failed permanently");
            }
            AttemptOutcome::Transient { code, body, error } => {
                let next_retry_at = if attempts <= endpoint.max_retries {
                    Some(now + backoff(&endpoint, attempts, self.state.config.webhook_delivery.max_backoff_seconds))
                } else {
                    // attempts == max_retries + 1: the budget is spent.
                    None
                };

                let truncated = body.map(|b| truncate(&b, limit));
                WebhookDeliveryRepository::record_failure(
                    &self.state.db,
                    &delivery.id,
                    attempts,
                    next_retry_at,
                    code,
                    truncated.as_deref(),
                    &error,
                    now,
                )
                .await?;

                match next_retry_at {
                    Some(at) => tracing::info!(
                        delivery = %delivery.id,
                        attempts,
                        retry_at = %at,
                        "Webhook attempt failed, retry scheduled"
                    ),
                    None => tracing::warn!(
                        delivery = %delivery.id,
                        attempts,
                        "Webhook retries exhausted"
                    ),
                }
            }
        }

        Ok(())
    }

    async fn post(
        &self,
        endpoint: &WebhookEndpoint,
        delivery: &WebhookDelivery,
        body: &[u8],
    ) -> AttemptOutcome {
        let signature = sign(&endpoint.secret, body);

        let mut request = self
            .state
            .http
            .post(&endpoint.url)
            .timeout(std::time::Duration::from_secs(
                endpoint.timeout_seconds.max(1) as u64,
            ))
            .header("Content-Type", "application/json")
            .header(SIGNATURE_HEADER, format!("sha256={signature}"))
            .header(EVENT_HEADER, &delivery.event_type)
            .header(DELIVERY_HEADER, &delivery.id);

        // Custom headers never override the reserved ones.
        for (name, value) in endpoint.header_map() {
            if is_reserved_header(&name) {
                continue;
            }
            request = request.header(name, value);
        }

        let response = match request.body(body.to_vec()).send().await {
            Ok(r) => r,
            Err(e) => {
                return AttemptOutcome::Transient {
                    code: None,
                    body: None,
                    error: format!("request failed: {e}"),
                }
            }
        };

        let status = response.status();
        let code = status.as_u16() as i64;
        let text = response.text().await.unwrap_or_default();

        if status.is_success() {
            AttemptOutcome::Success { code, body: text }
        } else if status.is_client_error() && code != 408 && code != 429 {
            AttemptOutcome::Permanent {
                code,
                body: text,
                error: format!("endpoint returned {code}"),
            }
        } else {
            AttemptOutcome::Transient {
                code: Some(code),
                body: Some(text),
                error: format!("endpoint returned {code}"),
            }
        }
    }
}

/// Exponential backoff: retry_delay * 2^(attempts-1), capped.
fn backoff(endpoint: &WebhookEndpoint, attempts: i64, cap_seconds: i64) -> Duration {
    let exponent = (attempts - 1).clamp(0, 30) as u32;
    let seconds = endpoint
        .retry_delay_seconds
        .saturating_mul(1i64 << exponent)
        .min(cap_seconds);
    Duration::seconds(seconds)
}

fn is_reserved_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("content-type")
        || name.eq_ignore_ascii_case(SIGNATURE_HEADER)
        || name.eq_ignore_ascii_case(EVENT_HEADER)
        || name.eq_ignore_ascii_case(DELIVERY_HEADER)
}

fn truncate(s: &str, limit: usize) -> String {
    if s.len() <= limit {
        return s.to_string();
    }
    let mut end = limit;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// Consumes the event-bus tap and creates one pending delivery per
/// endpoint whose filter wants the event.
pub struct WebhookEnqueuer {
    state: Arc<AppState>,
}

impl WebhookEnqueuer {
    pub fn new(state: &Arc<AppState>) -> Self {
        Self {
            state: state.clone(),
        }
    }

    pub async fn enqueue(&self, event: &Event) -> AppResult<usize> {
        let endpoints = WebhookEndpointRepository::list_enabled_for_org(
            &self.state.db,
            &event.organization_id,
        )
        .await?;

        let payload = event.payload.to_string();
        let mut enqueued = 0;

        for endpoint in endpoints {
            if !endpoint.accepts(&event.event_type) {
                continue;
            }
            WebhookDeliveryRepository::create_pending(
                &self.state.db,
                &endpoint.id,
                &event.organization_id,
                &event.event_type,
                &event.id,
                &payload,
            )
            .await?;
            enqueued += 1;
        }

        Ok(enqueued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn envelope_field_order_is_canonical() {
        let ts = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let body = render_envelope(
            "alert.created",
            "evt-1",
            "org-1",
            ts,
            r#"{"b":1,"a":2}"#,
        )
        .unwrap();

        assert_eq!(
            body,
            r#"{"event_type":"alert.created","event_id":"evt-1","organization_id":"org-1","timestamp":"2024-06-01T12:00:00.000000000Z","data":{"b":1,"a":2}}"#
        );
    }

    #[test]
    fn envelope_rendering_is_byte_stable() {
        let ts = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let payload = r#"{"z":"last","a":"first","nested":{"y":1,"b":2}}"#;

        let one = render_envelope("alert.updated", "e", "o", ts, payload).unwrap();
        let two = render_envelope("alert.updated", "e", "o", ts, payload).unwrap();
        assert_eq!(one, two);
        // The stored payload is embedded verbatim, key order untouched.
        assert!(one.contains(payload));
    }

    #[test]
    fn signature_matches_known_vector() {
        // echo -n 'hello' | openssl dgst -sha256 -hmac 'secret'
        assert_eq!(
            sign("secret", b"hello"),
            "88aab3ede8d3adf94d26ab90d3bafd4a2083070c3bcce9c014ee04a443847c0b"
        );
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let endpoint = endpoint_with(60);

        assert_eq!(backoff(&endpoint, 1, 3600), Duration::seconds(60));
        assert_eq!(backoff(&endpoint, 2, 3600), Duration::seconds(120));
        assert_eq!(backoff(&endpoint, 3, 3600), Duration::seconds(240));
        assert_eq!(backoff(&endpoint, 10, 3600), Duration::seconds(3600));
    }

    #[test]
    fn reserved_headers_cannot_be_overridden() {
        assert!(is_reserved_header("content-type"));
        assert!(is_reserved_header("X-PULSAR-SIGNATURE"));
        assert!(is_reserved_header("x-pulsar-event"));
        assert!(is_reserved_header("x-pulsar-delivery"));
        assert!(!is_reserved_header("x-custom"));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("hello", 3), "hel");
        // Multi-byte character straddling the limit is dropped whole.
        assert_eq!(truncate("héllo", 2), "h");
    }

    fn endpoint_with(retry_delay: i64) -> WebhookEndpoint {
        let now = Utc::now();
        WebhookEndpoint {
            id: "ep".to_string(),
            organization_id: "org".to_string(),
            name: "test".to_string(),
            url: "https://example.com/hook".to_string(),
            secret: "s".to_string(),
            enabled: true,
            on_alert_created: true,
            on_alert_updated: true,
            on_alert_acknowledged: true,
            on_alert_closed: true,
            on_alert_escalated: true,
            on_incident_events: false,
            headers: "{}".to_string(),
            timeout_seconds: 10,
            max_retries: 3,
            retry_delay_seconds: retry_delay,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn event_filter_flags_gate_event_types() {
        let mut endpoint = endpoint_with(60);
        endpoint.on_alert_created = false;

        assert!(!endpoint.accepts("alert.created"));
        assert!(endpoint.accepts("alert.closed"));
        assert!(!endpoint.accepts("incident.created"));

        endpoint.on_incident_events = true;
        assert!(endpoint.accepts("incident.timeline_added"));
        assert!(!endpoint.accepts("unknown.event"));
    }
}

#[cfg(test)]
mod delivery_tests {
    use super::*;
    use crate::db::models::CreateWebhookEndpoint;
    use crate::test_support;
    use serde_json::json;

    async fn make_endpoint(
        state: &crate::AppState,
        org: &str,
        url: &str,
        max_retries: i64,
    ) -> WebhookEndpoint {
        WebhookEndpointRepository::create(
            &state.db,
            org,
            "endpoint-secret".to_string(),
            CreateWebhookEndpoint {
                name: "receiver".to_string(),
                url: url.to_string(),
                enabled: true,
                on_alert_created: true,
                on_alert_updated: true,
                on_alert_acknowledged: true,
                on_alert_closed: true,
                on_alert_escalated: true,
                on_incident_events: false,
                headers: std::collections::HashMap::new(),
                timeout_seconds: 5,
                max_retries,
                retry_delay_seconds: 60,
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn transient_failures_back_off_until_success() {
        let clock = test_support::manual_clock("2024-06-01T00:00:00Z");
        let state = test_support::state_with_clock(clock.clone()).await;
        let org = test_support::seed_org(&state, "acme").await;

        let receiver = test_support::spawn_receiver(vec![500, 500, 200]).await;
        let endpoint = make_endpoint(&state, &org, &receiver.url, 2).await;

        let delivery = WebhookDeliveryRepository::create_pending(
            &state.db,
            &endpoint.id,
            &org,
            "alert.created",
            "evt-1",
            r#"{"id":"a1"}"#,
        )
        .await
        .unwrap();

        let deliverer = WebhookDeliverer::new(&state);

        // Attempt 1: 500, schedule retry at +60s.
        deliverer.run_tick().await.unwrap();
        let row = fetch(&state, &delivery.id).await;
        assert_eq!(row.status, "pending");
        assert_eq!(row.attempts, 1);
        assert_eq!(
            row.next_retry_at.unwrap(),
            test_support::at("2024-06-01T00:01:00Z")
        );

        // Not due yet: the sweep leaves it alone.
        clock.advance(Duration::seconds(30));
        deliverer.run_tick().await.unwrap();
        assert_eq!(fetch(&state, &delivery.id).await.attempts, 1);

        // Attempt 2: 500 again, backoff doubles to 120s.
        clock.advance(Duration::seconds(30));
        deliverer.run_tick().await.unwrap();
        let row = fetch(&state, &delivery.id).await;
        assert_eq!(row.attempts, 2);
        assert_eq!(
            row.next_retry_at.unwrap(),
            test_support::at("2024-06-01T00:03:00Z")
        );

        // Attempt 3: 200, terminal success.
        clock.advance(Duration::seconds(120));
        deliverer.run_tick().await.unwrap();
        let row = fetch(&state, &delivery.id).await;
        assert_eq!(row.status, "success");
        assert_eq!(row.attempts, 3);
        assert_eq!(row.response_code, Some(200));
        assert_eq!(receiver.hits.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn attempts_never_exceed_the_retry_budget() {
        let clock = test_support::manual_clock("2024-06-01T00:00:00Z");
        let state = test_support::state_with_clock(clock.clone()).await;
        let org = test_support::seed_org(&state, "acme").await;

        let receiver = test_support::spawn_receiver(vec![500]).await;
        let endpoint = make_endpoint(&state, &org, &receiver.url, 1).await;

        let delivery = WebhookDeliveryRepository::create_pending(
            &state.db,
            &endpoint.id,
            &org,
            "alert.created",
            "evt-1",
            r#"{"id":"a1"}"#,
        )
        .await
        .unwrap();

        let deliverer = WebhookDeliverer::new(&state);
        for _ in 0..5 {
            deliverer.run_tick().await.unwrap();
            clock.advance(Duration::seconds(3600));
        }

        let row = fetch(&state, &delivery.id).await;
        assert_eq!(row.status, "failed");
        // max_retries = 1 allows exactly two attempts.
        assert_eq!(row.attempts, 2);
        assert_eq!(receiver.hits.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn client_errors_fail_without_retry() {
        let clock = test_support::manual_clock("2024-06-01T00:00:00Z");
        let state = test_support::state_with_clock(clock).await;
        let org = test_support::seed_org(&state, "acme").await;

        let receiver = test_support::spawn_receiver(vec![404]).await;
        let endpoint = make_endpoint(&state, &org, &receiver.url, 5).await;

        let delivery = WebhookDeliveryRepository::create_pending(
            &state.db,
            &endpoint.id,
            &org,
            "alert.created",
            "evt-1",
            r#"{"id":"a1"}"#,
        )
        .await
        .unwrap();

        WebhookDeliverer::new(&state).run_tick().await.unwrap();

        let row = fetch(&state, &delivery.id).await;
        assert_eq!(row.status, "failed");
        assert_eq!(row.attempts, 1);
        assert!(row.next_retry_at.is_none());
    }

    #[tokio::test]
    async fn enqueuer_fans_out_only_to_matching_endpoints() {
        let clock = test_support::manual_clock("2024-06-01T00:00:00Z");
        let state = test_support::state_with_clock(clock).await;
        let org = test_support::seed_org(&state, "acme").await;

        let receiver = test_support::spawn_receiver(vec![200]).await;
        let wants_alerts = make_endpoint(&state, &org, &receiver.url, 1).await;

        // Second endpoint only cares about incidents.
        let incidents_only = WebhookEndpointRepository::create(
            &state.db,
            &org,
            "secret-2".to_string(),
            CreateWebhookEndpoint {
                name: "incident feed".to_string(),
                url: receiver.url.clone(),
                enabled: true,
                on_alert_created: false,
                on_alert_updated: false,
                on_alert_acknowledged: false,
                on_alert_closed: false,
                on_alert_escalated: false,
                on_incident_events: true,
                headers: std::collections::HashMap::new(),
                timeout_seconds: 5,
                max_retries: 1,
                retry_delay_seconds: 60,
            },
        )
        .await
        .unwrap();

        let enqueuer = WebhookEnqueuer::new(&state);
        let created = enqueuer
            .enqueue(&Event::new("alert.created", &org, json!({"id": "a1"})))
            .await
            .unwrap();
        assert_eq!(created, 1);

        let alert_jobs =
            WebhookDeliveryRepository::list_for_endpoint(&state.db, &wants_alerts.id, 10, 0)
                .await
                .unwrap();
        assert_eq!(alert_jobs.len(), 1);
        assert_eq!(alert_jobs[0].event_type, "alert.created");

        let incident_jobs =
            WebhookDeliveryRepository::list_for_endpoint(&state.db, &incidents_only.id, 10, 0)
                .await
                .unwrap();
        assert!(incident_jobs.is_empty());
    }

    async fn fetch(state: &crate::AppState, id: &str) -> WebhookDelivery {
        sqlx::query_as::<_, WebhookDelivery>(
            "SELECT id, endpoint_id, organization_id, event_type, event_id, payload, status, \
             attempts, last_attempt_at, next_retry_at, response_code, response_body, error, \
             created_at, updated_at FROM webhook_deliveries WHERE id = ?",
        )
        .bind(id)
        .fetch_one(&state.db)
        .await
        .unwrap()
    }
}
