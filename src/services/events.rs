use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

/// A typed event on the per-tenant bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub event_type: String,
    pub organization_id: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn new(event_type: &str, organization_id: &str, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type: event_type.to_string(),
            organization_id: organization_id.to_string(),
            payload,
            created_at: Utc::now(),
        }
    }
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Event>,
}

/// In-process broadcast bus, one subscriber set per organization.
///
/// Publishing never blocks: each subscriber gets a bounded channel and
/// messages to a full channel are dropped for that subscriber only.
/// An optional tap receives every event regardless of tenant; the
/// webhook enqueuer consumes it.
pub struct EventBus {
    subscribers: Mutex<HashMap<String, Vec<Subscriber>>>,
    tap: Mutex<Option<mpsc::UnboundedSender<Event>>>,
    next_id: AtomicU64,
}

/// Handle returned by [`EventBus::subscribe`]; used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberId(u64);

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            tap: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a subscriber for one organization's events with the given
    /// channel capacity.
    pub fn subscribe(&self, org_id: &str, capacity: usize) -> (SubscriberId, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers
            .entry(org_id.to_string())
            .or_default()
            .push(Subscriber { id, tx });

        (SubscriberId(id), rx)
    }

    pub fn unsubscribe(&self, org_id: &str, id: SubscriberId) {
        let mut subscribers = self.subscribers.lock().unwrap();
        if let Some(list) = subscribers.get_mut(org_id) {
            list.retain(|s| s.id != id.0);
            if list.is_empty() {
                subscribers.remove(org_id);
            }
        }
    }

    /// Wire up the global tap. Called once by the orchestrator before the
    /// webhook enqueuer starts.
    pub fn set_tap(&self, tx: mpsc::UnboundedSender<Event>) {
        *self.tap.lock().unwrap() = Some(tx);
    }

    /// Broadcast to the organization's subscribers and the tap. Slow
    /// subscribers lose messages; closed ones are pruned.
    pub fn publish(&self, event: Event) {
        if let Some(tap) = self.tap.lock().unwrap().as_ref() {
            // The tap is unbounded; a send only fails once the consumer
            // is gone (shutdown).
            let _ = tap.send(event.clone());
        }

        let mut subscribers = self.subscribers.lock().unwrap();
        let Some(list) = subscribers.get_mut(&event.organization_id) else {
            return;
        };

        list.retain(|s| match s.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!(
                    subscriber = s.id,
                    event_type = %event.event_type,
                    "Dropping event for slow subscriber"
                );
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });

        if list.is_empty() {
            subscribers.remove(&event.organization_id);
        }
    }

    #[cfg(test)]
    pub fn subscriber_count(&self, org_id: &str) -> usize {
        self.subscribers
            .lock()
            .unwrap()
            .get(org_id)
            .map(|l| l.len())
            .unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

pub mod event_types {
    pub const ALERT_CREATED: &str = "alert.created";
    pub const ALERT_UPDATED: &str = "alert.updated";
    pub const ALERT_DELETED: &str = "alert.deleted";
    pub const ALERT_ACKNOWLEDGED: &str = "alert.acknowledged";
    pub const ALERT_CLOSED: &str = "alert.closed";
    pub const ALERT_ESCALATED: &str = "alert.escalated";

    pub const INCIDENT_CREATED: &str = "incident.created";
    pub const INCIDENT_UPDATED: &str = "incident.updated";
    pub const INCIDENT_DELETED: &str = "incident.deleted";
    pub const INCIDENT_TIMELINE_ADDED: &str = "incident.timeline_added";
    pub const INCIDENT_RESPONDER_ADDED: &str = "incident.responder_added";
    pub const INCIDENT_RESPONDER_REMOVED: &str = "incident.responder_removed";
    pub const INCIDENT_ALERT_LINKED: &str = "incident.alert_linked";
    pub const INCIDENT_ALERT_UNLINKED: &str = "incident.alert_unlinked";
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscriber_receives_only_its_org() {
        let bus = EventBus::new();
        let (_id_a, mut rx_a) = bus.subscribe("org-a", 8);
        let (_id_b, mut rx_b) = bus.subscribe("org-b", 8);

        bus.publish(Event::new("alert.created", "org-a", json!({"n": 1})));

        let got = rx_a.recv().await.unwrap();
        assert_eq!(got.organization_id, "org-a");
        assert_eq!(got.event_type, "alert.created");

        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_subscriber_drops_messages_without_blocking() {
        let bus = EventBus::new();
        let (_id, mut rx) = bus.subscribe("org", 2);

        for n in 0..5 {
            bus.publish(Event::new("alert.updated", "org", json!({"n": n})));
        }

        // Only the first two fit; publish never blocked.
        assert_eq!(rx.recv().await.unwrap().payload["n"], 0);
        assert_eq!(rx.recv().await.unwrap().payload["n"], 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_subscribers_are_pruned() {
        let bus = EventBus::new();
        let (_id, rx) = bus.subscribe("org", 2);
        drop(rx);

        bus.publish(Event::new("alert.created", "org", json!({})));
        assert_eq!(bus.subscriber_count("org"), 0);
    }

    #[tokio::test]
    async fn unsubscribe_removes_only_that_subscriber() {
        let bus = EventBus::new();
        let (id_one, _rx_one) = bus.subscribe("org", 2);
        let (_id_two, _rx_two) = bus.subscribe("org", 2);

        bus.unsubscribe("org", id_one);
        assert_eq!(bus.subscriber_count("org"), 1);
    }

    #[tokio::test]
    async fn tap_sees_every_org() {
        let bus = EventBus::new();
        let (tap_tx, mut tap_rx) = mpsc::unbounded_channel();
        bus.set_tap(tap_tx);

        bus.publish(Event::new("alert.created", "org-a", json!({})));
        bus.publish(Event::new("incident.created", "org-b", json!({})));

        assert_eq!(tap_rx.recv().await.unwrap().organization_id, "org-a");
        assert_eq!(tap_rx.recv().await.unwrap().organization_id, "org-b");
    }
}
