pub mod alert;
pub mod api_key;
pub mod dnd;
pub mod escalation;
pub mod incident;
pub mod notification;
pub mod organization;
pub mod routing_rule;
pub mod schedule;
pub mod user;
pub mod webhook;

pub use alert::AlertRepository;
pub use api_key::ApiKeyRepository;
pub use dnd::DndSettingsRepository;
pub use escalation::{EscalationEventRepository, EscalationPolicyRepository};
pub use incident::IncidentRepository;
pub use notification::{NotificationChannelRepository, NotificationLogRepository};
pub use organization::OrganizationRepository;
pub use routing_rule::RoutingRuleRepository;
pub use schedule::ScheduleRepository;
pub use user::{TeamRepository, UserRepository};
pub use webhook::{IncomingTokenRepository, WebhookDeliveryRepository, WebhookEndpointRepository};
