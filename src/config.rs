use std::env;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub jwt: JwtConfig,
    pub rate_limit: RateLimitConfig,
    pub escalation: EscalationConfig,
    pub webhook_delivery: WebhookDeliveryConfig,
    pub smtp: SmtpConfig,
    pub event_bus: EventBusConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub frontend_url: String,
    /// Grace period (seconds) granted to background workers on shutdown
    /// before their tasks are aborted.
    pub shutdown_grace_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub expiration_hours: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Allowed requests per second (per IP) for the public ingest endpoint (/webhook/{token})
    pub ingest_per_second: u32,
    /// Burst size for the public ingest endpoint
    pub ingest_burst: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EscalationConfig {
    /// Whether the escalation scheduler worker is enabled.
    pub enabled: bool,
    /// How often (seconds) the scheduler sweeps for due escalation events.
    pub tick_seconds: u64,
    /// Maximum due events processed per sweep, bounded to avoid pool exhaustion.
    pub batch_size: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookDeliveryConfig {
    /// Whether the webhook delivery worker is enabled.
    pub enabled: bool,
    /// How often (seconds) the worker sweeps for due deliveries.
    pub tick_seconds: u64,
    /// Maximum deliveries attempted per sweep.
    pub batch_size: i64,
    /// Upper bound (seconds) for exponential retry backoff.
    pub max_backoff_seconds: i64,
    /// Maximum bytes of the endpoint response body retained on a delivery row.
    pub response_body_limit: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    pub host: Option<String>,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from_address: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventBusConfig {
    /// Default per-subscriber channel capacity when a client does not request one.
    pub default_capacity: usize,
    /// Interval (seconds) between connection pings on /ws.
    pub ping_interval_seconds: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        Ok(Config {
            server: ServerConfig {
                host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env::var("PORT")
                    .unwrap_or_else(|_| "8080".to_string())
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue("PORT".to_string()))?,
                frontend_url: env::var("FRONTEND_URL")
                    .unwrap_or_else(|_| "http://localhost:3000".to_string()),
                shutdown_grace_seconds: env::var("SHUTDOWN_GRACE_SECONDS")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .unwrap_or(5),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite://data/pulsar.db".to_string()),
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .unwrap_or(5),
            },
            jwt: JwtConfig {
                secret: env::var("JWT_SECRET")
                    .map_err(|_| ConfigError::MissingEnv("JWT_SECRET".to_string()))?,
                expiration_hours: env::var("JWT_EXPIRATION_HOURS")
                    .unwrap_or_else(|_| "24".to_string())
                    .parse()
                    .unwrap_or(24),
            },
            rate_limit: RateLimitConfig {
                ingest_per_second: env::var("RATE_LIMIT_INGEST_PER_SECOND")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()
                    .unwrap_or(10),
                ingest_burst: env::var("RATE_LIMIT_INGEST_BURST")
                    .unwrap_or_else(|_| "50".to_string())
                    .parse()
                    .unwrap_or(50),
            },
            escalation: EscalationConfig {
                enabled: parse_bool(env::var("ESCALATION_WORKER_ENABLED").ok(), true),
                tick_seconds: env::var("ESCALATION_TICK_SECONDS")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()
                    .unwrap_or(30),
                batch_size: env::var("ESCALATION_BATCH_SIZE")
                    .unwrap_or_else(|_| "100".to_string())
                    .parse()
                    .unwrap_or(100),
            },
            webhook_delivery: WebhookDeliveryConfig {
                enabled: parse_bool(env::var("WEBHOOK_WORKER_ENABLED").ok(), true),
                tick_seconds: env::var("WEBHOOK_TICK_SECONDS")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()
                    .unwrap_or(30),
                batch_size: env::var("WEBHOOK_BATCH_SIZE")
                    .unwrap_or_else(|_| "50".to_string())
                    .parse()
                    .unwrap_or(50),
                max_backoff_seconds: env::var("WEBHOOK_MAX_BACKOFF_SECONDS")
                    .unwrap_or_else(|_| "3600".to_string())
                    .parse()
                    .unwrap_or(3600),
                response_body_limit: env::var("WEBHOOK_RESPONSE_BODY_LIMIT")
                    .unwrap_or_else(|_| "65536".to_string())
                    .parse()
                    .unwrap_or(65536),
            },
            smtp: SmtpConfig {
                host: env::var("SMTP_HOST").ok(),
                port: env::var("SMTP_PORT")
                    .unwrap_or_else(|_| "587".to_string())
                    .parse()
                    .unwrap_or(587),
                username: env::var("SMTP_USERNAME").ok(),
                password: env::var("SMTP_PASSWORD").ok(),
                from_address: env::var("SMTP_FROM")
                    .unwrap_or_else(|_| "alerts@pulsar.local".to_string()),
            },
            event_bus: EventBusConfig {
                default_capacity: env::var("EVENT_BUS_DEFAULT_CAPACITY")
                    .unwrap_or_else(|_| "256".to_string())
                    .parse()
                    .unwrap_or(256),
                ping_interval_seconds: env::var("WS_PING_INTERVAL_SECONDS")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()
                    .unwrap_or(30),
            },
        })
    }
}

fn parse_bool(v: Option<String>, default: bool) -> bool {
    match v {
        Some(v) => match v.to_lowercase().as_str() {
            "1" | "true" | "yes" => true,
            "0" | "false" | "no" => false,
            _ => default,
        },
        None => default,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
                frontend_url: "http://localhost:3000".to_string(),
                shutdown_grace_seconds: 5,
            },
            database: DatabaseConfig {
                url: "sqlite://data/pulsar.db".to_string(),
                max_connections: 5,
            },
            jwt: JwtConfig {
                secret: String::new(),
                expiration_hours: 24,
            },
            rate_limit: RateLimitConfig {
                ingest_per_second: 10,
                ingest_burst: 50,
            },
            escalation: EscalationConfig {
                enabled: true,
                tick_seconds: 30,
                batch_size: 100,
            },
            webhook_delivery: WebhookDeliveryConfig {
                enabled: true,
                tick_seconds: 30,
                batch_size: 50,
                max_backoff_seconds: 3600,
                response_body_limit: 65536,
            },
            smtp: SmtpConfig {
                host: None,
                port: 587,
                username: None,
                password: None,
                from_address: "alerts@pulsar.local".to_string(),
            },
            event_bus: EventBusConfig {
                default_capacity: 256,
                ping_interval_seconds: 30,
            },
        }
    }
}
