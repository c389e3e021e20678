use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    pub jwt: JwtConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub websocket: WebSocketConfig,
    #[serde(default)]
    pub throttling: ThrottlingConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    /// Tenants allowed to publish, with their API keys and plan limits
    #[serde(default)]
    pub tenants: Vec<TenantEntry>,
    #[serde(default)]
    pub otel: OtelConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: Option<String>,
    pub audience: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    /// Backend type: "redis" or "memory"
    #[serde(default = "default_bus_backend")]
    pub backend: String,
    #[serde(default = "default_redis_url")]
    pub url: String,
    /// Prefix for per-topic channel names
    #[serde(default = "default_channel_prefix")]
    pub channel_prefix: String,
    /// Buffered events per subscription before the bus applies backpressure
    #[serde(default = "default_subscription_buffer")]
    pub subscription_buffer: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebSocketConfig {
    /// Heartbeat interval in seconds (server sends ping)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,
    /// Connection timeout in seconds (disconnect if no activity)
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: u64,
    /// Cleanup task interval in seconds
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: u64,
    /// Per-connection delivery timeout in milliseconds
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    /// Outbound frames buffered per connection
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_connections_per_user")]
    pub max_connections_per_user: usize,
    #[serde(default = "default_max_topic_filters")]
    pub max_topic_filters_per_connection: usize,
}

/// Short-window request ceiling per tenant
#[derive(Debug, Clone, Deserialize)]
pub struct ThrottlingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Requests admitted per window
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
    /// Time after which idle tenant windows are dropped (seconds)
    #[serde(default = "default_window_ttl")]
    pub window_ttl_seconds: u64,
}

/// Default plan limits and overage behavior
#[derive(Debug, Clone, Deserialize)]
pub struct QuotaConfig {
    #[serde(default)]
    pub default_max_events_per_hour: Option<u64>,
    #[serde(default)]
    pub default_max_events_per_month: Option<u64>,
    /// Hold back entity-change pushes to tenants currently over a ceiling
    #[serde(default = "default_true")]
    pub suppress_over_limit_delivery: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TenantEntry {
    pub id: String,
    #[serde(default)]
    pub api_keys: Vec<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub max_events_per_hour: Option<u64>,
    #[serde(default)]
    pub max_events_per_month: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OtelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_otel_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_sampling_ratio")]
    pub sampling_ratio: f64,
    /// Console log format: "text" or "json"
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8081
}

fn default_bus_backend() -> String {
    "redis".to_string()
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_channel_prefix() -> String {
    "relay".to_string()
}

fn default_subscription_buffer() -> usize {
    1024
}

fn default_heartbeat_interval() -> u64 {
    30 // 30 seconds
}

fn default_connection_timeout() -> u64 {
    120 // 2 minutes
}

fn default_cleanup_interval() -> u64 {
    60 // 1 minute
}

fn default_send_timeout_ms() -> u64 {
    2000
}

fn default_outbound_buffer() -> usize {
    32
}

fn default_max_connections() -> usize {
    10000
}

fn default_max_connections_per_user() -> usize {
    5
}

fn default_max_topic_filters() -> usize {
    16
}

fn default_max_requests() -> u32 {
    100
}

fn default_window_seconds() -> u64 {
    1
}

fn default_window_ttl() -> u64 {
    300 // Remove windows unused for 5 minutes
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_service_name() -> String {
    "event-relay".to_string()
}

fn default_sampling_ratio() -> f64 {
    1.0
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8081)?
            .set_default("bus.backend", "redis")?
            .set_default("bus.url", "redis://localhost:6379")?
            .set_default("websocket.heartbeat_interval", 30)?
            .set_default("websocket.connection_timeout", 120)?
            .set_default("websocket.cleanup_interval", 60)?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // SERVER_HOST, JWT_SECRET, BUS_URL, THROTTLING_MAX_REQUESTS, etc.
            .add_source(
                Environment::default()
                    .separator("_")
                    .try_parsing(true)
                    .list_separator(","),
            );

        builder.build()?.try_deserialize()
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: vec![],
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            backend: default_bus_backend(),
            url: default_redis_url(),
            channel_prefix: default_channel_prefix(),
            subscription_buffer: default_subscription_buffer(),
        }
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: default_heartbeat_interval(),
            connection_timeout: default_connection_timeout(),
            cleanup_interval: default_cleanup_interval(),
            send_timeout_ms: default_send_timeout_ms(),
            outbound_buffer: default_outbound_buffer(),
            max_connections: default_max_connections(),
            max_connections_per_user: default_max_connections_per_user(),
            max_topic_filters_per_connection: default_max_topic_filters(),
        }
    }
}

impl Default for ThrottlingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: default_max_requests(),
            window_seconds: default_window_seconds(),
            window_ttl_seconds: default_window_ttl(),
        }
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            default_max_events_per_hour: None,
            default_max_events_per_month: None,
            suppress_over_limit_delivery: true,
        }
    }
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_otel_endpoint(),
            service_name: default_service_name(),
            sampling_ratio: default_sampling_ratio(),
            log_format: default_log_format(),
        }
    }
}
