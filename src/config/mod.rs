mod settings;

pub use settings::{
    BusConfig, JwtConfig, OtelConfig, QuotaConfig, ServerConfig, Settings, TenantEntry,
    ThrottlingConfig, WebSocketConfig,
};
