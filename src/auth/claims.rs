use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Tenant assigned to tokens that carry no `tenant_id` claim
pub const DEFAULT_TENANT_ID: &str = "default";

/// Claims carried by a WebSocket client's token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID)
    pub sub: String,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Organization the connection belongs to
    #[serde(default)]
    pub tenant_id: Option<String>,
    /// Additional organizations the user is a member of
    #[serde(default)]
    pub organizations: Vec<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl Claims {
    pub fn user_id(&self) -> &str {
        &self.sub
    }

    pub fn tenant_id(&self) -> &str {
        self.tenant_id.as_deref().unwrap_or(DEFAULT_TENANT_ID)
    }

    /// Organizations other than the owning tenant
    pub fn extra_organizations(&self) -> impl Iterator<Item = &str> {
        let tenant = self.tenant_id();
        self.organizations
            .iter()
            .map(String::as_str)
            .filter(move |org| *org != tenant)
    }
}
