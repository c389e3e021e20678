//! API key authentication for publishers

use std::collections::HashMap;

use crate::config::TenantEntry;

use super::GuardError;

/// Tenant resolved from a credential
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantContext {
    pub tenant_id: String,
    pub active: bool,
}

pub struct ApiKeyGuard {
    keys: HashMap<String, TenantContext>,
}

impl ApiKeyGuard {
    pub fn new(tenants: &[TenantEntry]) -> Self {
        let mut keys = HashMap::new();
        for tenant in tenants {
            for key in &tenant.api_keys {
                let ctx = TenantContext {
                    tenant_id: tenant.id.clone(),
                    active: tenant.active,
                };
                if let Some(previous) = keys.insert(key.clone(), ctx) {
                    tracing::warn!(
                        tenant_id = %tenant.id,
                        previous_tenant = %previous.tenant_id,
                        "API key configured for more than one tenant; last one wins"
                    );
                }
            }
        }
        Self { keys }
    }

    pub fn authenticate(&self, credential: Option<&str>) -> Result<TenantContext, GuardError> {
        let key = credential
            .filter(|k| !k.is_empty())
            .ok_or_else(|| GuardError::Unauthorized("Missing API key".to_string()))?;

        let tenant = self
            .keys
            .get(key)
            .ok_or_else(|| GuardError::Unauthorized("Invalid API key".to_string()))?;

        if !tenant.active {
            return Err(GuardError::Unauthorized(format!(
                "Tenant {} is inactive",
                tenant.tenant_id
            )));
        }

        Ok(tenant.clone())
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }
}
