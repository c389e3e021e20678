//! Per-tenant request throttling

use dashmap::DashMap;

use crate::config::ThrottlingConfig;

use super::window::{WindowCounter, WindowDecision};

/// Result of a throttling check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleDecision {
    Allowed {
        remaining: u32,
        limit: u32,
        /// End of the current window (Unix seconds)
        reset_at: i64,
    },
    Denied {
        /// Seconds until the window rolls over
        retry_after: u64,
        limit: u32,
        reset_at: i64,
    },
}

impl ThrottleDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, ThrottleDecision::Allowed { .. })
    }
}

/// Admits at most `max_requests` per tenant in each fixed window of
/// `window_seconds`.
pub struct ThrottlingGuard {
    counters: DashMap<String, WindowCounter>,
    config: ThrottlingConfig,
}

impl ThrottlingGuard {
    pub fn new(config: ThrottlingConfig) -> Self {
        Self {
            counters: DashMap::new(),
            config,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn config(&self) -> &ThrottlingConfig {
        &self.config
    }

    fn window_ms(&self) -> i64 {
        (self.config.window_seconds.max(1) * 1000) as i64
    }

    pub fn check(&self, tenant_id: &str) -> ThrottleDecision {
        self.check_at(tenant_id, WindowCounter::now_millis())
    }

    pub fn check_at(&self, tenant_id: &str, now_ms: i64) -> ThrottleDecision {
        let limit = self.config.max_requests;

        if !self.config.enabled {
            return ThrottleDecision::Allowed {
                remaining: u32::MAX,
                limit: 0,
                reset_at: 0,
            };
        }

        let decision = match self.counters.get(tenant_id) {
            Some(counter) => counter.try_acquire_at(now_ms, self.window_ms(), limit),
            None => self
                .counters
                .entry(tenant_id.to_string())
                .or_default()
                .try_acquire_at(now_ms, self.window_ms(), limit),
        };

        match decision {
            WindowDecision::Allowed {
                remaining,
                reset_at_ms,
            } => ThrottleDecision::Allowed {
                remaining,
                limit,
                reset_at: reset_at_ms / 1000,
            },
            WindowDecision::Denied {
                retry_after_ms,
                reset_at_ms,
            } => {
                tracing::debug!(tenant_id = %tenant_id, limit = limit, "Tenant throttled");
                ThrottleDecision::Denied {
                    // Round up so clients never retry inside the same window
                    retry_after: ((retry_after_ms + 999) / 1000).max(1) as u64,
                    limit,
                    reset_at: reset_at_ms / 1000,
                }
            }
        }
    }

    /// Drop counters that have been idle longer than the configured TTL
    pub fn cleanup_stale(&self) -> usize {
        self.cleanup_stale_at(WindowCounter::now_millis())
    }

    pub fn cleanup_stale_at(&self, now_ms: i64) -> usize {
        let ttl_ms = (self.config.window_ttl_seconds * 1000) as i64;
        let before = self.counters.len();

        self.counters
            .retain(|_, counter| now_ms - counter.last_activity() < ttl_ms);

        let removed = before.saturating_sub(self.counters.len());
        if removed > 0 {
            tracing::debug!(
                removed = removed,
                remaining = self.counters.len(),
                "Cleaned up stale throttling windows"
            );
        }
        removed
    }

    /// Number of tenants with a live window
    pub fn tracked_tenants(&self) -> usize {
        self.counters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard(max_requests: u32, window_seconds: u64) -> ThrottlingGuard {
        ThrottlingGuard::new(ThrottlingConfig {
            enabled: true,
            max_requests,
            window_seconds,
            window_ttl_seconds: 60,
        })
    }

    #[test]
    fn test_admits_k_rejects_k_plus_one() {
        let guard = guard(5, 1);
        let now = 1_700_000_000_000;

        for _ in 0..5 {
            assert!(guard.check_at("org-1", now).is_allowed());
        }
        assert!(matches!(
            guard.check_at("org-1", now),
            ThrottleDecision::Denied {
                retry_after: 1,
                limit: 5,
                ..
            }
        ));
    }

    #[test]
    fn test_tenants_are_independent() {
        let guard = guard(1, 1);
        let now = 1_700_000_000_000;

        assert!(guard.check_at("org-1", now).is_allowed());
        assert!(!guard.check_at("org-1", now).is_allowed());
        assert!(guard.check_at("org-2", now).is_allowed());
    }

    #[test]
    fn test_next_window_admits_again() {
        let guard = guard(2, 1);
        let now = 1_700_000_000_000;

        assert!(guard.check_at("org-1", now).is_allowed());
        assert!(guard.check_at("org-1", now + 1).is_allowed());
        assert!(!guard.check_at("org-1", now + 2).is_allowed());
        assert!(guard.check_at("org-1", now + 1000).is_allowed());
    }

    #[test]
    fn test_disabled_always_allows() {
        let guard = ThrottlingGuard::new(ThrottlingConfig {
            enabled: false,
            max_requests: 1,
            ..Default::default()
        });
        for _ in 0..10 {
            assert!(guard.check("org-1").is_allowed());
        }
        assert_eq!(guard.tracked_tenants(), 0);
    }

    #[test]
    fn test_cleanup_stale_windows() {
        let guard = guard(10, 1);
        let now = WindowCounter::now_millis();
        guard.check_at("org-1", now);
        guard.check_at("org-2", now);

        assert_eq!(guard.cleanup_stale_at(now + 1_000), 0);
        assert_eq!(guard.cleanup_stale_at(now + 61_000), 2);
        assert_eq!(guard.tracked_tenants(), 0);
    }
}
