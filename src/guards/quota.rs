//! Per-tenant plan quotas over hourly and monthly windows.
//!
//! Windows are fixed: the current UTC hour and the current UTC calendar
//! month. A tenant is over a ceiling once its count in the window exceeds the
//! limit; crossing that line is reported exactly once per window.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Utc};
use dashmap::DashMap;

use crate::config::{QuotaConfig, TenantEntry};
use crate::events::PlanOverageNotice;

/// Event ceilings for one tenant. `None` means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanLimits {
    pub max_events_per_hour: Option<u64>,
    pub max_events_per_month: Option<u64>,
}

impl PlanLimits {
    pub fn unlimited() -> Self {
        Self::default()
    }
}

/// Supplies plan limits for tenants
pub trait QuotaSource: Send + Sync {
    fn limits(&self, tenant_id: &str) -> PlanLimits;
}

/// Limits taken from configuration: defaults plus per-tenant overrides
pub struct StaticQuotaSource {
    defaults: PlanLimits,
    overrides: HashMap<String, PlanLimits>,
}

impl StaticQuotaSource {
    pub fn new(defaults: PlanLimits) -> Self {
        Self {
            defaults,
            overrides: HashMap::new(),
        }
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>, limits: PlanLimits) -> Self {
        self.overrides.insert(tenant_id.into(), limits);
        self
    }

    pub fn from_settings(quota: &QuotaConfig, tenants: &[TenantEntry]) -> Self {
        let defaults = PlanLimits {
            max_events_per_hour: quota.default_max_events_per_hour,
            max_events_per_month: quota.default_max_events_per_month,
        };

        let overrides = tenants
            .iter()
            .map(|t| {
                let limits = PlanLimits {
                    max_events_per_hour: t.max_events_per_hour.or(defaults.max_events_per_hour),
                    max_events_per_month: t
                        .max_events_per_month
                        .or(defaults.max_events_per_month),
                };
                (t.id.clone(), limits)
            })
            .collect();

        Self {
            defaults,
            overrides,
        }
    }
}

impl QuotaSource for StaticQuotaSource {
    fn limits(&self, tenant_id: &str) -> PlanLimits {
        self.overrides
            .get(tenant_id)
            .copied()
            .unwrap_or(self.defaults)
    }
}

/// Over-limit flags after recording usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OverageStatus {
    pub over_hourly: bool,
    pub over_monthly: bool,
}

impl OverageStatus {
    pub fn is_over_limit(&self) -> bool {
        self.over_hourly || self.over_monthly
    }
}

/// Result of recording usage for a tenant
#[derive(Debug, Clone, Default)]
pub struct QuotaUpdate {
    pub status: OverageStatus,
    /// Notices for ceilings crossed by this update
    pub crossed: Vec<PlanOverageNotice>,
}

#[derive(Debug, Clone, Copy, Default)]
struct WindowUsage {
    key: i64,
    count: u64,
    over: bool,
}

impl WindowUsage {
    /// Add `n` in window `key`; returns true on the rising edge
    fn record(&mut self, key: i64, n: u64, limit: Option<u64>) -> bool {
        if self.key != key {
            *self = WindowUsage {
                key,
                count: 0,
                over: false,
            };
        }
        self.count = self.count.saturating_add(n);

        let over = limit.is_some_and(|limit| self.count > limit);
        let crossed = over && !self.over;
        self.over = over;
        crossed
    }

    fn is_over(&self, key: i64) -> bool {
        self.key == key && self.over
    }

    /// Count recorded in window `key`, zero once that window has passed
    fn count_in(&self, key: i64) -> u64 {
        if self.key == key {
            self.count
        } else {
            0
        }
    }
}

/// Usage of one tenant in its current windows
#[derive(Debug, Clone, Copy, Default)]
pub struct QuotaState {
    hourly: WindowUsage,
    monthly: WindowUsage,
}

impl QuotaState {
    /// Counts as of `now`; windows that have rolled over read as zero
    pub fn usage_at(&self, now: DateTime<Utc>) -> QuotaUsage {
        QuotaUsage {
            hourly: self.hourly.count_in(hour_key(now)),
            monthly: self.monthly.count_in(month_key(now)),
        }
    }
}

/// Events counted in the current hour and month
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuotaUsage {
    pub hourly: u64,
    pub monthly: u64,
}

fn hour_key(now: DateTime<Utc>) -> i64 {
    now.timestamp().div_euclid(3600)
}

fn month_key(now: DateTime<Utc>) -> i64 {
    now.year() as i64 * 12 + now.month0() as i64
}

/// Tracks per-tenant usage against plan limits
pub struct QuotaTracker {
    source: Arc<dyn QuotaSource>,
    states: DashMap<String, QuotaState>,
}

impl QuotaTracker {
    pub fn new(source: Arc<dyn QuotaSource>) -> Self {
        Self {
            source,
            states: DashMap::new(),
        }
    }

    pub fn limits(&self, tenant_id: &str) -> PlanLimits {
        self.source.limits(tenant_id)
    }

    pub fn record(&self, tenant_id: &str, n: u64) -> QuotaUpdate {
        self.record_at(tenant_id, n, Utc::now())
    }

    /// Count `n` events for a tenant at `now`
    pub fn record_at(&self, tenant_id: &str, n: u64, now: DateTime<Utc>) -> QuotaUpdate {
        let limits = self.source.limits(tenant_id);
        let mut state = self.states.entry(tenant_id.to_string()).or_default();

        let mut crossed = Vec::new();
        if state
            .hourly
            .record(hour_key(now), n, limits.max_events_per_hour)
        {
            crossed.push(PlanOverageNotice {
                organization_id: tenant_id.to_string(),
                is_hourly: true,
                count: state.hourly.count,
                limit: limits.max_events_per_hour.unwrap_or_default(),
            });
        }
        if state
            .monthly
            .record(month_key(now), n, limits.max_events_per_month)
        {
            crossed.push(PlanOverageNotice {
                organization_id: tenant_id.to_string(),
                is_hourly: false,
                count: state.monthly.count,
                limit: limits.max_events_per_month.unwrap_or_default(),
            });
        }

        QuotaUpdate {
            status: OverageStatus {
                over_hourly: state.hourly.over,
                over_monthly: state.monthly.over,
            },
            crossed,
        }
    }

    pub fn status(&self, tenant_id: &str) -> OverageStatus {
        self.status_at(tenant_id, Utc::now())
    }

    /// Over-limit flags in the windows containing `now`
    pub fn status_at(&self, tenant_id: &str, now: DateTime<Utc>) -> OverageStatus {
        self.states
            .get(tenant_id)
            .map(|state| OverageStatus {
                over_hourly: state.hourly.is_over(hour_key(now)),
                over_monthly: state.monthly.is_over(month_key(now)),
            })
            .unwrap_or_default()
    }

    pub fn is_over(&self, tenant_id: &str) -> bool {
        self.status(tenant_id).is_over_limit()
    }

    pub fn usage(&self, tenant_id: &str) -> QuotaUsage {
        self.usage_at(tenant_id, Utc::now())
    }

    pub fn usage_at(&self, tenant_id: &str, now: DateTime<Utc>) -> QuotaUsage {
        self.states
            .get(tenant_id)
            .map(|state| state.usage_at(now))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn tracker(hour: Option<u64>, month: Option<u64>) -> QuotaTracker {
        QuotaTracker::new(Arc::new(StaticQuotaSource::new(PlanLimits {
            max_events_per_hour: hour,
            max_events_per_month: month,
        })))
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 15, h, m, 0).unwrap()
    }

    #[test]
    fn test_over_only_when_count_exceeds_limit() {
        let tracker = tracker(Some(3), None);

        for _ in 0..3 {
            let update = tracker.record_at("org-1", 1, at(10, 0));
            assert!(!update.status.is_over_limit());
            assert!(update.crossed.is_empty());
        }

        let update = tracker.record_at("org-1", 1, at(10, 5));
        assert!(update.status.over_hourly);
        assert_eq!(update.crossed.len(), 1);
        assert_eq!(
            update.crossed[0],
            PlanOverageNotice {
                organization_id: "org-1".into(),
                is_hourly: true,
                count: 4,
                limit: 3,
            }
        );
    }

    #[test]
    fn test_one_notice_per_rising_edge() {
        let tracker = tracker(Some(1), None);

        let notices: usize = (0..10)
            .map(|_| tracker.record_at("org-1", 1, at(10, 0)).crossed.len())
            .sum();
        assert_eq!(notices, 1);
    }

    #[test]
    fn test_new_window_resets_and_notifies_again() {
        let tracker = tracker(Some(1), None);

        tracker.record_at("org-1", 2, at(10, 0));
        assert!(tracker.status_at("org-1", at(10, 30)).over_hourly);
        assert!(!tracker.status_at("org-1", at(11, 0)).over_hourly);

        let first = tracker.record_at("org-1", 1, at(11, 0));
        assert!(first.crossed.is_empty());
        let second = tracker.record_at("org-1", 1, at(11, 1));
        assert_eq!(second.crossed.len(), 1);
    }

    #[test]
    fn test_usage_reads_zero_after_rollover() {
        let tracker = tracker(Some(3), Some(100));
        let now = at(12, 0);

        tracker.record_at("org-1", 5, now - chrono::Duration::hours(2));
        assert_eq!(
            tracker.usage_at("org-1", now),
            QuotaUsage {
                hourly: 0,
                monthly: 5
            }
        );
        assert!(!tracker.status_at("org-1", now).over_hourly);

        let april = Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap();
        assert_eq!(tracker.usage_at("org-1", april), QuotaUsage::default());
        assert_eq!(tracker.usage_at("unknown", now), QuotaUsage::default());
    }

    #[test]
    fn test_monthly_window_spans_hours() {
        let tracker = tracker(None, Some(2));

        tracker.record_at("org-1", 1, at(1, 0));
        tracker.record_at("org-1", 1, at(5, 0));
        let update = tracker.record_at("org-1", 1, at(9, 0));
        assert!(update.status.over_monthly);
        assert!(!update.crossed[0].is_hourly);

        let april = Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap();
        assert!(!tracker.status_at("org-1", april).over_monthly);
    }

    #[test]
    fn test_unlimited_never_over() {
        let tracker = tracker(None, None);
        let update = tracker.record_at("org-1", 1_000_000, at(10, 0));
        assert!(!update.status.is_over_limit());
        assert!(!tracker.is_over("org-1"));
    }

    #[test]
    fn test_tenant_overrides_fall_back_to_defaults() {
        let quota = QuotaConfig {
            default_max_events_per_hour: Some(100),
            default_max_events_per_month: Some(1000),
            suppress_over_limit_delivery: true,
        };
        let tenants = vec![TenantEntry {
            id: "org-big".into(),
            api_keys: vec![],
            active: true,
            max_events_per_hour: Some(500),
            max_events_per_month: None,
        }];
        let source = StaticQuotaSource::from_settings(&quota, &tenants);

        assert_eq!(
            source.limits("org-big"),
            PlanLimits {
                max_events_per_hour: Some(500),
                max_events_per_month: Some(1000),
            }
        );
        assert_eq!(source.limits("org-other").max_events_per_hour, Some(100));
    }
}
