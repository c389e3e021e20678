use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Entity type name whose changes are routed to the changed user
pub const USER_ENTITY_TYPE: &str = "User";

/// Named category of bus message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topic {
    EntityChanged,
    WorkItemStatus,
    PlanOverage,
    PlanChanged,
    UserMembershipChanged,
    ReleaseNotification,
    SystemNotification,
}

impl Topic {
    pub const ALL: [Topic; 7] = [
        Topic::EntityChanged,
        Topic::WorkItemStatus,
        Topic::PlanOverage,
        Topic::PlanChanged,
        Topic::UserMembershipChanged,
        Topic::ReleaseNotification,
        Topic::SystemNotification,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::EntityChanged => "entity-changed",
            Topic::WorkItemStatus => "work-item-status",
            Topic::PlanOverage => "plan-overage",
            Topic::PlanChanged => "plan-changed",
            Topic::UserMembershipChanged => "user-membership-changed",
            Topic::ReleaseNotification => "release-notification",
            Topic::SystemNotification => "system-notification",
        }
    }

    /// Bus channel name for this topic under the given prefix
    pub fn channel_name(&self, prefix: &str) -> String {
        if prefix.is_empty() {
            self.as_str().to_string()
        } else {
            format!("{}:{}", prefix, self.as_str())
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown topic: {0}")]
pub struct UnknownTopic(pub String);

impl FromStr for Topic {
    type Err = UnknownTopic;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownTopic(s.to_string()))
    }
}

/// Kind of change applied to an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Added,
    Saved,
    Removed,
}

/// A domain entity was added, saved or removed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityChanged {
    /// Entity type name (e.g. "Project", "Stack", "User")
    #[serde(rename = "type")]
    pub entity_type: String,
    #[serde(default)]
    pub id: Option<String>,
    pub change_type: ChangeType,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub data: HashMap<String, serde_json::Value>,
}

/// Progress report from a background work item.
///
/// Absent identifiers and messages stay `None`; only log output renders them
/// with a placeholder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItemStatus {
    #[serde(default)]
    pub work_item_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    pub progress: i32,
}

impl WorkItemStatus {
    pub fn new(work_item_id: Option<String>, message: Option<String>, progress: i32) -> Self {
        Self {
            work_item_id,
            message,
            progress: progress.clamp(0, 100),
        }
    }
}

/// A tenant crossed its hourly or monthly event ceiling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanOverageNotice {
    pub organization_id: String,
    pub is_hourly: bool,
    pub count: u64,
    pub limit: u64,
}

/// A tenant's billing plan changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanChanged {
    pub organization_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipChange {
    Added,
    Removed,
}

/// A user joined or left an organization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMembershipChanged {
    pub user_id: String,
    pub organization_id: String,
    pub change_type: MembershipChange,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseNotification {
    #[serde(default)]
    pub critical: bool,
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemNotification {
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Typed body of a relay event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    EntityChanged(EntityChanged),
    WorkItemStatus(WorkItemStatus),
    PlanOverage(PlanOverageNotice),
    PlanChanged(PlanChanged),
    UserMembershipChanged(UserMembershipChanged),
    ReleaseNotification(ReleaseNotification),
    SystemNotification(SystemNotification),
}

impl EventPayload {
    pub fn topic(&self) -> Topic {
        match self {
            EventPayload::EntityChanged(_) => Topic::EntityChanged,
            EventPayload::WorkItemStatus(_) => Topic::WorkItemStatus,
            EventPayload::PlanOverage(_) => Topic::PlanOverage,
            EventPayload::PlanChanged(_) => Topic::PlanChanged,
            EventPayload::UserMembershipChanged(_) => Topic::UserMembershipChanged,
            EventPayload::ReleaseNotification(_) => Topic::ReleaseNotification,
            EventPayload::SystemNotification(_) => Topic::SystemNotification,
        }
    }
}

/// Event envelope published on the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayEvent {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    #[serde(default = "Utc::now")]
    pub occurred_at: DateTime<Utc>,
    /// Owning tenant; `None` for global events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    /// Routing hint narrowing delivery to one user's connections
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub payload: EventPayload,
}

impl RelayEvent {
    /// Event visible to every connection subscribed to its topic
    pub fn global(payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            tenant_id: None,
            user_id: None,
            payload,
        }
    }

    /// Event visible only to connections of one tenant
    pub fn for_tenant(tenant_id: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            tenant_id: Some(tenant_id.into()),
            ..Self::global(payload)
        }
    }

    /// Narrow delivery to a single user
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn topic(&self) -> Topic {
        self.payload.topic()
    }

    pub fn is_global(&self) -> bool {
        self.tenant_id.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_topic_from_str() {
        assert_eq!("work-item-status".parse::<Topic>(), Ok(Topic::WorkItemStatus));
        assert_eq!(
            "nope".parse::<Topic>(),
            Err(UnknownTopic("nope".to_string()))
        );
    }

    #[test]
    fn test_channel_name() {
        assert_eq!(Topic::PlanOverage.channel_name("relay"), "relay:plan-overage");
        assert_eq!(Topic::PlanOverage.channel_name(""), "plan-overage");
    }

    #[test]
    fn test_parse_work_item_status_from_bus() {
        let raw = json!({
            "tenant_id": "org-1",
            "payload": {
                "type": "work_item_status",
                "data": { "work_item_id": "abc", "message": null, "progress": 50 }
            }
        });

        let event: RelayEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(event.topic(), Topic::WorkItemStatus);
        assert_eq!(event.tenant_id.as_deref(), Some("org-1"));
        match event.payload {
            EventPayload::WorkItemStatus(status) => {
                assert_eq!(status.work_item_id.as_deref(), Some("abc"));
                assert!(status.message.is_none());
                assert_eq!(status.progress, 50);
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_parse_entity_changed() {
        let raw = json!({
            "payload": {
                "type": "entity_changed",
                "data": { "type": "Project", "id": "p-1", "change_type": "saved" }
            }
        });

        let event: RelayEvent = serde_json::from_value(raw).unwrap();
        assert!(event.is_global());
        assert_eq!(event.topic(), Topic::EntityChanged);
    }

    #[test]
    fn test_work_item_status_progress_clamped() {
        assert_eq!(WorkItemStatus::new(None, None, 140).progress, 100);
        assert_eq!(WorkItemStatus::new(None, None, -3).progress, 0);
    }

    #[test]
    fn test_tenant_scoped_builder() {
        let event = RelayEvent::for_tenant(
            "org-9",
            EventPayload::PlanChanged(PlanChanged {
                organization_id: "org-9".to_string(),
            }),
        )
        .with_user("user-1");

        assert_eq!(event.tenant_id.as_deref(), Some("org-9"));
        assert_eq!(event.user_id.as_deref(), Some("user-1"));
        assert_eq!(event.topic(), Topic::PlanChanged);
    }
}
