//! Event model carried on the bus and pushed to connected clients.
//!
//! Every bus message is a [`RelayEvent`]: a routing envelope (tenant scope and
//! optional user hint) around an [`EventPayload`]. The payload variant decides
//! the [`Topic`] the event travels on.

mod types;

pub use types::{
    ChangeType, EntityChanged, EventPayload, MembershipChange, PlanChanged, PlanOverageNotice,
    RelayEvent, ReleaseNotification, SystemNotification, Topic, UnknownTopic,
    UserMembershipChanged, WorkItemStatus, USER_ENTITY_TYPE,
};
