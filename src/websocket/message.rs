use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::events::{RelayEvent, Topic};

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ClientMessage {
    Subscribe { topics: Vec<String> },
    Unsubscribe { topics: Vec<String> },
    Ping,
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "event")]
    Event { topic: Topic, event: RelayEvent },
    #[serde(rename = "subscribed")]
    Subscribed {
        #[serde(rename = "payload")]
        topics: Vec<String>,
    },
    #[serde(rename = "unsubscribed")]
    Unsubscribed {
        #[serde(rename = "payload")]
        topics: Vec<String>,
    },
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "heartbeat")]
    Heartbeat,
    #[serde(rename = "error")]
    Error { code: String, message: String },
    #[serde(rename = "shutdown")]
    Shutdown {
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reconnect_after: Option<u64>,
    },
}

impl ServerMessage {
    pub fn event(event: RelayEvent) -> Self {
        Self::Event {
            topic: event.topic(),
            event,
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn subscribed(topics: Vec<String>) -> Self {
        Self::Subscribed { topics }
    }

    pub fn unsubscribed(topics: Vec<String>) -> Self {
        Self::Unsubscribed { topics }
    }

    pub fn shutdown(reason: impl Into<String>, reconnect_after: Option<u64>) -> Self {
        Self::Shutdown {
            reason: reason.into(),
            reconnect_after,
        }
    }
}

/// Frame queued on a connection's outbound channel
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    /// Serialized by the connection's write loop
    Raw(ServerMessage),
    /// Serialized once by the broker and shared across all targets
    Preserialized(Arc<str>),
}

impl OutboundMessage {
    pub fn preserialized(message: &ServerMessage) -> Result<Self, serde_json::Error> {
        let json = serde_json::to_string(message)?;
        Ok(Self::Preserialized(Arc::from(json)))
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        match self {
            Self::Raw(message) => serde_json::to_string(message),
            Self::Preserialized(json) => Ok(json.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventPayload, WorkItemStatus};

    #[test]
    fn test_event_message_shape() {
        let event = RelayEvent::for_tenant(
            "org-1",
            EventPayload::WorkItemStatus(WorkItemStatus::new(Some("abc".into()), None, 50)),
        );
        let json: serde_json::Value =
            serde_json::to_value(ServerMessage::event(event)).unwrap();

        assert_eq!(json["type"], "event");
        assert_eq!(json["topic"], "work-item-status");
        assert_eq!(json["event"]["payload"]["data"]["progress"], 50);
        assert!(json["event"]["payload"]["data"]["message"].is_null());
    }

    #[test]
    fn test_preserialized_matches_raw() {
        let message = ServerMessage::error("BAD", "bad things");
        let raw = OutboundMessage::Raw(message.clone()).to_json().unwrap();
        let pre = OutboundMessage::preserialized(&message)
            .unwrap()
            .to_json()
            .unwrap();
        assert_eq!(raw, pre);
    }

    #[test]
    fn test_parse_client_subscribe() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"Subscribe","payload":{"topics":["work-item-status"]}}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::Subscribe { topics } => assert_eq!(topics, vec!["work-item-status"]),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
