//! Immutable, typed messages exchanged over the [`crate::bus::MessageBus`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::identity::{now_monotonic_ms, AgentId, Id};

/// Enumerated message tag. `#[non_exhaustive]` plus the `Other` escape
/// hatch means adding a new well-known tag later, or round-tripping an
/// unrecognized one from a future extension, never breaks an existing
/// `match`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum MessageType {
    StatusUpdate,
    Coordination,
    Alert,
    Query,
    Response,
    Other(String),
}

/// An immutable message. Construct via [`Message::new`] or
/// [`MessageBuilder`]; there is no public mutator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub sender_id: AgentId,
    pub recipient_id: Option<AgentId>,
    pub message_type: MessageType,
    pub content: String,
    pub payload: HashMap<String, serde_json::Value>,
    pub correlation_id: Option<Id>,
    pub timestamp: u64,
    pub message_id: Id,
}

impl Message {
    /// `recipient_id == None` iff this message is a broadcast.
    pub fn is_broadcast(&self) -> bool {
        self.recipient_id.is_none()
    }

    /// `correlation_id.is_some()` iff this message is correlated to a
    /// prior request (i.e. it is a response).
    pub fn is_response(&self) -> bool {
        self.correlation_id.is_some()
    }
}

/// Builder for [`Message`]; the only way to construct one outside the
/// bus's own `broadcast`/`send_response` helpers.
pub struct MessageBuilder {
    sender_id: AgentId,
    recipient_id: Option<AgentId>,
    message_type: MessageType,
    content: String,
    payload: HashMap<String, serde_json::Value>,
    correlation_id: Option<Id>,
}

impl MessageBuilder {
    pub fn new(sender_id: AgentId, message_type: MessageType, content: impl Into<String>) -> Self {
        Self {
            sender_id,
            recipient_id: None,
            message_type,
            content: content.into(),
            payload: HashMap::new(),
            correlation_id: None,
        }
    }

    pub fn to(mut self, recipient_id: AgentId) -> Self {
        self.recipient_id = Some(recipient_id);
        self
    }

    pub fn payload(mut self, payload: HashMap<String, serde_json::Value>) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_payload_entry(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    pub fn correlated_with(mut self, correlation_id: Id) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn build(self, message_id: Id) -> Message {
        Message {
            sender_id: self.sender_id,
            recipient_id: self.recipient_id,
            message_type: self.message_type,
            content: self.content,
            payload: self.payload,
            correlation_id: self.correlation_id,
            timestamp: now_monotonic_ms(),
            message_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_iff_no_recipient() {
        let m = MessageBuilder::new(AgentId::new(1), MessageType::Alert, "danger")
            .build(Id(1));
        assert!(m.is_broadcast());

        let m2 = MessageBuilder::new(AgentId::new(1), MessageType::Alert, "danger")
            .to(AgentId::new(2))
            .build(Id(2));
        assert!(!m2.is_broadcast());
    }

    #[test]
    fn response_iff_correlated() {
        let m = MessageBuilder::new(AgentId::new(1), MessageType::Response, "ok")
            .to(AgentId::new(2))
            .correlated_with(Id(42))
            .build(Id(3));
        assert!(m.is_response());
        assert_eq!(m.correlation_id, Some(Id(42)));
    }
}
