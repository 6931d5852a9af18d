//! Participant-scoped message log with a strict state machine.
//!
//! `INITIATED -> ACTIVE` on first message, `ACTIVE <-> PAUSED` via
//! explicit calls, and any non-terminal state can `complete()` or
//! `timeout()`; illegal transitions fail rather than silently no-op.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::identity::AgentId;
use crate::message::{Message, MessageType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversationState {
    Initiated,
    Active,
    Paused,
    Completed,
    TimedOut,
}

impl ConversationState {
    fn is_terminal(self) -> bool {
        matches!(self, ConversationState::Completed | ConversationState::TimedOut)
    }
}

/// A participant-scoped, append-only message log plus its state
/// machine. `participants` is fixed at construction time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub conversation_id: String,
    participants: HashSet<AgentId>,
    messages: Vec<Message>,
    state: ConversationState,
    timeout_duration_ms: u64,
    last_activity: DateTime<Utc>,
}

impl Conversation {
    pub fn new(conversation_id: impl Into<String>, participants: HashSet<AgentId>, timeout_duration_ms: u64) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            participants,
            messages: Vec::new(),
            state: ConversationState::Initiated,
            timeout_duration_ms,
            last_activity: Utc::now(),
        }
    }

    pub fn state(&self) -> ConversationState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn participants(&self) -> &HashSet<AgentId> {
        &self.participants
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn involves(&self, a: AgentId, b: AgentId) -> bool {
        self.participants.contains(&a) && self.participants.contains(&b)
    }

    /// Appends `message`; the sender must be a participant. Transitions
    /// `Initiated -> Active` on the first message.
    pub fn add_message(&mut self, message: Message) -> Result<(), CoreError> {
        if !self.participants.contains(&message.sender_id) {
            return Err(CoreError::InvalidArg(format!(
                "sender {} is not a participant in conversation {}",
                message.sender_id, self.conversation_id
            )));
        }
        if self.state == ConversationState::Initiated {
            self.state = ConversationState::Active;
        }
        self.messages.push(message);
        self.last_activity = Utc::now();
        Ok(())
    }

    pub fn get_last_from(&self, agent_id: AgentId) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.sender_id == agent_id)
    }

    pub fn get_messages_of_type(&self, message_type: &MessageType) -> Vec<&Message> {
        self.messages.iter().filter(|m| &m.message_type == message_type).collect()
    }

    pub fn pause(&mut self) -> Result<(), CoreError> {
        if self.state != ConversationState::Active {
            return Err(illegal_transition(self.state, ConversationState::Paused));
        }
        self.state = ConversationState::Paused;
        Ok(())
    }

    pub fn resume(&mut self) -> Result<(), CoreError> {
        if self.state != ConversationState::Paused {
            return Err(illegal_transition(self.state, ConversationState::Active));
        }
        self.state = ConversationState::Active;
        self.last_activity = Utc::now();
        Ok(())
    }

    /// Any non-terminal state may complete.
    pub fn complete(&mut self) -> Result<(), CoreError> {
        if self.state.is_terminal() {
            return Err(illegal_transition(self.state, ConversationState::Completed));
        }
        self.state = ConversationState::Completed;
        Ok(())
    }

    /// Any state may time out, including an already-terminal one the
    /// caller explicitly forces (the lazy observer check below only
    /// ever calls this on a non-terminal conversation).
    pub fn timeout(&mut self) {
        self.state = ConversationState::TimedOut;
    }

    /// Observer check: transitions to `TimedOut` if `timeout_duration`
    /// has elapsed since the last activity and the conversation is
    /// still open. Returns whether a transition happened.
    pub fn check_timeout(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        let elapsed = Utc::now() - self.last_activity;
        if elapsed >= Duration::milliseconds(self.timeout_duration_ms as i64) {
            self.timeout();
            true
        } else {
            false
        }
    }
}

fn illegal_transition(from: ConversationState, to: ConversationState) -> CoreError {
    CoreError::InvalidState(format!("illegal transition {from:?} -> {to:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageBuilder;
    use crate::identity::Id;

    fn participants(ids: &[u128]) -> HashSet<AgentId> {
        ids.iter().map(|n| AgentId::new(*n)).collect()
    }

    fn msg_from(agent: AgentId) -> Message {
        MessageBuilder::new(agent, MessageType::Coordination, "hi").build(Id(1))
    }

    #[test]
    fn first_message_moves_initiated_to_active() {
        let mut convo = Conversation::new("c1", participants(&[1, 2]), 60_000);
        assert_eq!(convo.state(), ConversationState::Initiated);
        convo.add_message(msg_from(AgentId::new(1))).unwrap();
        assert_eq!(convo.state(), ConversationState::Active);
    }

    #[test]
    fn non_participant_message_is_rejected() {
        let mut convo = Conversation::new("c1", participants(&[1, 2]), 60_000);
        let err = convo.add_message(msg_from(AgentId::new(99))).unwrap_err();
        assert!(matches!(err, CoreError::InvalidArg(_)));
    }

    #[test]
    fn pause_resume_requires_active_state() {
        let mut convo = Conversation::new("c1", participants(&[1]), 60_000);
        // Can't pause before any message has activated it.
        assert!(convo.pause().is_err());

        convo.add_message(msg_from(AgentId::new(1))).unwrap();
        convo.pause().unwrap();
        assert_eq!(convo.state(), ConversationState::Paused);
        convo.resume().unwrap();
        assert_eq!(convo.state(), ConversationState::Active);
    }

    #[test]
    fn complete_is_terminal_and_irreversible() {
        let mut convo = Conversation::new("c1", participants(&[1]), 60_000);
        convo.add_message(msg_from(AgentId::new(1))).unwrap();
        convo.complete().unwrap();
        assert!(convo.is_closed());
        assert!(convo.complete().is_err());
    }

    #[test]
    fn check_timeout_transitions_after_elapsed_duration() {
        let mut convo = Conversation::new("c1", participants(&[1]), 0);
        convo.add_message(msg_from(AgentId::new(1))).unwrap();
        assert!(convo.check_timeout());
        assert_eq!(convo.state(), ConversationState::TimedOut);
    }

    #[test]
    fn involves_checks_both_participants() {
        let convo = Conversation::new("c1", participants(&[1, 2]), 60_000);
        assert!(convo.involves(AgentId::new(1), AgentId::new(2)));
        assert!(!convo.involves(AgentId::new(1), AgentId::new(99)));
    }
}
