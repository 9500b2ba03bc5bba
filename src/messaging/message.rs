//! Broker-level message and connection event types

use std::fmt;

use serde::{Deserialize, Serialize};

/// Subject prefix of request/reply inboxes
pub const INBOX_PREFIX: &str = "_INBOX.";

/// A message delivered by a subscription or returned by a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub subject: String,
    pub reply_to: Option<String>,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    pub fn new(subject: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            subject: subject.into(),
            reply_to: None,
            payload,
        }
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }
}

/// Connection lifecycle events published by a broker client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
    Reconnected,
    Resubscribed,
    Closed,
}

impl ConnectionEvent {
    /// Events after which server-side subscriptions must be recreated
    pub fn requires_resubscribe(&self) -> bool {
        matches!(self, ConnectionEvent::Reconnected | ConnectionEvent::Resubscribed)
    }
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionEvent::Connected => "connected",
            ConnectionEvent::Disconnected => "disconnected",
            ConnectionEvent::Reconnected => "reconnected",
            ConnectionEvent::Resubscribed => "resubscribed",
            ConnectionEvent::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Connection state as observed by a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Closed,
}

impl From<u8> for ConnectionState {
    fn from(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connected,
            2 => ConnectionState::Closed,
            _ => ConnectionState::Disconnected,
        }
    }
}

impl From<ConnectionState> for u8 {
    fn from(state: ConnectionState) -> Self {
        match state {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connected => 1,
            ConnectionState::Closed => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resubscribe_events() {
        assert!(ConnectionEvent::Reconnected.requires_resubscribe());
        assert!(ConnectionEvent::Resubscribed.requires_resubscribe());
        assert!(!ConnectionEvent::Connected.requires_resubscribe());
        assert!(!ConnectionEvent::Disconnected.requires_resubscribe());
    }

    #[test]
    fn test_connection_state_u8_conversion() {
        for state in [
            ConnectionState::Disconnected,
            ConnectionState::Connected,
            ConnectionState::Closed,
        ] {
            assert_eq!(ConnectionState::from(u8::from(state)), state);
        }
        assert_eq!(ConnectionState::from(42), ConnectionState::Disconnected);
    }
}
