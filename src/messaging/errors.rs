//! # Messaging Error Types
//!
//! Structured error handling for the broker seam and the context codec, using
//! thiserror instead of `Box<dyn Error>` patterns.

use thiserror::Error;

/// Messaging error types
#[derive(Error, Debug)]
pub enum MessagingError {
    #[error("Broker connection error: {message}")]
    Connection { message: String },

    #[error("Client {client} is not connected")]
    NotConnected { client: String },

    #[error("Subscription failed: {topic}/{group}: {message}")]
    Subscription {
        topic: String,
        group: String,
        message: String,
    },

    #[error("Publish failed: {subject}: {message}")]
    Publish { subject: String, message: String },

    #[error("Message serialization error: {message}")]
    MessageSerialization { message: String },

    #[error("Message deserialization error: {message}")]
    MessageDeserialization { message: String },

    #[error("Request timeout: {subject} did not reply within {timeout_ms}ms")]
    Timeout { subject: String, timeout_ms: u64 },

    #[error("Client closed: {client}")]
    Closed { client: String },

    #[error("Internal messaging error: {message}")]
    Internal { message: String },
}

impl MessagingError {
    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a not connected error
    pub fn not_connected(client: impl Into<String>) -> Self {
        Self::NotConnected {
            client: client.into(),
        }
    }

    /// Create a subscription error
    pub fn subscription(
        topic: impl Into<String>,
        group: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Subscription {
            topic: topic.into(),
            group: group.into(),
            message: message.into(),
        }
    }

    /// Create a publish error
    pub fn publish(subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Publish {
            subject: subject.into(),
            message: message.into(),
        }
    }

    /// Create a message serialization error
    pub fn message_serialization(message: impl Into<String>) -> Self {
        Self::MessageSerialization {
            message: message.into(),
        }
    }

    /// Create a message deserialization error
    pub fn message_deserialization(message: impl Into<String>) -> Self {
        Self::MessageDeserialization {
            message: message.into(),
        }
    }

    /// Create a request timeout error
    pub fn timeout(subject: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            subject: subject.into(),
            timeout_ms,
        }
    }

    /// Create a closed client error
    pub fn closed(client: impl Into<String>) -> Self {
        Self::Closed {
            client: client.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether retrying after a reconnect can succeed
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::NotConnected { .. })
    }
}

/// Conversion from serde_json::Error to MessagingError
impl From<serde_json::Error> for MessagingError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_syntax() || err.is_eof() || err.is_data() {
            MessagingError::message_deserialization(err.to_string())
        } else {
            MessagingError::message_serialization(err.to_string())
        }
    }
}

/// Result type alias for messaging operations
pub type MessagingResult<T> = Result<T, MessagingError>;
