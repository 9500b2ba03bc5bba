//! Crate-level error types

use thiserror::Error;

use crate::messaging::errors::MessagingError;

/// Errors surfaced by the runtime (configuration, broker plumbing, lifecycle).
///
/// Pipeline bodies report failures as `anyhow::Error`; those never leave the
/// [`Processor`](crate::chain::Processor) as a `CoreError` because they are folded
/// into the context's error list instead.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Messaging error: {0}")]
    Messaging(#[from] MessagingError),

    #[error("Shutdown in progress")]
    ShutdownInProgress,

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl CoreError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}

impl From<config::ConfigError> for CoreError {
    fn from(err: config::ConfigError) -> Self {
        CoreError::Configuration(err.to_string())
    }
}

/// Result type alias for [`CoreError`]
pub type Result<T> = std::result::Result<T, CoreError>;
