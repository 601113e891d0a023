//! Crate-level error type
//!
//! Each layer keeps its own `thiserror` enum; [`AgentError`] wraps them for
//! the agent start-up path and the binary.

use crate::config::ConfigError;
use crate::protocol::{PropertyError, TopicError};
use crate::state_store::StateStoreError;
use crate::transport::{EngineError, SessionError};
use crate::workqueue::WorkQueueError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("State store error: {0}")]
    StateStore(#[from] StateStoreError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("MQTT engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Invalid message properties: {0}")]
    Property(#[from] PropertyError),

    #[error("Invalid topic: {0}")]
    Topic(#[from] TopicError),

    #[error("Work queue error: {0}")]
    WorkQueue(#[from] WorkQueueError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl AgentError {
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Failures that need an operator to change configuration or local files
    pub fn requires_operator(&self) -> bool {
        match self {
            AgentError::Config(_) | AgentError::StateStore(_) | AgentError::Io(_) => true,
            AgentError::Engine(e) => e.is_unrecoverable(),
            AgentError::Session(e) => e.is_unrecoverable(),
            _ => false,
        }
    }
}

/// Result type for agent operations
pub type AgentResult<T> = Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversions_keep_the_source_message() {
        let error: AgentError = ConfigError::InvalidDeviceId("a/b".to_string()).into();
        assert!(matches!(error, AgentError::Config(_)));
        assert!(error.to_string().starts_with("Configuration error:"));

        let error: AgentError = SessionError::NotConnected.into();
        assert_eq!(
            error.to_string(),
            "Session error: communication channel is not connected"
        );
    }

    #[test]
    fn test_operator_classification() {
        assert!(AgentError::from(ConfigError::InvalidConfig("qos".into())).requires_operator());
        assert!(AgentError::from(EngineError::InvalidArgument("port".into())).requires_operator());
        assert!(!AgentError::from(EngineError::NoConnection).requires_operator());
        assert!(!AgentError::internal("unexpected").requires_operator());
    }

    #[test]
    fn test_internal_constructor() {
        let error = AgentError::internal("agent stopped");
        assert_eq!(error.to_string(), "Internal error: agent stopped");
    }
}
