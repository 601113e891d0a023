//! Correlation identifiers
//!
//! A correlation id pairs an outbound request with its asynchronous response.
//! The agent generates hyphenated UUIDs (36 bytes). Ids echoed by the service
//! may be any printable token, such as a 32-byte UUID without hyphens or a
//! time-based value.

use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Length of a generated correlation id
pub const CORRELATION_ID_LENGTH: usize = 36;

#[derive(Debug, Error, PartialEq)]
pub enum CorrelationIdError {
    #[error("correlation id cannot be empty")]
    Empty,
    #[error("correlation id is not printable ASCII")]
    NotPrintable,
}

/// Opaque request/response pairing token
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Random UUID v4 id, 36 bytes with hyphens
    pub fn generate() -> Self {
        Self(Uuid::new_v4().hyphenated().to_string())
    }

    /// Wrap an id echoed from a prior exchange
    pub fn parse(value: &str) -> Result<Self, CorrelationIdError> {
        if value.is_empty() {
            return Err(CorrelationIdError::Empty);
        }
        if !value.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(CorrelationIdError::NotPrintable);
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
