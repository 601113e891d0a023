//! Device update protocol
//!
//! Message types, result codes, topic naming, correlation ids and the
//! property codec used to pair asynchronous requests with their responses.

pub mod correlation;
pub mod messages;
pub mod properties;
pub mod topics;

pub use correlation::{CorrelationId, CorrelationIdError};
pub use messages::*;
pub use properties::{
    correlation_matches, read_common_response_properties, validate_envelope, MessageProperties,
    PropertyError,
};
pub use topics::{TopicBuilder, TopicError};
