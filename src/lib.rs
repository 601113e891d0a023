//! Device update agent
//!
//! The communication core of a device update agent: one durable MQTT v5
//! session to a cloud broker, and the request/response operations that run
//! over it.
//!
//! # Overview
//!
//! - [`transport::mqtt::ConnectionSession`] - connection state machine with
//!   reason-code driven backoff and subscription tracking
//! - [`retry`] - exponential backoff with bounded jitter
//! - [`protocol`] - message types, topics and the user-property codec that
//!   pairs responses with requests
//! - [`operations`] - enrollment, agent info, update and result reporting
//! - [`workqueue`] - bounded queues between network callbacks and workers
//! - [`agent::DeviceAgent`] - the main loop tying it together
//!
//! # Quick Start
//!
//! ```rust
//! use du_agent::protocol::{CorrelationId, MessageProperties, MessageType};
//!
//! let correlation_id = CorrelationId::generate();
//! let properties = MessageProperties::for_request(MessageType::EnrollmentRequest, &correlation_id);
//! assert_eq!(properties.message_type(), Some("enr_req"));
//! ```

pub mod agent;
pub mod clock;
pub mod config;
pub mod error;
pub mod observability;
pub mod operations;
pub mod protocol;
pub mod retry;
pub mod state_store;
pub mod testing;
pub mod transport;
pub mod workqueue;

pub use agent::DeviceAgent;
pub use config::{AgentConfig, ConfigError};
pub use error::{AgentError, AgentResult};
pub use transport::mqtt::{ConnectionSession, RumqttcEngine};
pub use workqueue::{WorkItem, WorkQueue};
