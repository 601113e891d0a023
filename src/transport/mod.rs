//! Transport layer for the device agent
//!
//! This module defines the two seams around the connection session:
//!
//! - [`MqttEngine`] abstracts the MQTT client library. The session drives it
//!   and never sees library types, which keeps the state machine testable
//!   with a scripted engine.
//! - [`MessageChannel`] is the narrow view of the session that operation
//!   modules receive: connectivity, subscription membership, publish and
//!   subscribe.

use crate::protocol::MessageProperties;
use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;

pub mod mqtt;

pub use rumqttc::v5::mqttbytes::QoS;

/// Locally assigned id of a publish or subscribe request
pub type MessageId = i32;

/// Errors returned by engine calls
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("out of memory")]
    NoMemory,
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("payload too large: {0} bytes")]
    PayloadSize(usize),
    #[error("malformed UTF-8 in topic or property")]
    MalformedUtf8,
    #[error("QoS not supported")]
    QosNotSupported,
    #[error("packet exceeds the broker maximum")]
    OversizePacket,
    #[error("no connection")]
    NoConnection,
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("hostname lookup failed: {0}")]
    Lookup(String),
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("I/O error: {0}")]
    Io(String),
}

impl EngineError {
    /// Errors that retrying the same request cannot fix
    pub fn is_unrecoverable(&self) -> bool {
        matches!(
            self,
            EngineError::InvalidArgument(_)
                | EngineError::NoMemory
                | EngineError::Protocol(_)
                | EngineError::PayloadSize(_)
                | EngineError::MalformedUtf8
                | EngineError::QosNotSupported
                | EngineError::OversizePacket
        )
    }

    pub fn is_no_connection(&self) -> bool {
        matches!(
            self,
            EngineError::NoConnection | EngineError::ConnectionLost(_)
        )
    }

    /// Pump errors that indicate broken local state; the session stops
    /// pumping the engine for a while when it sees one
    pub fn suppresses_pump(&self) -> bool {
        matches!(
            self,
            EngineError::InvalidArgument(_)
                | EngineError::NoMemory
                | EngineError::Protocol(_)
                | EngineError::Io(_)
        )
    }
}

/// A message delivered on a subscribed topic
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub properties: MessageProperties,
}

impl InboundMessage {
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// Events observed by the engine, delivered in the order they occurred
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// CONNACK (or a refused connect), 0 means success
    ConnAck { reason_code: u8 },
    /// The connection ended; `reason_code` is the broker's DISCONNECT reason,
    /// or 0x80 (unspecified) when the network dropped
    Disconnected { reason_code: u8 },
    SubAck {
        message_id: MessageId,
        granted: Vec<u8>,
    },
    PubAck {
        message_id: MessageId,
        reason_code: u8,
    },
    Message(InboundMessage),
}

/// MQTT client library seam
///
/// `connect`, `publish` and `subscribe` never wait for the network; their
/// outcome is reported later through [`MqttEngine::poll`].
#[async_trait::async_trait]
pub trait MqttEngine: Send {
    /// Start a connection attempt. Success means the attempt was issued, not
    /// that the broker accepted it.
    fn connect(&mut self, host: &str, port: u16, keep_alive_secs: u16)
        -> Result<(), EngineError>;

    /// Drop the current connection without letting the library reconnect
    fn disconnect(&mut self) -> Result<(), EngineError>;

    fn publish(
        &mut self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        properties: MessageProperties,
    ) -> Result<MessageId, EngineError>;

    /// Subscribe to all `topics` with one request
    fn subscribe(&mut self, topics: &[String], qos: QoS) -> Result<MessageId, EngineError>;

    /// Pump network I/O for at most `timeout`
    async fn poll(&mut self, timeout: Duration) -> Result<Vec<TransportEvent>, EngineError>;
}

/// Errors surfaced by the connection session's publish/subscribe API
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SessionError {
    #[error("communication channel is not connected")]
    NotConnected,
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
}

impl SessionError {
    pub fn is_unrecoverable(&self) -> bool {
        match self {
            SessionError::NotConnected => false,
            SessionError::Engine(e) => e.is_unrecoverable(),
        }
    }

    pub fn is_no_connection(&self) -> bool {
        match self {
            SessionError::NotConnected => true,
            SessionError::Engine(e) => e.is_no_connection(),
        }
    }
}

/// What an operation module may do with the communication channel
pub trait MessageChannel: Send {
    fn is_connected(&self) -> bool;

    fn is_subscribed(&self, topic: &str) -> bool;

    fn is_subscription_pending(&self, topic: &str) -> bool;

    /// Publish with the channel's configured QoS, not retained
    fn publish_message(
        &mut self,
        topic: &str,
        payload: Bytes,
        properties: MessageProperties,
    ) -> Result<MessageId, SessionError>;

    /// Subscribe to a single topic with the channel's configured QoS
    fn subscribe_topic(&mut self, topic: &str) -> Result<MessageId, SessionError>;
}

/// Map a configured QoS level onto the library's type
pub fn qos_from_level(level: u8) -> Option<QoS> {
    match level {
        0 => Some(QoS::AtMostOnce),
        1 => Some(QoS::AtLeastOnce),
        2 => Some(QoS::ExactlyOnce),
        _ => None,
    }
}
