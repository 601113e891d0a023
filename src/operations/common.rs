//! Helpers shared by the request/response operations

use crate::protocol::{CorrelationId, MessageProperties, MessageType, TopicBuilder, TopicError};
use crate::state_store::ProvisioningStore;
use crate::transport::{MessageChannel, MessageId, SessionError};
use bytes::Bytes;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// How long a request waits for its response before the attempt fails
pub const DEFAULT_RESPONSE_TIMEOUT_SECS: i64 = 180;

/// Where the device's identity and progress flags come from
#[derive(Clone)]
pub struct DeviceIdentity {
    store: Arc<dyn ProvisioningStore>,
    configured_device_id: Option<String>,
}

impl fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("configured_device_id", &self.configured_device_id)
            .finish_non_exhaustive()
    }
}

impl DeviceIdentity {
    pub fn new(store: Arc<dyn ProvisioningStore>, configured_device_id: Option<String>) -> Self {
        Self {
            store,
            configured_device_id: configured_device_id.filter(|id| !id.is_empty()),
        }
    }

    pub fn store(&self) -> &dyn ProvisioningStore {
        self.store.as_ref()
    }

    /// External device id: the provisioned value wins over the configured one
    pub fn device_id(&self) -> Option<String> {
        self.store
            .get_external_device_id()
            .or_else(|| self.configured_device_id.clone())
    }

    pub fn scope_id(&self) -> Option<String> {
        self.store.get_scope_id()
    }

    /// Publish and response topics, scoped when `scoped` is set
    pub fn topics(&self, scoped: bool) -> Result<RequestTopics, NotReady> {
        let device_id = self.device_id().ok_or(NotReady::MissingDeviceId)?;
        let scope_id = if scoped {
            Some(self.scope_id().ok_or(NotReady::MissingScopeId)?)
        } else {
            None
        };
        Ok(RequestTopics {
            publish: TopicBuilder::publish_topic(&device_id, scope_id.as_deref())?,
            response: TopicBuilder::subscribe_topic(&device_id, scope_id.as_deref())?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTopics {
    pub publish: String,
    pub response: String,
}

/// Why a request cannot be sent on this pass
#[derive(Debug, Clone, PartialEq)]
pub enum NotReady {
    NotConnected,
    MissingDeviceId,
    MissingScopeId,
    InvalidTopic(TopicError),
    /// The response topic subscription is in flight
    Subscribing(String),
    SubscribeFailed(SessionError),
}

impl From<TopicError> for NotReady {
    fn from(e: TopicError) -> Self {
        NotReady::InvalidTopic(e)
    }
}

impl fmt::Display for NotReady {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotReady::NotConnected => f.write_str("channel not connected"),
            NotReady::MissingDeviceId => f.write_str("external device id not known"),
            NotReady::MissingScopeId => f.write_str("scope id not known"),
            NotReady::InvalidTopic(e) => write!(f, "invalid topic: {e}"),
            NotReady::Subscribing(topic) => write!(f, "waiting for subscription to '{topic}'"),
            NotReady::SubscribeFailed(e) => write!(f, "subscribe failed: {e}"),
        }
    }
}

/// Check connectivity and identity, and make sure the response topic is
/// subscribed. A missing subscription is requested here and reported as
/// [`NotReady::Subscribing`]; the caller tries again on a later pass.
pub fn prepare_request(
    channel: &mut dyn MessageChannel,
    identity: &DeviceIdentity,
    scoped: bool,
) -> Result<RequestTopics, NotReady> {
    if !channel.is_connected() {
        return Err(NotReady::NotConnected);
    }
    let topics = identity.topics(scoped)?;

    if channel.is_subscribed(&topics.response) {
        return Ok(topics);
    }
    if !channel.is_subscription_pending(&topics.response) {
        info!("Subscribing to response topic '{}'", topics.response);
        channel
            .subscribe_topic(&topics.response)
            .map_err(NotReady::SubscribeFailed)?;
    }
    Err(NotReady::Subscribing(topics.response))
}

/// Errors from [`publish_request`]
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("failed to encode request body: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Send(#[from] SessionError),
}

/// Encode `body` as JSON and publish it as a `message_type` request
pub fn publish_request<T: Serialize + ?Sized>(
    channel: &mut dyn MessageChannel,
    topic: &str,
    message_type: MessageType,
    correlation_id: &CorrelationId,
    body: &T,
) -> Result<MessageId, RequestError> {
    let payload = serde_json::to_vec(body)?;
    let properties = MessageProperties::for_request(message_type, correlation_id);
    let message_id = channel.publish_message(topic, Bytes::from(payload), properties)?;
    debug!(
        "Sent {} (message id {}, correlation id {}) to '{}'",
        message_type, message_id, correlation_id, topic
    );
    Ok(message_id)
}
