//! Mock implementations for testing
//!
//! Provides a scripted MQTT engine, a manually advanced clock and a recording
//! message channel so the session, operations and agent loop can be tested
//! without a broker.

use crate::clock::Clock;
use crate::protocol::{
    CorrelationId, MessageProperties, MessageType, PROPERTY_EXTENDED_RESULT_CODE,
    PROPERTY_RESULT_CODE,
};
use crate::transport::{
    EngineError, InboundMessage, MessageChannel, MessageId, MqttEngine, QoS, SessionError,
    TransportEvent,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A call observed by [`MockEngine`]
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    Connect {
        host: String,
        port: u16,
        keep_alive_secs: u16,
    },
    Disconnect,
    Publish {
        message_id: MessageId,
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        properties: MessageProperties,
    },
    Subscribe {
        message_id: MessageId,
        topics: Vec<String>,
        qos: QoS,
    },
}

/// Scripted MQTT engine
///
/// Records every call, hands out sequential message ids, and returns queued
/// events from `poll` in the order they were pushed.
#[derive(Debug, Default)]
pub struct MockEngine {
    calls: Vec<EngineCall>,
    events: VecDeque<TransportEvent>,
    next_message_id: MessageId,
    poll_count: usize,
    connect_failure: Option<EngineError>,
    publish_failure: Option<EngineError>,
    subscribe_failure: Option<EngineError>,
    poll_failure: Option<EngineError>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            next_message_id: 1,
            ..Self::default()
        }
    }

    /// Queue an event for the next poll
    pub fn push_event(&mut self, event: TransportEvent) {
        self.events.push_back(event);
    }

    pub fn fail_next_connect(&mut self, error: EngineError) {
        self.connect_failure = Some(error);
    }

    pub fn fail_next_publish(&mut self, error: EngineError) {
        self.publish_failure = Some(error);
    }

    pub fn fail_next_subscribe(&mut self, error: EngineError) {
        self.subscribe_failure = Some(error);
    }

    pub fn fail_next_poll(&mut self, error: EngineError) {
        self.poll_failure = Some(error);
    }

    pub fn calls(&self) -> &[EngineCall] {
        &self.calls
    }

    pub fn clear_calls(&mut self) {
        self.calls.clear();
    }

    pub fn poll_count(&self) -> usize {
        self.poll_count
    }

    pub fn connect_count(&self) -> usize {
        self.calls
            .iter()
            .filter(|c| matches!(c, EngineCall::Connect { .. }))
            .count()
    }

    pub fn subscribe_calls(&self) -> Vec<(MessageId, Vec<String>)> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                EngineCall::Subscribe {
                    message_id, topics, ..
                } => Some((*message_id, topics.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn published(&self) -> Vec<(MessageId, String, MessageProperties)> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                EngineCall::Publish {
                    message_id,
                    topic,
                    properties,
                    ..
                } => Some((*message_id, topic.clone(), properties.clone())),
                _ => None,
            })
            .collect()
    }

    fn allocate_message_id(&mut self) -> MessageId {
        let id = self.next_message_id.max(1);
        self.next_message_id = id + 1;
        id
    }
}

#[async_trait]
impl MqttEngine for MockEngine {
    fn connect(&mut self, host: &str, port: u16, keep_alive_secs: u16) -> Result<(), EngineError> {
        self.calls.push(EngineCall::Connect {
            host: host.to_string(),
            port,
            keep_alive_secs,
        });
        match self.connect_failure.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn disconnect(&mut self) -> Result<(), EngineError> {
        self.calls.push(EngineCall::Disconnect);
        Ok(())
    }

    fn publish(
        &mut self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        properties: MessageProperties,
    ) -> Result<MessageId, EngineError> {
        if let Some(error) = self.publish_failure.take() {
            return Err(error);
        }
        let message_id = self.allocate_message_id();
        self.calls.push(EngineCall::Publish {
            message_id,
            topic: topic.to_string(),
            payload,
            qos,
            retain,
            properties,
        });
        Ok(message_id)
    }

    fn subscribe(&mut self, topics: &[String], qos: QoS) -> Result<MessageId, EngineError> {
        if let Some(error) = self.subscribe_failure.take() {
            return Err(error);
        }
        let message_id = self.allocate_message_id();
        self.calls.push(EngineCall::Subscribe {
            message_id,
            topics: topics.to_vec(),
            qos,
        });
        Ok(message_id)
    }

    async fn poll(&mut self, _timeout: Duration) -> Result<Vec<TransportEvent>, EngineError> {
        self.poll_count += 1;
        if let Some(error) = self.poll_failure.take() {
            return Err(error);
        }
        Ok(self.events.drain(..).collect())
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Starts at 2024-01-01T00:00:00Z
    pub fn new() -> Self {
        let start = Utc
            .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or_default();
        Self::starting_at(start)
    }

    pub fn starting_at(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn advance(&self, delta: TimeDelta) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += delta;
    }

    pub fn set(&self, time: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = time;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A message published through [`RecordingChannel`]
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub message_id: MessageId,
    pub topic: String,
    pub payload: Bytes,
    pub properties: MessageProperties,
}

impl PublishedMessage {
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        let data = self.properties.correlation_data.as_ref()?;
        CorrelationId::parse(std::str::from_utf8(data).ok()?).ok()
    }

    pub fn payload_json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.payload).ok()
    }
}

/// [`MessageChannel`] double for operation tests
#[derive(Debug, Default)]
pub struct RecordingChannel {
    pub connected: bool,
    pub subscribed: HashSet<String>,
    pub pending: HashSet<String>,
    pub published: Vec<PublishedMessage>,
    pub subscribe_requests: Vec<String>,
    next_message_id: MessageId,
    publish_failure: Option<SessionError>,
}

impl RecordingChannel {
    /// Connected channel with `topics` already confirmed
    pub fn connected_with(topics: &[&str]) -> Self {
        Self {
            connected: true,
            subscribed: topics.iter().map(|t| t.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn fail_next_publish(&mut self, error: SessionError) {
        self.publish_failure = Some(error);
    }

    pub fn last_published(&self) -> Option<&PublishedMessage> {
        self.published.last()
    }

    /// Confirm every pending subscription
    pub fn confirm_pending(&mut self) {
        let pending: Vec<String> = self.pending.drain().collect();
        self.subscribed.extend(pending);
    }
}

impl MessageChannel for RecordingChannel {
    fn is_connected(&self) -> bool {
        self.connected
    }

    fn is_subscribed(&self, topic: &str) -> bool {
        self.subscribed.contains(topic)
    }

    fn is_subscription_pending(&self, topic: &str) -> bool {
        self.pending.contains(topic)
    }

    fn publish_message(
        &mut self,
        topic: &str,
        payload: Bytes,
        properties: MessageProperties,
    ) -> Result<MessageId, SessionError> {
        if let Some(error) = self.publish_failure.take() {
            return Err(error);
        }
        if !self.connected {
            return Err(SessionError::NotConnected);
        }
        self.next_message_id += 1;
        self.published.push(PublishedMessage {
            message_id: self.next_message_id,
            topic: topic.to_string(),
            payload,
            properties,
        });
        Ok(self.next_message_id)
    }

    fn subscribe_topic(&mut self, topic: &str) -> Result<MessageId, SessionError> {
        if !self.connected {
            return Err(SessionError::NotConnected);
        }
        self.next_message_id += 1;
        self.subscribe_requests.push(topic.to_string());
        self.subscribed.remove(topic);
        self.pending.insert(topic.to_string());
        Ok(self.next_message_id)
    }
}

/// Build a service response as it arrives from the broker
pub fn response_message(
    topic: &str,
    message_type: MessageType,
    correlation_id: &CorrelationId,
    result_code: i32,
    extended_result_code: i32,
    payload: &str,
) -> InboundMessage {
    let mut properties = MessageProperties::for_request(message_type, correlation_id);
    properties.add_user_property(PROPERTY_RESULT_CODE, &result_code.to_string());
    properties.add_user_property(
        PROPERTY_EXTENDED_RESULT_CODE,
        &extended_result_code.to_string(),
    );
    InboundMessage {
        topic: topic.to_string(),
        payload: Bytes::from(payload.to_string()),
        qos: QoS::AtLeastOnce,
        retain: false,
        properties,
    }
}

/// Build a service notification (no correlation data, no result codes)
pub fn notification_message(topic: &str, message_type: MessageType, payload: &str) -> InboundMessage {
    let mut properties = MessageProperties::new();
    properties.add_user_property(crate::protocol::PROPERTY_MESSAGE_TYPE, message_type.as_str());
    properties.add_user_property(
        crate::protocol::PROPERTY_PROTOCOL_ID,
        crate::protocol::PROTOCOL_VERSION,
    );
    InboundMessage {
        topic: topic.to_string(),
        payload: Bytes::from(payload.to_string()),
        qos: QoS::AtLeastOnce,
        retain: false,
        properties,
    }
}
