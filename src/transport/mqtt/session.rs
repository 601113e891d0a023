//! Connection session
//!
//! [`ConnectionSession`] is the single owner of the physical MQTT connection.
//! It is driven by periodic [`ConnectionSession::do_work`] calls from the agent
//! loop; each pass pumps the engine, applies the events it reported, and then
//! decides whether to connect, wait, or (re)subscribe.
//!
//! ```text
//! Unknown -> Connecting -> Connected -> Disconnected -> Unknown -> ...
//! ```
//!
//! `Connected` is only entered from `Connecting` on a zero CONNACK. Every
//! entry into `Disconnected` records a timestamp and the next retry time.

use crate::clock::SharedClock;
use crate::config::{HostnameSource, MqttSection};
use crate::protocol::{validate_envelope, MessageProperties, MessageType};
use crate::retry::{compute_next_retry, RetryParams};
use crate::state_store::ProvisioningStore;
use crate::transport::mqtt::connection::{ConnectionState, SessionTimings};
use crate::transport::mqtt::disconnect::{classify, reason_code_str, reason_codes, DisconnectCategory};
use crate::transport::mqtt::subscriptions::{SubscribeCallback, SubscribeOutcome, SubscriptionTracker};
use crate::transport::{
    qos_from_level, EngineError, InboundMessage, MessageChannel, MessageId, MqttEngine, QoS,
    SessionError, TransportEvent,
};
use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Notifications delivered to the session's owner
///
/// All methods default to no-ops. They run inside `do_work`, so they must
/// not block; the agent forwards them to its inbox.
pub trait ChannelEventHandler: Send {
    /// CONNACK received; `reason_code` 0 means connected
    fn on_connect(&mut self, _reason_code: u8) {}

    fn on_disconnect(&mut self, _reason_code: u8) {}

    /// A message that passed envelope validation
    fn on_message(&mut self, _message: &InboundMessage, _message_type: MessageType) {}

    fn on_publish(&mut self, _message_id: MessageId, _reason_code: u8) {}

    fn on_subscribe(&mut self, _outcome: &SubscribeOutcome) {}
}

/// Supplies the topics the device must be subscribed to
pub type TopicProvider = Box<dyn Fn() -> Vec<String> + Send>;

/// Connection parameters the session needs from configuration
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub hostname: Option<String>,
    pub hostname_source: HostnameSource,
    pub port: u16,
    pub keep_alive_secs: u16,
    pub qos: QoS,
    pub retry: RetryParams,
    pub timings: SessionTimings,
}

impl SessionConfig {
    pub fn from_config(config: &MqttSection) -> Self {
        Self {
            hostname: config.hostname.clone().filter(|h| !h.is_empty()),
            hostname_source: config.hostname_source,
            port: config.port,
            keep_alive_secs: config.keep_alive_secs,
            qos: qos_from_level(config.qos).unwrap_or(QoS::AtLeastOnce),
            retry: config.retry.unwrap_or_else(RetryParams::connection_default),
            timings: SessionTimings::from_config(config),
        }
    }
}

/// The communication channel state: connection, subscriptions and retry timestamps
pub struct ConnectionSession<E: MqttEngine> {
    engine: E,
    config: SessionConfig,
    clock: SharedClock,
    store: Option<Arc<dyn ProvisioningStore>>,
    handler: Option<Box<dyn ChannelEventHandler>>,
    topic_provider: Option<TopicProvider>,
    rng: StdRng,

    state: ConnectionState,
    subscriptions: SubscriptionTracker,
    topics_subscribed: bool,
    resolved_hostname: Option<String>,
    connect_attempts: u32,

    connect_started_at: Option<DateTime<Utc>>,
    last_connected_at: Option<DateTime<Utc>>,
    last_disconnected_at: Option<DateTime<Utc>>,
    next_retry_at: Option<DateTime<Utc>>,
    next_hostname_query_at: Option<DateTime<Utc>>,
    suppressed_until: Option<DateTime<Utc>>,
    shut_down: bool,
}

impl<E: MqttEngine> ConnectionSession<E> {
    pub fn new(engine: E, config: SessionConfig, clock: SharedClock) -> Self {
        Self {
            engine,
            config,
            clock,
            store: None,
            handler: None,
            topic_provider: None,
            rng: StdRng::from_entropy(),
            state: ConnectionState::Unknown,
            subscriptions: SubscriptionTracker::new(),
            topics_subscribed: false,
            resolved_hostname: None,
            connect_attempts: 0,
            connect_started_at: None,
            last_connected_at: None,
            last_disconnected_at: None,
            next_retry_at: None,
            next_hostname_query_at: None,
            suppressed_until: None,
            shut_down: false,
        }
    }

    /// Store queried for the broker hostname when it is provisioned dynamically
    pub fn with_store(mut self, store: Arc<dyn ProvisioningStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_handler(mut self, handler: Box<dyn ChannelEventHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn with_topic_provider(mut self, provider: TopicProvider) -> Self {
        self.topic_provider = Some(provider);
        self
    }

    /// Seed the jitter source
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn subscriptions(&self) -> &SubscriptionTracker {
        &self.subscriptions
    }

    pub fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        self.next_retry_at
    }

    pub fn last_connected_at(&self) -> Option<DateTime<Utc>> {
        self.last_connected_at
    }

    pub fn last_disconnected_at(&self) -> Option<DateTime<Utc>> {
        self.last_disconnected_at
    }

    pub fn suppressed_until(&self) -> Option<DateTime<Utc>> {
        self.suppressed_until
    }

    pub fn qos(&self) -> QoS {
        self.config.qos
    }

    /// One pass of the state machine
    pub async fn do_work(&mut self) {
        if self.shut_down {
            return;
        }
        let now = self.clock.now();

        if self.is_suppressed(now) {
            debug!("Engine pump suppressed until {:?}", self.suppressed_until);
        } else {
            match self.engine.poll(self.config.timings.poll_timeout).await {
                Ok(events) => {
                    for event in events {
                        self.handle_event(event);
                    }
                }
                Err(e) => self.handle_pump_error(e),
            }
        }

        if self.resolve_hostname().is_none() {
            return;
        }

        self.ensure_topics_subscribed();
        self.connect_if_needed();
    }

    /// Drive `Unknown`/`Disconnected` towards `Connecting` when it is time.
    /// Returns true when a connect attempt was issued.
    pub fn connect_if_needed(&mut self) -> bool {
        if self.shut_down {
            return false;
        }
        let now = self.clock.now();
        match self.state {
            ConnectionState::Connected => false,
            ConnectionState::Connecting => {
                let timed_out = match (self.config.timings.connect_timeout, self.connect_started_at) {
                    (Some(timeout), Some(started)) => started
                        .checked_add_signed(timeout)
                        .is_some_and(|deadline| now >= deadline),
                    _ => false,
                };
                if !timed_out {
                    return false;
                }
                warn!(
                    "No CONNACK within {:?}, abandoning connect attempt",
                    self.config.timings.connect_timeout
                );
                if let Err(e) = self.engine.disconnect() {
                    debug!("Disconnect after connect timeout failed: {}", e);
                }
                self.set_state(ConnectionState::Unknown);
                self.attempt_connect()
            }
            ConnectionState::Disconnected => {
                if self.next_retry_at.is_some_and(|retry_at| now < retry_at) {
                    return false;
                }
                self.set_state(ConnectionState::Unknown);
                self.attempt_connect()
            }
            ConnectionState::Unknown => {
                if self.next_retry_at.is_some_and(|retry_at| now < retry_at) {
                    return false;
                }
                self.attempt_connect()
            }
        }
    }

    /// Publish on the live connection
    pub fn publish(
        &mut self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        properties: MessageProperties,
    ) -> Result<MessageId, SessionError> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected);
        }
        let message_id = self
            .engine
            .publish(topic, payload, qos, retain, properties)
            .inspect_err(|e| warn!("Publish to '{}' failed: {}", topic, e))?;
        debug!("Published message {} to '{}'", message_id, topic);
        Ok(message_id)
    }

    /// Subscribe to one topic; `callback` runs when the matching SUBACK arrives
    pub fn subscribe(
        &mut self,
        topic: &str,
        qos: QoS,
        callback: Option<SubscribeCallback>,
    ) -> Result<MessageId, SessionError> {
        self.subscribe_many(&[topic.to_string()], qos, callback)
    }

    /// Subscribe to several topics with one request
    pub fn subscribe_many(
        &mut self,
        topics: &[String],
        qos: QoS,
        callback: Option<SubscribeCallback>,
    ) -> Result<MessageId, SessionError> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected);
        }
        let message_id = self
            .engine
            .subscribe(topics, qos)
            .inspect_err(|e| warn!("Subscribe to {:?} failed: {}", topics, e))?;
        info!("Subscribing to {:?} (message id {})", topics, message_id);
        self.subscriptions
            .add_pending(message_id, topics.to_vec(), callback);
        Ok(message_id)
    }

    /// Close the connection on agent shutdown. The session stays
    /// `Disconnected` afterwards: later passes neither pump nor reconnect.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        if matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            info!("Closing MQTT connection");
            if let Err(e) = self.engine.disconnect() {
                warn!("Disconnect on shutdown failed: {}", e);
            }
        }
        self.enter_disconnected(self.config.timings.retry_delay);
        self.shut_down = true;
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// Apply one transport event
    pub fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::ConnAck { reason_code } => self.handle_connack(reason_code),
            TransportEvent::Disconnected { reason_code } => self.handle_disconnect(reason_code),
            TransportEvent::SubAck {
                message_id,
                granted,
            } => self.handle_suback(message_id, &granted),
            TransportEvent::PubAck {
                message_id,
                reason_code,
            } => {
                debug!("Publish {} acknowledged ({:#04x})", message_id, reason_code);
                if let Some(handler) = self.handler.as_mut() {
                    handler.on_publish(message_id, reason_code);
                }
            }
            TransportEvent::Message(message) => self.handle_message(message),
        }
    }

    fn handle_connack(&mut self, reason_code: u8) {
        if self.state != ConnectionState::Connecting {
            warn!(
                "Ignoring CONNACK ({:#04x}) in state '{}'",
                reason_code, self.state
            );
            return;
        }

        if reason_code == reason_codes::SUCCESS {
            let now = self.clock.now();
            self.last_connected_at = Some(now);
            self.connect_started_at = None;
            self.connect_attempts = 0;
            self.next_retry_at = None;
            self.set_state(ConnectionState::Connected);
        } else {
            let category = classify(reason_code);
            if reason_code == reason_codes::QUOTA_EXCEEDED {
                warn!("Connection refused: device quota exceeded ({:#04x})", reason_code);
            } else {
                log_reason("Connection refused", reason_code, category);
            }
            // stop the library from retrying on its own
            if let Err(e) = self.engine.disconnect() {
                debug!("Disconnect after refused connect failed: {}", e);
            }
            self.enter_disconnected(self.config.timings.retry_delay);
        }

        if let Some(handler) = self.handler.as_mut() {
            handler.on_connect(reason_code);
        }
    }

    fn handle_disconnect(&mut self, reason_code: u8) {
        log_reason("Disconnected", reason_code, classify(reason_code));
        self.enter_disconnected(self.config.timings.retry_delay);
        if let Some(handler) = self.handler.as_mut() {
            handler.on_disconnect(reason_code);
        }
    }

    fn handle_suback(&mut self, message_id: MessageId, granted: &[u8]) {
        let Some(outcome) = self.subscriptions.confirm(message_id, granted) else {
            debug!("SUBACK for unknown message id {}", message_id);
            return;
        };
        if outcome.is_success() {
            info!("Subscribed to {:?}", outcome.topics);
        } else {
            warn!(
                "Subscription to {:?} not fully granted: {:?}",
                outcome.topics, outcome.granted
            );
        }
        if let Some(handler) = self.handler.as_mut() {
            handler.on_subscribe(&outcome);
        }
    }

    fn handle_message(&mut self, message: InboundMessage) {
        match validate_envelope(&message.properties) {
            Ok(message_type) => {
                debug!("Received '{}' on '{}'", message_type, message.topic);
                if let Some(handler) = self.handler.as_mut() {
                    handler.on_message(&message, message_type);
                }
            }
            Err(e) => warn!("Dropping message on '{}': {}", message.topic, e),
        }
    }

    fn handle_pump_error(&mut self, error: EngineError) {
        if error.suppresses_pump() {
            let now = self.clock.now();
            let until = now + self.config.timings.suppression_window;
            error!(
                "Unrecoverable engine error, suppressing network pump until {}: {}",
                until, error
            );
            self.suppressed_until = Some(until);
            if matches!(
                self.state,
                ConnectionState::Connecting | ConnectionState::Connected
            ) {
                self.handle_disconnect(reason_codes::PROTOCOL_ERROR);
            }
        } else {
            warn!("Engine poll failed: {}", error);
            if matches!(
                self.state,
                ConnectionState::Connecting | ConnectionState::Connected
            ) {
                self.handle_disconnect(reason_codes::UNSPECIFIED_ERROR);
            }
        }
    }

    fn is_suppressed(&self, now: DateTime<Utc>) -> bool {
        self.suppressed_until.is_some_and(|until| now < until)
    }

    /// Hostname to connect to. When it is provisioned dynamically and not
    /// yet known, the store is re-queried on a short interval and connection
    /// attempts are held back until then.
    fn resolve_hostname(&mut self) -> Option<String> {
        if let Some(hostname) = &self.config.hostname {
            return Some(hostname.clone());
        }
        if let Some(hostname) = &self.resolved_hostname {
            return Some(hostname.clone());
        }

        let now = self.clock.now();
        if self.next_hostname_query_at.is_some_and(|at| now < at) {
            return None;
        }

        let queried = match self.config.hostname_source {
            HostnameSource::Dps => self
                .store
                .as_ref()
                .and_then(|store| store.get_broker_hostname()),
            HostnameSource::Config => {
                error!("No MQTT broker hostname configured");
                None
            }
        };

        match queried {
            Some(hostname) => {
                info!("Broker hostname provisioned: {}", hostname);
                self.resolved_hostname = Some(hostname.clone());
                self.next_hostname_query_at = None;
                Some(hostname)
            }
            None => {
                let recheck = now + self.config.timings.hostname_requery;
                debug!("Broker hostname not provisioned, checking again at {}", recheck);
                self.next_hostname_query_at = Some(recheck);
                self.next_retry_at =
                    Some(self.next_retry_at.map_or(recheck, |at| at.max(recheck)));
                None
            }
        }
    }

    fn attempt_connect(&mut self) -> bool {
        let Some(hostname) = self.resolve_hostname() else {
            return false;
        };
        let now = self.clock.now();

        match self
            .engine
            .connect(&hostname, self.config.port, self.config.keep_alive_secs)
        {
            Ok(()) => {
                self.connect_started_at = Some(now);
                self.set_state(ConnectionState::Connecting);
                true
            }
            Err(EngineError::InvalidArgument(reason)) => {
                error!(
                    "Connect to {}:{} rejected its arguments: {}",
                    hostname, self.config.port, reason
                );
                self.enter_disconnected(self.config.timings.invalid_argument_delay);
                false
            }
            Err(e) => {
                warn!("Connect to {}:{} failed: {}", hostname, self.config.port, e);
                if matches!(e, EngineError::Lookup(_)) {
                    // a stale provisioned name is looked up again next time
                    self.resolved_hostname = None;
                }
                self.enter_disconnected(self.config.timings.retry_delay);
                false
            }
        }
    }

    /// Subscribe once per connection epoch to the provider's topics
    fn ensure_topics_subscribed(&mut self) {
        if !self.is_connected() || self.topics_subscribed {
            return;
        }
        let Some(provider) = &self.topic_provider else {
            self.topics_subscribed = true;
            return;
        };

        let topics: Vec<String> = provider()
            .into_iter()
            .filter(|t| !self.subscriptions.is_subscribed(t) && !self.subscriptions.is_pending(t))
            .collect();
        if topics.is_empty() {
            self.topics_subscribed = true;
            return;
        }

        let qos = self.config.qos;
        if self.subscribe_many(&topics, qos, None).is_ok() {
            self.topics_subscribed = true;
        }
    }

    fn enter_disconnected(&mut self, additional_delay: TimeDelta) {
        let now = self.clock.now();
        let attempt = self.connect_attempts;
        self.connect_attempts = self.connect_attempts.saturating_add(1);

        let next_retry = compute_next_retry(
            now,
            additional_delay,
            attempt,
            &self.config.retry,
            &mut self.rng,
        );
        info!("Next connection attempt at {}", next_retry);

        self.last_disconnected_at = Some(now);
        self.next_retry_at = Some(next_retry);
        self.connect_started_at = None;
        self.topics_subscribed = false;
        self.subscriptions.clear();
        self.set_state(ConnectionState::Disconnected);
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state != next {
            info!("Connection state '{}' -> '{}'", self.state, next);
            self.state = next;
        }
    }
}

fn log_reason(context: &str, reason_code: u8, category: DisconnectCategory) {
    let reason = reason_code_str(reason_code);
    match category {
        DisconnectCategory::NonRecoverable => error!(
            "{}: {} ({:#04x}, {}), operator action may be required",
            context, reason, reason_code, category
        ),
        _ if reason_code == reason_codes::NORMAL_DISCONNECTION => {
            info!("{}: {} ({:#04x})", context, reason, reason_code)
        }
        _ => warn!(
            "{}: {} ({:#04x}, {})",
            context, reason, reason_code, category
        ),
    }
}

impl<E: MqttEngine> MessageChannel for ConnectionSession<E> {
    fn is_connected(&self) -> bool {
        ConnectionSession::is_connected(self)
    }

    fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions.is_subscribed(topic)
    }

    fn is_subscription_pending(&self, topic: &str) -> bool {
        self.subscriptions.is_pending(topic)
    }

    fn publish_message(
        &mut self,
        topic: &str,
        payload: Bytes,
        properties: MessageProperties,
    ) -> Result<MessageId, SessionError> {
        let qos = self.config.qos;
        self.publish(topic, payload, qos, false, properties)
    }

    fn subscribe_topic(&mut self, topic: &str) -> Result<MessageId, SessionError> {
        let qos = self.config.qos;
        self.subscribe(topic, qos, None)
    }
}
