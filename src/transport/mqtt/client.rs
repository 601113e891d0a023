//! rumqttc-backed MQTT engine
//!
//! [`RumqttcEngine`] implements [`MqttEngine`] on top of rumqttc's v5 client.
//! Requests go through the non-blocking `try_*` client calls and return a
//! locally assigned message id at once; the event loop later reports the
//! broker packet id, which is mapped back to the local id before SUBACK and
//! PUBACK events reach the session.
//!
//! rumqttc reconnects on its own whenever its event loop is polled after an
//! error. The engine drops the event loop on any connection error instead, so
//! only the session decides when the next attempt happens.

use crate::protocol::MessageProperties;
use crate::transport::mqtt::connection::{configure_mqtt_options, ConnectSettings};
use crate::transport::mqtt::message_handler::{ErrorRoute, EventRoute, MessageHandler};
use crate::transport::{EngineError, MessageId, MqttEngine, QoS, TransportEvent};
use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::Filter;
use rumqttc::v5::{AsyncClient, EventLoop};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Capacity of the client request channel
const REQUEST_CHANNEL_CAPACITY: usize = 32;

/// MQTT engine backed by rumqttc
pub struct RumqttcEngine {
    settings: ConnectSettings,
    client: Option<AsyncClient>,
    event_loop: Option<EventLoop>,
    next_message_id: MessageId,
    /// Local ids of publishes not yet seen leaving the client, in request order
    unsent_publishes: VecDeque<MessageId>,
    unsent_subscribes: VecDeque<MessageId>,
    /// Broker packet id to local id for requests awaiting an ack
    publish_ids: HashMap<u16, MessageId>,
    subscribe_ids: HashMap<u16, MessageId>,
}

impl RumqttcEngine {
    pub fn new(settings: ConnectSettings) -> Self {
        Self {
            settings,
            client: None,
            event_loop: None,
            next_message_id: 1,
            unsent_publishes: VecDeque::new(),
            unsent_subscribes: VecDeque::new(),
            publish_ids: HashMap::new(),
            subscribe_ids: HashMap::new(),
        }
    }

    fn allocate_message_id(&mut self) -> MessageId {
        let id = self.next_message_id;
        self.next_message_id = if id >= i32::from(u16::MAX) { 1 } else { id + 1 };
        id
    }

    fn connected_client(&self) -> Result<&AsyncClient, EngineError> {
        match (&self.client, &self.event_loop) {
            (Some(client), Some(_)) => Ok(client),
            _ => Err(EngineError::NoConnection),
        }
    }

    /// Forget the current connection and every id mapping tied to it
    fn drop_connection(&mut self) {
        self.client = None;
        self.event_loop = None;
        self.unsent_publishes.clear();
        self.unsent_subscribes.clear();
        self.publish_ids.clear();
        self.subscribe_ids.clear();
    }

    fn handle_route(&mut self, route: EventRoute, events: &mut Vec<TransportEvent>) {
        match route {
            EventRoute::OutgoingPublish(pkid) => {
                if let Some(local) = self.unsent_publishes.pop_front() {
                    // QoS 0 publishes carry packet id 0 and are never acknowledged
                    if pkid != 0 {
                        self.publish_ids.insert(pkid, local);
                    }
                }
            }
            EventRoute::OutgoingSubscribe(pkid) => {
                if let Some(local) = self.unsent_subscribes.pop_front() {
                    self.subscribe_ids.insert(pkid, local);
                }
            }
            EventRoute::Transport(TransportEvent::SubAck {
                message_id,
                granted,
            }) => match self.subscribe_ids.remove(&(message_id as u16)) {
                Some(local) => events.push(TransportEvent::SubAck {
                    message_id: local,
                    granted,
                }),
                None => debug!("SUBACK for unknown packet id {}", message_id),
            },
            EventRoute::Transport(TransportEvent::PubAck {
                message_id,
                reason_code,
            }) => {
                if let Some(local) = self.publish_ids.remove(&(message_id as u16)) {
                    events.push(TransportEvent::PubAck {
                        message_id: local,
                        reason_code,
                    });
                }
            }
            EventRoute::Transport(event) => events.push(event),
            EventRoute::Ignored => {}
        }
    }
}

#[async_trait::async_trait]
impl MqttEngine for RumqttcEngine {
    fn connect(&mut self, host: &str, port: u16, keep_alive_secs: u16) -> Result<(), EngineError> {
        let options = configure_mqtt_options(&self.settings, host, port, keep_alive_secs)?;
        self.drop_connection();

        // rumqttc opens the socket on the first poll
        let (client, event_loop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        self.client = Some(client);
        self.event_loop = Some(event_loop);
        info!(
            "MQTT connect issued to {}:{} as '{}'",
            host, port, self.settings.client_id
        );
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), EngineError> {
        if let Some(client) = &self.client {
            if let Err(e) = client.try_disconnect() {
                debug!("Disconnect request not queued: {}", e);
            }
        }
        self.drop_connection();
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
        let publish_properties = MessageHandler::properties_to_publish(properties);
        self.connected_client()?
            .try_publish_with_properties(topic, qos, retain, payload, publish_properties)
            .map_err(MessageHandler::map_client_error)?;

        let id = self.allocate_message_id();
        self.unsent_publishes.push_back(id);
        Ok(id)
    }

    fn subscribe(&mut self, topics: &[String], qos: QoS) -> Result<MessageId, EngineError> {
        if topics.is_empty() {
            return Err(EngineError::InvalidArgument(
                "subscribe needs at least one topic".to_string(),
            ));
        }
        let filters: Vec<Filter> = topics
            .iter()
            .map(|topic| Filter::new(topic.clone(), qos))
            .collect();
        self.connected_client()?
            .try_subscribe_many(filters)
            .map_err(MessageHandler::map_client_error)?;

        let id = self.allocate_message_id();
        self.unsent_subscribes.push_back(id);
        Ok(id)
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Vec<TransportEvent>, EngineError> {
        let mut events = Vec::new();
        let deadline = Instant::now() + timeout;

        loop {
            let Some(event_loop) = self.event_loop.as_mut() else {
                break;
            };
            let polled = tokio::time::timeout_at(deadline, event_loop.poll()).await;
            match polled {
                Err(_elapsed) => break,
                Ok(Ok(event)) => {
                    let route = MessageHandler::route_mqtt_event(&event);
                    let ends_connection =
                        matches!(route, EventRoute::Transport(TransportEvent::Disconnected { .. }));
                    self.handle_route(route, &mut events);
                    if ends_connection {
                        self.drop_connection();
                        break;
                    }
                }
                Ok(Err(error)) => {
                    self.drop_connection();
                    match MessageHandler::route_connection_error(&error) {
                        ErrorRoute::ConnectionEnded(event) => {
                            warn!("MQTT connection ended: {}", error);
                            events.push(event);
                            break;
                        }
                        ErrorRoute::Fatal(engine_error) => {
                            // events gathered earlier in this poll are lost with the connection
                            return Err(engine_error);
                        }
                    }
                }
            }
        }

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> ConnectSettings {
        ConnectSettings {
            client_id: "device-1".to_string(),
            use_tls: false,
            ca_file: None,
            cert_file: None,
            key_file: None,
            username: None,
            password: None,
            clean_start: false,
        }
    }

    #[tokio::test]
    async fn test_requests_fail_without_connection() {
        let mut engine = RumqttcEngine::new(settings());
        let result = engine.publish(
            "t",
            Bytes::new(),
            QoS::AtLeastOnce,
            false,
            MessageProperties::new(),
        );
        assert_eq!(result, Err(EngineError::NoConnection));
        assert_eq!(
            engine.subscribe(&["t".to_string()], QoS::AtLeastOnce),
            Err(EngineError::NoConnection)
        );
    }

    #[tokio::test]
    async fn test_poll_without_connection_returns_nothing() {
        let mut engine = RumqttcEngine::new(settings());
        let events = engine.poll(Duration::from_millis(10)).await.unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_arguments() {
        let mut engine = RumqttcEngine::new(settings());
        assert!(matches!(
            engine.connect("", 1883, 30),
            Err(EngineError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_local_ids_are_sequential() {
        let mut engine = RumqttcEngine::new(settings());
        engine.connect("localhost", 1883, 30).unwrap();

        let first = engine
            .publish("a", Bytes::new(), QoS::AtLeastOnce, false, MessageProperties::new())
            .unwrap();
        let second = engine.subscribe(&["b".to_string()], QoS::AtLeastOnce).unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 2);
    }

    #[test]
    fn test_message_ids_wrap() {
        let mut engine = RumqttcEngine::new(settings());
        engine.next_message_id = i32::from(u16::MAX);
        assert_eq!(engine.allocate_message_id(), i32::from(u16::MAX));
        assert_eq!(engine.allocate_message_id(), 1);
    }

    #[test]
    fn test_ack_ids_are_mapped_to_local_ids() {
        let mut engine = RumqttcEngine::new(settings());
        engine.unsent_subscribes.push_back(42);
        let mut events = Vec::new();

        engine.handle_route(EventRoute::OutgoingSubscribe(7), &mut events);
        engine.handle_route(
            EventRoute::Transport(TransportEvent::SubAck {
                message_id: 7,
                granted: vec![1],
            }),
            &mut events,
        );

        assert_eq!(
            events,
            vec![TransportEvent::SubAck {
                message_id: 42,
                granted: vec![1],
            }]
        );
    }

    #[test]
    fn test_disconnect_clears_mappings() {
        let mut engine = RumqttcEngine::new(settings());
        engine.unsent_publishes.push_back(1);
        engine.publish_ids.insert(3, 2);

        engine.disconnect().unwrap();
        assert!(engine.unsent_publishes.is_empty());
        assert!(engine.publish_ids.is_empty());
    }
}
