//! Pure translation of rumqttc events into transport events
//!
//! The rumqttc engine feeds every event-loop item through [`MessageHandler`]
//! and acts on the returned route. Nothing here performs I/O, so the mapping
//! from library packets and errors to [`TransportEvent`]s is unit tested
//! directly.

use crate::protocol::MessageProperties;
use crate::transport::mqtt::disconnect::reason_codes;
use crate::transport::{EngineError, InboundMessage, TransportEvent};
use rumqttc::v5::mqttbytes::v5::{
    Packet, PubAck, PubAckReason, PublishProperties, SubscribeReasonCode,
};
use rumqttc::v5::{ClientError, ConnectionError, Event, StateError};
use rumqttc::Outgoing;
use tracing::debug;

/// Pure routing of MQTT events
pub struct MessageHandler;

/// Routing decision for one event-loop item
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Report to the session
    Transport(TransportEvent),
    /// A publish left the client with this packet id (0 for QoS 0)
    OutgoingPublish(u16),
    /// A subscribe left the client with this packet id
    OutgoingSubscribe(u16),
    /// Keep-alive traffic and other packets the session does not care about
    Ignored,
}

/// Routing decision for an event-loop error
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorRoute {
    /// The connection is over; report this event and drop the event loop
    ConnectionEnded(TransportEvent),
    /// Local state is broken; surface an engine error and drop the event loop
    Fatal(EngineError),
}

impl MessageHandler {
    /// Route an event-loop item
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(packet) => Self::route_incoming(packet),
            Event::Outgoing(Outgoing::Publish(pkid)) => EventRoute::OutgoingPublish(*pkid),
            Event::Outgoing(Outgoing::Subscribe(pkid)) => EventRoute::OutgoingSubscribe(*pkid),
            Event::Outgoing(_) => EventRoute::Ignored,
        }
    }

    fn route_incoming(packet: &Packet) -> EventRoute {
        match packet {
            Packet::ConnAck(connack) => EventRoute::Transport(TransportEvent::ConnAck {
                reason_code: connack.code as u8,
            }),
            Packet::Disconnect(disconnect) => {
                EventRoute::Transport(TransportEvent::Disconnected {
                    reason_code: disconnect.reason_code as u8,
                })
            }
            Packet::SubAck(suback) => EventRoute::Transport(TransportEvent::SubAck {
                message_id: i32::from(suback.pkid),
                granted: Self::granted_codes(&suback.return_codes),
            }),
            Packet::PubAck(puback) => EventRoute::Transport(TransportEvent::PubAck {
                message_id: i32::from(puback.pkid),
                reason_code: Self::puback_reason(puback),
            }),
            Packet::PubComp(pubcomp) => EventRoute::Transport(TransportEvent::PubAck {
                message_id: i32::from(pubcomp.pkid),
                reason_code: reason_codes::NORMAL_DISCONNECTION,
            }),
            Packet::Publish(publish) => {
                let message = InboundMessage {
                    topic: String::from_utf8_lossy(&publish.topic).to_string(),
                    payload: publish.payload.clone(),
                    qos: publish.qos,
                    retain: publish.retain,
                    properties: Self::properties_from_publish(publish.properties.as_ref()),
                };
                EventRoute::Transport(TransportEvent::Message(message))
            }
            other => {
                debug!("Ignoring MQTT packet: {:?}", other);
                EventRoute::Ignored
            }
        }
    }

    /// Route an event-loop error
    ///
    /// A refused connect becomes a CONNACK carrying the broker's reason code
    /// so the session applies its normal connect handling.
    pub fn route_connection_error(error: &ConnectionError) -> ErrorRoute {
        match error {
            ConnectionError::ConnectionRefused(code) => {
                ErrorRoute::ConnectionEnded(TransportEvent::ConnAck {
                    reason_code: *code as u8,
                })
            }
            ConnectionError::MqttState(StateError::Deserialization(e)) => {
                ErrorRoute::Fatal(EngineError::Protocol(e.to_string()))
            }
            ConnectionError::NotConnAck(packet) => ErrorRoute::Fatal(EngineError::Protocol(
                format!("expected CONNACK, received {packet:?}"),
            )),
            _ => ErrorRoute::ConnectionEnded(TransportEvent::Disconnected {
                reason_code: reason_codes::UNSPECIFIED_ERROR,
            }),
        }
    }

    /// Granted QoS per topic; failures map to their v5 reason code range
    pub fn granted_codes(codes: &[SubscribeReasonCode]) -> Vec<u8> {
        codes
            .iter()
            .map(|code| match code {
                SubscribeReasonCode::Success(qos) => *qos as u8,
                _ => reason_codes::UNSPECIFIED_ERROR,
            })
            .collect()
    }

    fn puback_reason(puback: &PubAck) -> u8 {
        match puback.reason {
            PubAckReason::Success => 0x00,
            PubAckReason::NoMatchingSubscribers => 0x10,
            _ => reason_codes::UNSPECIFIED_ERROR,
        }
    }

    /// Convert outgoing properties to the library's form
    pub fn properties_to_publish(props: MessageProperties) -> PublishProperties {
        PublishProperties {
            message_expiry_interval: props.message_expiry_interval,
            correlation_data: props.correlation_data,
            user_properties: props.user_properties,
            content_type: props.content_type,
            ..PublishProperties::default()
        }
    }

    /// Convert received properties; absent properties yield an empty set
    pub fn properties_from_publish(props: Option<&PublishProperties>) -> MessageProperties {
        match props {
            Some(props) => MessageProperties {
                correlation_data: props.correlation_data.clone(),
                content_type: props.content_type.clone(),
                user_properties: props.user_properties.clone(),
                message_expiry_interval: props.message_expiry_interval,
            },
            None => MessageProperties::default(),
        }
    }

    /// Map a client request failure; the request channel only fails when it
    /// is full or the event loop is gone
    pub fn map_client_error(error: ClientError) -> EngineError {
        EngineError::Rejected(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CorrelationId, MessageType};
    use crate::transport::QoS;
    use bytes::Bytes;
    use rumqttc::v5::mqttbytes::v5::{
        ConnAck, ConnectReturnCode, Disconnect, DisconnectReasonCode, Publish, SubAck,
    };

    #[test]
    fn test_connack_success() {
        let event = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
            properties: None,
        }));
        assert_eq!(
            MessageHandler::route_mqtt_event(&event),
            EventRoute::Transport(TransportEvent::ConnAck { reason_code: 0 })
        );
    }

    #[test]
    fn test_refused_connect_becomes_connack() {
        let error = ConnectionError::ConnectionRefused(ConnectReturnCode::QuotaExceeded);
        assert_eq!(
            MessageHandler::route_connection_error(&error),
            ErrorRoute::ConnectionEnded(TransportEvent::ConnAck { reason_code: 0x97 })
        );
    }

    #[test]
    fn test_network_error_ends_connection() {
        let error = ConnectionError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert_eq!(
            MessageHandler::route_connection_error(&error),
            ErrorRoute::ConnectionEnded(TransportEvent::Disconnected { reason_code: 0x80 })
        );
    }

    #[test]
    fn test_broker_disconnect_reason() {
        let event = Event::Incoming(Packet::Disconnect(Disconnect {
            reason_code: DisconnectReasonCode::SessionTakenOver,
            properties: None,
        }));
        assert_eq!(
            MessageHandler::route_mqtt_event(&event),
            EventRoute::Transport(TransportEvent::Disconnected { reason_code: 0x8E })
        );
    }

    #[test]
    fn test_suback_codes() {
        let event = Event::Incoming(Packet::SubAck(SubAck {
            pkid: 4,
            return_codes: vec![
                SubscribeReasonCode::Success(QoS::AtLeastOnce),
                SubscribeReasonCode::NotAuthorized,
            ],
            properties: None,
        }));
        assert_eq!(
            MessageHandler::route_mqtt_event(&event),
            EventRoute::Transport(TransportEvent::SubAck {
                message_id: 4,
                granted: vec![1, 0x80],
            })
        );
    }

    #[test]
    fn test_outgoing_packet_ids() {
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Outgoing(Outgoing::Publish(12))),
            EventRoute::OutgoingPublish(12)
        );
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Outgoing(Outgoing::Subscribe(3))),
            EventRoute::OutgoingSubscribe(3)
        );
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Outgoing(Outgoing::PingReq)),
            EventRoute::Ignored
        );
    }

    #[test]
    fn test_inbound_publish_keeps_properties() {
        let cid = CorrelationId::generate();
        let props = MessageProperties::for_request(MessageType::UpdateResponse, &cid);
        let mut publish = Publish::new(
            "adu/oto/dev/s/scope",
            QoS::AtLeastOnce,
            Bytes::from_static(b"{}"),
            Some(MessageHandler::properties_to_publish(props.clone())),
        );
        publish.retain = false;

        let route = MessageHandler::route_mqtt_event(&Event::Incoming(Packet::Publish(publish)));
        let EventRoute::Transport(TransportEvent::Message(message)) = route else {
            panic!("expected a message route, got {route:?}");
        };
        assert_eq!(message.topic, "adu/oto/dev/s/scope");
        assert_eq!(message.properties, props);
        assert_eq!(message.payload_str(), Some("{}"));
    }

    #[test]
    fn test_missing_properties_are_empty() {
        assert_eq!(
            MessageHandler::properties_from_publish(None),
            MessageProperties::default()
        );
    }
}
