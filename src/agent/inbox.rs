//! Channel event inbox
//!
//! Session callbacks run inside `ConnectionSession::do_work`, while the
//! session is mutably borrowed. [`InboxHandler`] only records each event on a
//! bounded channel; the agent loop drains it afterwards and routes the events
//! to the operations.

use crate::protocol::MessageType;
use crate::transport::mqtt::{ChannelEventHandler, SubscribeOutcome};
use crate::transport::{InboundMessage, MessageId};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;

/// Default number of undrained events before new ones are dropped
pub const DEFAULT_INBOX_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    ConnAck {
        reason_code: u8,
    },
    Disconnected {
        reason_code: u8,
    },
    Message {
        message: InboundMessage,
        message_type: MessageType,
    },
    PublishAck {
        message_id: MessageId,
        reason_code: u8,
    },
    Subscribed(SubscribeOutcome),
}

/// [`ChannelEventHandler`] that forwards every callback to the inbox
#[derive(Debug)]
pub struct InboxHandler {
    sender: mpsc::Sender<ChannelEvent>,
}

impl InboxHandler {
    fn forward(&self, event: ChannelEvent) {
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!("Agent inbox full, dropping {:?}", event);
            }
            Err(TrySendError::Closed(_)) => {
                warn!("Agent inbox closed, dropping channel event");
            }
        }
    }
}

impl ChannelEventHandler for InboxHandler {
    fn on_connect(&mut self, reason_code: u8) {
        self.forward(ChannelEvent::ConnAck { reason_code });
    }

    fn on_disconnect(&mut self, reason_code: u8) {
        self.forward(ChannelEvent::Disconnected { reason_code });
    }

    fn on_message(&mut self, message: &InboundMessage, message_type: MessageType) {
        self.forward(ChannelEvent::Message {
            message: message.clone(),
            message_type,
        });
    }

    fn on_publish(&mut self, message_id: MessageId, reason_code: u8) {
        self.forward(ChannelEvent::PublishAck {
            message_id,
            reason_code,
        });
    }

    fn on_subscribe(&mut self, outcome: &SubscribeOutcome) {
        self.forward(ChannelEvent::Subscribed(outcome.clone()));
    }
}

/// Create a handler and the receiving end of its inbox
pub fn inbox(capacity: usize) -> (InboxHandler, mpsc::Receiver<ChannelEvent>) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    (InboxHandler { sender }, receiver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::notification_message;

    #[test]
    fn test_events_arrive_in_order() {
        let (mut handler, mut receiver) = inbox(8);

        handler.on_connect(0);
        handler.on_message(
            &notification_message("t", MessageType::UpdateAvailableNotification, ""),
            MessageType::UpdateAvailableNotification,
        );
        handler.on_publish(4, 0x10);

        assert_eq!(
            receiver.try_recv().unwrap(),
            ChannelEvent::ConnAck { reason_code: 0 }
        );
        assert!(matches!(
            receiver.try_recv().unwrap(),
            ChannelEvent::Message {
                message_type: MessageType::UpdateAvailableNotification,
                ..
            }
        ));
        assert_eq!(
            receiver.try_recv().unwrap(),
            ChannelEvent::PublishAck {
                message_id: 4,
                reason_code: 0x10
            }
        );
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn test_full_inbox_drops_newest() {
        let (mut handler, mut receiver) = inbox(1);

        handler.on_connect(0);
        handler.on_disconnect(0x8e);

        assert_eq!(
            receiver.try_recv().unwrap(),
            ChannelEvent::ConnAck { reason_code: 0 }
        );
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn test_closed_inbox_does_not_panic() {
        let (mut handler, receiver) = inbox(4);
        drop(receiver);
        handler.on_subscribe(&SubscribeOutcome {
            message_id: 1,
            topics: vec!["t".to_string()],
            granted: vec![1],
        });
    }
}
