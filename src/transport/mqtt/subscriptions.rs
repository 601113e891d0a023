//! Subscription tracking
//!
//! A subscribe request is pending until its SUBACK arrives, matched strictly
//! by message id. Granted topics then become confirmed. A topic is never in
//! both sets at once.

use crate::transport::MessageId;
use std::collections::HashSet;
use std::fmt;

/// Result of a subscribe request, handed to its callback
#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeOutcome {
    pub message_id: MessageId,
    pub topics: Vec<String>,
    /// Granted QoS (or failure reason >= 0x80) per topic
    pub granted: Vec<u8>,
}

impl SubscribeOutcome {
    pub fn is_success(&self) -> bool {
        !self.granted.is_empty() && self.granted.iter().all(|code| *code < 0x80)
    }
}

/// Per-request callback invoked when the matching SUBACK arrives
pub type SubscribeCallback = Box<dyn FnOnce(&SubscribeOutcome) + Send>;

struct PendingSubscription {
    message_id: MessageId,
    topics: Vec<String>,
    callback: Option<SubscribeCallback>,
}

impl fmt::Debug for PendingSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingSubscription")
            .field("message_id", &self.message_id)
            .field("topics", &self.topics)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

/// Pending and confirmed subscriptions of one connection
#[derive(Debug, Default)]
pub struct SubscriptionTracker {
    pending: Vec<PendingSubscription>,
    confirmed: HashSet<String>,
}

impl SubscriptionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an issued subscribe request
    pub fn add_pending(
        &mut self,
        message_id: MessageId,
        topics: Vec<String>,
        callback: Option<SubscribeCallback>,
    ) {
        for topic in &topics {
            self.confirmed.remove(topic);
        }
        self.pending.push(PendingSubscription {
            message_id,
            topics,
            callback,
        });
    }

    /// Apply a SUBACK. Returns `None` when no request with `message_id` is pending.
    pub fn confirm(&mut self, message_id: MessageId, granted: &[u8]) -> Option<SubscribeOutcome> {
        let index = self
            .pending
            .iter()
            .position(|p| p.message_id == message_id)?;
        let pending = self.pending.remove(index);

        for (i, topic) in pending.topics.iter().enumerate() {
            // brokers may answer a multi-topic request with a single code
            let code = granted.get(i).or(granted.last()).copied().unwrap_or(0x80);
            if code < 0x80 {
                self.confirmed.insert(topic.clone());
            }
        }

        let outcome = SubscribeOutcome {
            message_id,
            topics: pending.topics,
            granted: granted.to_vec(),
        };

        if let Some(callback) = pending.callback {
            callback(&outcome);
        }

        Some(outcome)
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.confirmed.contains(topic)
    }

    pub fn is_pending(&self, topic: &str) -> bool {
        self.pending
            .iter()
            .any(|p| p.topics.iter().any(|t| t == topic))
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn confirmed_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.confirmed.iter().cloned().collect();
        topics.sort();
        topics
    }

    /// Forget everything; subscriptions do not survive a connection epoch
    pub fn clear(&mut self) {
        self.pending.clear();
        self.confirmed.clear();
    }
}
