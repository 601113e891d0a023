//! Bounded work queues
//!
//! Network callbacks only enqueue; a consumer loop dequeues and does the
//! work. The queue refuses new items at its high-water mark instead of
//! growing while the broker is unreachable.

use crate::clock::SharedClock;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// Default wait of [`WorkQueue::dequeue`]
pub const DEFAULT_DEQUEUE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub payload: String,
    pub time_added: DateTime<Utc>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WorkQueueError {
    #[error("work queue '{name}' is full ({capacity} items)")]
    Full { name: String, capacity: usize },
    #[error("work queue '{0}' is closed")]
    Closed(String),
}

/// Multi-consumer FIFO of string payloads
#[derive(Clone)]
pub struct WorkQueue {
    name: Arc<str>,
    capacity: usize,
    sender: mpsc::Sender<WorkItem>,
    receiver: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
    clock: SharedClock,
}

impl fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkQueue")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

impl WorkQueue {
    /// `capacity` is clamped to at least one item
    pub fn new(name: &str, capacity: usize, clock: SharedClock) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        Self {
            name: Arc::from(name),
            capacity,
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            clock,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Add an item without waiting
    pub fn enqueue(&self, payload: impl Into<String>) -> Result<(), WorkQueueError> {
        let item = WorkItem {
            payload: payload.into(),
            time_added: self.clock.now(),
        };
        match self.sender.try_send(item) {
            Ok(()) => {
                debug!("Enqueued work item on '{}' ({} queued)", self.name, self.len());
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    "Work queue '{}' reached its limit of {} items, dropping item",
                    self.name, self.capacity
                );
                Err(WorkQueueError::Full {
                    name: self.name.to_string(),
                    capacity: self.capacity,
                })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(WorkQueueError::Closed(self.name.to_string()))
            }
        }
    }

    /// Wait up to `timeout` for the next item
    pub async fn dequeue(&self, timeout: Duration) -> Option<WorkItem> {
        let mut receiver = self.receiver.lock().await;
        tokio::time::timeout(timeout, receiver.recv())
            .await
            .ok()
            .flatten()
    }

    /// Next item if one is ready and no other consumer holds the queue
    pub fn try_dequeue(&self) -> Option<WorkItem> {
        let mut receiver = self.receiver.try_lock().ok()?;
        receiver.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.capacity.saturating_sub(self.sender.capacity())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
