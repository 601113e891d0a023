//! Device agent
//!
//! The main loop that ties the connection session, the operations and the
//! work queues together.

pub mod inbox;
pub mod lifecycle;
pub mod processor;

pub use inbox::{inbox, ChannelEvent, InboxHandler, DEFAULT_INBOX_CAPACITY};
pub use lifecycle::{DeviceAgent, REPORTING_QUEUE_NAME, UPDATE_QUEUE_NAME};
pub use processor::{
    LoggingUpdateProcessor, ProcessError, UpdateProcessor, RESULT_FAILURE, RESULT_SUCCESS,
};
