//! Request/response operations built on the message channel
//!
//! - [`enrollment`] - `enr_req` / `enr_resp` / `enr_cn`
//! - [`agent_info`] - `ainfo_req` / `ainfo_resp`
//! - [`update`] - `upd_req` / `upd_resp` / `upd_cn`
//! - [`update_result`] - `updrslt_req` / `updrslt_resp` / `updrslt_ack`
//!
//! Each operation owns a [`RetriableOperationContext`] and is driven by the
//! agent loop, one [`RetriableOperation::do_work`] call per pass.

pub mod agent_info;
pub mod common;
pub mod context;
pub mod enrollment;
pub mod update;
pub mod update_result;

pub use agent_info::AgentInfoOperation;
pub use common::{DeviceIdentity, NotReady, RequestError, DEFAULT_RESPONSE_TIMEOUT_SECS};
pub use context::{
    OperationState, RetriableOperationContext, RetryDecision, SendFailureAction, TerminalOutcome,
};
pub use enrollment::{EnrollmentOperation, EnrollmentStatus};
pub use update::{UpdateOperation, UpdateState};
pub use update_result::UpdateResultReporter;

use crate::protocol::MessageType;
use crate::transport::{InboundMessage, MessageChannel, MessageId};

/// An operation the agent loop drives
pub trait RetriableOperation: Send {
    fn name(&self) -> &'static str;

    fn context(&self) -> &RetriableOperationContext;

    /// One pass: start, time out, retry or send as the state requires
    fn do_work(&mut self, channel: &mut dyn MessageChannel);

    /// Offer a validated inbound message. Returns false when the message type
    /// belongs to another operation.
    fn handle_message(&mut self, message: &InboundMessage, message_type: MessageType) -> bool;

    fn handle_publish_ack(&mut self, _message_id: MessageId, _reason_code: u8) {}

    fn cancel(&mut self);
}
