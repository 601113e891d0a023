//! Update operation
//!
//! Polls the service for a pending deployment (`upd_req` / `upd_resp` on the
//! scoped topics) and hands accepted deployments to the update work queue.
//!
//! ```text
//!            +-------------------------------------------+
//!            v                                           |
//! Ready -> Requesting -> RequestAck -> ProcessingUpdate -> IdleWait
//!   ^          |             |                             ^
//!   |          +-------------+---------> RetryWait --------+
//!   +-------------------------------------+
//! ```

use super::common::{prepare_request, publish_request, DeviceIdentity, NotReady, RequestError};
use super::context::{
    send_failure_class, RetriableOperationContext, RetryDecision, TerminalOutcome,
};
use super::RetriableOperation;
use crate::clock::SharedClock;
use crate::config::OperationSettings;
use crate::protocol::{
    read_common_response_properties, CorrelationId, MessageType, ResponseResultCode,
    UpdateResponse,
};
use crate::retry::FailureClass;
use crate::transport::{InboundMessage, MessageChannel, MessageId};
use crate::workqueue::WorkQueue;
use chrono::{DateTime, TimeDelta, Utc};
use rand::rngs::StdRng;
use std::fmt;
use tracing::{debug, error, info, warn};

/// Longest wait for the PUBACK of a request
pub const REQUESTING_TIMEOUT_SECS: i64 = 30;
/// Minimum spacing between a request and the retry that follows it
pub const RETRY_WAIT_SECS: i64 = 60;
/// Longest wait for the response once the request was acknowledged
pub const REQUEST_ACK_TIMEOUT_SECS: i64 = 120;
/// Idle period after a cancelled exchange
pub const CANCEL_IDLE_SECS: i64 = 180;
/// Idle period after the service rejected or deferred a request
pub const SERVICE_BACKOFF_SECS: i64 = 300;
/// Added on top of the computed backoff for every retry
pub const RETRY_ADDITIONAL_DELAY_SECS: i64 = 30;

/// MQTT v5 PUBACK reason codes the update exchange reacts to
mod puback {
    pub const SUCCESS: u8 = 0x00;
    pub const NO_MATCHING_SUBSCRIBERS: u8 = 0x10;
    pub const UNSPECIFIED_ERROR: u8 = 0x80;
    pub const IMPLEMENTATION_SPECIFIC_ERROR: u8 = 0x83;
    pub const NOT_AUTHORIZED: u8 = 0x87;
    pub const TOPIC_NAME_INVALID: u8 = 0x90;
    pub const PACKET_IDENTIFIER_IN_USE: u8 = 0x91;
    pub const PACKET_TOO_LARGE: u8 = 0x95;
    pub const QUOTA_EXCEEDED: u8 = 0x97;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateState {
    #[default]
    Ready,
    IdleWait,
    Requesting,
    RetryWait,
    RequestAck,
    ProcessingUpdate,
}

impl UpdateState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateState::Ready => "Ready",
            UpdateState::IdleWait => "IdleWait",
            UpdateState::Requesting => "Requesting",
            UpdateState::RetryWait => "RetryWait",
            UpdateState::RequestAck => "RequestAck",
            UpdateState::ProcessingUpdate => "ProcessingUpdate",
        }
    }
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub struct UpdateOperation {
    ctx: RetriableOperationContext,
    identity: DeviceIdentity,
    state: UpdateState,
    request_message_id: Option<MessageId>,
    update_queue: WorkQueue,
}

impl UpdateOperation {
    pub fn new(
        settings: &OperationSettings,
        identity: DeviceIdentity,
        update_queue: WorkQueue,
        clock: SharedClock,
    ) -> Self {
        Self {
            ctx: RetriableOperationContext::new("update", settings, clock),
            identity,
            state: UpdateState::Ready,
            request_message_id: None,
            update_queue,
        }
    }

    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.ctx = self.ctx.with_rng(rng);
        self
    }

    pub fn state(&self) -> UpdateState {
        self.state
    }

    /// The processing of the last accepted deployment has finished
    pub fn on_processing_complete(&mut self) {
        if self.state != UpdateState::ProcessingUpdate {
            debug!("update: processing finished while in '{}'", self.state);
            return;
        }
        self.ctx.mark_terminal(TerminalOutcome::Success);
        self.set_state(UpdateState::IdleWait);
    }

    /// Request immediately if no exchange is in flight (`upd_cn`)
    pub fn request_now(&mut self) {
        match self.state {
            UpdateState::Ready | UpdateState::IdleWait | UpdateState::RetryWait => {
                info!("update: update available, requesting now");
                let now = self.ctx.now();
                self.ctx.set_next_execution(now);
                self.set_state(UpdateState::Ready);
            }
            UpdateState::Requesting | UpdateState::RequestAck | UpdateState::ProcessingUpdate => {
                debug!("update: notification ignored while in '{}'", self.state);
            }
        }
    }

    fn process_publish_ack(&mut self, message_id: MessageId, reason_code: u8) {
        if self.request_message_id != Some(message_id) {
            return;
        }
        self.request_message_id = None;
        if self.state != UpdateState::Requesting {
            debug!("update: late PUBACK in '{}'", self.state);
            return;
        }

        match reason_code {
            puback::SUCCESS => {
                self.ctx.touch_execution();
                self.set_state(UpdateState::RequestAck);
            }
            puback::NO_MATCHING_SUBSCRIBERS
            | puback::UNSPECIFIED_ERROR
            | puback::IMPLEMENTATION_SPECIFIC_ERROR
            | puback::NOT_AUTHORIZED => {
                warn!("update: request not accepted by broker ({:#04x})", reason_code);
                self.retry(FailureClass::Default);
            }
            puback::TOPIC_NAME_INVALID
            | puback::PACKET_IDENTIFIER_IN_USE
            | puback::PACKET_TOO_LARGE
            | puback::QUOTA_EXCEEDED => {
                warn!("update: request refused by broker ({:#04x})", reason_code);
                self.cancel_to_idle();
            }
            other => {
                warn!("update: unexpected PUBACK reason {:#04x}", other);
                self.retry(FailureClass::Default);
            }
        }
    }

    fn set_state(&mut self, state: UpdateState) {
        if self.state != state {
            info!("update: '{}' -> '{}'", self.state, state);
            self.state = state;
        }
    }

    fn retry(&mut self, class: FailureClass) {
        self.request_message_id = None;
        let decision = self
            .ctx
            .mark_attempt_failed_with_delay(class, TimeDelta::seconds(RETRY_ADDITIONAL_DELAY_SECS));
        match decision {
            RetryDecision::Retry(_) => self.set_state(UpdateState::RetryWait),
            RetryDecision::Exhausted => self.set_state(UpdateState::IdleWait),
        }
    }

    fn cancel_to_idle(&mut self) {
        self.request_message_id = None;
        self.ctx.cancel();
        self.ctx.schedule_in(TimeDelta::seconds(CANCEL_IDLE_SECS));
        self.set_state(UpdateState::IdleWait);
    }

    fn elapsed_since_execution(&self, now: DateTime<Utc>, secs: i64) -> bool {
        self.ctx
            .last_execution_at()
            .and_then(|at| at.checked_add_signed(TimeDelta::seconds(secs)))
            .map_or(true, |deadline| now >= deadline)
    }

    fn send_request(&mut self, channel: &mut dyn MessageChannel) {
        let topics = match prepare_request(channel, &self.identity, true) {
            Ok(topics) => topics,
            Err(NotReady::SubscribeFailed(e)) => {
                warn!("update: cannot subscribe to response topic: {}", e);
                return;
            }
            Err(reason) => {
                debug!("update: not sending yet, {}", reason);
                return;
            }
        };

        let correlation_id = CorrelationId::generate();
        match publish_request(
            channel,
            &topics.publish,
            MessageType::UpdateRequest,
            &correlation_id,
            &serde_json::json!({}),
        ) {
            Ok(message_id) => {
                info!("Update request sent (correlation id {})", correlation_id);
                self.request_message_id = Some(message_id);
                self.ctx.record_execution(correlation_id);
                self.set_state(UpdateState::Requesting);
            }
            Err(RequestError::Send(e)) => match send_failure_class(&e) {
                Some(class) => {
                    debug!("update: publish failed: {}", e);
                    self.retry(class);
                }
                None => {
                    warn!("update: unrecoverable publish error: {}", e);
                    self.cancel_to_idle();
                }
            },
            Err(RequestError::Encode(e)) => {
                error!("update: cannot encode request: {}", e);
                self.cancel_to_idle();
            }
        }
    }

    fn handle_response(&mut self, message: &InboundMessage) {
        if !self.ctx.matches_response(&message.properties) {
            debug!("update: dropping response with unknown correlation id");
            return;
        }

        let common = match read_common_response_properties(
            &message.properties,
            MessageType::UpdateResponse,
        ) {
            Ok(common) => common,
            Err(e) => {
                warn!("update: invalid response properties: {}", e);
                return;
            }
        };

        if !matches!(self.state, UpdateState::Requesting | UpdateState::RequestAck) {
            warn!("update: response arrived in '{}'", self.state);
        }
        self.ctx.clear_correlation();
        self.request_message_id = None;
        let service_backoff = TimeDelta::seconds(SERVICE_BACKOFF_SECS);

        match common.result() {
            ResponseResultCode::Success => self.accept_update(message),
            ResponseResultCode::BadRequest => {
                warn!(
                    "update: request rejected ({})",
                    common.extended_result().description()
                );
                self.ctx.mark_terminal(TerminalOutcome::Failure);
                self.ctx.schedule_in(service_backoff);
                self.set_state(UpdateState::IdleWait);
            }
            ResponseResultCode::Busy
            | ResponseResultCode::Conflict
            | ResponseResultCode::ServerError => {
                warn!("update: service returned {}, retrying later", common.result());
                self.ctx.schedule_in(service_backoff);
                self.set_state(UpdateState::RetryWait);
            }
            ResponseResultCode::AgentNotEnrolled => {
                warn!("update: service reports the agent is not enrolled");
                let store = self.identity.store();
                let cleared = store
                    .set_device_enrolled(false)
                    .and_then(|()| store.set_agent_info_reported(false));
                if let Err(e) = cleared {
                    warn!("update: failed to clear enrollment state: {}", e);
                }
                self.ctx.cancel();
                self.ctx.schedule_in(service_backoff);
                self.set_state(UpdateState::IdleWait);
            }
            ResponseResultCode::Unknown(code) => {
                warn!("update: unknown result code {}, retrying", code);
                self.retry(FailureClass::Default);
            }
        }
    }

    fn accept_update(&mut self, message: &InboundMessage) {
        let Some(payload) = message.payload_str() else {
            warn!("update: response payload is not UTF-8");
            self.retry(FailureClass::Default);
            return;
        };

        match serde_json::from_str::<UpdateResponse>(payload) {
            Ok(UpdateResponse {
                workflow: Some(workflow),
                ..
            }) => info!(
                "Update available (workflow {}, action {:?})",
                workflow.id, workflow.action
            ),
            Ok(_) => info!("Update response carries no workflow"),
            Err(e) => debug!("update: response is not a deployment document: {}", e),
        }

        match self.update_queue.enqueue(payload) {
            Ok(()) => self.set_state(UpdateState::ProcessingUpdate),
            Err(e) => {
                warn!("update: cannot queue update: {}", e);
                self.retry(FailureClass::Default);
            }
        }
    }
}

impl RetriableOperation for UpdateOperation {
    fn name(&self) -> &'static str {
        "update"
    }

    fn context(&self) -> &RetriableOperationContext {
        &self.ctx
    }

    fn do_work(&mut self, channel: &mut dyn MessageChannel) {
        if self.ctx.check_expiry() {
            self.cancel_to_idle();
            return;
        }

        let now = self.ctx.now();
        match self.state {
            UpdateState::Ready => {
                if !self.identity.store().is_agent_info_reported() || !self.ctx.should_retry_now() {
                    return;
                }
                if !self.ctx.state().is_active() {
                    self.ctx.start();
                }
                self.send_request(channel);
            }
            UpdateState::IdleWait => {
                if self.ctx.should_retry_now() {
                    self.set_state(UpdateState::Ready);
                }
            }
            UpdateState::Requesting => {
                if self.elapsed_since_execution(now, REQUESTING_TIMEOUT_SECS) {
                    warn!("update: no PUBACK within {}s", REQUESTING_TIMEOUT_SECS);
                    self.cancel_to_idle();
                }
            }
            UpdateState::RetryWait => {
                if self.ctx.should_retry_now() && self.elapsed_since_execution(now, RETRY_WAIT_SECS)
                {
                    self.set_state(UpdateState::Ready);
                }
            }
            UpdateState::RequestAck => {
                if self.elapsed_since_execution(now, REQUEST_ACK_TIMEOUT_SECS) {
                    warn!("update: no response within {}s", REQUEST_ACK_TIMEOUT_SECS);
                    self.cancel_to_idle();
                }
            }
            UpdateState::ProcessingUpdate => {}
        }
    }

    fn handle_message(&mut self, message: &InboundMessage, message_type: MessageType) -> bool {
        match message_type {
            MessageType::UpdateResponse => self.handle_response(message),
            MessageType::UpdateAvailableNotification => self.request_now(),
            _ => return false,
        }
        true
    }

    fn handle_publish_ack(&mut self, message_id: MessageId, reason_code: u8) {
        self.process_publish_ack(message_id, reason_code);
    }

    fn cancel(&mut self) {
        self.cancel_to_idle();
    }
}
