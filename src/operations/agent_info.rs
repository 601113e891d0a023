//! Agent info operation
//!
//! Reports the device's compatibility properties once per enrollment
//! (`ainfo_req` / `ainfo_resp` on the scoped topics).

use super::common::{
    prepare_request, publish_request, DeviceIdentity, NotReady, RequestError,
    DEFAULT_RESPONSE_TIMEOUT_SECS,
};
use super::context::{OperationState, RetriableOperationContext, TerminalOutcome};
use super::RetriableOperation;
use crate::clock::SharedClock;
use crate::config::OperationSettings;
use crate::protocol::{
    read_common_response_properties, AgentInfoRequest, CorrelationId, MessageType,
    ResponseResultCode,
};
use crate::retry::FailureClass;
use crate::transport::{InboundMessage, MessageChannel};
use chrono::TimeDelta;
use rand::rngs::StdRng;
use tracing::{debug, error, info, warn};

#[derive(Debug)]
pub struct AgentInfoOperation {
    ctx: RetriableOperationContext,
    identity: DeviceIdentity,
    manufacturer: String,
    model: String,
    response_timeout: TimeDelta,
}

impl AgentInfoOperation {
    pub fn new(
        settings: &OperationSettings,
        identity: DeviceIdentity,
        manufacturer: impl Into<String>,
        model: impl Into<String>,
        clock: SharedClock,
    ) -> Self {
        Self {
            ctx: RetriableOperationContext::new("agent_info", settings, clock),
            identity,
            manufacturer: manufacturer.into(),
            model: model.into(),
            response_timeout: TimeDelta::seconds(DEFAULT_RESPONSE_TIMEOUT_SECS),
        }
    }

    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.ctx = self.ctx.with_rng(rng);
        self
    }

    pub fn is_reported(&self) -> bool {
        self.identity.store().is_agent_info_reported()
    }

    fn send_request(&mut self, channel: &mut dyn MessageChannel) {
        let topics = match prepare_request(channel, &self.identity, true) {
            Ok(topics) => topics,
            Err(NotReady::SubscribeFailed(e)) => {
                self.ctx.handle_send_error(&e);
                return;
            }
            Err(reason) => {
                debug!("agent_info: not sending yet, {}", reason);
                return;
            }
        };

        let body = AgentInfoRequest::new(self.ctx.now(), &self.manufacturer, &self.model);
        let correlation_id = CorrelationId::generate();
        match publish_request(
            channel,
            &topics.publish,
            MessageType::AgentInfoRequest,
            &correlation_id,
            &body,
        ) {
            Ok(_) => {
                info!("Agent info sent (sn {}, correlation id {})", body.sn, correlation_id);
                self.ctx.record_execution(correlation_id);
            }
            Err(RequestError::Send(e)) => {
                self.ctx.handle_send_error(&e);
            }
            Err(RequestError::Encode(e)) => {
                error!("agent_info: cannot encode request: {}", e);
                self.ctx.mark_terminal(TerminalOutcome::Failure);
            }
        }
    }

    fn handle_response(&mut self, message: &InboundMessage) {
        if !self.ctx.matches_response(&message.properties) {
            debug!("agent_info: dropping response with unknown correlation id");
            return;
        }

        let common = match read_common_response_properties(
            &message.properties,
            MessageType::AgentInfoResponse,
        ) {
            Ok(common) => common,
            Err(e) => {
                warn!("agent_info: invalid response properties: {}", e);
                return;
            }
        };

        match common.result() {
            ResponseResultCode::Success => {
                if let Err(e) = self.identity.store().set_agent_info_reported(true) {
                    warn!("agent_info: failed to persist reported flag: {}", e);
                    self.ctx.mark_attempt_failed(FailureClass::ClientTransient);
                    return;
                }
                info!("Agent info accepted by the service");
                self.ctx.mark_terminal(TerminalOutcome::Success);
            }
            ResponseResultCode::AgentNotEnrolled => {
                warn!("agent_info: service reports the agent is not enrolled");
                let store = self.identity.store();
                let cleared = store
                    .set_device_enrolled(false)
                    .and_then(|()| store.set_agent_info_reported(false));
                if let Err(e) = cleared {
                    warn!("agent_info: failed to clear enrollment state: {}", e);
                }
                self.ctx.cancel();
            }
            ResponseResultCode::Busy
            | ResponseResultCode::Conflict
            | ResponseResultCode::ServerError => {
                warn!(
                    "agent_info: service returned {} ({})",
                    common.result(),
                    common.extended_result().description()
                );
                self.ctx.mark_attempt_failed(FailureClass::ServiceTransient);
            }
            ResponseResultCode::BadRequest => {
                warn!(
                    "agent_info: request rejected ({})",
                    common.extended_result().description()
                );
                self.ctx
                    .mark_attempt_failed(FailureClass::ServiceUnrecoverable);
            }
            ResponseResultCode::Unknown(code) => {
                warn!("agent_info: unknown result code {}", code);
                self.ctx.mark_attempt_failed(FailureClass::Default);
            }
        }
    }
}

impl RetriableOperation for AgentInfoOperation {
    fn name(&self) -> &'static str {
        "agent_info"
    }

    fn context(&self) -> &RetriableOperationContext {
        &self.ctx
    }

    fn do_work(&mut self, channel: &mut dyn MessageChannel) {
        let store = self.identity.store();
        if !store.is_device_enrolled() {
            if self.ctx.state().is_active() {
                info!("agent_info: enrollment lost, cancelling");
                self.ctx.cancel();
            }
            return;
        }
        if store.is_agent_info_reported() {
            if self.ctx.state() != OperationState::Completed && self.ctx.correlation_id().is_none() {
                self.ctx.mark_terminal(TerminalOutcome::Success);
            }
            return;
        }

        let start = match self.ctx.state() {
            OperationState::NotStarted | OperationState::Completed => true,
            OperationState::Failure | OperationState::Cancelled | OperationState::Expired => {
                self.ctx.should_retry_now()
            }
            OperationState::InProgress | OperationState::RetryPending => false,
        };
        if start {
            self.ctx.start();
        }
        if !self.ctx.state().is_active() || self.ctx.check_expiry() {
            return;
        }

        if self.ctx.correlation_id().is_some() {
            if self.ctx.response_timed_out(self.response_timeout) {
                warn!("agent_info: no response within {}s", self.response_timeout.num_seconds());
                self.ctx.mark_attempt_failed(FailureClass::Default);
            }
            return;
        }

        if self.ctx.should_retry_now() {
            self.send_request(channel);
        }
    }

    fn handle_message(&mut self, message: &InboundMessage, message_type: MessageType) -> bool {
        if message_type != MessageType::AgentInfoResponse {
            return false;
        }
        self.handle_response(message);
        true
    }

    fn cancel(&mut self) {
        self.ctx.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::{RetryParams, RetryPolicy};
    use crate::state_store::{AgentStateStore, ProvisioningStore};
    use crate::testing::{response_message, ManualClock, RecordingChannel};
    use rand::SeedableRng;
    use std::sync::Arc;

    const RESPONSE_TOPIC: &str = "adu/oto/dev-1/s/scope-1";

    fn setup(enrolled: bool) -> (AgentInfoOperation, Arc<AgentStateStore>, RecordingChannel) {
        let store = Arc::new(AgentStateStore::in_memory());
        store.set_scope_id(Some("scope-1".to_string())).unwrap();
        store.set_device_enrolled(enrolled).unwrap();
        let settings = OperationSettings {
            retry: RetryPolicy::uniform(RetryParams {
                max_jitter_percent: 0.0,
                ..RetryParams::default()
            }),
            ..OperationSettings::default()
        };
        let op = AgentInfoOperation::new(
            &settings,
            DeviceIdentity::new(store.clone(), Some("dev-1".to_string())),
            "contoso",
            "toaster",
            ManualClock::shared(),
        )
        .with_rng(StdRng::seed_from_u64(3));
        (op, store, RecordingChannel::connected_with(&[RESPONSE_TOPIC]))
    }

    #[test]
    fn test_waits_for_enrollment() {
        let (mut op, _store, mut channel) = setup(false);
        op.do_work(&mut channel);
        assert!(channel.published.is_empty());
        assert_eq!(op.context().state(), OperationState::NotStarted);
    }

    #[test]
    fn test_sends_compat_properties_on_scoped_topic() {
        let (mut op, _store, mut channel) = setup(true);
        op.do_work(&mut channel);

        let sent = channel.last_published().unwrap();
        assert_eq!(sent.topic, "adu/oto/dev-1/a/scope-1");
        assert_eq!(sent.properties.message_type(), Some("ainfo_req"));
        let body = sent.payload_json().unwrap();
        assert_eq!(body["compatProperties"]["manufacturer"], "contoso");
        assert_eq!(body["compatProperties"]["model"], "toaster");
        assert!(body["sn"].is_string());
    }

    #[test]
    fn test_success_marks_reported() {
        let (mut op, store, mut channel) = setup(true);
        op.do_work(&mut channel);
        let cid = channel.last_published().unwrap().correlation_id().unwrap();

        let response =
            response_message(RESPONSE_TOPIC, MessageType::AgentInfoResponse, &cid, 0, 0, "{}");
        assert!(op.handle_message(&response, MessageType::AgentInfoResponse));
        assert!(store.is_agent_info_reported());
        assert_eq!(op.context().state(), OperationState::Completed);

        op.do_work(&mut channel);
        assert_eq!(channel.published.len(), 1);
    }

    #[test]
    fn test_not_enrolled_resets_enrollment() {
        let (mut op, store, mut channel) = setup(true);
        op.do_work(&mut channel);
        let cid = channel.last_published().unwrap().correlation_id().unwrap();

        let response =
            response_message(RESPONSE_TOPIC, MessageType::AgentInfoResponse, &cid, 5, 0, "");
        op.handle_message(&response, MessageType::AgentInfoResponse);
        assert!(!store.is_device_enrolled());
        assert_eq!(op.context().state(), OperationState::Cancelled);

        store.set_device_enrolled(true).unwrap();
        op.do_work(&mut channel);
        assert_eq!(channel.published.len(), 2);
    }

    #[test]
    fn test_mismatched_type_is_rejected() {
        let (mut op, store, mut channel) = setup(true);
        op.do_work(&mut channel);
        let cid = channel.last_published().unwrap().correlation_id().unwrap();

        let response =
            response_message(RESPONSE_TOPIC, MessageType::EnrollmentResponse, &cid, 0, 0, "{}");
        op.handle_message(&response, MessageType::AgentInfoResponse);
        assert!(!store.is_agent_info_reported());
        assert_eq!(op.context().state(), OperationState::InProgress);
    }
}
