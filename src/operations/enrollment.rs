//! Enrollment operation
//!
//! Asks the service whether this device is enrolled and which scope it
//! belongs to (`enr_req` / `enr_resp` on the unscoped topics). Every scoped
//! exchange waits for this one to complete.

use super::common::{
    prepare_request, publish_request, DeviceIdentity, NotReady, RequestError,
    DEFAULT_RESPONSE_TIMEOUT_SECS,
};
use super::context::{OperationState, RetriableOperationContext, TerminalOutcome};
use super::RetriableOperation;
use crate::clock::SharedClock;
use crate::config::OperationSettings;
use crate::protocol::{
    read_common_response_properties, CorrelationId, EnrollmentChangeNotification,
    EnrollmentResponse, MessageType, ResponseResultCode,
};
use crate::retry::FailureClass;
use crate::transport::{InboundMessage, MessageChannel};
use chrono::TimeDelta;
use rand::rngs::StdRng;
use tracing::{debug, error, info, warn};

/// Enrollment status as last reported by the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnrollmentStatus {
    #[default]
    Unknown,
    Requesting,
    Enrolled,
    NotEnrolled,
}

#[derive(Debug)]
pub struct EnrollmentOperation {
    ctx: RetriableOperationContext,
    identity: DeviceIdentity,
    status: EnrollmentStatus,
    response_timeout: TimeDelta,
}

impl EnrollmentOperation {
    pub fn new(settings: &OperationSettings, identity: DeviceIdentity, clock: SharedClock) -> Self {
        Self {
            ctx: RetriableOperationContext::new("enrollment", settings, clock),
            identity,
            status: EnrollmentStatus::Unknown,
            response_timeout: TimeDelta::seconds(DEFAULT_RESPONSE_TIMEOUT_SECS),
        }
    }

    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.ctx = self.ctx.with_rng(rng);
        self
    }

    pub fn status(&self) -> EnrollmentStatus {
        self.status
    }

    pub fn is_enrolled(&self) -> bool {
        self.status == EnrollmentStatus::Enrolled || self.identity.store().is_device_enrolled()
    }

    /// Decide whether this pass may start a new instance
    fn ready_to_start(&mut self) -> bool {
        match self.ctx.state() {
            OperationState::NotStarted => true,
            OperationState::Completed => !self.identity.store().is_device_enrolled(),
            OperationState::Failure | OperationState::Cancelled | OperationState::Expired => {
                self.ctx.should_retry_now()
            }
            OperationState::InProgress | OperationState::RetryPending => false,
        }
    }

    fn send_request(&mut self, channel: &mut dyn MessageChannel) {
        let topics = match prepare_request(channel, &self.identity, false) {
            Ok(topics) => topics,
            Err(NotReady::SubscribeFailed(e)) => {
                self.ctx.handle_send_error(&e);
                return;
            }
            Err(reason) => {
                debug!("enrollment: not sending yet, {}", reason);
                return;
            }
        };

        let correlation_id = CorrelationId::generate();
        match publish_request(
            channel,
            &topics.publish,
            MessageType::EnrollmentRequest,
            &correlation_id,
            &serde_json::json!({}),
        ) {
            Ok(_) => {
                info!("Enrollment request sent (correlation id {})", correlation_id);
                self.ctx.record_execution(correlation_id);
                self.status = EnrollmentStatus::Requesting;
            }
            Err(RequestError::Send(e)) => {
                self.ctx.handle_send_error(&e);
            }
            Err(RequestError::Encode(e)) => {
                error!("enrollment: cannot encode request: {}", e);
                self.ctx.mark_terminal(TerminalOutcome::Failure);
            }
        }
    }

    fn handle_response(&mut self, message: &InboundMessage) {
        if !self.ctx.matches_response(&message.properties) {
            debug!("enrollment: dropping response with unknown correlation id");
            return;
        }

        let common = match read_common_response_properties(
            &message.properties,
            MessageType::EnrollmentResponse,
        ) {
            Ok(common) => common,
            Err(e) => {
                warn!("enrollment: invalid response properties: {}", e);
                return;
            }
        };

        let result = common.result();
        if result != ResponseResultCode::Success {
            warn!(
                "enrollment: service returned {} ({})",
                result,
                common.extended_result().description()
            );
        }

        match result {
            ResponseResultCode::Success => self.apply_success(message),
            ResponseResultCode::AgentNotEnrolled
            | ResponseResultCode::Busy
            | ResponseResultCode::Conflict
            | ResponseResultCode::ServerError => {
                self.status = EnrollmentStatus::Unknown;
                self.ctx.mark_attempt_failed(FailureClass::ServiceTransient);
            }
            ResponseResultCode::BadRequest => {
                self.status = EnrollmentStatus::Unknown;
                self.ctx
                    .mark_attempt_failed(FailureClass::ServiceUnrecoverable);
            }
            ResponseResultCode::Unknown(code) => {
                warn!("enrollment: unknown result code {}", code);
                self.status = EnrollmentStatus::Unknown;
                self.ctx.mark_attempt_failed(FailureClass::Default);
            }
        }
    }

    fn apply_success(&mut self, message: &InboundMessage) {
        let body: EnrollmentResponse = match serde_json::from_slice(&message.payload) {
            Ok(body) => body,
            Err(e) => {
                warn!("enrollment: cannot parse response body: {}", e);
                self.ctx.mark_attempt_failed(FailureClass::Default);
                return;
            }
        };

        if !body.is_enrolled {
            info!("Device is not enrolled yet");
            self.status = EnrollmentStatus::NotEnrolled;
            if let Err(e) = self.identity.store().set_device_enrolled(false) {
                warn!("enrollment: failed to persist enrollment state: {}", e);
            }
            self.ctx.mark_attempt_failed(FailureClass::ServiceTransient);
            return;
        }

        let store = self.identity.store();
        let persisted = store
            .set_scope_id(Some(body.scope_id.clone()))
            .and_then(|()| store.set_device_enrolled(true));
        if let Err(e) = persisted {
            warn!("enrollment: failed to persist enrollment state: {}", e);
            self.ctx.mark_attempt_failed(FailureClass::ClientTransient);
            return;
        }

        info!("Device enrolled with scope '{}'", body.scope_id);
        self.status = EnrollmentStatus::Enrolled;
        self.ctx.mark_terminal(TerminalOutcome::Success);
    }

    fn handle_change_notification(&mut self, message: &InboundMessage) {
        let notification: EnrollmentChangeNotification =
            match serde_json::from_slice(&message.payload) {
                Ok(n) => n,
                Err(e) => {
                    warn!("enrollment: cannot parse change notification: {}", e);
                    return;
                }
            };

        let current_scope = self.identity.scope_id();
        let unenrolled = notification.is_enrolled == Some(false);
        let scope_changed = notification
            .scope_id
            .as_deref()
            .is_some_and(|scope| current_scope.as_deref() != Some(scope));

        if !unenrolled && !scope_changed {
            debug!("enrollment: change notification does not change anything");
            return;
        }

        info!(
            "Enrollment changed (enrolled: {:?}, scope: {:?}), enrolling again",
            notification.is_enrolled, notification.scope_id
        );
        self.reset();
        self.ctx.start();
    }

    /// Forget the enrollment, both here and in the state store
    pub fn reset(&mut self) {
        self.ctx.cancel();
        self.status = EnrollmentStatus::Unknown;
        let store = self.identity.store();
        let cleared = store
            .set_device_enrolled(false)
            .and_then(|()| store.set_agent_info_reported(false));
        if let Err(e) = cleared {
            warn!("enrollment: failed to clear enrollment state: {}", e);
        }
    }
}

impl RetriableOperation for EnrollmentOperation {
    fn name(&self) -> &'static str {
        "enrollment"
    }

    fn context(&self) -> &RetriableOperationContext {
        &self.ctx
    }

    fn do_work(&mut self, channel: &mut dyn MessageChannel) {
        if self.ctx.state() != OperationState::Completed
            && self.ctx.correlation_id().is_none()
            && self.identity.store().is_device_enrolled()
        {
            debug!("enrollment: device already enrolled");
            self.status = EnrollmentStatus::Enrolled;
            self.ctx.mark_terminal(TerminalOutcome::Success);
            return;
        }

        if self.ready_to_start() {
            self.ctx.start();
        }
        if !self.ctx.state().is_active() || self.ctx.check_expiry() {
            return;
        }

        if self.ctx.correlation_id().is_some() {
            if self.ctx.response_timed_out(self.response_timeout) {
                warn!("enrollment: no response within {}s", self.response_timeout.num_seconds());
                self.status = EnrollmentStatus::Unknown;
                self.ctx.mark_attempt_failed(FailureClass::Default);
            }
            return;
        }

        if self.ctx.should_retry_now() {
            self.send_request(channel);
        }
    }

    fn handle_message(&mut self, message: &InboundMessage, message_type: MessageType) -> bool {
        match message_type {
            MessageType::EnrollmentResponse => self.handle_response(message),
            MessageType::EnrollmentChangeNotification => self.handle_change_notification(message),
            _ => return false,
        }
        true
    }

    fn cancel(&mut self) {
        if self.ctx.cancel() {
            self.status = EnrollmentStatus::Unknown;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::{RetryParams, RetryPolicy};
    use crate::state_store::{AgentStateStore, ProvisioningStore};
    use crate::testing::{notification_message, response_message, ManualClock, RecordingChannel};
    use rand::SeedableRng;
    use std::sync::Arc;

    const RESPONSE_TOPIC: &str = "adu/oto/dev-1/s";

    fn settings() -> OperationSettings {
        OperationSettings {
            retry: RetryPolicy::uniform(RetryParams {
                max_retries: 10,
                initial_delay_ms: 1000,
                max_delay_s: 60,
                fallback_wait_s: 60,
                max_jitter_percent: 0.0,
            }),
            ..OperationSettings::default()
        }
    }

    fn setup() -> (
        EnrollmentOperation,
        Arc<AgentStateStore>,
        Arc<ManualClock>,
        RecordingChannel,
    ) {
        let store = Arc::new(AgentStateStore::in_memory());
        let clock = ManualClock::shared();
        let op = EnrollmentOperation::new(
            &settings(),
            DeviceIdentity::new(store.clone(), Some("dev-1".to_string())),
            clock.clone(),
        )
        .with_rng(StdRng::seed_from_u64(1));
        (op, store, clock, RecordingChannel::connected_with(&[RESPONSE_TOPIC]))
    }

    fn sent_correlation(channel: &RecordingChannel) -> CorrelationId {
        channel.last_published().unwrap().correlation_id().unwrap()
    }

    #[test]
    fn test_sends_empty_request_on_unscoped_topic() {
        let (mut op, _store, _clock, mut channel) = setup();
        op.do_work(&mut channel);

        let sent = channel.last_published().unwrap();
        assert_eq!(sent.topic, "adu/oto/dev-1/a");
        assert_eq!(sent.properties.message_type(), Some("enr_req"));
        assert_eq!(sent.payload_json(), Some(serde_json::json!({})));
        assert_eq!(op.status(), EnrollmentStatus::Requesting);

        op.do_work(&mut channel);
        assert_eq!(channel.published.len(), 1);
    }

    #[test]
    fn test_success_persists_scope() {
        let (mut op, store, _clock, mut channel) = setup();
        op.do_work(&mut channel);
        let cid = sent_correlation(&channel);

        let response = response_message(
            RESPONSE_TOPIC,
            MessageType::EnrollmentResponse,
            &cid,
            0,
            0,
            r#"{"IsEnrolled": true, "ScopeId": "scope-9"}"#,
        );
        assert!(op.handle_message(&response, MessageType::EnrollmentResponse));

        assert!(op.is_enrolled());
        assert_eq!(op.context().state(), OperationState::Completed);
        assert_eq!(store.get_scope_id().as_deref(), Some("scope-9"));
        assert!(store.is_device_enrolled());
    }

    #[test]
    fn test_not_enrolled_retries() {
        let (mut op, store, clock, mut channel) = setup();
        op.do_work(&mut channel);
        let cid = sent_correlation(&channel);

        let response = response_message(
            RESPONSE_TOPIC,
            MessageType::EnrollmentResponse,
            &cid,
            0,
            0,
            r#"{"IsEnrolled": false, "ScopeId": ""}"#,
        );
        op.handle_message(&response, MessageType::EnrollmentResponse);
        assert_eq!(op.status(), EnrollmentStatus::NotEnrolled);
        assert_eq!(op.context().state(), OperationState::RetryPending);
        assert!(!store.is_device_enrolled());

        op.do_work(&mut channel);
        assert_eq!(channel.published.len(), 1);
        clock.advance(TimeDelta::seconds(2));
        op.do_work(&mut channel);
        assert_eq!(channel.published.len(), 2);
        assert_ne!(sent_correlation(&channel), cid);
    }

    #[test]
    fn test_stale_response_is_dropped_after_cancel() {
        let (mut op, store, _clock, mut channel) = setup();
        op.do_work(&mut channel);
        let cid = sent_correlation(&channel);
        op.cancel();

        let response = response_message(
            RESPONSE_TOPIC,
            MessageType::EnrollmentResponse,
            &cid,
            0,
            0,
            r#"{"IsEnrolled": true, "ScopeId": "scope-9"}"#,
        );
        op.handle_message(&response, MessageType::EnrollmentResponse);
        assert_eq!(op.context().state(), OperationState::Cancelled);
        assert!(!store.is_device_enrolled());
        assert_eq!(store.get_scope_id(), None);
    }

    #[test]
    fn test_bad_request_uses_unrecoverable_policy() {
        let (mut op, _store, _clock, mut channel) = setup();
        op.do_work(&mut channel);
        let cid = sent_correlation(&channel);

        let response =
            response_message(RESPONSE_TOPIC, MessageType::EnrollmentResponse, &cid, 1, 2, "");
        op.handle_message(&response, MessageType::EnrollmentResponse);
        assert_eq!(op.context().state(), OperationState::RetryPending);
        assert_eq!(op.context().attempt_count(), 1);
    }

    #[test]
    fn test_response_timeout_retries() {
        let (mut op, _store, clock, mut channel) = setup();
        op.do_work(&mut channel);
        clock.advance(TimeDelta::seconds(DEFAULT_RESPONSE_TIMEOUT_SECS));
        op.do_work(&mut channel);
        assert_eq!(op.context().state(), OperationState::RetryPending);
        assert!(op.context().correlation_id().is_none());
    }

    #[test]
    fn test_already_enrolled_skips_request() {
        let (mut op, store, _clock, mut channel) = setup();
        store.set_device_enrolled(true).unwrap();
        op.do_work(&mut channel);
        assert!(channel.published.is_empty());
        assert_eq!(op.context().state(), OperationState::Completed);
    }

    #[test]
    fn test_waits_for_connection() {
        let (mut op, _store, _clock, _) = setup();
        let mut channel = RecordingChannel::default();
        op.do_work(&mut channel);
        assert!(channel.published.is_empty());
        assert_eq!(op.context().state(), OperationState::InProgress);
    }

    #[test]
    fn test_publish_failure_backs_off() {
        let (mut op, _store, _clock, mut channel) = setup();
        channel.fail_next_publish(crate::transport::SessionError::NotConnected);
        op.do_work(&mut channel);
        assert!(channel.published.is_empty());
        assert_eq!(op.context().state(), OperationState::RetryPending);
    }

    #[test]
    fn test_scope_change_notification_reenrolls() {
        let (mut op, store, _clock, mut channel) = setup();
        store.set_device_enrolled(true).unwrap();
        store.set_agent_info_reported(true).unwrap();
        store.set_scope_id(Some("old".to_string())).unwrap();
        op.do_work(&mut channel);
        assert!(op.is_enrolled());

        let notification = notification_message(
            RESPONSE_TOPIC,
            MessageType::EnrollmentChangeNotification,
            r#"{"ScopeId": "new"}"#,
        );
        assert!(op.handle_message(&notification, MessageType::EnrollmentChangeNotification));
        assert!(!store.is_device_enrolled());
        assert!(!store.is_agent_info_reported());

        op.do_work(&mut channel);
        assert_eq!(
            channel.last_published().unwrap().properties.message_type(),
            Some("enr_req")
        );
    }

    #[test]
    fn test_ignores_other_message_types() {
        let (mut op, _store, _clock, _channel) = setup();
        let message = notification_message(RESPONSE_TOPIC, MessageType::UpdateAvailableNotification, "{}");
        assert!(!op.handle_message(&message, MessageType::UpdateAvailableNotification));
    }
}
