//! Retriable operation context
//!
//! Bookkeeping shared by every request/response operation: when the next
//! attempt is due, how many attempts were made, which correlation id is live,
//! and when the whole operation instance expires. The owning module decides
//! what an attempt is; the context decides when one may happen.

use crate::clock::SharedClock;
use crate::config::OperationSettings;
use crate::protocol::{correlation_matches, CorrelationId, MessageProperties};
use crate::retry::{compute_next_retry, FailureClass, RetryPolicy};
use crate::transport::SessionError;
use chrono::{DateTime, TimeDelta, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fmt;
use tracing::{debug, info, warn};

/// Lifecycle of one operation instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OperationState {
    #[default]
    NotStarted,
    InProgress,
    /// An attempt failed and another one is scheduled
    RetryPending,
    Completed,
    Failure,
    Expired,
    Cancelled,
}

impl OperationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationState::NotStarted => "NotStarted",
            OperationState::InProgress => "InProgress",
            OperationState::RetryPending => "RetryPending",
            OperationState::Completed => "Completed",
            OperationState::Failure => "Failure",
            OperationState::Expired => "Expired",
            OperationState::Cancelled => "Cancelled",
        }
    }

    /// Completed, Failure and Cancelled never schedule further attempts on
    /// their own
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationState::Completed | OperationState::Failure | OperationState::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            OperationState::InProgress | OperationState::RetryPending
        )
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome passed to [`RetriableOperationContext::mark_terminal`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalOutcome {
    Success,
    Failure,
    Cancelled,
}

/// What happened after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Another attempt is scheduled at the given time
    Retry(DateTime<Utc>),
    /// The retry budget for the failure class is used up
    Exhausted,
}

/// What to do after a publish or subscribe call failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailureAction {
    Retry(RetryDecision),
    Cancelled,
}

/// Retry class for a failed publish/subscribe call; `None` when retrying
/// cannot help
pub fn send_failure_class(error: &SessionError) -> Option<FailureClass> {
    if error.is_unrecoverable() {
        None
    } else if error.is_no_connection() {
        Some(FailureClass::ClientTransient)
    } else {
        Some(FailureClass::Default)
    }
}

/// Clamp a configured number of seconds into a representable delta
pub fn secs_to_delta(secs: u64) -> TimeDelta {
    i64::try_from(secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .unwrap_or(TimeDelta::MAX)
}

pub struct RetriableOperationContext {
    name: &'static str,
    clock: SharedClock,
    rng: StdRng,
    policy: RetryPolicy,
    interval: TimeDelta,
    timeout: TimeDelta,
    state: OperationState,
    attempt_count: u32,
    correlation_id: Option<CorrelationId>,
    started_at: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
    last_execution_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    last_failure_at: Option<DateTime<Utc>>,
    next_execution_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for RetriableOperationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetriableOperationContext")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("attempt_count", &self.attempt_count)
            .field("correlation_id", &self.correlation_id)
            .field("next_execution_at", &self.next_execution_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl RetriableOperationContext {
    pub fn new(name: &'static str, settings: &OperationSettings, clock: SharedClock) -> Self {
        Self {
            name,
            clock,
            rng: StdRng::from_entropy(),
            policy: settings.retry.clone(),
            interval: secs_to_delta(settings.interval_secs),
            timeout: secs_to_delta(settings.timeout_secs),
            state: OperationState::NotStarted,
            attempt_count: 0,
            correlation_id: None,
            started_at: None,
            expires_at: None,
            last_execution_at: None,
            last_success_at: None,
            last_failure_at: None,
            next_execution_at: None,
        }
    }

    /// Replace the jitter source, for deterministic tests
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn state(&self) -> OperationState {
        self.state
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        self.correlation_id.as_ref()
    }

    pub fn interval(&self) -> TimeDelta {
        self.interval
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn last_execution_at(&self) -> Option<DateTime<Utc>> {
        self.last_execution_at
    }

    pub fn last_success_at(&self) -> Option<DateTime<Utc>> {
        self.last_success_at
    }

    pub fn last_failure_at(&self) -> Option<DateTime<Utc>> {
        self.last_failure_at
    }

    pub fn next_execution_at(&self) -> Option<DateTime<Utc>> {
        self.next_execution_at
    }

    /// Start a fresh instance: attempts reset, expiry armed
    pub fn start(&mut self) {
        let now = self.now();
        self.attempt_count = 0;
        self.correlation_id = None;
        self.started_at = Some(now);
        self.expires_at = now.checked_add_signed(self.timeout);
        self.next_execution_at = None;
        self.set_state(OperationState::InProgress);
    }

    /// True when no attempt is scheduled in the future
    pub fn should_retry_now(&self) -> bool {
        let now = self.now();
        self.next_execution_at.map_or(true, |at| now >= at)
    }

    /// Record that a request carrying `correlation_id` was just sent
    pub fn record_execution(&mut self, correlation_id: CorrelationId) {
        self.last_execution_at = Some(self.now());
        self.correlation_id = Some(correlation_id);
        self.next_execution_at = None;
        self.set_state(OperationState::InProgress);
    }

    /// Move the reference time of the in-flight exchange to now
    pub fn touch_execution(&mut self) {
        self.last_execution_at = Some(self.now());
    }

    /// Forget the live correlation id; responses carrying it are dropped from now on
    pub fn clear_correlation(&mut self) {
        self.correlation_id = None;
    }

    pub fn set_next_execution(&mut self, at: DateTime<Utc>) {
        self.next_execution_at = Some(at);
    }

    /// Schedule the next attempt `delay` from now
    pub fn schedule_in(&mut self, delay: TimeDelta) {
        let now = self.now();
        self.next_execution_at = Some(now.checked_add_signed(delay).unwrap_or(now));
    }

    pub fn mark_attempt_failed(&mut self, class: FailureClass) -> RetryDecision {
        self.mark_attempt_failed_with_delay(class, TimeDelta::zero())
    }

    /// Count a failed attempt and schedule the next one with the backoff of
    /// `class`, plus `additional_delay`
    pub fn mark_attempt_failed_with_delay(
        &mut self,
        class: FailureClass,
        additional_delay: TimeDelta,
    ) -> RetryDecision {
        let now = self.now();
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.correlation_id = None;
        self.last_failure_at = Some(now);

        let params = *self.policy.params_for(class);
        if params.is_exhausted(self.attempt_count) {
            warn!(
                "{}: retries exhausted after {} attempts ({})",
                self.name,
                self.attempt_count,
                class.as_str()
            );
            self.mark_terminal(TerminalOutcome::Failure);
            return RetryDecision::Exhausted;
        }

        let next = compute_next_retry(
            now,
            additional_delay,
            self.attempt_count,
            &params,
            &mut self.rng,
        );
        self.next_execution_at = Some(next);
        self.set_state(OperationState::RetryPending);
        info!(
            "{}: attempt {} failed ({}), next attempt at {}",
            self.name,
            self.attempt_count,
            class.as_str(),
            next
        );
        RetryDecision::Retry(next)
    }

    /// Classify a failed publish/subscribe call and act on it
    pub fn handle_send_error(&mut self, error: &SessionError) -> SendFailureAction {
        match send_failure_class(error) {
            Some(class) => {
                debug!("{}: send failed ({}): {}", self.name, class.as_str(), error);
                SendFailureAction::Retry(self.mark_attempt_failed(class))
            }
            None => {
                warn!("{}: unrecoverable send error, cancelling: {}", self.name, error);
                self.cancel();
                let interval = self.interval;
                self.schedule_in(interval);
                SendFailureAction::Cancelled
            }
        }
    }

    pub fn mark_terminal(&mut self, outcome: TerminalOutcome) {
        let now = self.now();
        self.correlation_id = None;
        match outcome {
            TerminalOutcome::Success => {
                self.attempt_count = 0;
                self.last_success_at = Some(now);
                self.next_execution_at = now.checked_add_signed(self.interval);
                self.set_state(OperationState::Completed);
            }
            TerminalOutcome::Failure => {
                self.last_failure_at = Some(now);
                self.next_execution_at = now.checked_add_signed(self.interval);
                self.set_state(OperationState::Failure);
            }
            TerminalOutcome::Cancelled => self.set_state(OperationState::Cancelled),
        }
    }

    /// Cancel the live instance. Returns false when there was nothing to cancel.
    pub fn cancel(&mut self) -> bool {
        self.correlation_id = None;
        match self.state {
            OperationState::NotStarted
            | OperationState::InProgress
            | OperationState::RetryPending
            | OperationState::Expired => {
                self.mark_terminal(TerminalOutcome::Cancelled);
                true
            }
            _ => false,
        }
    }

    /// Expire the instance once its lifetime is over. Returns true when it
    /// just expired; the instance ends up `Cancelled`.
    pub fn check_expiry(&mut self) -> bool {
        if !self.state.is_active() {
            return false;
        }
        let now = self.now();
        match self.expires_at {
            Some(expires_at) if now >= expires_at => {
                warn!("{}: expired at {}", self.name, expires_at);
                self.set_state(OperationState::Expired);
                self.cancel();
                true
            }
            _ => false,
        }
    }

    /// True when `props` answers the live request
    pub fn matches_response(&self, props: &MessageProperties) -> bool {
        self.correlation_id
            .as_ref()
            .is_some_and(|id| correlation_matches(props, id))
    }

    /// True when a request is outstanding and was sent at least `timeout` ago
    pub fn response_timed_out(&self, timeout: TimeDelta) -> bool {
        if self.correlation_id.is_none() {
            return false;
        }
        let now = self.now();
        self.last_execution_at
            .and_then(|sent| sent.checked_add_signed(timeout))
            .is_some_and(|deadline| now >= deadline)
    }

    fn set_state(&mut self, state: OperationState) {
        if self.state != state {
            info!("{}: '{}' -> '{}'", self.name, self.state, state);
            self.state = state;
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::clock::Clock;
    use super::*;
    use crate::retry::RetryParams;
    use crate::testing::ManualClock;
    use std::sync::Arc;

    fn settings(max_retries: u32) -> OperationSettings {
        OperationSettings {
            interval_secs: 3600,
            timeout_secs: 600,
            retry: RetryPolicy::uniform(RetryParams {
                max_retries,
                initial_delay_ms: 1000,
                max_delay_s: 60,
                fallback_wait_s: 60,
                max_jitter_percent: 0.0,
            }),
        }
    }

    fn context(max_retries: u32) -> (RetriableOperationContext, Arc<ManualClock>) {
        let clock = ManualClock::shared();
        let ctx = RetriableOperationContext::new("test", &settings(max_retries), clock.clone())
            .with_rng(StdRng::seed_from_u64(7));
        (ctx, clock)
    }

    #[test]
    fn test_start_arms_expiry_and_runs_immediately() {
        let (mut ctx, clock) = context(3);
        ctx.start();
        assert_eq!(ctx.state(), OperationState::InProgress);
        assert!(ctx.should_retry_now());
        assert_eq!(ctx.expires_at(), Some(clock.now() + TimeDelta::seconds(600)));
    }

    #[test]
    fn test_failed_attempt_backs_off() {
        let (mut ctx, clock) = context(3);
        ctx.start();
        ctx.record_execution(CorrelationId::generate());

        let decision = ctx.mark_attempt_failed(FailureClass::Default);
        assert_eq!(decision, RetryDecision::Retry(clock.now() + TimeDelta::seconds(2)));
        assert_eq!(ctx.state(), OperationState::RetryPending);
        assert!(ctx.correlation_id().is_none());
        assert!(!ctx.should_retry_now());

        clock.advance(TimeDelta::seconds(2));
        assert!(ctx.should_retry_now());
    }

    #[test]
    fn test_exhausted_retries_fail() {
        let (mut ctx, clock) = context(1);
        ctx.start();
        assert!(matches!(
            ctx.mark_attempt_failed(FailureClass::Default),
            RetryDecision::Retry(_)
        ));
        assert_eq!(
            ctx.mark_attempt_failed(FailureClass::Default),
            RetryDecision::Exhausted
        );
        assert_eq!(ctx.state(), OperationState::Failure);
        assert_eq!(
            ctx.next_execution_at(),
            Some(clock.now() + TimeDelta::seconds(3600))
        );
    }

    #[test]
    fn test_send_error_classification() {
        let (mut ctx, _clock) = context(5);
        ctx.start();

        let action = ctx.handle_send_error(&SessionError::NotConnected);
        assert!(matches!(action, SendFailureAction::Retry(RetryDecision::Retry(_))));
        assert_eq!(ctx.attempt_count(), 1);

        let unrecoverable = SessionError::Engine(crate::transport::EngineError::PayloadSize(9));
        assert_eq!(
            ctx.handle_send_error(&unrecoverable),
            SendFailureAction::Cancelled
        );
        assert_eq!(ctx.state(), OperationState::Cancelled);
        assert!(!ctx.should_retry_now());
    }

    #[test]
    fn test_cancel_drops_correlation() {
        let (mut ctx, _clock) = context(5);
        ctx.start();
        let id = CorrelationId::generate();
        ctx.record_execution(id.clone());
        let props = MessageProperties::for_request(crate::protocol::MessageType::EnrollmentResponse, &id);
        assert!(ctx.matches_response(&props));

        assert!(ctx.cancel());
        assert!(!ctx.matches_response(&props));
        assert!(!ctx.cancel());
    }

    #[test]
    fn test_expiry_cancels() {
        let (mut ctx, clock) = context(5);
        ctx.start();
        clock.advance(TimeDelta::seconds(599));
        assert!(!ctx.check_expiry());
        clock.advance(TimeDelta::seconds(1));
        assert!(ctx.check_expiry());
        assert_eq!(ctx.state(), OperationState::Cancelled);
        assert!(!ctx.check_expiry());
    }

    #[test]
    fn test_response_timeout() {
        let (mut ctx, clock) = context(5);
        ctx.start();
        assert!(!ctx.response_timed_out(TimeDelta::seconds(180)));
        ctx.record_execution(CorrelationId::generate());
        clock.advance(TimeDelta::seconds(179));
        assert!(!ctx.response_timed_out(TimeDelta::seconds(180)));
        clock.advance(TimeDelta::seconds(1));
        assert!(ctx.response_timed_out(TimeDelta::seconds(180)));
    }

    #[test]
    fn test_success_schedules_next_interval() {
        let (mut ctx, clock) = context(5);
        ctx.start();
        ctx.mark_attempt_failed(FailureClass::Default);
        ctx.mark_terminal(TerminalOutcome::Success);
        assert_eq!(ctx.state(), OperationState::Completed);
        assert_eq!(ctx.attempt_count(), 0);
        assert_eq!(ctx.last_success_at(), Some(clock.now()));
        assert_eq!(
            ctx.next_execution_at(),
            Some(clock.now() + TimeDelta::seconds(3600))
        );
    }

    #[test]
    fn test_huge_settings_do_not_overflow() {
        assert_eq!(secs_to_delta(u64::MAX), TimeDelta::MAX);
        assert_eq!(secs_to_delta(30), TimeDelta::seconds(30));
    }
}
