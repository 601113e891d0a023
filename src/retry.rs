//! Retry policy engine
//!
//! Exponential backoff with bounded jitter, shared by the connection session
//! and by every retriable operation. The delay for attempt `n` is
//!
//! ```text
//! delay  = min(2^min(n, 9) * initial_delay_ms / 1000, max_delay_s)
//! next   = now + additional + delay * (1 + jitter)
//! jitter = uniform(0, max_jitter_percent / 100)
//! ```
//!
//! Randomness is injected so callers can seed it in tests.

use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Default base delay unit
pub const DEFAULT_INITIAL_DELAY_MS: u32 = 1000;
/// Default upper bound of the exponential part
pub const DEFAULT_MAX_BACKOFF_SECS: u32 = 60;
/// Default jitter ceiling, in percent
pub const DEFAULT_MAX_JITTER_PERCENT: f64 = 5.0;
/// Exponent cap so `2^n` never overflows the delay computation
pub const MAX_RETRY_EXPONENT: u32 = 9;
/// Wait used when a timestamp cannot be computed
pub const DEFAULT_FALLBACK_WAIT_SECS: u32 = 30;

/// Parameters of one backoff policy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryParams {
    /// Attempts allowed before an operation gives up
    pub max_retries: u32,
    /// Base delay unit, doubled per attempt
    pub initial_delay_ms: u32,
    /// Ceiling of the exponential part, before jitter
    pub max_delay_s: u32,
    /// Wait applied when the regular computation is not representable
    pub fallback_wait_s: u32,
    /// Jitter ceiling in percent (0..=100)
    pub max_jitter_percent: f64,
}

impl Default for RetryParams {
    fn default() -> Self {
        Self {
            max_retries: u32::from(u16::MAX),
            initial_delay_ms: DEFAULT_INITIAL_DELAY_MS,
            max_delay_s: DEFAULT_MAX_BACKOFF_SECS,
            fallback_wait_s: DEFAULT_FALLBACK_WAIT_SECS,
            max_jitter_percent: DEFAULT_MAX_JITTER_PERCENT,
        }
    }
}

impl RetryParams {
    /// Defaults for the connection session's reconnect policy
    pub fn connection_default() -> Self {
        Self {
            fallback_wait_s: 60,
            ..Self::default()
        }
    }

    /// Check ranges that would make the delay computation meaningless
    pub fn validate(&self) -> Result<(), String> {
        if !self.max_jitter_percent.is_finite()
            || !(0.0..=100.0).contains(&self.max_jitter_percent)
        {
            return Err(format!(
                "max_jitter_percent must be within 0..=100, got {}",
                self.max_jitter_percent
            ));
        }
        Ok(())
    }

    /// True once `attempt` has used up the retry budget
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt > self.max_retries
    }

    /// Upper bound of any delay this policy can produce, in seconds
    pub fn max_jittered_delay_secs(&self) -> f64 {
        f64::from(self.max_delay_s) * (1.0 + self.max_jitter_percent / 100.0)
    }
}

/// Failure classes that select a retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    Default,
    ClientTransient,
    ClientUnrecoverable,
    ServiceTransient,
    ServiceUnrecoverable,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::Default => "default",
            FailureClass::ClientTransient => "clientTransient",
            FailureClass::ClientUnrecoverable => "clientUnrecoverable",
            FailureClass::ServiceTransient => "serviceTransient",
            FailureClass::ServiceUnrecoverable => "serviceUnrecoverable",
        }
    }
}

/// Retry parameters keyed by failure class
///
/// Classes without their own entry use `default`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default)]
    pub default: RetryParams,
    pub client_transient: Option<RetryParams>,
    pub client_unrecoverable: Option<RetryParams>,
    pub service_transient: Option<RetryParams>,
    pub service_unrecoverable: Option<RetryParams>,
}

impl RetryPolicy {
    /// Same parameters for every failure class
    pub fn uniform(params: RetryParams) -> Self {
        Self {
            default: params,
            ..Self::default()
        }
    }

    pub fn params_for(&self, class: FailureClass) -> &RetryParams {
        let specific = match class {
            FailureClass::Default => None,
            FailureClass::ClientTransient => self.client_transient.as_ref(),
            FailureClass::ClientUnrecoverable => self.client_unrecoverable.as_ref(),
            FailureClass::ServiceTransient => self.service_transient.as_ref(),
            FailureClass::ServiceUnrecoverable => self.service_unrecoverable.as_ref(),
        };
        specific.unwrap_or(&self.default)
    }

    pub fn validate(&self) -> Result<(), String> {
        self.default.validate()?;
        for params in [
            &self.client_transient,
            &self.client_unrecoverable,
            &self.service_transient,
            &self.service_unrecoverable,
        ]
        .into_iter()
        .flatten()
        {
            params.validate()?;
        }
        Ok(())
    }
}

/// Exponential part of the delay for `attempt`, in seconds, before jitter
pub fn backoff_delay_secs(initial_delay_ms: u32, attempt: u32, max_delay_s: u32) -> f64 {
    let exponent = attempt.min(MAX_RETRY_EXPONENT);
    let delay = f64::from(1u32 << exponent) * f64::from(initial_delay_ms) / 1000.0;
    delay.min(f64::from(max_delay_s))
}

/// Delay in seconds for `attempt` with an explicit jitter fraction in `[0, 1]`
pub fn jittered_delay_secs(params: &RetryParams, attempt: u32, jitter_fraction: f64) -> f64 {
    let jitter = params.max_jitter_percent / 100.0 * jitter_fraction.clamp(0.0, 1.0);
    backoff_delay_secs(params.initial_delay_ms, attempt, params.max_delay_s) * (1.0 + jitter)
}

/// Compute the next retry timestamp for `attempt`
///
/// `additional_delay` is added on top of the backoff, which is how callers
/// express a policy floor (for example the session's five minute reconnect
/// delay). Falls back to `now + fallback_wait_s` when the result is not
/// representable.
pub fn compute_next_retry<R: Rng + ?Sized>(
    now: DateTime<Utc>,
    additional_delay: TimeDelta,
    attempt: u32,
    params: &RetryParams,
    rng: &mut R,
) -> DateTime<Utc> {
    let fraction: f64 = rng.gen_range(0.0..=1.0);
    let delay_secs = jittered_delay_secs(params, attempt, fraction);

    let scheduled = if delay_secs.is_finite() && delay_secs >= 0.0 {
        TimeDelta::try_milliseconds((delay_secs * 1000.0).round() as i64)
            .and_then(|delay| additional_delay.checked_add(&delay))
            .and_then(|total| now.checked_add_signed(total))
    } else {
        None
    };

    scheduled.unwrap_or_else(|| fallback_time(now, params))
}

fn fallback_time(now: DateTime<Utc>, params: &RetryParams) -> DateTime<Utc> {
    now.checked_add_signed(TimeDelta::seconds(i64::from(params.fallback_wait_s)))
        .unwrap_or(now)
}
