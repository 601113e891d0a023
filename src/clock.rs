//! Wall-clock abstraction
//!
//! Every retry timestamp in the agent is computed from a [`Clock`] so the
//! connection session and the retriable operations can be driven
//! deterministically in tests.

use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Source of the current wall-clock time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the system time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Shared clock handle passed to the session, operations and agent loop
pub type SharedClock = Arc<dyn Clock>;

/// Convenience constructor for the production clock
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}
