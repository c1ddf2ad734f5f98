//! Wall-clock abstraction.
//!
//! All timeouts are wall-clock since state entry and are observed only when
//! a time event is published, so the machines never read the system clock
//! directly.  Tests drive a manual clock.

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The real wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
