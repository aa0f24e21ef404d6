//! Injectable wall-clock abstraction
//!
//! Daily quota rollover compares calendar days, not elapsed seconds, so the
//! orchestrator needs a clock it can read dates from. Production code uses
//! [`SystemClock`]; tests drive a manual clock (see `test_utils`) to cross
//! day boundaries without real time passing.

use chrono::{DateTime, NaiveDate, Utc};

/// Source of wall-clock time for calendar-day bookkeeping.
///
/// Rate windows and backoff delays intentionally do *not* go through this
/// trait; they use tokio time, which tests can pause.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;

    /// The current calendar day in UTC.
    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

/// The real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
