//! Calendar clock for quota day bucketing.
//!
//! Daily counters are keyed by the calendar day in the server's local
//! timezone, so "day rollover" is a clock question, not a TTL question.
//! The clock is injected wherever day boundaries matter, which keeps
//! rollover behavior testable without sleeping across midnight.

use std::sync::Mutex;

use chrono::{DateTime, Duration, Local, NaiveDate};

/// Abstraction over the wall clock for dependency injection.
///
/// Allows deterministic testing by replacing the real clock with a settable
/// one. The default implementation ([`SystemClock`]) delegates to
/// `chrono::Local`.
pub trait ClockSource: Send + Sync {
    /// Returns the current instant in the server's local timezone.
    fn now(&self) -> DateTime<Local>;

    /// Returns the current local calendar day.
    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

/// Default clock source that reads the real system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// Clock source pinned to a settable instant.
///
/// Intended for tests that need to cross day boundaries on demand.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Local>>,
}

impl ManualClock {
    /// Creates a clock frozen at `start`.
    #[must_use]
    pub fn new(start: DateTime<Local>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Moves the clock to an absolute instant.
    pub fn set(&self, to: DateTime<Local>) {
        *self.now.lock().expect("clock lock poisoned") = to;
    }

    /// Advances the clock by whole days.
    pub fn advance_days(&self, days: i64) {
        let mut now = self.now.lock().expect("clock lock poisoned");
        *now += Duration::days(days);
    }
}

impl ClockSource for ManualClock {
    fn now(&self) -> DateTime<Local> {
        *self.now.lock().expect("clock lock poisoned")
    }
}
