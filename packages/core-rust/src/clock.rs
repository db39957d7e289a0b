//! Wall-clock abstraction used for call deadlines.
//!
//! Deadlines in this workspace are absolute instants expressed as
//! milliseconds since the Unix epoch. Reading time through [`ClockSource`]
//! lets the timeout path be driven deterministically in tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Abstraction over the system clock for dependency injection.
///
/// The default implementation ([`SystemClock`]) delegates to `std::time::SystemTime`.
pub trait ClockSource: Send + Sync {
    /// Returns the current time as milliseconds since Unix epoch.
    fn now(&self) -> u64;
}

/// Default clock source that reads the real system time.
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    #[allow(clippy::cast_possible_truncation)]
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before Unix epoch")
            .as_millis() as u64
    }
}

/// Virtual clock that only moves when told to.
///
/// Shared between a test and the engine under test (wrap it in an `Arc`) so
/// the test can push time past a deadline without sleeping.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    /// Creates a clock frozen at `start_ms`.
    #[must_use]
    pub fn new(start_ms: u64) -> Self {
        Self {
            millis: AtomicU64::new(start_ms),
        }
    }

    /// Moves the clock forward by `delta_ms` and returns the new time.
    pub fn advance(&self, delta_ms: u64) -> u64 {
        self.millis.fetch_add(delta_ms, Ordering::SeqCst) + delta_ms
    }

    /// Sets the clock to an absolute value. Going backwards is allowed.
    pub fn set(&self, millis: u64) {
        self.millis.store(millis, Ordering::SeqCst);
    }
}

impl ClockSource for ManualClock {
    fn now(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_returns_nonzero() {
        let clock = SystemClock;
        assert!(clock.now() > 0);
    }

    #[test]
    fn manual_clock_starts_where_told() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now(), 1_000);
    }

    #[test]
    fn manual_clock_advance_and_set() {
        let clock = ManualClock::new(10);
        assert_eq!(clock.advance(5), 15);
        assert_eq!(clock.now(), 15);

        clock.set(3);
        assert_eq!(clock.now(), 3);
    }
}
