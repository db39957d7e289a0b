//! Advisory admission control for outbound calls.
//!
//! Counts in-flight calls against a limit. Exceeding the limit is reported
//! (log + metric) but the call is still admitted: the counter is a
//! back-pressure signal shared with peers, not a gate.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::traits::ReplicationHook;

/// Snapshot handed to the replication hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionState {
    pub limit: u32,
    pub in_flight: u32,
}

impl AdmissionState {
    #[must_use]
    pub fn is_over_limit(&self) -> bool {
        self.in_flight > self.limit
    }
}

/// In-flight counter with replication after every change.
///
/// The counter update and its `replicate` call happen under one lock, so the
/// hook sees states in the order they occurred and its last state is always
/// the current count.
pub struct AdmissionController {
    key: String,
    limit: u32,
    in_flight: Mutex<u32>,
    replication: Arc<dyn ReplicationHook>,
}

impl fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionController")
            .field("key", &self.key)
            .field("limit", &self.limit)
            .field("in_flight", &*self.in_flight.lock())
            .finish_non_exhaustive()
    }
}

impl AdmissionController {
    #[must_use]
    pub fn new(key: impl Into<String>, limit: u32, replication: Arc<dyn ReplicationHook>) -> Self {
        Self {
            key: key.into(),
            limit,
            in_flight: Mutex::new(0),
            replication,
        }
    }

    /// Counts one more in-flight call.
    ///
    /// Returns whether the call fits under the limit. A `false` result is
    /// advisory: the caller proceeds anyway and the overflow is reported.
    pub fn try_acquire(&self) -> bool {
        let in_flight = {
            let mut count = self.in_flight.lock();
            *count = count.saturating_add(1);
            self.publish(*count);
            *count
        };
        let granted = in_flight <= self.limit;
        if !granted {
            metrics::counter!("conduit_admission_overflow_total").increment(1);
            warn!(
                key = %self.key,
                in_flight,
                limit = self.limit,
                "admission limit exceeded; admitting anyway"
            );
        }
        granted
    }

    /// Counts one in-flight call as finished.
    ///
    /// Callers guarantee one release per acquired call. A release at zero is
    /// logged and ignored.
    pub fn release(&self) {
        let mut count = self.in_flight.lock();
        if let Some(next) = count.checked_sub(1) {
            *count = next;
            self.publish(next);
        } else {
            drop(count);
            warn!(key = %self.key, "admission release without matching acquire");
        }
    }

    #[must_use]
    pub fn state(&self) -> AdmissionState {
        AdmissionState {
            limit: self.limit,
            in_flight: *self.in_flight.lock(),
        }
    }

    #[must_use]
    pub fn in_flight(&self) -> u32 {
        *self.in_flight.lock()
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Called with the counter lock held.
    fn publish(&self, in_flight: u32) {
        metrics::gauge!("conduit_admission_in_flight").set(f64::from(in_flight));
        self.replication.replicate(
            &self.key,
            &AdmissionState {
                limit: self.limit,
                in_flight,
            },
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
