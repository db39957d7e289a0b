//! Timeout sweeper: expires overdue pending calls and drives their fault path.
//!
//! State machine: idle -> sweeping -> idle, once per tick. The sweeper talks
//! to the response path only through the registry's atomic claim; a call the
//! response path claimed first is skipped without side effects.

use std::sync::Arc;

use async_trait::async_trait;
use conduit_core::{ClockSource, Envelope, FaultInfo};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::admission::AdmissionController;
use super::fault::{FaultOutcome, FaultRouter};
use super::registry::{PendingCall, PendingCallRegistry, TimeoutAction};
use super::session::SessionAffinityStore;
use crate::error::CorrelationError;
use crate::worker::BackgroundRunnable;

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Another sweep was still running; this one did nothing.
    pub skipped: bool,
    /// Calls claimed by this sweep.
    pub expired: usize,
    /// Expired calls whose fault handler ran.
    pub faulted: usize,
    /// Expired calls whose fault stack was cleared (discard policy).
    pub discarded: usize,
    /// Expired calls with no timeout action; removed silently.
    pub dropped: usize,
    /// Expired calls whose fault handler returned an error.
    pub handler_failures: usize,
    /// Expired calls with an empty fault stack.
    pub undeliverable: usize,
    /// Overdue calls a response claimed between snapshot and claim.
    pub lost_races: usize,
    /// Session-affinity bindings purged.
    pub sessions_purged: usize,
}

/// Periodic expiry of overdue pending calls.
pub struct TimeoutSweeper {
    registry: Arc<PendingCallRegistry>,
    admission: Arc<AdmissionController>,
    faults: Arc<FaultRouter>,
    sessions: Arc<SessionAffinityStore>,
    clock: Arc<dyn ClockSource>,
    sweeping: Mutex<()>,
}

impl TimeoutSweeper {
    #[must_use]
    pub fn new(
        registry: Arc<PendingCallRegistry>,
        admission: Arc<AdmissionController>,
        faults: Arc<FaultRouter>,
        sessions: Arc<SessionAffinityStore>,
        clock: Arc<dyn ClockSource>,
    ) -> Self {
        Self {
            registry,
            admission,
            faults,
            sessions,
            clock,
            sweeping: Mutex::new(()),
        }
    }

    /// Sweeps at the current clock time.
    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(self.clock.now()).await
    }

    /// Expires every call whose deadline is at or before `now_ms`.
    ///
    /// Returns immediately with `skipped` set if a sweep is already running.
    /// A failing fault handler is logged and the sweep moves on.
    pub async fn sweep_at(&self, now_ms: u64) -> SweepReport {
        let Ok(_sweeping) = self.sweeping.try_lock() else {
            debug!("sweep already in progress; skipping tick");
            return SweepReport {
                skipped: true,
                ..SweepReport::default()
            };
        };

        let mut report = SweepReport::default();
        for id in self.registry.expired_ids(now_ms) {
            let Some(call) = self.registry.claim_if_pending(&id) else {
                report.lost_races += 1;
                continue;
            };
            self.registry
                .stats()
                .expired
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            report.expired += 1;
            self.expire(call, &mut report).await;
        }

        report.sessions_purged = self.sessions.purge_expired(now_ms);
        if report.expired > 0 {
            debug!(
                expired = report.expired,
                faulted = report.faulted,
                discarded = report.discarded,
                dropped = report.dropped,
                "sweep finished"
            );
        }
        report
    }

    /// Purges session bindings without touching pending calls.
    pub fn purge_sessions(&self) -> usize {
        self.sessions.purge_expired(self.clock.now())
    }

    async fn expire(&self, call: PendingCall, report: &mut SweepReport) {
        let policy = call.policy();
        let deadline_ms = call.deadline_ms();
        let err = CorrelationError::Timeout(call.correlation_id().clone());
        metrics::counter!("conduit_timeouts_total").increment(1);
        // The call is claimed; its slot is free whatever the handler does.
        self.admission.release();

        if policy.action == TimeoutAction::None {
            debug!(deadline_ms, "{err}; no timeout action, dropping");
            report.dropped += 1;
        } else {
            warn!(deadline_ms, action = ?policy.action, "{err}");
            let mut msg = call.into_outbound();
            msg.envelope = Envelope::empty_fault(msg.protocol());
            let outcome = self
                .faults
                .route_call_failure(&mut msg, FaultInfo::timeout(deadline_ms), policy.action)
                .await;
            match outcome {
                FaultOutcome::Handled { .. } => report.faulted += 1,
                FaultOutcome::HandlerFailed { .. } => report.handler_failures += 1,
                FaultOutcome::Discarded => report.discarded += 1,
                FaultOutcome::Undeliverable => report.undeliverable += 1,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Worker adapter
// ---------------------------------------------------------------------------

/// On-demand tasks for the sweeper worker.
#[derive(Debug)]
pub enum SweepTask {
    /// Run a sweep now instead of waiting for the next tick.
    SweepNow,
    /// Purge expired session bindings only.
    PurgeSessions,
}

/// Runs a shared [`TimeoutSweeper`] inside a `BackgroundWorker`.
pub struct SweepRunner {
    sweeper: Arc<TimeoutSweeper>,
}

impl SweepRunner {
    #[must_use]
    pub fn new(sweeper: Arc<TimeoutSweeper>) -> Self {
        Self { sweeper }
    }
}

#[async_trait]
impl BackgroundRunnable for SweepRunner {
    type Task = SweepTask;

    async fn run(&mut self, task: SweepTask) {
        match task {
            SweepTask::SweepNow => {
                self.sweeper.sweep().await;
            }
            SweepTask::PurgeSessions => {
                self.sweeper.purge_sessions();
            }
        }
    }

    async fn on_tick(&mut self) {
        self.sweeper.sweep().await;
    }

    async fn shutdown(&mut self) {
        debug!(
            pending = self.sweeper.registry.size(),
            "timeout sweeper stopped"
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
