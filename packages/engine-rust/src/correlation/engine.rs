//! Correlation engine: the façade tying registry, admission, fault routing,
//! continuation resume and the timeout sweeper together.
//!
//! Lifecycle follows `Created -> Running -> Stopping -> Stopped`:
//! 1. [`EngineBuilder::build`] allocates every component
//! 2. [`CorrelationEngine::start`] spawns the sweeper worker
//! 3. transports call [`CorrelationEngine::on_response_received`] from any thread
//! 4. [`CorrelationEngine::stop`] stops the sweeper; no new dispatches

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use conduit_core::{
    error_codes, resume, ClockSource, CorrelationId, FaultInfo, InboundResponse, MessageContext,
    ResponseKind, SystemClock, CORRELATION_PROPERTY,
};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::admission::AdmissionController;
use super::fault::{guarded, FaultOutcome, FaultRouter};
use super::registry::{PendingCallHandle, PendingCallRegistry, TimeoutPolicy};
use super::session::SessionAffinityStore;
use super::sweeper::{SweepReport, SweepRunner, SweepTask, TimeoutSweeper};
use crate::config::{ConfigError, EngineConfig};
use crate::error::CorrelationError;
use crate::traits::{MediationEngine, NoReplication, ReplicationHook, Transport};
use crate::worker::BackgroundWorker;

// ---------------------------------------------------------------------------
// State and outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Built, sweeper not yet running. Dispatch is allowed.
    Created,
    /// Sweeper running.
    Running,
    /// `stop()` in progress; new dispatches are refused.
    Stopping,
    Stopped,
    /// The sweeper task ended without `stop()`. Nothing expires any more, so
    /// new dispatches are refused.
    Failed,
}

/// How a delivered response was dealt with. Returned instead of an error so
/// nothing propagates into the transport's threads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseOutcome {
    /// No pending call (unknown id, late response, or lost to the sweeper).
    Unregistered,
    /// Provisional acknowledgement; the call was cleaned up, nothing ran.
    Accepted,
    /// The reply resumed suspended mediation. `completed` is `false` if a
    /// unit halted with frames left.
    Resumed { completed: bool },
    /// No continuation was pending; the reply was injected as a new flow.
    Injected { handled: bool },
    /// The outbound leg failed and was routed through the fault stack.
    SendingFault(FaultOutcome),
    /// Mediating the reply failed and was routed through the fault stack.
    MediationFailed(FaultOutcome),
}

impl ResponseOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Unregistered => "unregistered",
            Self::Accepted => "accepted",
            Self::Resumed { .. } => "resumed",
            Self::Injected { .. } => "injected",
            Self::SendingFault(_) => "sending_fault",
            Self::MediationFailed(_) => "mediation_failed",
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Assembles a [`CorrelationEngine`] from its collaborators.
pub struct EngineBuilder {
    config: EngineConfig,
    transport: Arc<dyn Transport>,
    mediation: Arc<dyn MediationEngine>,
    clock: Arc<dyn ClockSource>,
    replication: Arc<dyn ReplicationHook>,
}

impl EngineBuilder {
    #[must_use]
    pub fn new(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        mediation: Arc<dyn MediationEngine>,
    ) -> Self {
        Self {
            config,
            transport,
            mediation,
            clock: Arc::new(SystemClock),
            replication: Arc::new(NoReplication),
        }
    }

    /// Replaces the system clock (tests use `ManualClock`).
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn ClockSource>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the cluster replication hook for admission state.
    #[must_use]
    pub fn replication(mut self, replication: Arc<dyn ReplicationHook>) -> Self {
        self.replication = replication;
        self
    }

    /// Validates the config and wires every component.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] for unusable configuration values.
    pub fn build(self) -> Result<CorrelationEngine, ConfigError> {
        self.config.validate()?;

        let registry = Arc::new(PendingCallRegistry::new());
        let admission = Arc::new(AdmissionController::new(
            self.config.replication_key(),
            self.config.admission_limit,
            self.replication,
        ));
        let faults = Arc::new(FaultRouter::new(Arc::clone(&self.mediation)));
        let sessions = Arc::new(SessionAffinityStore::new());
        let sweeper = Arc::new(TimeoutSweeper::new(
            Arc::clone(&registry),
            Arc::clone(&admission),
            Arc::clone(&faults),
            Arc::clone(&sessions),
            Arc::clone(&self.clock),
        ));

        Ok(CorrelationEngine {
            config: self.config,
            registry,
            admission,
            faults,
            sessions,
            sweeper,
            transport: self.transport,
            mediation: self.mediation,
            clock: self.clock,
            state: ArcSwap::from_pointee(EngineState::Created),
            dispatch_gate: RwLock::new(()),
            worker: Mutex::new(None),
        })
    }
}

// ---------------------------------------------------------------------------
// CorrelationEngine
// ---------------------------------------------------------------------------

/// Reunites asynchronous responses with the calls that caused them.
///
/// Shared across transport threads behind an `Arc`; every method takes
/// `&self`.
pub struct CorrelationEngine {
    config: EngineConfig,
    registry: Arc<PendingCallRegistry>,
    admission: Arc<AdmissionController>,
    faults: Arc<FaultRouter>,
    sessions: Arc<SessionAffinityStore>,
    sweeper: Arc<TimeoutSweeper>,
    transport: Arc<dyn Transport>,
    mediation: Arc<dyn MediationEngine>,
    clock: Arc<dyn ClockSource>,
    state: ArcSwap<EngineState>,
    /// Held shared from the state check through registration, and
    /// exclusively while `stop()` flips the state, so no call is registered
    /// once stopping has been observed.
    dispatch_gate: RwLock<()>,
    worker: Mutex<Option<BackgroundWorker<SweepRunner>>>,
}

impl CorrelationEngine {
    /// Spawns the sweeper on the current tokio runtime. Calling it again
    /// while running is a no-op.
    pub fn start(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        let interval = Duration::from_millis(self.config.sweep_interval_ms);
        *worker = Some(BackgroundWorker::start(
            SweepRunner::new(Arc::clone(&self.sweeper)),
            interval,
        ));
        self.state.store(Arc::new(EngineState::Running));
        info!(
            sweep_interval_ms = self.config.sweep_interval_ms,
            admission_limit = self.config.admission_limit,
            "correlation engine started"
        );
    }

    /// Refuses new dispatches and stops the sweeper.
    ///
    /// Calls still pending stay registered; responses for them are still
    /// correlated, but nothing expires them any more.
    pub async fn stop(&self) {
        {
            let _gate = self.dispatch_gate.write();
            self.state.store(Arc::new(EngineState::Stopping));
        }
        let worker = self.worker.lock().take();
        if let Some(mut worker) = worker {
            worker.stop().await;
        }
        self.state.store(Arc::new(EngineState::Stopped));
        info!(pending = self.registry.size(), "correlation engine stopped");
    }

    /// Current lifecycle state. A `Running` engine whose sweeper task has
    /// died reports [`EngineState::Failed`].
    #[must_use]
    pub fn state(&self) -> EngineState {
        let state = **self.state.load();
        if state == EngineState::Running {
            let alive = self
                .worker
                .lock()
                .as_ref()
                .is_some_and(BackgroundWorker::is_running);
            if !alive {
                return EngineState::Failed;
            }
        }
        state
    }

    /// Registers `outbound` for correlation, then hands it to the transport.
    ///
    /// The correlation id is the message's own id. Protocols without
    /// WS-Addressing also carry it in [`CORRELATION_PROPERTY`] so the
    /// transport can echo it back.
    ///
    /// # Errors
    ///
    /// - [`CorrelationError::EngineNotRunning`] once the engine is stopping,
    ///   or if its sweeper has failed.
    /// - [`CorrelationError::DuplicateCorrelationId`] if the id is pending.
    /// - [`CorrelationError::SendingFault`] if the transport refused the
    ///   message; the call has already been routed through its fault stack.
    pub async fn dispatch_and_register(
        &self,
        mut outbound: MessageContext,
        policy: TimeoutPolicy,
    ) -> Result<PendingCallHandle, CorrelationError> {
        let correlation_id = CorrelationId::for_outbound(&outbound);
        if !outbound.protocol().uses_addressing() {
            outbound.set_property(
                CORRELATION_PROPERTY,
                serde_json::Value::String(correlation_id.to_string()),
            );
        }

        let wire = outbound.clone();

        let handle = {
            let _gate = self.dispatch_gate.read();
            if matches!(
                self.state(),
                EngineState::Stopping | EngineState::Stopped | EngineState::Failed
            ) {
                return Err(CorrelationError::EngineNotRunning);
            }

            let now = self.clock.now();
            let deadline_ms = policy.deadline_from(now, self.config.default_timeout_ms);
            // Acquire before the call becomes claimable so a release can never
            // run ahead of its acquire.
            let _ = self.admission.try_acquire();
            match self
                .registry
                .register(correlation_id.clone(), outbound, policy, now, deadline_ms)
            {
                Ok(handle) => handle,
                Err(e) => {
                    self.admission.release();
                    return Err(e);
                }
            }
        };
        metrics::counter!("conduit_calls_registered_total").increment(1);

        if let Err(e) = guarded(self.transport.send_outbound(wire)).await {
            let info = FaultInfo::sending(error_codes::SENDING_FAILURE, e.to_string())
                .with_detail(format!("{e:#}"));
            warn!(correlation_id = %correlation_id, error = %e, "outbound dispatch failed");
            if let Some(call) = self.registry.claim_if_pending(&correlation_id) {
                self.admission.release();
                let action = call.policy().action;
                let mut msg = call.into_outbound();
                let outcome = self
                    .faults
                    .route_call_failure(&mut msg, info.clone(), action)
                    .await;
                debug!(correlation_id = %correlation_id, ?outcome, "dispatch failure routed");
            }
            return Err(CorrelationError::SendingFault(info));
        }

        Ok(handle)
    }

    /// Entry point for the transport when a response arrives.
    ///
    /// Never fails: every error is caught here, routed to the message's
    /// fault stack if it has one, and otherwise logged and dropped.
    pub async fn on_response_received(
        &self,
        correlation_id: &CorrelationId,
        response: InboundResponse,
    ) -> ResponseOutcome {
        let Some(call) = self.registry.complete(correlation_id) else {
            let err = CorrelationError::UnregisteredResponse(correlation_id.clone());
            warn!("{err}; dropping late or unknown response");
            metrics::counter!("conduit_responses_total", "outcome" => "unregistered").increment(1);
            return ResponseOutcome::Unregistered;
        };
        self.admission.release();

        let action = call.policy().action;
        let outbound = call.into_outbound();
        let outcome = match response.kind {
            ResponseKind::Accepted => {
                debug!(
                    correlation_id = %correlation_id,
                    "provisional acknowledgement; call closed"
                );
                ResponseOutcome::Accepted
            }
            ResponseKind::SendingFault(info) => {
                let mut msg = outbound;
                warn!(
                    correlation_id = %correlation_id,
                    error_code = info.code,
                    error_message = %info.message,
                    "sending fault"
                );
                ResponseOutcome::SendingFault(
                    self.faults.route_call_failure(&mut msg, info, action).await,
                )
            }
            ResponseKind::Reply(envelope) => {
                let mut msg = outbound.response_from(envelope, response.properties);
                self.mediate_reply(&mut msg).await
            }
        };

        metrics::counter!("conduit_responses_total", "outcome" => outcome.label()).increment(1);
        outcome
    }

    async fn mediate_reply(&self, msg: &mut MessageContext) -> ResponseOutcome {
        let result = if msg.continuation.is_empty() {
            guarded(self.mediation.inject(msg))
                .await
                .map(|handled| ResponseOutcome::Injected { handled })
        } else {
            guarded(resume(msg, self.mediation.as_ref()))
                .await
                .map(|completed| ResponseOutcome::Resumed { completed })
        };

        match result {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(message_id = %msg.message_id, error = %e, "response mediation failed");
                let outcome = self.faults.handle_fault(msg, FaultInfo::mediation(&e)).await;
                ResponseOutcome::MediationFailed(outcome)
            }
        }
    }

    /// Sends `msg` back to its inbound caller, at most once per request.
    ///
    /// # Errors
    ///
    /// - [`CorrelationError::DuplicateResponse`] if the request was already
    ///   answered; the transport is not touched.
    /// - [`CorrelationError::Transport`] if the transport write failed.
    pub async fn send_response(&self, msg: MessageContext) -> Result<(), CorrelationError> {
        if let Some(guard) = &msg.response_guard {
            if guard.try_mark_sent() {
                warn!(
                    request_id = guard.request_id(),
                    message_id = %msg.message_id,
                    "response already sent; suppressing duplicate"
                );
                metrics::counter!("conduit_duplicate_responses_total").increment(1);
                return Err(CorrelationError::DuplicateResponse {
                    request_id: guard.request_id().to_string(),
                });
            }
        }
        self.transport.send_response(msg).await?;
        Ok(())
    }

    /// Runs a sweep right now on the caller's task.
    pub async fn sweep_now(&self) -> SweepReport {
        self.sweeper.sweep().await
    }

    /// Asks the running sweeper worker to sweep as soon as it is free.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine was never started or has stopped.
    pub async fn request_sweep(&self) -> anyhow::Result<()> {
        self.submit(SweepTask::SweepNow).await
    }

    /// Asks the running sweeper worker to purge expired session bindings.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine was never started or has stopped.
    pub async fn request_session_purge(&self) -> anyhow::Result<()> {
        self.submit(SweepTask::PurgeSessions).await
    }

    async fn submit(&self, task: SweepTask) -> anyhow::Result<()> {
        // Clone the sender out so the lock is not held across the await.
        let sender = self.worker.lock().as_ref().and_then(BackgroundWorker::sender);
        let Some(tx) = sender else {
            anyhow::bail!("sweeper not running");
        };
        tx.send(task)
            .await
            .map_err(|_| anyhow::anyhow!("sweeper channel closed"))
    }

    /// Binds a session to an endpoint for the configured session lifetime.
    pub fn bind_session(&self, session_id: impl Into<String>, endpoint: impl Into<String>) {
        let expires_at = self.clock.now().saturating_add(self.config.session_ttl_ms);
        self.sessions.bind(session_id, endpoint, expires_at);
    }

    /// Endpoint currently bound to `session_id`, if the binding is live.
    #[must_use]
    pub fn session_endpoint(&self, session_id: &str) -> Option<String> {
        self.sessions.lookup(session_id, self.clock.now())
    }

    #[must_use]
    pub fn registry(&self) -> &PendingCallRegistry {
        &self.registry
    }

    #[must_use]
    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    #[must_use]
    pub fn sessions(&self) -> &SessionAffinityStore {
        &self.sessions
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
