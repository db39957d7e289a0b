//! Fault routing: turns a failure into exactly one fault handler run.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use conduit_core::{FaultHandler, FaultInfo, MessageContext};
use futures_util::FutureExt;
use tracing::{debug, error};

use super::registry::TimeoutAction;
use crate::error::CorrelationError;
use crate::traits::MediationEngine;

/// Awaits collaborator code, turning a panic into an error so it cannot
/// unwind through the sweeper or the transport's task.
pub(crate) async fn guarded<T, F>(fut: F) -> anyhow::Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(anyhow::anyhow!("panicked: {}", panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg
    } else {
        "unknown panic payload"
    }
}

/// Result of routing one fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The popped handler ran to completion.
    Handled { handler: FaultHandler },
    /// The popped handler returned an error. It is not retried.
    HandlerFailed { handler: FaultHandler, error: String },
    /// Timeout under a discard policy: remaining handlers were cleared.
    Discarded,
    /// No handler left; the message is dropped.
    Undeliverable,
}

/// Pops and runs fault handlers through the mediation engine.
pub struct FaultRouter {
    mediation: Arc<dyn MediationEngine>,
}

impl FaultRouter {
    #[must_use]
    pub fn new(mediation: Arc<dyn MediationEngine>) -> Self {
        Self { mediation }
    }

    /// Records `cause` on the message, pops one handler and runs it.
    ///
    /// An empty stack is terminal for the message: it is logged and dropped,
    /// never treated as success.
    pub async fn handle_fault(&self, msg: &mut MessageContext, cause: FaultInfo) -> FaultOutcome {
        msg.fault = Some(cause.clone());

        let Some(handler) = msg.fault_stack.pop() else {
            let err = CorrelationError::NoFaultHandler {
                message_id: msg.message_id.clone(),
            };
            metrics::counter!("conduit_faults_total", "outcome" => "undeliverable").increment(1);
            error!(
                trace_id = %msg.trace_id,
                error_code = cause.code,
                error_message = %cause.message,
                "{err}; dropping message"
            );
            return FaultOutcome::Undeliverable;
        };

        debug!(
            message_id = %msg.message_id,
            handler = handler.name(),
            error_code = cause.code,
            "invoking fault handler"
        );
        match guarded(self.mediation.on_fault(&handler, msg, &cause)).await {
            Ok(()) => {
                metrics::counter!("conduit_faults_total", "outcome" => "handled").increment(1);
                FaultOutcome::Handled { handler }
            }
            Err(e) => {
                metrics::counter!("conduit_faults_total", "outcome" => "handler_failed")
                    .increment(1);
                error!(
                    message_id = %msg.message_id,
                    handler = handler.name(),
                    error = %e,
                    "fault handler failed"
                );
                FaultOutcome::HandlerFailed {
                    handler,
                    error: e.to_string(),
                }
            }
        }
    }

    /// Routes the failure of an outbound call (sending fault or timeout).
    ///
    /// Precedence:
    /// 1. a timeout under [`TimeoutAction::Discard`] clears the stack and runs
    ///    nothing;
    /// 2. an endpoint handler on top that belongs to a failover/load-balance
    ///    group and names the message's successful endpoint is popped unrun,
    ///    so the group's own handler below it takes over;
    /// 3. one handler is popped and run via [`Self::handle_fault`].
    pub async fn route_call_failure(
        &self,
        msg: &mut MessageContext,
        cause: FaultInfo,
        action: TimeoutAction,
    ) -> FaultOutcome {
        if cause.is_timeout() && action == TimeoutAction::Discard {
            debug!(
                message_id = %msg.message_id,
                cleared = msg.fault_stack.len(),
                "timeout with discard policy; clearing fault handlers"
            );
            msg.fault_stack.clear();
            msg.fault = Some(cause);
            metrics::counter!("conduit_faults_total", "outcome" => "discarded").increment(1);
            return FaultOutcome::Discarded;
        }

        skip_successful_endpoint(msg);
        self.handle_fault(msg, cause).await
    }
}

fn skip_successful_endpoint(msg: &mut MessageContext) {
    let is_successful_member = match (msg.fault_stack.peek(), msg.successful_endpoint.as_deref()) {
        (Some(FaultHandler::Endpoint { name, topology }), Some(successful)) => {
            topology.is_retryable() && name == successful
        }
        _ => false,
    };
    if is_successful_member {
        if let Some(skipped) = msg.fault_stack.pop() {
            debug!(
                message_id = %msg.message_id,
                endpoint = skipped.name(),
                "skipping handler of last successful group member"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
