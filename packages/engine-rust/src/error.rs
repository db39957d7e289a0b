//! Error taxonomy of the correlation engine.

use conduit_core::{CorrelationId, FaultInfo};

/// Errors surfaced by engine operations.
///
/// Only dispatch and response sending return these to callers. Response and
/// sweep processing swallow failures at the engine boundary and report them
/// through outcome values and logs instead.
#[derive(Debug, thiserror::Error)]
pub enum CorrelationError {
    /// A pending call with this id already exists. Indicates a dispatch bug;
    /// retrying will not help.
    #[error("duplicate correlation id: {0}")]
    DuplicateCorrelationId(CorrelationId),
    /// A response arrived for an id with no pending call.
    #[error("no pending call for correlation id {0}")]
    UnregisteredResponse(CorrelationId),
    /// The outbound leg failed before any backend reply.
    #[error("sending fault {}: {}", .0.code, .0.message)]
    SendingFault(FaultInfo),
    /// The call expired in the registry.
    #[error("call {0} timed out")]
    Timeout(CorrelationId),
    /// A fault occurred but no handler was left to take it.
    #[error("no fault handler for message {message_id}")]
    NoFaultHandler { message_id: String },
    /// The response guard already fired for this inbound request.
    #[error("response already sent for request {request_id}")]
    DuplicateResponse { request_id: String },
    #[error("engine is not accepting dispatches")]
    EngineNotRunning,
    #[error("transport error: {0}")]
    Transport(#[from] anyhow::Error),
}
