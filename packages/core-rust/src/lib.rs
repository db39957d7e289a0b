//! Conduit core: the per-message state of the correlation engine.
//!
//! Message context, fault stack, continuation stack and response guard. No
//! async runtime lives here; the engine crate supplies concurrency.

pub mod clock;
pub mod continuation;
pub mod fault;
pub mod guard;
pub mod message;

pub use clock::{ClockSource, ManualClock, SystemClock};
pub use continuation::{
    resume, ContinuationFrame, ContinuationStack, Flow, ResumePoint, SequenceRef, SequenceResumer,
};
pub use fault::{EndpointTopology, FaultHandler, FaultStack};
pub use guard::ResponseGuard;
pub use message::{
    error_codes, CorrelationId, Envelope, ErrorKind, FaultInfo, InboundResponse, MessageContext,
    ProtocolVersion, ResponseKind, CORRELATION_PROPERTY,
};
