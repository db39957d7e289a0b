//! Asynchronous call correlation: pending-call registry, admission counting,
//! fault routing, timeout sweeping, and the engine that ties them together.

pub mod admission;
pub mod engine;
pub mod fault;
pub mod registry;
pub mod session;
pub mod sweeper;

pub use admission::{AdmissionController, AdmissionState};
pub use engine::{CorrelationEngine, EngineBuilder, EngineState, ResponseOutcome};
pub use fault::{FaultOutcome, FaultRouter};
pub use registry::{
    CompletionState, PendingCall, PendingCallHandle, PendingCallRegistry, RegistryStats,
    TimeoutAction, TimeoutPolicy, TimeoutScope,
};
pub use session::SessionAffinityStore;
pub use sweeper::{SweepReport, SweepRunner, SweepTask, TimeoutSweeper};
