//! Conduit engine: asynchronous request/response correlation, timeouts,
//! advisory admission control and suspend/resume of mediation flows.

pub mod config;
pub mod correlation;
pub mod error;
pub mod traits;
pub mod worker;

pub use config::{ConfigError, EngineConfig};
pub use correlation::{
    CorrelationEngine, EngineBuilder, EngineState, FaultOutcome, PendingCallHandle,
    ResponseOutcome, SweepReport, TimeoutAction, TimeoutPolicy,
};
pub use error::CorrelationError;
pub use traits::{MediationEngine, NoReplication, ReplicationHook, Transport};

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
