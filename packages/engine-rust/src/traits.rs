use async_trait::async_trait;
use conduit_core::{FaultHandler, FaultInfo, MessageContext, SequenceResumer};

use crate::correlation::admission::AdmissionState;

/// Outbound side of the transport layer.
///
/// Inbound responses flow the other way: the transport calls
/// `CorrelationEngine::on_response_received` from its own threads.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Hand an outbound request to the wire. The message is already
    /// registered for correlation when this is called.
    async fn send_outbound(&self, msg: MessageContext) -> anyhow::Result<()>;

    /// Write a response back to the inbound caller.
    async fn send_response(&self, msg: MessageContext) -> anyhow::Result<()>;
}

/// The mediation engine that owns sequences, mediators and endpoints.
///
/// Resuming a suspended flow comes from the [`SequenceResumer`] supertrait.
#[async_trait]
pub trait MediationEngine: SequenceResumer {
    /// Dispatch `msg` as a fresh inbound flow. Returns whether any unit
    /// handled it.
    async fn inject(&self, msg: &mut MessageContext) -> anyhow::Result<bool>;

    /// Run one fault handler: look up the named sequence, or call the named
    /// endpoint's failure hook. `cause` is also recorded on `msg.fault`.
    async fn on_fault(
        &self,
        handler: &FaultHandler,
        msg: &mut MessageContext,
        cause: &FaultInfo,
    ) -> anyhow::Result<()>;
}

/// Cluster-aware sink for admission counter changes.
///
/// Called synchronously after every acquire and release. Implementations
/// must not block; propagate asynchronously if the cluster link is slow.
pub trait ReplicationHook: Send + Sync {
    fn replicate(&self, key: &str, state: &AdmissionState);
}

/// Replication hook for single-node deployments.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoReplication;

impl ReplicationHook for NoReplication {
    fn replicate(&self, _key: &str, _state: &AdmissionState) {}
}
