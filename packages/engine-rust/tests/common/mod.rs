//! Recording fakes shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use conduit_core::{
    ContinuationFrame, Envelope, FaultHandler, FaultInfo, Flow, ManualClock, MessageContext,
    ProtocolVersion, SequenceRef, SequenceResumer,
};
use conduit_engine::correlation::AdmissionState;
use conduit_engine::{
    CorrelationEngine, EngineBuilder, EngineConfig, MediationEngine, ReplicationHook, Transport,
};
use parking_lot::Mutex;

/// One thing the mediation fake was asked to do, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Resumed(String),
    Injected(String),
    Fault { handler: String, code: i32 },
}

#[derive(Default)]
pub struct RecordingTransport {
    pub fail_outbound: AtomicBool,
    pub outbound: Mutex<Vec<MessageContext>>,
    pub responses: Mutex<Vec<MessageContext>>,
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send_outbound(&self, msg: MessageContext) -> anyhow::Result<()> {
        if self.fail_outbound.load(Ordering::SeqCst) {
            anyhow::bail!("connection refused");
        }
        self.outbound.lock().push(msg);
        Ok(())
    }

    async fn send_response(&self, msg: MessageContext) -> anyhow::Result<()> {
        self.responses.lock().push(msg);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingMediation {
    pub events: Mutex<Vec<Event>>,
    /// Sequence name whose resume reports `Flow::Halt`.
    pub halt_on: Mutex<Option<String>>,
    /// Sequence name whose resume returns an error.
    pub fail_on: Mutex<Option<String>>,
    /// Fault handler name that panics when run.
    pub panic_on: Mutex<Option<String>>,
    pub panic_on_inject: AtomicBool,
    /// Message as it was when a resume halted, outer frames still on it.
    pub halted: Mutex<Option<MessageContext>>,
    /// `msg.fault` as seen by the last fault handler.
    pub last_fault: Mutex<Option<FaultInfo>>,
}

impl RecordingMediation {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn fault_handlers(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Fault { handler, .. } => Some(handler),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl SequenceResumer for RecordingMediation {
    async fn resume_at(
        &self,
        msg: &mut MessageContext,
        frame: &ContinuationFrame,
    ) -> anyhow::Result<Flow> {
        let name = match &frame.sequence {
            SequenceRef::Named(name) => name.clone(),
            other => other.to_string(),
        };
        self.events.lock().push(Event::Resumed(name.clone()));
        if self.fail_on.lock().as_deref() == Some(name.as_str()) {
            anyhow::bail!("mediator in {name} failed");
        }
        if self.halt_on.lock().as_deref() == Some(name.as_str()) {
            *self.halted.lock() = Some(msg.clone());
            return Ok(Flow::Halt);
        }
        Ok(Flow::Continue)
    }
}

#[async_trait]
impl MediationEngine for RecordingMediation {
    async fn inject(&self, msg: &mut MessageContext) -> anyhow::Result<bool> {
        assert!(!self.panic_on_inject.load(Ordering::SeqCst), "inject panicked");
        self.events
            .lock()
            .push(Event::Injected(msg.message_id.clone()));
        Ok(true)
    }

    async fn on_fault(
        &self,
        handler: &FaultHandler,
        msg: &mut MessageContext,
        cause: &FaultInfo,
    ) -> anyhow::Result<()> {
        self.events.lock().push(Event::Fault {
            handler: handler.name().to_string(),
            code: cause.code,
        });
        *self.last_fault.lock() = msg.fault.clone();
        let panics = self.panic_on.lock().as_deref() == Some(handler.name());
        assert!(!panics, "handler {} panicked", handler.name());
        Ok(())
    }
}

/// Collects every replicated admission state.
#[derive(Default)]
pub struct RecordingReplication {
    pub states: Mutex<Vec<(String, AdmissionState)>>,
}

impl ReplicationHook for RecordingReplication {
    fn replicate(&self, key: &str, state: &AdmissionState) {
        self.states.lock().push((key.to_string(), *state));
    }
}

pub struct Harness {
    pub engine: Arc<CorrelationEngine>,
    pub transport: Arc<RecordingTransport>,
    pub mediation: Arc<RecordingMediation>,
    pub replication: Arc<RecordingReplication>,
    pub clock: Arc<ManualClock>,
}

pub fn harness() -> Harness {
    harness_with(EngineConfig::default())
}

pub fn harness_with(config: EngineConfig) -> Harness {
    let transport = Arc::new(RecordingTransport::default());
    let mediation = Arc::new(RecordingMediation::default());
    let replication = Arc::new(RecordingReplication::default());
    let clock = Arc::new(ManualClock::new(0));
    let engine = EngineBuilder::new(config, transport.clone(), mediation.clone())
        .clock(clock.clone())
        .replication(replication.clone())
        .build()
        .expect("valid config");
    Harness {
        engine: Arc::new(engine),
        transport,
        mediation,
        replication,
        clock,
    }
}

/// An outbound SOAP 1.2 request with the given fault handlers pushed in
/// order (last one on top).
pub fn outbound_with_handlers(handlers: &[&str]) -> MessageContext {
    let mut msg = MessageContext::new(Envelope::new(
        ProtocolVersion::Soap12,
        serde_json::json!({"op": "quote"}),
    ));
    for name in handlers {
        msg.fault_stack.push(FaultHandler::sequence(*name));
    }
    msg
}

pub fn named(name: &str) -> SequenceRef {
    SequenceRef::Named(name.to_string())
}

pub fn reply() -> conduit_core::InboundResponse {
    conduit_core::InboundResponse::reply(Envelope::new(
        ProtocolVersion::Soap12,
        serde_json::json!({"price": 42}),
    ))
}
