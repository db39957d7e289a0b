//! Drives a correlation engine against a simulated backend.
//!
//! Each dispatched call is answered after a random delay, answered too late,
//! or never answered, so registry, sweeper and admission counters all get
//! exercised. Prints a summary and the Prometheus metrics on exit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use conduit_core::{
    ContinuationFrame, CorrelationId, Envelope, FaultHandler, FaultInfo, Flow, InboundResponse,
    MessageContext, ProtocolVersion, ResumePoint, SequenceRef, SequenceResumer,
};
use conduit_engine::{
    CorrelationEngine, EngineBuilder, EngineConfig, MediationEngine, TimeoutPolicy, Transport,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "correlation-sim")]
#[command(about = "Simulate asynchronous backend calls through the correlation engine")]
struct Args {
    /// Number of outbound calls to dispatch.
    #[arg(long, env = "CONDUIT_SIM_CALLS", default_value_t = 200)]
    calls: u32,

    /// Per-call timeout in milliseconds.
    #[arg(long, env = "CONDUIT_SIM_TIMEOUT_MS", default_value_t = 300)]
    timeout_ms: u64,

    /// Probability that the backend answers at all.
    #[arg(long, env = "CONDUIT_SIM_RESPONSE_PROBABILITY", default_value_t = 0.8)]
    response_probability: f64,

    /// Upper bound of the simulated backend latency in milliseconds.
    #[arg(long, env = "CONDUIT_SIM_MAX_LATENCY_MS", default_value_t = 500)]
    max_latency_ms: u64,

    /// Sweeper period in milliseconds.
    #[arg(long, env = "CONDUIT_SWEEP_INTERVAL_MS", default_value_t = 50)]
    sweep_interval_ms: u64,

    /// Advisory in-flight limit.
    #[arg(long, env = "CONDUIT_ADMISSION_LIMIT", default_value_t = 100)]
    admission_limit: u32,

    /// Emit logs as JSON lines.
    #[arg(long, env = "CONDUIT_LOG_JSON")]
    json_logs: bool,
}

// ---------------------------------------------------------------------------
// Simulated collaborators
// ---------------------------------------------------------------------------

/// Hands outbound messages to the simulated backend task.
struct ChannelTransport {
    backend: mpsc::UnboundedSender<MessageContext>,
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send_outbound(&self, msg: MessageContext) -> anyhow::Result<()> {
        self.backend
            .send(msg)
            .map_err(|_| anyhow::anyhow!("backend gone"))
    }

    async fn send_response(&self, msg: MessageContext) -> anyhow::Result<()> {
        debug!(message_id = %msg.message_id, "response to client");
        Ok(())
    }
}

#[derive(Default)]
struct Tally {
    resumed_frames: AtomicU64,
    injected: AtomicU64,
    faults: AtomicU64,
}

/// Mediation that only counts what it is asked to do.
struct CountingMediation {
    tally: Arc<Tally>,
}

#[async_trait]
impl SequenceResumer for CountingMediation {
    async fn resume_at(
        &self,
        msg: &mut MessageContext,
        frame: &ContinuationFrame,
    ) -> anyhow::Result<Flow> {
        debug!(
            message_id = %msg.message_id,
            sequence = %frame.sequence,
            at = %frame.resume_point,
            "resume"
        );
        self.tally.resumed_frames.fetch_add(1, Ordering::Relaxed);
        Ok(Flow::Continue)
    }
}

#[async_trait]
impl MediationEngine for CountingMediation {
    async fn inject(&self, _msg: &mut MessageContext) -> anyhow::Result<bool> {
        self.tally.injected.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    async fn on_fault(
        &self,
        handler: &FaultHandler,
        msg: &mut MessageContext,
        cause: &FaultInfo,
    ) -> anyhow::Result<()> {
        debug!(
            message_id = %msg.message_id,
            handler = handler.name(),
            error_code = cause.code,
            "fault handler"
        );
        self.tally.faults.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Answers outbound calls after a random delay, or not at all.
async fn run_backend(
    engine: Arc<CorrelationEngine>,
    mut rx: mpsc::UnboundedReceiver<MessageContext>,
    response_probability: f64,
    max_latency_ms: u64,
) {
    while let Some(msg) = rx.recv().await {
        let (answer, delay_ms) = {
            let mut rng = rand::rng();
            (
                rng.random_bool(response_probability.clamp(0.0, 1.0)),
                rng.random_range(0..=max_latency_ms),
            )
        };
        if !answer {
            continue;
        }
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            let id = CorrelationId::for_outbound(&msg);
            let reply = InboundResponse::reply(Envelope::new(
                msg.protocol(),
                serde_json::json!({ "echo": msg.envelope.body }),
            ))
            .relating_to(id.as_str());
            engine.on_response_received(&id, reply).await;
        });
    }
}

fn outbound(seq: u32) -> MessageContext {
    let version = if seq % 2 == 0 {
        ProtocolVersion::Soap12
    } else {
        ProtocolVersion::Pox
    };
    let mut msg = MessageContext::new(Envelope::new(version, serde_json::json!({ "seq": seq })))
        .with_to("http://backend.local/service");
    msg.fault_stack.push(FaultHandler::sequence("fault"));
    if seq % 3 == 0 {
        msg.continuation
            .suspend(SequenceRef::Named("main".to_string()), ResumePoint::at(1));
        msg.continuation
            .suspend(SequenceRef::Named("enrich".to_string()), ResumePoint::at(0));
    }
    msg
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);
    let metrics = PrometheusBuilder::new().install_recorder()?;

    let config = EngineConfig {
        node_id: "sim".to_string(),
        sweep_interval_ms: args.sweep_interval_ms,
        admission_limit: args.admission_limit,
        ..EngineConfig::default()
    };

    let (backend_tx, backend_rx) = mpsc::unbounded_channel();
    let tally = Arc::new(Tally::default());
    let engine = Arc::new(
        EngineBuilder::new(
            config,
            Arc::new(ChannelTransport {
                backend: backend_tx,
            }),
            Arc::new(CountingMediation {
                tally: Arc::clone(&tally),
            }),
        )
        .build()?,
    );
    engine.start();

    let backend = tokio::spawn(run_backend(
        Arc::clone(&engine),
        backend_rx,
        args.response_probability,
        args.max_latency_ms,
    ));

    for seq in 0..args.calls {
        engine
            .dispatch_and_register(outbound(seq), TimeoutPolicy::fault_after(args.timeout_ms))
            .await?;
    }
    info!(calls = args.calls, "all calls dispatched");

    // Let every call either answer or expire.
    let settle = args.timeout_ms.max(args.max_latency_ms) + 2 * args.sweep_interval_ms;
    tokio::select! {
        () = tokio::time::sleep(Duration::from_millis(settle)) => {}
        _ = tokio::signal::ctrl_c() => info!("interrupted; stopping early"),
    }
    engine.sweep_now().await;
    engine.stop().await;
    backend.abort();

    let stats = engine.registry().stats();
    info!(
        registered = stats.registered.load(Ordering::Relaxed),
        completed = stats.completed.load(Ordering::Relaxed),
        expired = stats.expired.load(Ordering::Relaxed),
        unregistered = stats.unregistered.load(Ordering::Relaxed),
        in_flight = engine.admission().in_flight(),
        resumed_frames = tally.resumed_frames.load(Ordering::Relaxed),
        injected = tally.injected.load(Ordering::Relaxed),
        faults = tally.faults.load(Ordering::Relaxed),
        "simulation finished"
    );
    println!("{}", metrics.render());
    Ok(())
}
