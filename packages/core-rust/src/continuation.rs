//! Suspension points of a mediation flow and the resume algorithm.
//!
//! When a mediation unit issues an outbound call it records where it stopped
//! with [`ContinuationStack::suspend`]. When the reply arrives, [`resume`]
//! unwinds the recorded frames innermost-first. Frames are added only by
//! suspension and removed only by [`resume`]; there is no other way to pop a
//! frame, which keeps resumption order a mirror of suspension order.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::message::MessageContext;

// ---------------------------------------------------------------------------
// Frame types
// ---------------------------------------------------------------------------

/// Position of a mediator inside a (possibly nested) sequence, outermost
/// index first. `[2, 0]` is the first child of the third mediator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResumePoint(Vec<usize>);

impl ResumePoint {
    #[must_use]
    pub fn new(path: Vec<usize>) -> Self {
        Self(path)
    }

    /// Point at the top-level mediator `index`.
    #[must_use]
    pub fn at(index: usize) -> Self {
        Self(vec![index])
    }

    /// Descends into child `index` of the current position.
    #[must_use]
    pub fn child(&self, index: usize) -> Self {
        let mut path = self.0.clone();
        path.push(index);
        Self(path)
    }

    #[must_use]
    pub fn path(&self) -> &[usize] {
        &self.0
    }
}

impl fmt::Display for ResumePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        write!(f, "[{}]", parts.join("."))
    }
}

/// The mediation unit a frame belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SequenceRef {
    /// A named, reusable sequence.
    Named(String),
    /// Inline in-sequence of a proxy service.
    ProxyIn { proxy: String },
    /// Inline out-sequence of a proxy service.
    ProxyOut { proxy: String },
    /// Inline sequence of an API resource.
    ApiResource { api: String, resource: String },
}

impl fmt::Display for SequenceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named(name) => write!(f, "sequence:{name}"),
            Self::ProxyIn { proxy } => write!(f, "proxy:{proxy}:in"),
            Self::ProxyOut { proxy } => write!(f, "proxy:{proxy}:out"),
            Self::ApiResource { api, resource } => write!(f, "api:{api}:{resource}"),
        }
    }
}

/// One suspension: where to pick up, and in which unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuationFrame {
    pub sequence: SequenceRef,
    pub resume_point: ResumePoint,
}

/// Decision returned by a resumed mediation unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep unwinding outer frames.
    Continue,
    /// The unit short-circuited; leave outer frames for a later resume.
    Halt,
}

// ---------------------------------------------------------------------------
// ContinuationStack
// ---------------------------------------------------------------------------

/// Ordered suspension frames of one message, innermost on top.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuationStack {
    frames: Vec<ContinuationFrame>,
}

impl ContinuationStack {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `sequence` stopped at `resume_point` to wait for an
    /// outbound call.
    pub fn suspend(&mut self, sequence: SequenceRef, resume_point: ResumePoint) {
        self.frames.push(ContinuationFrame {
            sequence,
            resume_point,
        });
    }

    /// The frame the next resume would run.
    #[must_use]
    pub fn peek(&self) -> Option<&ContinuationFrame> {
        self.frames.last()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    fn pop(&mut self) -> Option<ContinuationFrame> {
        self.frames.pop()
    }
}

// ---------------------------------------------------------------------------
// Resume
// ---------------------------------------------------------------------------

/// Runs a mediation unit from a saved frame. Implemented by the mediation
/// engine, which owns sequence lookup and mediator execution.
#[async_trait]
pub trait SequenceResumer: Send + Sync {
    /// Continue `frame.sequence` after `frame.resume_point`.
    async fn resume_at(
        &self,
        msg: &mut MessageContext,
        frame: &ContinuationFrame,
    ) -> anyhow::Result<Flow>;
}

/// Unwinds `msg`'s continuation stack one frame at a time.
///
/// Keeps going while each resumed unit answers [`Flow::Continue`] and frames
/// remain. Returns `Ok(true)` once the stack is drained, `Ok(false)` if a
/// unit halted (the remaining frames stay for a later resume). A frame is
/// consumed even when its unit fails.
///
/// # Errors
///
/// Propagates the first error returned by the resumer.
pub async fn resume<R>(msg: &mut MessageContext, resumer: &R) -> anyhow::Result<bool>
where
    R: SequenceResumer + ?Sized,
{
    while let Some(frame) = msg.continuation.pop() {
        tracing::debug!(
            message_id = %msg.message_id,
            sequence = %frame.sequence,
            resume_point = %frame.resume_point,
            remaining = msg.continuation.len(),
            "resuming continuation"
        );
        if resumer.resume_at(msg, &frame).await? == Flow::Halt {
            return Ok(false);
        }
    }
    Ok(true)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
