//! Per-message fault handler stack.
//!
//! Handlers are pushed as mediation enters a sequence or endpoint and popped
//! one at a time when an error is signalled. The stack only stores *which*
//! handler to run; running it is the mediation engine's job.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// FaultHandler
// ---------------------------------------------------------------------------

/// Shape of the endpoint group that pushed an endpoint handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndpointTopology {
    /// A single concrete address.
    Address,
    /// Ordered failover group: on failure the next sibling is tried.
    Failover,
    /// Load-balanced group: on failure another member is tried.
    LoadBalance,
}

impl EndpointTopology {
    /// Returns `true` for group topologies that retry through a sibling.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Failover | Self::LoadBalance)
    }
}

/// One compensating action recorded on a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultHandler {
    /// Run the named fault sequence.
    Sequence { name: String },
    /// Run the failure hook of the named endpoint.
    Endpoint {
        name: String,
        topology: EndpointTopology,
    },
}

impl FaultHandler {
    /// Convenience constructor for [`FaultHandler::Sequence`].
    pub fn sequence(name: impl Into<String>) -> Self {
        Self::Sequence { name: name.into() }
    }

    /// Convenience constructor for [`FaultHandler::Endpoint`].
    pub fn endpoint(name: impl Into<String>, topology: EndpointTopology) -> Self {
        Self::Endpoint {
            name: name.into(),
            topology,
        }
    }

    /// Name of the sequence or endpoint this handler refers to.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Sequence { name } | Self::Endpoint { name, .. } => name,
        }
    }
}

// ---------------------------------------------------------------------------
// FaultStack
// ---------------------------------------------------------------------------

/// LIFO of [`FaultHandler`]s owned by a single message.
///
/// Not synchronized: a message is only ever worked on by one thread at a
/// time, and ownership moves with the message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultStack {
    handlers: Vec<FaultHandler>,
}

impl FaultStack {
    /// Creates an empty stack.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes a handler; it will be consulted by the next fault.
    pub fn push(&mut self, handler: FaultHandler) {
        self.handlers.push(handler);
    }

    /// Removes and returns the most recently pushed handler.
    pub fn pop(&mut self) -> Option<FaultHandler> {
        self.handlers.pop()
    }

    /// Returns the handler the next fault would run, without removing it.
    #[must_use]
    pub fn peek(&self) -> Option<&FaultHandler> {
        self.handlers.last()
    }

    /// Drops every remaining handler.
    pub fn clear(&mut self) {
        self.handlers.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
