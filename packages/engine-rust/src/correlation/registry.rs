//! Pending-call registry: correlation id -> outstanding outbound call.
//!
//! Two parties race to finish every call: the thread delivering the response
//! and the timeout sweeper. Both go through [`PendingCallRegistry::claim_if_pending`],
//! which removes the entry and flips its completion state in one step, so
//! exactly one of them ever receives the call.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use conduit_core::{CorrelationId, MessageContext};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, error};

use crate::error::CorrelationError;

// ---------------------------------------------------------------------------
// Timeout policy
// ---------------------------------------------------------------------------

/// What happens when a call expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutAction {
    /// Drop the call silently.
    None,
    /// Drop the call and clear its fault handlers without running them.
    Discard,
    /// Route a timeout fault through the message's fault stack.
    Fault,
}

/// Where the call's deadline comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutScope {
    /// A timeout chosen for this call (e.g. by the endpoint definition).
    PerCall { timeout_ms: u64 },
    /// The engine-wide default timeout.
    Global,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeoutPolicy {
    pub action: TimeoutAction,
    pub scope: TimeoutScope,
}

impl TimeoutPolicy {
    /// Fault after `timeout_ms`.
    #[must_use]
    pub fn fault_after(timeout_ms: u64) -> Self {
        Self {
            action: TimeoutAction::Fault,
            scope: TimeoutScope::PerCall { timeout_ms },
        }
    }

    /// Discard after `timeout_ms`.
    #[must_use]
    pub fn discard_after(timeout_ms: u64) -> Self {
        Self {
            action: TimeoutAction::Discard,
            scope: TimeoutScope::PerCall { timeout_ms },
        }
    }

    /// `action` on the engine-wide default deadline.
    #[must_use]
    pub fn global(action: TimeoutAction) -> Self {
        Self {
            action,
            scope: TimeoutScope::Global,
        }
    }

    /// Absolute deadline for a call registered at `now_ms`.
    #[must_use]
    pub fn deadline_from(&self, now_ms: u64, default_timeout_ms: u64) -> u64 {
        let timeout_ms = match self.scope {
            TimeoutScope::PerCall { timeout_ms } => timeout_ms,
            TimeoutScope::Global => default_timeout_ms,
        };
        now_ms.saturating_add(timeout_ms)
    }
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self::global(TimeoutAction::Fault)
    }
}

// ---------------------------------------------------------------------------
// PendingCall
// ---------------------------------------------------------------------------

/// Completion state of a pending call. Moves `Pending -> Marked` once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionState {
    Pending,
    Marked,
}

const PENDING: u8 = 0;
const MARKED: u8 = 1;

/// One outbound request waiting for its response.
///
/// Owns the outbound message snapshot until it is claimed; the claimer gets
/// the whole record by value.
#[derive(Debug)]
pub struct PendingCall {
    correlation_id: CorrelationId,
    outbound: MessageContext,
    policy: TimeoutPolicy,
    registered_at_ms: u64,
    deadline_ms: u64,
    state: AtomicU8,
}

impl PendingCall {
    #[must_use]
    pub fn new(
        correlation_id: CorrelationId,
        outbound: MessageContext,
        policy: TimeoutPolicy,
        registered_at_ms: u64,
        deadline_ms: u64,
    ) -> Self {
        Self {
            correlation_id,
            outbound,
            policy,
            registered_at_ms,
            deadline_ms,
            state: AtomicU8::new(PENDING),
        }
    }

    /// Single compare-and-set from `Pending` to `Marked`. Returns `true` for
    /// the caller that performed the transition.
    pub fn try_mark(&self) -> bool {
        self.state
            .compare_exchange(PENDING, MARKED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[must_use]
    pub fn state(&self) -> CompletionState {
        if self.state.load(Ordering::Acquire) == PENDING {
            CompletionState::Pending
        } else {
            CompletionState::Marked
        }
    }

    #[must_use]
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    #[must_use]
    pub fn outbound(&self) -> &MessageContext {
        &self.outbound
    }

    #[must_use]
    pub fn policy(&self) -> TimeoutPolicy {
        self.policy
    }

    #[must_use]
    pub fn registered_at_ms(&self) -> u64 {
        self.registered_at_ms
    }

    #[must_use]
    pub fn deadline_ms(&self) -> u64 {
        self.deadline_ms
    }

    #[must_use]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.deadline_ms <= now_ms
    }

    /// Hands the outbound message to whoever claimed the call.
    #[must_use]
    pub fn into_outbound(self) -> MessageContext {
        self.outbound
    }
}

/// Returned by registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCallHandle {
    pub correlation_id: CorrelationId,
    pub deadline_ms: u64,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Counters for registry activity.
#[derive(Debug, Default)]
pub struct RegistryStats {
    /// Calls registered.
    pub registered: AtomicU64,
    /// Calls claimed by a response.
    pub completed: AtomicU64,
    /// Calls claimed by the sweeper.
    pub expired: AtomicU64,
    /// Responses that found no pending call.
    pub unregistered: AtomicU64,
}

/// Concurrent map of outstanding calls.
#[derive(Debug, Default)]
pub struct PendingCallRegistry {
    pending: DashMap<CorrelationId, PendingCall>,
    stats: RegistryStats,
}

impl PendingCallRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a new pending call.
    ///
    /// # Errors
    ///
    /// Returns [`CorrelationError::DuplicateCorrelationId`] if the id is
    /// already registered; the existing call is left untouched.
    pub fn register(
        &self,
        correlation_id: CorrelationId,
        outbound: MessageContext,
        policy: TimeoutPolicy,
        registered_at_ms: u64,
        deadline_ms: u64,
    ) -> Result<PendingCallHandle, CorrelationError> {
        match self.pending.entry(correlation_id.clone()) {
            Entry::Occupied(_) => {
                error!(correlation_id = %correlation_id, "duplicate correlation id on register");
                Err(CorrelationError::DuplicateCorrelationId(correlation_id))
            }
            Entry::Vacant(slot) => {
                slot.insert(PendingCall::new(
                    correlation_id.clone(),
                    outbound,
                    policy,
                    registered_at_ms,
                    deadline_ms,
                ));
                self.stats.registered.fetch_add(1, Ordering::Relaxed);
                metrics::gauge!("conduit_pending_calls").increment(1.0);
                debug!(correlation_id = %correlation_id, deadline_ms, "registered pending call");
                Ok(PendingCallHandle {
                    correlation_id,
                    deadline_ms,
                })
            }
        }
    }

    /// Claims the call for the response path.
    ///
    /// Returns `None` if the id is unknown or the sweeper got there first.
    pub fn complete(&self, correlation_id: &CorrelationId) -> Option<PendingCall> {
        let call = self.claim_if_pending(correlation_id);
        match &call {
            Some(_) => self.stats.completed.fetch_add(1, Ordering::Relaxed),
            None => self.stats.unregistered.fetch_add(1, Ordering::Relaxed),
        };
        call
    }

    /// The shared claim primitive: removes the entry iff its completion
    /// state flips from pending to marked. The removal and the flip happen
    /// under the same shard lock, so concurrent claimers cannot both win.
    pub fn claim_if_pending(&self, correlation_id: &CorrelationId) -> Option<PendingCall> {
        let (_, call) = self
            .pending
            .remove_if(correlation_id, |_, call| call.try_mark())?;
        metrics::gauge!("conduit_pending_calls").decrement(1.0);
        Some(call)
    }

    /// Snapshot of ids whose deadline is at or before `now_ms`.
    ///
    /// The snapshot is taken before any removal so the map is never mutated
    /// while shards are read-locked.
    #[must_use]
    pub fn expired_ids(&self, now_ms: u64) -> Vec<CorrelationId> {
        self.pending
            .iter()
            .filter(|entry| entry.value().is_expired(now_ms))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Whether `correlation_id` is still outstanding.
    #[must_use]
    pub fn contains(&self, correlation_id: &CorrelationId) -> bool {
        self.pending.contains_key(correlation_id)
    }

    /// Number of outstanding calls. Observability only.
    #[must_use]
    pub fn size(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn stats(&self) -> &RegistryStats {
        &self.stats
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
