//! Session-affinity bindings (session id -> endpoint) with absolute expiry.
//!
//! Not part of the timeout contract; the sweeper purges expired bindings on
//! every tick as a side effect.

use dashmap::DashMap;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    endpoint: String,
    expires_at_ms: u64,
}

/// Concurrent map of sticky-session bindings.
#[derive(Debug, Default)]
pub struct SessionAffinityStore {
    bindings: DashMap<String, Binding>,
}

impl SessionAffinityStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `session_id` to `endpoint` until `expires_at_ms`, replacing any
    /// previous binding.
    pub fn bind(
        &self,
        session_id: impl Into<String>,
        endpoint: impl Into<String>,
        expires_at_ms: u64,
    ) {
        self.bindings.insert(
            session_id.into(),
            Binding {
                endpoint: endpoint.into(),
                expires_at_ms,
            },
        );
    }

    /// Endpoint bound to `session_id`, unless the binding expired by `now_ms`.
    #[must_use]
    pub fn lookup(&self, session_id: &str, now_ms: u64) -> Option<String> {
        self.bindings
            .get(session_id)
            .filter(|binding| binding.expires_at_ms > now_ms)
            .map(|binding| binding.endpoint.clone())
    }

    pub fn unbind(&self, session_id: &str) -> Option<String> {
        self.bindings
            .remove(session_id)
            .map(|(_, binding)| binding.endpoint)
    }

    /// Drops every binding whose expiry is at or before `now_ms` and returns
    /// how many were removed.
    pub fn purge_expired(&self, now_ms: u64) -> usize {
        let before = self.bindings.len();
        self.bindings.retain(|_, binding| binding.expires_at_ms > now_ms);
        let purged = before.saturating_sub(self.bindings.len());
        if purged > 0 {
            debug!(purged, "purged expired session bindings");
        }
        purged
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}
