//! Single-fire latch protecting an inbound request from double responses.

use std::sync::atomic::{AtomicBool, Ordering};

/// Created once per inbound request and shared (via `Arc`) with every
/// message derived from it, so whichever path answers first wins.
///
/// State machine: unsent -> sent. There is no way back.
#[derive(Debug)]
pub struct ResponseGuard {
    request_id: String,
    sent: AtomicBool,
}

impl ResponseGuard {
    /// Creates an unsent guard for the inbound request `request_id`.
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            sent: AtomicBool::new(false),
        }
    }

    /// Identifier of the inbound request this guard protects.
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Atomically flips the guard to sent.
    ///
    /// Returns the previous value: `false` means the caller won and must
    /// write the response, `true` means a response already went out and the
    /// caller must not touch the transport.
    #[must_use = "a `true` result means the response must not be sent"]
    pub fn try_mark_sent(&self) -> bool {
        self.sent
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
    }

    #[must_use]
    pub fn is_sent(&self) -> bool {
        self.sent.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    use super::*;

    #[test]
    fn second_mark_reports_already_sent() {
        let guard = ResponseGuard::new("req-1");
        assert!(!guard.try_mark_sent());
        assert!(guard.try_mark_sent());
        assert!(guard.is_sent());
        assert_eq!(guard.request_id(), "req-1");
    }

    #[test]
    fn exactly_one_thread_wins() {
        let guard = Arc::new(ResponseGuard::new("req-race"));
        let winners = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let guard = Arc::clone(&guard);
                let winners = Arc::clone(&winners);
                std::thread::spawn(move || {
                    if !guard.try_mark_sent() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }
}
