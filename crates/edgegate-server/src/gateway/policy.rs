//! Connection accounting for the gateway.
//!
//! Two counters are kept: live sessions (bounded by `max_sessions`) and open
//! outbound connections. Both are tracked with RAII guards so a counter drops
//! back exactly when the owning task releases its resources.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Runtime tracker with atomic session and outbound-connection counts.
#[derive(Debug)]
pub struct ConnectionTracker {
    /// Maximum number of concurrent sessions.
    max_sessions: usize,
    active_sessions: Arc<AtomicUsize>,
    open_connections: Arc<AtomicUsize>,
}

impl ConnectionTracker {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            max_sessions,
            active_sessions: Arc::new(AtomicUsize::new(0)),
            open_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Reserve a session slot, or `Err` with the reason when the limit is reached.
    ///
    /// The slot is held until the returned guard is dropped.
    pub fn try_admit(&self) -> Result<ConnectionGuard, String> {
        let admitted = self
            .active_sessions
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < self.max_sessions).then_some(current + 1)
            });
        match admitted {
            Ok(_) => Ok(ConnectionGuard {
                counter: self.active_sessions.clone(),
            }),
            Err(current) => Err(format!(
                "session limit reached ({}/{})",
                current, self.max_sessions
            )),
        }
    }

    /// Count one open outbound connection until the guard is dropped.
    pub fn acquire_outbound(&self) -> ConnectionGuard {
        self.open_connections.fetch_add(1, Ordering::AcqRel);
        ConnectionGuard {
            counter: self.open_connections.clone(),
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::Acquire)
    }

    pub fn open_connections(&self) -> usize {
        self.open_connections.load(Ordering::Acquire)
    }
}

/// RAII guard that decrements its counter on drop.
/// Owns an `Arc<AtomicUsize>` so it is `Send` and can be moved into spawned tasks.
#[derive(Debug)]
pub struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}
