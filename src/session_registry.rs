//! SessionRegistry - Active verification session accounting
//!
//! ## Responsibilities
//!
//! - Count sessions that have not reached a terminal state
//! - Hand out session ids unique within the process
//! - Deregister through an RAII guard (no leak on early return or panic)
//! - Let shutdown wait for zero active sessions with a heartbeat log

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Shortest shutdown heartbeat period
pub const MIN_HEARTBEAT: Duration = Duration::from_millis(100);

/// Session Registry
#[derive(Default)]
pub struct SessionRegistry {
    active: AtomicUsize,
    total_started: AtomicU64,
    idle: Notify,
    /// Last base id handed out and how often
    last_id: Mutex<(String, u32)>,
}

impl SessionRegistry {
    /// Create new SessionRegistry
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a session; it stays active until the guard drops
    ///
    /// `base_id` repeated back to back (same start second) gets `_2`, `_3`, ...
    /// so the returned guard's id is final.
    pub fn register(self: &Arc<Self>, base_id: impl Into<String>) -> SessionGuard {
        let session_id = self.unique_id(base_id.into());
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.total_started.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(session_id = %session_id, active_sessions = active, "Session registered");

        SessionGuard {
            registry: Arc::clone(self),
            session_id,
        }
    }

    fn unique_id(&self, base_id: String) -> String {
        let mut last = match self.last_id.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if last.0 == base_id {
            last.1 += 1;
            format!("{}_{}", base_id, last.1)
        } else {
            *last = (base_id.clone(), 1);
            base_id
        }
    }

    fn deregister(&self, session_id: &str) {
        let remaining = self.active.fetch_sub(1, Ordering::SeqCst) - 1;

        tracing::debug!(
            session_id = %session_id,
            active_sessions = remaining,
            "Session deregistered"
        );

        if remaining == 0 {
            self.idle.notify_waiters();
        }
    }

    /// Sessions not yet in a terminal state
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Sessions registered since start
    pub fn total_started(&self) -> u64 {
        self.total_started.load(Ordering::Relaxed)
    }

    /// Resolve once no session is active, logging a heartbeat meanwhile
    pub async fn wait_idle(&self, heartbeat: Duration) {
        let mut ticker = tokio::time::interval(heartbeat.max(MIN_HEARTBEAT));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let active = self.active_count();
            if active == 0 {
                return;
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = ticker.tick() => {
                    tracing::info!(
                        active_sessions = self.active_count(),
                        "Waiting for verification sessions to finish"
                    );
                }
            }
        }
    }
}

/// Keeps one session registered while alive
pub struct SessionGuard {
    registry: Arc<SessionRegistry>,
    session_id: String,
}

impl SessionGuard {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.deregister(&self.session_id);
    }
}
