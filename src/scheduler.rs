//! Live connection tracking and the delayed idle pause/stop
//!
//! The connection counter and the pending stop handle live under one mutex, so opening a
//! connection (which cancels the pending stop) and closing the last one (which schedules a
//! new stop) can never interleave.

use crate::backend::Backend;
use crate::config::Strategy;
use crate::status::BackendStatus;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A scheduled idle action that has not fired yet
struct PendingStop {
    generation: u64,
    token: CancellationToken,
    _handle: JoinHandle<()>,
}

#[derive(Default)]
struct SchedulerState {
    live: usize,
    pending: Option<PendingStop>,
    generation: u64,
}

impl SchedulerState {
    /// Cancel the pending stop, if any.
    ///
    /// Cancelling never fails: a task that already fired removed itself from the slot, and
    /// cancelling a token twice is a no-op. A task whose sleep already elapsed and whose
    /// action is running is not interrupted.
    fn cancel_pending(&mut self) -> bool {
        match self.pending.take() {
            Some(pending) => {
                pending.token.cancel();
                true
            }
            None => false,
        }
    }
}

/// Counts proxied connections and pauses or stops the backend once they stay at zero
pub struct IdleScheduler<B: Backend> {
    backend: Arc<B>,
    strategy: Strategy,
    idle_shutdown: Duration,
    state: Arc<Mutex<SchedulerState>>,
}

impl<B: Backend> IdleScheduler<B> {
    pub fn new(backend: Arc<B>, strategy: Strategy, idle_shutdown: Duration) -> Arc<Self> {
        Arc::new(Self {
            backend,
            strategy,
            idle_shutdown,
            state: Arc::new(Mutex::new(SchedulerState::default())),
        })
    }

    pub fn live_connections(&self) -> usize {
        self.state.lock().live
    }

    pub fn has_pending_stop(&self) -> bool {
        self.state.lock().pending.is_some()
    }

    /// Register a new proxied connection, cancelling any pending stop.
    ///
    /// The returned guard unregisters the connection when dropped.
    pub fn connection_opened(self: &Arc<Self>) -> ConnectionGuard<B> {
        let live = {
            let mut state = self.state.lock();
            if state.cancel_pending() {
                debug!("Cancelled pending idle {}", self.strategy.action());
            }
            state.live += 1;
            state.live
        };
        info!(live_connections = live, "New connection");

        ConnectionGuard {
            scheduler: Arc::clone(self),
        }
    }

    /// Unregister a proxied connection, scheduling the idle action at zero
    pub fn connection_closed(&self) {
        let mut state = self.state.lock();
        state.live = match state.live.checked_sub(1) {
            Some(live) => live,
            None => {
                warn!("Connection closed with no live connections recorded");
                0
            }
        };
        info!(live_connections = state.live, "Lost connection");

        if state.live == 0 {
            self.schedule_locked(&mut state);
        }
    }

    /// Schedule the idle action, replacing any pending one.
    ///
    /// Does nothing unless the backend is running with no live connections.
    pub fn schedule_stop(&self) {
        let mut state = self.state.lock();
        self.schedule_locked(&mut state);
    }

    /// Cancel the pending idle action. Safe to call when none is pending.
    pub fn cancel_stop(&self) {
        if self.state.lock().cancel_pending() {
            debug!("Cancelled pending idle {}", self.strategy.action());
        }
    }

    fn schedule_locked(&self, state: &mut SchedulerState) {
        if state.live > 0 {
            debug!(live_connections = state.live, "Clients connected, nothing to schedule");
            return;
        }
        let status = self.backend.status();
        if status != BackendStatus::Running {
            debug!(%status, "Backend not running, nothing to schedule");
            return;
        }

        state.cancel_pending();
        state.generation += 1;
        let generation = state.generation;

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let backend = Arc::clone(&self.backend);
        let slot = Arc::clone(&self.state);
        let strategy = self.strategy;
        let idle = self.idle_shutdown;

        debug!(
            idle_secs = idle.as_secs_f64(),
            action = strategy.action(),
            "Scheduling idle backend {}",
            strategy.action()
        );

        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancelled.cancelled() => return,
                _ = tokio::time::sleep(idle) => {}
            }

            // Leave the slot under the lock: a connection that got there first wins,
            // anything arriving later races with the action below.
            {
                let mut state = slot.lock();
                if cancelled.is_cancelled() {
                    return;
                }
                if state.pending.as_ref().map(|p| p.generation) == Some(generation) {
                    state.pending = None;
                }
            }

            info!(
                idle_secs = idle.as_secs_f64(),
                "No clients connected, {} backend",
                strategy.action_progressive()
            );
            let result = match strategy {
                Strategy::Pause => backend.pause().await,
                Strategy::Stop => backend.stop().await,
            };
            if let Err(e) = result {
                warn!(error = %e, "Idle {} failed", strategy.action());
            }
        });

        state.pending = Some(PendingStop {
            generation,
            token,
            _handle: handle,
        });
    }
}

/// Keeps one proxied connection counted while alive
pub struct ConnectionGuard<B: Backend> {
    scheduler: Arc<IdleScheduler<B>>,
}

impl<B: Backend> Drop for ConnectionGuard<B> {
    fn drop(&mut self) {
        self.scheduler.connection_closed();
    }
}
