//! Backend lifecycle status and its transition table

use parking_lot::Mutex;
use std::fmt;

/// Lifecycle state of a backend server
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendStatus {
    /// Not running
    Stopped,
    /// Launched, waiting to become ready
    Starting,
    /// Ready to accept traffic
    Running,
    /// Shutting down
    Stopping,
    /// Suspended without terminating
    Paused,
}

impl BackendStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendStatus::Stopped => "stopped",
            BackendStatus::Starting => "starting",
            BackendStatus::Running => "running",
            BackendStatus::Stopping => "stopping",
            BackendStatus::Paused => "paused",
        }
    }
}

impl fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A requested lifecycle transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Stopped -> Starting
    Start,
    /// Starting -> Running
    Ready,
    /// Starting -> Stopped (launch failed)
    Abort,
    /// Starting | Running | Paused -> Stopping
    Stop,
    /// Stopping -> Stopped
    Exited,
    /// Running -> Paused
    Pause,
    /// Paused -> Running
    Unpause,
}

impl Transition {
    /// Target status when applied from `from`, or `None` if not allowed
    pub fn apply(self, from: BackendStatus) -> Option<BackendStatus> {
        use BackendStatus::*;
        match (self, from) {
            (Transition::Start, Stopped) => Some(Starting),
            (Transition::Ready, Starting) => Some(Running),
            (Transition::Abort, Starting) => Some(Stopped),
            (Transition::Stop, Starting | Running | Paused) => Some(Stopping),
            (Transition::Exited, Stopping) => Some(Stopped),
            (Transition::Pause, Running) => Some(Paused),
            (Transition::Unpause, Paused) => Some(Running),
            _ => None,
        }
    }
}

/// Shared, atomically updated backend status.
///
/// Backends drive every change through [`StatusCell::advance`]; a transition that is not
/// allowed from the current state leaves it untouched, which is how the idempotent no-op
/// behaviour of `start`/`stop`/`pause`/`unpause` is expressed.
#[derive(Debug)]
pub struct StatusCell {
    current: Mutex<BackendStatus>,
}

impl StatusCell {
    pub fn new(initial: BackendStatus) -> Self {
        Self {
            current: Mutex::new(initial),
        }
    }

    pub fn get(&self) -> BackendStatus {
        *self.current.lock()
    }

    /// Apply a transition, returning the previous status on success
    pub fn advance(&self, transition: Transition) -> Option<BackendStatus> {
        let mut current = self.current.lock();
        let previous = *current;
        let next = transition.apply(previous)?;
        *current = next;
        Some(previous)
    }

    /// Like [`advance`](Self::advance) but only from one of `allowed`
    pub fn advance_from(
        &self,
        allowed: &[BackendStatus],
        transition: Transition,
    ) -> Option<BackendStatus> {
        let mut current = self.current.lock();
        let previous = *current;
        if !allowed.contains(&previous) {
            return None;
        }
        *current = transition.apply(previous)?;
        Some(previous)
    }

    /// Overwrite the status with an externally observed value (e.g. a container state)
    pub fn observe(&self, status: BackendStatus) {
        *self.current.lock() = status;
    }
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new(BackendStatus::Stopped)
    }
}
