use crate::error::Result;
use log::debug;
use std::sync::{Condvar, Mutex, PoisonError};

/// Server lifecycle: Stopped -> Starting -> Running -> Stopping -> Stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Guards state transitions and runs entry/exit actions under the guard,
/// so a concurrent `stop` waits for a `start` in progress.
pub struct Lifecycle {
    name: String,
    state: Mutex<ServerState>,
    changed: Condvar,
}

impl Lifecycle {
    pub fn new(name: impl Into<String>) -> Self {
        Lifecycle {
            name: name.into(),
            state: Mutex::new(ServerState::Stopped),
            changed: Condvar::new(),
        }
    }

    pub fn state(&self) -> ServerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.state() == ServerState::Running
    }

    /// Runs `entry` if stopped. Returns `Ok(false)` when already started.
    /// A failing entry action leaves the server stopped.
    pub fn start<F>(&self, entry: F) -> Result<bool>
    where
        F: FnOnce() -> Result<()>,
    {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != ServerState::Stopped {
            return Ok(false);
        }
        *state = ServerState::Starting;
        debug!("{} starting", self.name);
        let outcome = entry();
        *state = if outcome.is_ok() { ServerState::Running } else { ServerState::Stopped };
        self.changed.notify_all();
        outcome.map(|_| true)
    }

    /// Runs `exit` if running. Returns `false` when not running.
    pub fn stop<F>(&self, exit: F) -> bool
    where
        F: FnOnce(),
    {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != ServerState::Running {
            return false;
        }
        *state = ServerState::Stopping;
        debug!("{} stopping", self.name);
        exit();
        *state = ServerState::Stopped;
        self.changed.notify_all();
        true
    }

    /// Blocks until the server reaches `target`.
    pub fn wait_for(&self, target: ServerState) {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let _state = self
            .changed
            .wait_while(state, |s| *s != target)
            .unwrap_or_else(PoisonError::into_inner);
    }
}
