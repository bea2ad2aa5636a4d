//! Run states for a community manager.
//!
//! A manager has two controllable subsystems (`queue` and `events`) and a
//! derived `manager` state. The manager state is `Running` exactly when both
//! subsystems are; otherwise it mirrors the least-running subsystem.
//!
//! Every state carries a [`CausedBy`] tag. Automatic recovery (heartbeat,
//! nanny) only ever restarts work that the system stopped.

use serde::{Deserialize, Serialize};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RunStatus {
    Running,
    Paused,
    Stopped,
}

impl RunStatus {
    /// Ordering used to pick the "least running" status.
    fn severity(self) -> u8 {
        match self {
            RunStatus::Running => 0,
            RunStatus::Paused => 1,
            RunStatus::Stopped => 2,
        }
    }
}

/// Who initiated a state change.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CausedBy {
    System,
    User,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub status: RunStatus,
    pub caused_by: CausedBy,
    pub reason: Option<String>,
}

impl RunState {
    pub fn new(status: RunStatus, caused_by: CausedBy, reason: Option<String>) -> Self {
        Self {
            status,
            caused_by,
            reason,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == RunStatus::Running
    }

    /// Not running and safe for automatic recovery to restart.
    pub fn is_system_halted(&self) -> bool {
        !self.is_running() && self.caused_by == CausedBy::System
    }

    /// Halted with the given status by the system.
    pub fn is_system(&self, status: RunStatus) -> bool {
        self.status == status && self.caused_by == CausedBy::System
    }
}

/// Controllable subsystem of a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Subsystem {
    Queue,
    Events,
}

/// The three run states of one manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStates {
    pub queue: RunState,
    pub events: RunState,
    pub manager: RunState,
}

impl Default for RunStates {
    fn default() -> Self {
        let stopped = RunState::new(RunStatus::Stopped, CausedBy::System, None);
        Self {
            queue: stopped.clone(),
            events: stopped.clone(),
            manager: stopped,
        }
    }
}

impl RunStates {
    pub fn get(&self, subsystem: Subsystem) -> &RunState {
        match subsystem {
            Subsystem::Queue => &self.queue,
            Subsystem::Events => &self.events,
        }
    }

    /// Update one subsystem and re-derive the manager state.
    ///
    /// Returns the new manager state when it changed.
    pub fn set(&mut self, subsystem: Subsystem, state: RunState) -> Option<RunState> {
        match subsystem {
            Subsystem::Queue => self.queue = state,
            Subsystem::Events => self.events = state,
        }

        let derived = derive_manager_state(&self.queue, &self.events);
        if derived.status != self.manager.status || derived.caused_by != self.manager.caused_by {
            self.manager = derived.clone();
            Some(derived)
        } else {
            None
        }
    }
}

fn derive_manager_state(queue: &RunState, events: &RunState) -> RunState {
    if queue.is_running() && events.is_running() {
        let caused_by = match (queue.caused_by, events.caused_by) {
            (CausedBy::System, CausedBy::System) => CausedBy::System,
            (CausedBy::User, _) | (_, CausedBy::User) => CausedBy::User,
        };
        return RunState::new(RunStatus::Running, caused_by, None);
    }

    let status = if queue.status.severity() >= events.status.severity() {
        queue.status
    } else {
        events.status
    };

    // the subsystems sharing the worst status decide who caused it
    let culprits: Vec<&RunState> = [queue, events]
        .into_iter()
        .filter(|s| s.status == status)
        .collect();
    let caused_by = if culprits.iter().any(|s| s.caused_by == CausedBy::User) {
        CausedBy::User
    } else {
        CausedBy::System
    };
    let reason = culprits.iter().find_map(|s| s.reason.clone());

    RunState::new(status, caused_by, reason)
}
