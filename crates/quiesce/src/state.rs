//! The lifecycle state machine shared between the health endpoint and the
//! shutdown coordinator.

use std::fmt;
use std::sync::RwLock;

use metrics::gauge;
use tracing::debug;

use crate::metrics::STATE;

/// Lifecycle phase of the supervised application, as reported to probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Starting,
    Healthy,
    Unhealthy,
    Draining,
    Terminating,
}

impl LifecycleState {
    /// Numeric encoding used by the state gauge.
    pub fn code(self) -> u8 {
        match self {
            LifecycleState::Starting => 0,
            LifecycleState::Healthy => 1,
            LifecycleState::Unhealthy => 2,
            LifecycleState::Draining => 3,
            LifecycleState::Terminating => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<LifecycleState> {
        match code {
            0 => Some(LifecycleState::Starting),
            1 => Some(LifecycleState::Healthy),
            2 => Some(LifecycleState::Unhealthy),
            3 => Some(LifecycleState::Draining),
            4 => Some(LifecycleState::Terminating),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Starting => "starting",
            LifecycleState::Healthy => "healthy",
            LifecycleState::Unhealthy => "unhealthy",
            LifecycleState::Draining => "draining",
            LifecycleState::Terminating => "terminating",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Single authoritative lifecycle state behind a readers-writer guard.
///
/// The writer holds the guard across both the legality check and the commit,
/// so no reader can observe a state newer than Draining before the
/// coordinator publishes Draining.
pub struct Lifecycle {
    current: RwLock<LifecycleState>,
}

impl Lifecycle {
    pub fn new() -> Lifecycle {
        gauge!(STATE).set(LifecycleState::Starting.code() as f64);
        Lifecycle {
            current: RwLock::new(LifecycleState::Starting),
        }
    }

    /// Request a transition. Illegal transitions are logged and dropped:
    /// Terminating accepts nothing, Draining accepts only Terminating.
    /// Shutdown paths are allowed to request illegal transitions (a late
    /// health tick trying to recover, say) and must be tolerated.
    pub fn set(&self, target: LifecycleState) {
        let mut current = self.current.write().expect("lifecycle lock poisoned");
        debug!(from = %*current, to = %target, "state transition requested");

        if *current == LifecycleState::Terminating {
            debug!("blocked: no transition leaves terminating");
            return;
        }
        if *current == LifecycleState::Draining && target != LifecycleState::Terminating {
            debug!("blocked: draining only advances to terminating");
            return;
        }

        *current = target;
        gauge!(STATE).set(target.code() as f64);
        debug!(state = %target, "state transition applied");
    }

    /// The most recently committed state.
    pub fn get(&self) -> LifecycleState {
        *self.current.read().expect("lifecycle lock poisoned")
    }
}

impl Default for Lifecycle {
    fn default() -> Lifecycle {
        Lifecycle::new()
    }
}
