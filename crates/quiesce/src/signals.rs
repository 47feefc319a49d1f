//! Signal routing: classify every delivered signal into one of four actions
//! and forward or consume it accordingly.

use std::collections::HashSet;

use metrics::counter;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use signal_hook::consts::signal::{
    SIGCHLD, SIGHUP, SIGINT, SIGQUIT, SIGTERM, SIGUSR1, SIGUSR2, SIGWINCH,
};
use tracing::{debug, error, info, warn};

use crate::child::ChildHandle;
use crate::config::SignalConfig;
use crate::metrics::{SIGNALS_FORWARDED, SIGNALS_RECEIVED};

/// What the supervisor should do with a delivered signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// Not configured; log and move on.
    Ignore,
    /// Forwarded verbatim to the application.
    PassThrough,
    /// Run the termination sequence.
    Shutdown,
    /// A descendant exited; harvest zombies.
    ReapZombies,
}

/// Closed vocabulary of signal names accepted in configuration. Unknown
/// names yield `None`.
pub fn parse_signal(name: &str) -> Option<i32> {
    match name {
        "SIGHUP" => Some(SIGHUP),
        "SIGINT" => Some(SIGINT),
        "SIGTERM" => Some(SIGTERM),
        "SIGUSR1" => Some(SIGUSR1),
        "SIGUSR2" => Some(SIGUSR2),
        "SIGWINCH" => Some(SIGWINCH),
        "SIGQUIT" => Some(SIGQUIT),
        _ => None,
    }
}

/// Display name for a raw signal number, for logs and metric labels.
pub fn signal_name(sig: i32) -> &'static str {
    match sig {
        SIGHUP => "SIGHUP",
        SIGINT => "SIGINT",
        SIGTERM => "SIGTERM",
        SIGUSR1 => "SIGUSR1",
        SIGUSR2 => "SIGUSR2",
        SIGWINCH => "SIGWINCH",
        SIGQUIT => "SIGQUIT",
        SIGCHLD => "SIGCHLD",
        _ => "UNKNOWN",
    }
}

/// Classifies delivered signals against the configured pass-through and
/// shutdown sets and forwards pass-through signals to the application.
pub struct SignalRouter {
    pass_through: HashSet<i32>,
    shutdown: HashSet<i32>,
    child: ChildHandle,
}

impl SignalRouter {
    /// Unparseable names are silently omitted here; configuration validation
    /// has already rejected them at startup.
    pub fn new(config: &SignalConfig, child: ChildHandle) -> SignalRouter {
        let pass_through = config
            .pass_through
            .iter()
            .filter_map(|name| parse_signal(name))
            .collect();
        let shutdown = config
            .shutdown
            .iter()
            .filter_map(|name| parse_signal(name))
            .collect();
        SignalRouter {
            pass_through,
            shutdown,
            child,
        }
    }

    /// Every signal the supervisor should register for: both configured sets
    /// plus the implicit SIGCHLD.
    pub fn signals_of_interest(&self) -> Vec<i32> {
        let mut signals: Vec<i32> = self
            .pass_through
            .iter()
            .chain(self.shutdown.iter())
            .copied()
            .collect();
        signals.push(SIGCHLD);
        signals
    }

    /// Classify a delivered signal, forwarding it when it is pass-through.
    /// Every delivery increments the received counter for its name.
    pub fn classify(&self, sig: i32) -> SignalAction {
        counter!(SIGNALS_RECEIVED, "signal" => signal_name(sig)).increment(1);

        if self.shutdown.contains(&sig) {
            return SignalAction::Shutdown;
        }
        if self.pass_through.contains(&sig) {
            self.forward(sig);
            return SignalAction::PassThrough;
        }
        if sig == SIGCHLD {
            return SignalAction::ReapZombies;
        }

        warn!(signal = signal_name(sig), "received unexpected signal");
        SignalAction::Ignore
    }

    fn forward(&self, sig: i32) {
        match nix::sys::signal::Signal::try_from(sig) {
            Ok(signal) => match self.child.signal(signal) {
                Ok(()) => {
                    counter!(SIGNALS_FORWARDED, "signal" => signal_name(sig)).increment(1);
                    info!(signal = signal_name(sig), pid = self.child.id(), "forwarded signal to application");
                }
                Err(e) => {
                    error!(signal = signal_name(sig), error = %e, "failed to forward signal to application");
                }
            },
            Err(e) => {
                error!(signal = sig, error = %e, "unrepresentable signal number");
            }
        }
    }
}

/// Harvest every exited descendant without blocking until none remain.
///
/// The primary child's exit status is safe to collect here: its dedicated
/// waiter treats a stolen status (ECHILD) as a clean exit.
pub fn reap_zombies() {
    loop {
        match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(status) => {
                debug!(pid = ?status.pid(), "reaped zombie process");
            }
            // ECHILD: nothing left to reap.
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vocabulary_parses() {
        for name in [
            "SIGHUP", "SIGINT", "SIGTERM", "SIGUSR1", "SIGUSR2", "SIGWINCH", "SIGQUIT",
        ] {
            let sig = parse_signal(name).unwrap();
            assert_eq!(signal_name(sig), name);
        }
    }

    #[test]
    fn unknown_names_yield_none() {
        assert_eq!(parse_signal("SIGKILL"), None);
        assert_eq!(parse_signal("SIGCHLD"), None);
        assert_eq!(parse_signal("sigterm"), None);
        assert_eq!(parse_signal(""), None);
    }
}
