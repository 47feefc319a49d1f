//! The ordered termination sequence: mark draining, wait for connections to
//! drain, signal the application, await its exit, force-kill on deadline.

use std::sync::Arc;

use metrics::gauge;
use nix::sys::signal::Signal;
use tracing::{error, info, warn};

use crate::child::{ChildExit, ChildHandle};
use crate::config::ShutdownConfig;
use crate::error::SupervisorError;
use crate::metrics::HEALTH_APP;
use crate::monitor::ConnectionMonitor;
use crate::signals::{parse_signal, signal_name};
use crate::state::{Lifecycle, LifecycleState};

/// Drives the termination sequence exactly once per supervisor lifetime.
/// A duplicate invocation is a state-machine no-op: the publisher rejects
/// every transition away from Draining except Terminating.
pub struct Coordinator {
    config: ShutdownConfig,
    lifecycle: Arc<Lifecycle>,
    monitor: Arc<ConnectionMonitor>,
    child: Option<ChildHandle>,
}

impl Coordinator {
    pub fn new(
        config: ShutdownConfig,
        lifecycle: Arc<Lifecycle>,
        monitor: Arc<ConnectionMonitor>,
        child: Option<ChildHandle>,
    ) -> Coordinator {
        Coordinator {
            config,
            lifecycle,
            monitor,
            child,
        }
    }

    /// Run the termination sequence. `trigger` is the signal that initiated
    /// shutdown; it doubles as the signal-to-app when none is configured.
    pub async fn initiate(&self, trigger: i32) -> crate::Result<()> {
        info!(signal = signal_name(trigger), "starting graceful shutdown");

        self.lifecycle.set(LifecycleState::Draining);
        gauge!(HEALTH_APP).set(LifecycleState::Draining.code() as f64);
        info!("health endpoint now reporting draining");

        // Drain failures never halt the sequence; the application still gets
        // its signal and its shutdown window.
        match self.monitor.wait_for_zero(self.config.drain_timeout).await {
            Ok(()) => info!("all connections drained"),
            Err(SupervisorError::DrainTimeout) => warn!("connection drain timeout"),
            Err(e) => warn!(error = %e, "connection drain aborted"),
        }

        let Some(child) = &self.child else {
            info!("no application process to signal");
            return Ok(());
        };

        let signal = self.app_signal(trigger);
        match child.signal(signal) {
            Ok(()) => info!(signal = %signal, pid = child.id(), "sent signal to application"),
            Err(e) => error!(signal = %signal, error = %e, "failed to signal application"),
        }

        match tokio::time::timeout(self.config.shutdown_timeout, child.wait()).await {
            Ok(ChildExit::Exited(status)) => {
                info!(%status, "application exited");
                Ok(())
            }
            Ok(ChildExit::Reaped) => {
                info!("application exit already collected by reaper");
                Ok(())
            }
            Ok(ChildExit::WaitFailed(msg)) => Err(std::io::Error::other(msg).into()),
            Err(_) => {
                if self.config.force_kill_after_timeout {
                    match child.signal(Signal::SIGKILL) {
                        Ok(()) => warn!(pid = child.id(), "sent SIGKILL after shutdown timeout"),
                        Err(e) => error!(error = %e, "failed to SIGKILL application"),
                    }
                }
                Err(SupervisorError::ShutdownTimeout)
            }
        }
    }

    /// Signal to deliver to the application: the configured name when it is
    /// recognized, otherwise the triggering signal, with SIGTERM as the
    /// final fallback.
    fn app_signal(&self, trigger: i32) -> Signal {
        let raw = parse_signal(&self.config.signal_to_app).unwrap_or(trigger);
        Signal::try_from(raw).unwrap_or(Signal::SIGTERM)
    }
}
