//! Connection observer: counts in-flight TCP connections on the monitored
//! ports and waits for them to drain.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use metrics::gauge;
use procnet::{Connection, TcpState};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::SupervisorError;
use crate::metrics::{ACTIVE_CONNECTIONS, DRAIN_DURATION, DRAIN_PHASE_ACTIVE};

const TCP_TABLE: &str = "/proc/net/tcp";
const TCP6_TABLE: &str = "/proc/net/tcp6";

/// Steady-state polling granularity, independent of the check interval.
const STEADY_STATE_TICK: Duration = Duration::from_millis(50);

pub struct ConnectionMonitor {
    ports: HashSet<u16>,
    check_interval: Duration,
    steady_state_wait: Duration,
    tcp_table: PathBuf,
    tcp6_table: PathBuf,
}

impl ConnectionMonitor {
    pub fn new(ports: impl IntoIterator<Item = u16>, check_interval: Duration) -> ConnectionMonitor {
        ConnectionMonitor {
            ports: ports.into_iter().collect(),
            check_interval,
            steady_state_wait: Duration::ZERO,
            tcp_table: PathBuf::from(TCP_TABLE),
            tcp6_table: PathBuf::from(TCP6_TABLE),
        }
    }

    /// Require the count to stay at zero for `wait` before declaring the
    /// drain complete. Zero disables the confirmation phase.
    pub fn with_steady_state_wait(mut self, wait: Duration) -> ConnectionMonitor {
        self.steady_state_wait = wait;
        self
    }

    /// Read from alternate table files instead of `/proc/net`. Tests use
    /// this to stage fixture tables.
    pub fn with_tables(
        mut self,
        tcp_table: impl Into<PathBuf>,
        tcp6_table: impl Into<PathBuf>,
    ) -> ConnectionMonitor {
        self.tcp_table = tcp_table.into();
        self.tcp6_table = tcp6_table.into();
        self
    }

    /// Count connections that are both on a monitored port and in an active
    /// protocol state. Publishes the count to the active-connections gauge.
    pub fn count_active(&self) -> crate::Result<usize> {
        let mut conns = self.read_table(&self.tcp_table)?;
        conns.extend(self.read_table(&self.tcp6_table)?);

        let count = conns
            .iter()
            .filter(|conn| {
                self.ports.contains(&conn.local_port)
                    && conn.state.is_some_and(TcpState::is_active)
            })
            .count();

        gauge!(ACTIVE_CONNECTIONS).set(count as f64);
        debug!(count, "active connections counted");
        Ok(count)
    }

    fn read_table(&self, path: &Path) -> crate::Result<Vec<Connection>> {
        procnet::parse_table(path).map_err(|e| {
            error!(path = %path.display(), error = %e, "cannot read connection table");
            SupervisorError::Io(e)
        })
    }

    /// Block until the active count reaches zero (and, when configured, stays
    /// there for the steady-state wait), or `timeout` elapses.
    ///
    /// The drain-phase gauge is held at 1 for the duration; the elapsed time
    /// is published on return regardless of outcome.
    pub async fn wait_for_zero(&self, timeout: Duration) -> crate::Result<()> {
        let start = Instant::now();
        gauge!(DRAIN_PHASE_ACTIVE).set(1.0);

        let result = self.drain(start + timeout).await;

        gauge!(DRAIN_PHASE_ACTIVE).set(0.0);
        gauge!(DRAIN_DURATION).set(start.elapsed().as_secs_f64());
        result
    }

    async fn drain(&self, deadline: Instant) -> crate::Result<()> {
        info!(
            check_interval = ?self.check_interval,
            steady_state_wait = ?self.steady_state_wait,
            "waiting for connections to drain"
        );

        loop {
            // Poll at the check interval until the count first reaches zero.
            let mut count = self.count_active()?;
            while count > 0 {
                if Instant::now() > deadline {
                    warn!(active = count, "connection drain timeout exceeded");
                    return Err(SupervisorError::DrainTimeout);
                }
                debug!(active = count, "connections still active, continuing to wait");
                tokio::time::sleep(self.check_interval).await;
                count = self.count_active()?;
            }

            if self.steady_state_wait.is_zero() {
                info!("all connections drained");
                return Ok(());
            }

            // Confirmation phase: the count must hold at zero for the full
            // steady-state wait. A rise re-enters the main wait with the
            // original deadline intact.
            info!(wait = ?self.steady_state_wait, "connections at zero, starting steady state wait");
            let steady_deadline = Instant::now() + self.steady_state_wait;
            loop {
                tokio::time::sleep(STEADY_STATE_TICK).await;
                if Instant::now() > deadline {
                    warn!("drain timeout exceeded during steady state wait");
                    return Err(SupervisorError::DrainTimeout);
                }
                let count = self.count_active()?;
                if count > 0 {
                    info!(active = count, "connections rose during steady state wait, resetting");
                    break;
                }
                if Instant::now() > steady_deadline {
                    info!("steady state wait complete, all connections drained");
                    return Ok(());
                }
            }
        }
    }

    /// Background task that keeps the active-connections gauge warm. Never
    /// influences control flow; read failures are already logged.
    pub fn spawn_background_poll(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(self.check_interval).await;
                let _ = self.count_active();
            }
        })
    }
}
