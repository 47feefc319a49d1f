//! Spawning and observing the supervised application process.

use std::process::{ExitStatus, Stdio};

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::debug;

use crate::error::SupervisorError;

/// How the application process ended.
#[derive(Debug, Clone)]
pub enum ChildExit {
    /// The waiter observed the exit status directly.
    Exited(ExitStatus),
    /// Another reaper collected the status first (ECHILD from the waiter).
    Reaped,
    /// The wait itself failed for a reason other than ECHILD.
    WaitFailed(String),
}

/// Shared read-only handle to the spawned application: its pid plus a
/// one-shot carrying the exit outcome, set by a dedicated waiter task.
///
/// The waiter owns the `tokio::process::Child`; everyone else signals by pid
/// and awaits the outcome through the handle, so a zombie-reaping race can
/// never leave the coordinator blocked on a stolen status.
#[derive(Clone)]
pub struct ChildHandle {
    pid: Pid,
    exit: watch::Receiver<Option<ChildExit>>,
}

impl ChildHandle {
    /// Spawn `command` with inherited stdio, in its own process group
    /// (`setpgid`, so pgid == pid), and start the waiter task.
    pub fn spawn(command: &[String]) -> crate::Result<ChildHandle> {
        let (program, args) = command
            .split_first()
            .ok_or(SupervisorError::EmptyCommand)?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .process_group(0)
            .spawn()
            .map_err(SupervisorError::Spawn)?;

        let pid = child
            .id()
            .and_then(|id| i32::try_from(id).ok())
            .map(Pid::from_raw)
            .ok_or_else(|| {
                SupervisorError::Spawn(std::io::Error::other("spawned child has no pid"))
            })?;

        let (tx, rx) = watch::channel(None);
        tokio::spawn(async move {
            let outcome = match child.wait().await {
                Ok(status) => ChildExit::Exited(status),
                Err(e) if e.raw_os_error() == Some(libc::ECHILD) => ChildExit::Reaped,
                Err(e) => ChildExit::WaitFailed(e.to_string()),
            };
            debug!(?outcome, "application waiter finished");
            let _ = tx.send(Some(outcome));
        });

        Ok(ChildHandle { pid, exit: rx })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Raw pid for logging.
    pub fn id(&self) -> i32 {
        self.pid.as_raw()
    }

    /// Deliver `signal` to the application (the pid, not the whole group).
    pub fn signal(&self, signal: Signal) -> nix::Result<()> {
        nix::sys::signal::kill(self.pid, signal)
    }

    /// Wait until the application's exit has been observed.
    pub async fn wait(&self) -> ChildExit {
        let mut rx = self.exit.clone();
        match rx.wait_for(|outcome| outcome.is_some()).await {
            Ok(outcome) => (*outcome)
                .clone()
                .unwrap_or(ChildExit::WaitFailed("empty exit outcome".into())),
            // The waiter task can only be gone after sending an outcome or on
            // runtime teardown.
            Err(_) => ChildExit::WaitFailed("application waiter dropped".into()),
        }
    }
}
