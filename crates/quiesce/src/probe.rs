//! Application health probes.
//!
//! A probe answers one question: is the application itself healthy right now?
//! The HTTP variant asks an endpoint the application exposes; the command
//! variant runs a caller-supplied check program.

use std::process::Stdio;
use std::time::Duration;

use metrics::gauge;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::metrics::HEALTH_APP;

/// Probe over HTTP: any 2xx response within the per-attempt timeout counts
/// as healthy.
pub struct HttpProbe {
    url: String,
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> HttpProbe {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        HttpProbe {
            url: url.into(),
            client,
        }
    }

    pub async fn check(&self) -> bool {
        if self.url.is_empty() {
            warn!("application health URL is empty");
            gauge!(HEALTH_APP).set(0.0);
            return false;
        }

        let healthy = match self.client.get(&self.url).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!(url = %self.url, status = %resp.status(), "application probe succeeded");
                true
            }
            Ok(resp) => {
                warn!(url = %self.url, status = %resp.status(), "application probe failed");
                false
            }
            Err(e) => {
                warn!(url = %self.url, error = %e, "application probe request failed");
                false
            }
        };

        gauge!(HEALTH_APP).set(if healthy { 1.0 } else { 0.0 });
        healthy
    }
}

/// Outcome of a command probe run, including the raw exit code for callers
/// that report details. `exit_code` is −1 when no process ran to completion.
#[derive(Debug)]
pub struct CommandCheck {
    pub healthy: bool,
    pub exit_code: i32,
    pub error: Option<String>,
}

/// Probe via a check command: exit code 0 within the timeout is healthy.
pub struct CommandProbe {
    command: Vec<String>,
    timeout: Duration,
}

impl CommandProbe {
    pub fn new(command: Vec<String>, timeout: Duration) -> CommandProbe {
        CommandProbe { command, timeout }
    }

    pub async fn check(&self) -> bool {
        let outcome = self.check_with_details().await;
        gauge!(HEALTH_APP).set(if outcome.healthy { 1.0 } else { 0.0 });
        outcome.healthy
    }

    pub async fn check_with_details(&self) -> CommandCheck {
        let Some((program, args)) = self.command.split_first() else {
            warn!("health check command is empty");
            return CommandCheck {
                healthy: false,
                exit_code: -1,
                error: Some("no command configured".into()),
            };
        };

        let mut child = match Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                warn!(command = %program, error = %e, "health check command failed to spawn");
                return CommandCheck {
                    healthy: false,
                    exit_code: -1,
                    error: Some(e.to_string()),
                };
            }
        };

        match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) => {
                let exit_code = status.code().unwrap_or(-1);
                if status.success() {
                    debug!(command = %program, "health check command succeeded");
                    CommandCheck {
                        healthy: true,
                        exit_code,
                        error: None,
                    }
                } else {
                    warn!(command = %program, exit_code, "health check command failed");
                    CommandCheck {
                        healthy: false,
                        exit_code,
                        error: Some(format!("exit code {exit_code}")),
                    }
                }
            }
            Ok(Err(e)) => CommandCheck {
                healthy: false,
                exit_code: -1,
                error: Some(e.to_string()),
            },
            Err(_) => {
                let _ = child.kill().await;
                warn!(command = %program, timeout = ?self.timeout, "health check command timed out");
                CommandCheck {
                    healthy: false,
                    exit_code: -1,
                    error: Some("health check command timed out".into()),
                }
            }
        }
    }
}

/// The configured application probe, if any.
pub enum AppProbe {
    Http(HttpProbe),
    Command(CommandProbe),
}

impl AppProbe {
    pub async fn check(&self) -> bool {
        match self {
            AppProbe::Http(probe) => probe.check().await,
            AppProbe::Command(probe) => probe.check().await,
        }
    }

    /// Poll `check` on `interval` until it succeeds or `startup_timeout`
    /// elapses. Returns whether the application became healthy in time.
    pub async fn wait_until_healthy(&self, startup_timeout: Duration, interval: Duration) -> bool {
        info!(timeout = ?startup_timeout, "waiting for application to become healthy");
        let deadline = Instant::now() + startup_timeout;

        loop {
            if self.check().await {
                info!("application is healthy");
                return true;
            }
            if Instant::now() >= deadline {
                warn!(timeout = ?startup_timeout, "application startup timeout exceeded");
                return false;
            }
            tokio::time::sleep(interval).await;
        }
    }
}
