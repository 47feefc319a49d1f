//! Startup ordering and the signal loop.
//!
//! The supervisor brings the health endpoint up first, spawns the
//! application in its own process group, wires the signal router to the
//! shutdown coordinator, and blocks until termination completes.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::StreamExt as _;
use metrics::{counter, gauge};
use signal_hook_tokio::Signals;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::child::ChildHandle;
use crate::config::{Config, HealthMode};
use crate::error::SupervisorError;
use crate::health::{self, HealthServer};
use crate::metrics::{APP_UPTIME, HEALTH_APP, UPTIME, install_recorder};
use crate::monitor::ConnectionMonitor;
use crate::probe::{AppProbe, CommandProbe, HttpProbe};
use crate::shutdown::Coordinator;
use crate::signals::{self, SignalAction, SignalRouter};
use crate::state::{Lifecycle, LifecycleState};

/// Run the supervisor to completion. Returns once a shutdown signal has been
/// handled and the coordinator has finished, or immediately on a startup
/// failure.
pub async fn run(config: Config) -> crate::Result<()> {
    let metrics_handle = if config.metrics.enabled {
        Some(install_recorder()?)
    } else {
        None
    };

    let lifecycle = Arc::new(Lifecycle::new());
    let server = HealthServer::new(
        Arc::clone(&lifecycle),
        build_probe(&config),
        &config.health.path,
    );

    // The health endpoint must be accepting before the application exists:
    // external probes should see 503 starting, not connection refused.
    let mut router = server.router();
    let metrics_on_health_port =
        config.metrics.enabled && config.metrics.port == config.health.port;
    if let Some(handle) = &metrics_handle
        && metrics_on_health_port
    {
        router = router.merge(health::metrics_router(&config.metrics.path, handle.clone()));
        info!(path = %config.metrics.path, port = config.health.port, "metrics endpoint enabled on health server");
    }
    let listener = TcpListener::bind(("0.0.0.0", config.health.port))
        .await
        .map_err(SupervisorError::Bind)?;
    tokio::spawn(health::serve(listener, router));
    info!(port = config.health.port, path = %config.health.path, "health endpoint started");

    if let Some(handle) = &metrics_handle {
        if !metrics_on_health_port {
            let listener = TcpListener::bind(("0.0.0.0", config.metrics.port))
                .await
                .map_err(SupervisorError::Bind)?;
            tokio::spawn(health::serve(
                listener,
                health::metrics_router(&config.metrics.path, handle.clone()),
            ));
            info!(port = config.metrics.port, path = %config.metrics.path, "metrics endpoint started");
        }
        spawn_uptime_ticker(UPTIME);
    }

    gauge!(HEALTH_APP).set(LifecycleState::Starting.code() as f64);

    if config.app.command.is_empty() {
        return Err(SupervisorError::EmptyCommand);
    }
    let child = ChildHandle::spawn(&config.app.command)?;
    info!(pid = child.id(), command = ?config.app.command, "application started");
    gauge!(HEALTH_APP).set(LifecycleState::Healthy.code() as f64);

    // Initial state is probe-driven; standalone mode has no probe and
    // resolves to Healthy immediately. Never fatal: a probe that stays
    // unhealthy leaves the endpoint at 503 and the container running.
    {
        let server = server.clone();
        let lifecycle = Arc::clone(&lifecycle);
        let startup_timeout = config.app.startup_timeout;
        let interval = config.health.probe_interval;
        tokio::spawn(async move {
            let healthy = server.wait_for_app_healthy(startup_timeout, interval).await;
            if healthy {
                lifecycle.set(LifecycleState::Healthy);
                info!("health endpoint now reporting healthy");
            } else {
                lifecycle.set(LifecycleState::Unhealthy);
                warn!("application did not become healthy within startup timeout, health endpoint will report unhealthy");
            }
        });
    }

    let monitor = Arc::new(
        ConnectionMonitor::new(config.monitored_ports(), config.shutdown.check_interval)
            .with_steady_state_wait(config.shutdown.steady_state_wait),
    );
    Arc::clone(&monitor).spawn_background_poll();
    info!(ports = ?config.monitored_ports(), interval = ?config.shutdown.check_interval, "connection monitoring started");

    let router = SignalRouter::new(&config.signals, child.clone());
    let mut stream = Signals::new(router.signals_of_interest())?;
    info!("signal handler initialized and ready");

    spawn_uptime_ticker(APP_UPTIME);

    let coordinator = Coordinator::new(
        config.shutdown.clone(),
        Arc::clone(&lifecycle),
        Arc::clone(&monitor),
        Some(child),
    );

    // Single-consumer signal loop. Dispatch ends at the first shutdown-class
    // signal; duplicates delivered later are never dequeued, so the sequence
    // cannot restart.
    while let Some(sig) = stream.next().await {
        match router.classify(sig) {
            SignalAction::Shutdown => return coordinator.initiate(sig).await,
            SignalAction::ReapZombies => signals::reap_zombies(),
            SignalAction::PassThrough | SignalAction::Ignore => {}
        }
    }

    Ok(())
}

fn build_probe(config: &Config) -> Option<AppProbe> {
    match config.health.mode {
        HealthMode::Standalone => None,
        HealthMode::AppDependent => Some(AppProbe::Http(HttpProbe::new(
            config.app.health_url.clone(),
            config.health.probe_timeout,
        ))),
        HealthMode::Command => Some(AppProbe::Command(CommandProbe::new(
            config.health.command.clone(),
            config.health.command_timeout,
        ))),
    }
}

/// Increment `name` once a second for the life of the process.
fn spawn_uptime_ticker(name: &'static str) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            counter!(name).increment(1);
        }
    });
}
