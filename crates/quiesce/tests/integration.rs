//! Integration tests: connection draining against fixture tables, probes
//! against mock HTTP servers, and the shutdown coordinator against real
//! child processes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use httpmock::prelude::*;
use signal_hook::consts::signal::{SIGCHLD, SIGHUP, SIGTERM, SIGUSR1};
use tokio::net::TcpListener;
use tokio::time::Instant;

use quiesce::SupervisorError;
use quiesce::child::{ChildExit, ChildHandle};
use quiesce::config::{Config, ShutdownConfig, SignalConfig};
use quiesce::health::{self, HealthServer};
use quiesce::monitor::ConnectionMonitor;
use quiesce::probe::{AppProbe, CommandProbe, HttpProbe};
use quiesce::shutdown::Coordinator;
use quiesce::signals::{SignalAction, SignalRouter};
use quiesce::state::{Lifecycle, LifecycleState};

const TABLE_HEADER: &str = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode";

/// Write a fixture table with one row per `(local_port, state_code)`.
/// Writes via rename so a concurrent poll never observes a partial file.
fn write_table(path: &Path, rows: &[(u16, u8)]) {
    let mut content = format!("{TABLE_HEADER}\n");
    for (port, state) in rows {
        content.push_str(&format!(
            "   0: 0100007F:{port:04X} 0200007F:D431 {state:02X} 00000000:00000000 00:00000000 00000000  1000        0 12345 1 0000000000000000 100 0 0 10 0\n"
        ));
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, content).unwrap();
    std::fs::rename(&tmp, path).unwrap();
}

struct Tables {
    _dir: tempfile::TempDir,
    tcp: PathBuf,
    tcp6: PathBuf,
}

fn tables(rows: &[(u16, u8)]) -> Tables {
    let dir = tempfile::tempdir().unwrap();
    let tcp = dir.path().join("tcp");
    let tcp6 = dir.path().join("tcp6");
    write_table(&tcp, rows);
    write_table(&tcp6, &[]);
    Tables {
        _dir: dir,
        tcp,
        tcp6,
    }
}

fn monitor(tables: &Tables, ports: &[u16], check_interval: Duration) -> ConnectionMonitor {
    ConnectionMonitor::new(ports.iter().copied(), check_interval)
        .with_tables(&tables.tcp, &tables.tcp6)
}

const ESTABLISHED: u8 = 0x01;
const TIME_WAIT: u8 = 0x06;
const CLOSE: u8 = 0x07;
const LISTEN: u8 = 0x0a;

// =========================================================================
// Group 1: connection observer
// =========================================================================

#[tokio::test]
async fn count_filters_ports_and_states() {
    let fixture = tables(&[
        (8080, ESTABLISHED),
        (8080, LISTEN),
        (8080, TIME_WAIT),
        (8080, CLOSE),
        (9999, ESTABLISHED),
        (8081, 0x08), // CLOSE_WAIT counts
    ]);
    let monitor = monitor(&fixture, &[8080, 8081], Duration::from_millis(50));
    assert_eq!(monitor.count_active().unwrap(), 2);
}

#[tokio::test]
async fn count_propagates_read_failures() {
    let monitor = ConnectionMonitor::new([8080], Duration::from_millis(50))
        .with_tables("/does/not/exist/tcp", "/does/not/exist/tcp6");
    assert!(matches!(
        monitor.count_active(),
        Err(SupervisorError::Io(_))
    ));
}

#[tokio::test]
async fn wait_for_zero_returns_immediately_when_drained() {
    let fixture = tables(&[(8080, LISTEN)]);
    let monitor = monitor(&fixture, &[8080], Duration::from_millis(50));

    let start = Instant::now();
    monitor.wait_for_zero(Duration::from_secs(5)).await.unwrap();
    assert!(start.elapsed() < Duration::from_millis(100));
}

#[tokio::test]
async fn wait_for_zero_times_out_while_connections_persist() {
    let fixture = tables(&[(8080, ESTABLISHED)]);
    let monitor = monitor(&fixture, &[8080], Duration::from_millis(50));

    let start = Instant::now();
    let result = monitor.wait_for_zero(Duration::from_millis(200)).await;
    assert!(matches!(result, Err(SupervisorError::DrainTimeout)));
    assert!(start.elapsed() >= Duration::from_millis(200));
}

#[tokio::test]
async fn wait_for_zero_propagates_io_errors() {
    let monitor = ConnectionMonitor::new([8080], Duration::from_millis(50))
        .with_tables("/does/not/exist/tcp", "/does/not/exist/tcp6");
    let result = monitor.wait_for_zero(Duration::from_secs(1)).await;
    assert!(matches!(result, Err(SupervisorError::Io(_))));
}

#[tokio::test]
async fn steady_state_confirms_zero() {
    let fixture = tables(&[]);
    let monitor = monitor(&fixture, &[8080], Duration::from_millis(50))
        .with_steady_state_wait(Duration::from_millis(200));

    let start = Instant::now();
    monitor.wait_for_zero(Duration::from_secs(5)).await.unwrap();
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(200), "returned at {elapsed:?}");
    assert!(elapsed < Duration::from_secs(1));
}

#[tokio::test]
async fn steady_state_respects_overall_deadline() {
    let fixture = tables(&[]);
    let monitor = monitor(&fixture, &[8080], Duration::from_millis(50))
        .with_steady_state_wait(Duration::from_millis(500));

    // Count is zero from the first sample, but the overall deadline elapses
    // before the steady-state confirmation completes.
    let result = monitor.wait_for_zero(Duration::from_millis(150)).await;
    assert!(matches!(result, Err(SupervisorError::DrainTimeout)));
}

#[tokio::test]
async fn rise_during_steady_state_restarts_the_wait() {
    let fixture = tables(&[]);
    let monitor = Arc::new(
        monitor(&fixture, &[8080], Duration::from_millis(50))
            .with_steady_state_wait(Duration::from_millis(300)),
    );

    // A connection appears 100 ms into the steady-state wait and disappears
    // 150 ms later; the confirmation must start over from the later zero.
    let tcp = fixture.tcp.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        write_table(&tcp, &[(8080, ESTABLISHED)]);
        tokio::time::sleep(Duration::from_millis(150)).await;
        write_table(&tcp, &[]);
    });

    let start = Instant::now();
    monitor.wait_for_zero(Duration::from_secs(5)).await.unwrap();
    let elapsed = start.elapsed();
    assert!(
        elapsed >= Duration::from_millis(500),
        "steady-state timer did not restart, returned at {elapsed:?}"
    );
    assert!(elapsed < Duration::from_secs(3));
}

// =========================================================================
// Group 2: application probes
// =========================================================================

#[tokio::test]
async fn http_probe_accepts_2xx() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET).path("/health");
            then.status(200);
        })
        .await;

    let probe = HttpProbe::new(server.url("/health"), Duration::from_secs(1));
    assert!(probe.check().await);
    mock.assert_hits_async(1).await;
}

#[tokio::test]
async fn http_probe_rejects_5xx_and_connect_failures() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/health");
            then.status(503);
        })
        .await;

    let probe = HttpProbe::new(server.url("/health"), Duration::from_secs(1));
    assert!(!probe.check().await);

    // Nothing listens on this port.
    let probe = HttpProbe::new("http://127.0.0.1:9/health", Duration::from_millis(200));
    assert!(!probe.check().await);

    let probe = HttpProbe::new("", Duration::from_secs(1));
    assert!(!probe.check().await);
}

#[tokio::test]
async fn wait_until_healthy_gives_up_after_startup_timeout() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/health");
            then.status(503);
        })
        .await;

    let probe = AppProbe::Http(HttpProbe::new(server.url("/health"), Duration::from_secs(1)));
    let start = Instant::now();
    let healthy = probe
        .wait_until_healthy(Duration::from_millis(500), Duration::from_millis(100))
        .await;
    assert!(!healthy);
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(500));
    assert!(elapsed < Duration::from_secs(2));
}

#[tokio::test]
async fn wait_until_healthy_recovers_when_the_app_comes_up() {
    let server = MockServer::start_async().await;
    // Failure mock first (lower ID = matched first); deleted mid-test so the
    // success mock underneath takes over.
    let fail = server
        .mock_async(|when, then| {
            when.method(GET).path("/health");
            then.status(503);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/health");
            then.status(200);
        })
        .await;

    let probe = AppProbe::Http(HttpProbe::new(server.url("/health"), Duration::from_secs(1)));
    let handle = tokio::spawn(async move {
        probe
            .wait_until_healthy(Duration::from_secs(5), Duration::from_millis(100))
            .await
    });

    tokio::time::sleep(Duration::from_millis(300)).await;
    fail.delete_async().await;

    assert!(handle.await.unwrap());
}

#[tokio::test]
async fn command_probe_reports_exit_codes() {
    let probe = CommandProbe::new(vec!["true".into()], Duration::from_secs(1));
    assert!(probe.check().await);

    let probe = CommandProbe::new(
        vec!["sh".into(), "-c".into(), "exit 3".into()],
        Duration::from_secs(1),
    );
    let outcome = probe.check_with_details().await;
    assert!(!outcome.healthy);
    assert_eq!(outcome.exit_code, 3);
    assert!(outcome.error.is_some());
}

#[tokio::test]
async fn command_probe_times_out() {
    let probe = CommandProbe::new(
        vec!["sleep".into(), "10".into()],
        Duration::from_millis(200),
    );
    let start = Instant::now();
    let outcome = probe.check_with_details().await;
    assert!(!outcome.healthy);
    assert_eq!(outcome.exit_code, -1);
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn command_probe_rejects_empty_and_unspawnable_commands() {
    let probe = CommandProbe::new(vec![], Duration::from_secs(1));
    let outcome = probe.check_with_details().await;
    assert!(!outcome.healthy);
    assert_eq!(outcome.exit_code, -1);

    let probe = CommandProbe::new(
        vec!["/does/not/exist".into()],
        Duration::from_secs(1),
    );
    let outcome = probe.check_with_details().await;
    assert!(!outcome.healthy);
    assert_eq!(outcome.exit_code, -1);
}

// =========================================================================
// Group 3: health endpoint
// =========================================================================

async fn serve(server: &HealthServer) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(health::serve(listener, server.router()));
    addr
}

#[tokio::test]
async fn endpoint_reflects_lifecycle_states() {
    let lifecycle = Arc::new(Lifecycle::new());
    let server = HealthServer::new(Arc::clone(&lifecycle), None, "/health");
    let addr = serve(&server).await;
    let url = format!("http://{addr}/health");

    let resp = reqwest::get(&url).await.unwrap();
    assert_eq!(resp.status(), 503);
    assert_eq!(
        resp.headers()["content-type"].to_str().unwrap(),
        "application/json"
    );
    assert_eq!(resp.text().await.unwrap(), r#"{"status":"starting"}"#);

    lifecycle.set(LifecycleState::Healthy);
    let resp = reqwest::get(&url).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), r#"{"status":"healthy"}"#);

    lifecycle.set(LifecycleState::Draining);
    let resp = reqwest::get(&url).await.unwrap();
    assert_eq!(resp.status(), 503);
    assert_eq!(resp.text().await.unwrap(), r#"{"status":"draining"}"#);

    lifecycle.set(LifecycleState::Terminating);
    let resp = reqwest::get(&url).await.unwrap();
    assert_eq!(resp.status(), 503);
    assert_eq!(resp.text().await.unwrap(), r#"{"status":"terminating"}"#);
}

#[tokio::test]
async fn probe_failure_overrides_healthy_state() {
    let mock_server = MockServer::start_async().await;
    mock_server
        .mock_async(|when, then| {
            when.method(GET).path("/app-health");
            then.status(503);
        })
        .await;

    let lifecycle = Arc::new(Lifecycle::new());
    lifecycle.set(LifecycleState::Healthy);
    let probe = AppProbe::Http(HttpProbe::new(
        mock_server.url("/app-health"),
        Duration::from_secs(1),
    ));
    let server = HealthServer::new(Arc::clone(&lifecycle), Some(probe), "/health");
    let addr = serve(&server).await;

    let resp = reqwest::get(format!("http://{addr}/health")).await.unwrap();
    assert_eq!(resp.status(), 503);
    assert_eq!(resp.text().await.unwrap(), r#"{"status":"unhealthy"}"#);

    // The stored state is untouched by the override.
    assert_eq!(lifecycle.get(), LifecycleState::Healthy);
}

#[tokio::test]
async fn probe_success_recovers_unhealthy_state() {
    let mock_server = MockServer::start_async().await;
    mock_server
        .mock_async(|when, then| {
            when.method(GET).path("/app-health");
            then.status(200);
        })
        .await;

    let lifecycle = Arc::new(Lifecycle::new());
    lifecycle.set(LifecycleState::Unhealthy);
    let probe = AppProbe::Http(HttpProbe::new(
        mock_server.url("/app-health"),
        Duration::from_secs(1),
    ));
    let server = HealthServer::new(Arc::clone(&lifecycle), Some(probe), "/health");
    let addr = serve(&server).await;

    let resp = reqwest::get(format!("http://{addr}/health")).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), r#"{"status":"healthy"}"#);
    assert_eq!(lifecycle.get(), LifecycleState::Healthy);
}

#[tokio::test]
async fn probe_is_not_consulted_while_draining() {
    let mock_server = MockServer::start_async().await;
    let mock = mock_server
        .mock_async(|when, then| {
            when.method(GET).path("/app-health");
            then.status(200);
        })
        .await;

    let lifecycle = Arc::new(Lifecycle::new());
    lifecycle.set(LifecycleState::Draining);
    let probe = AppProbe::Http(HttpProbe::new(
        mock_server.url("/app-health"),
        Duration::from_secs(1),
    ));
    let server = HealthServer::new(Arc::clone(&lifecycle), Some(probe), "/health");
    let addr = serve(&server).await;

    let resp = reqwest::get(format!("http://{addr}/health")).await.unwrap();
    assert_eq!(resp.status(), 503);
    assert_eq!(resp.text().await.unwrap(), r#"{"status":"draining"}"#);
    mock.assert_hits_async(0).await;
}

#[tokio::test]
async fn wait_for_app_healthy_is_immediate_without_a_probe() {
    let server = HealthServer::new(Arc::new(Lifecycle::new()), None, "/health");
    let start = Instant::now();
    assert!(
        server
            .wait_for_app_healthy(Duration::from_secs(30), Duration::from_secs(5))
            .await
    );
    assert!(start.elapsed() < Duration::from_millis(50));
}

// =========================================================================
// Group 4: signal router
// =========================================================================

fn signal_config(pass_through: &[&str], shutdown: &[&str]) -> SignalConfig {
    SignalConfig {
        pass_through: pass_through.iter().map(|s| s.to_string()).collect(),
        shutdown: shutdown.iter().map(|s| s.to_string()).collect(),
    }
}

#[tokio::test]
async fn router_classifies_by_priority() {
    let child = ChildHandle::spawn(&["sleep".into(), "10".into()]).unwrap();
    let router = SignalRouter::new(&signal_config(&["SIGHUP"], &["SIGTERM"]), child.clone());

    let mut interest = router.signals_of_interest();
    interest.sort_unstable();
    let mut expected = vec![SIGHUP, SIGTERM, SIGCHLD];
    expected.sort_unstable();
    assert_eq!(interest, expected);

    // Unconfigured signal: ignored, nothing is forwarded.
    assert_eq!(router.classify(SIGUSR1), SignalAction::Ignore);
    assert_eq!(router.classify(SIGCHLD), SignalAction::ReapZombies);
    assert_eq!(router.classify(SIGTERM), SignalAction::Shutdown);

    // Pass-through delivers the same signal to the child; sleep(1) dies of
    // the unhandled SIGHUP, which the waiter observes.
    assert_eq!(router.classify(SIGHUP), SignalAction::PassThrough);
    match child.wait().await {
        ChildExit::Exited(status) => assert_eq!(status.signal(), Some(SIGHUP)),
        other => panic!("unexpected exit: {other:?}"),
    }
}

// =========================================================================
// Group 5: shutdown coordinator
// =========================================================================

fn shutdown_config(drain: Duration, shutdown: Duration, force_kill: bool) -> ShutdownConfig {
    ShutdownConfig {
        drain_timeout: drain,
        shutdown_timeout: shutdown,
        check_interval: Duration::from_millis(50),
        steady_state_wait: Duration::ZERO,
        signal_to_app: String::new(),
        force_kill_after_timeout: force_kill,
    }
}

/// Child that installs a TERM handler and exits 0 when signaled. The short
/// sleep before signaling gives the shell time to install the trap.
const POLITE_CHILD: &str = "trap 'exit 0' TERM; sleep 10 & wait";

/// Child that ignores TERM outright.
const STUBBORN_CHILD: &str = "trap '' TERM; sleep 60 & wait";

fn sh(script: &str) -> Vec<String> {
    vec!["sh".into(), "-c".into(), script.into()]
}

#[tokio::test]
async fn coordinator_runs_a_clean_shutdown() {
    let fixture = tables(&[]);
    let monitor = Arc::new(monitor(&fixture, &[8080], Duration::from_millis(50)));
    let lifecycle = Arc::new(Lifecycle::new());
    lifecycle.set(LifecycleState::Healthy);

    let child = ChildHandle::spawn(&sh(POLITE_CHILD)).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let coordinator = Coordinator::new(
        shutdown_config(Duration::from_secs(1), Duration::from_secs(5), true),
        Arc::clone(&lifecycle),
        monitor,
        Some(child.clone()),
    );

    coordinator.initiate(SIGTERM).await.unwrap();
    assert_eq!(lifecycle.get(), LifecycleState::Draining);
    match child.wait().await {
        ChildExit::Exited(status) => assert_eq!(status.code(), Some(0)),
        other => panic!("unexpected exit: {other:?}"),
    }
}

#[tokio::test]
async fn coordinator_proceeds_after_drain_timeout() {
    // One ESTABLISHED connection that never goes away.
    let fixture = tables(&[(8080, ESTABLISHED)]);
    let monitor = Arc::new(monitor(&fixture, &[8080], Duration::from_millis(50)));
    let lifecycle = Arc::new(Lifecycle::new());

    let child = ChildHandle::spawn(&sh(POLITE_CHILD)).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let coordinator = Coordinator::new(
        shutdown_config(Duration::from_millis(100), Duration::from_secs(2), true),
        Arc::clone(&lifecycle),
        monitor,
        Some(child.clone()),
    );

    // Drain times out, the signal is still sent, the child still exits.
    coordinator.initiate(SIGTERM).await.unwrap();
    match child.wait().await {
        ChildExit::Exited(status) => assert_eq!(status.code(), Some(0)),
        other => panic!("unexpected exit: {other:?}"),
    }
}

#[tokio::test]
async fn coordinator_force_kills_a_stubborn_child() {
    let fixture = tables(&[]);
    let monitor = Arc::new(monitor(&fixture, &[8080], Duration::from_millis(50)));
    let lifecycle = Arc::new(Lifecycle::new());

    let child = ChildHandle::spawn(&sh(STUBBORN_CHILD)).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let coordinator = Coordinator::new(
        shutdown_config(Duration::from_millis(50), Duration::from_millis(300), true),
        Arc::clone(&lifecycle),
        monitor,
        Some(child.clone()),
    );

    let result = coordinator.initiate(SIGTERM).await;
    assert!(matches!(result, Err(SupervisorError::ShutdownTimeout)));
    assert_eq!(lifecycle.get(), LifecycleState::Draining);

    match child.wait().await {
        ChildExit::Exited(status) => assert_eq!(status.signal(), Some(libc::SIGKILL)),
        other => panic!("unexpected exit: {other:?}"),
    }
}

#[tokio::test]
async fn coordinator_without_a_child_just_drains() {
    let fixture = tables(&[]);
    let monitor = Arc::new(monitor(&fixture, &[8080], Duration::from_millis(50)));
    let lifecycle = Arc::new(Lifecycle::new());

    let coordinator = Coordinator::new(
        shutdown_config(Duration::from_millis(100), Duration::from_secs(1), true),
        Arc::clone(&lifecycle),
        monitor,
        None,
    );

    coordinator.initiate(SIGTERM).await.unwrap();
    assert_eq!(lifecycle.get(), LifecycleState::Draining);
}

#[tokio::test]
async fn coordinator_sends_the_configured_signal() {
    let fixture = tables(&[]);
    let monitor = Arc::new(monitor(&fixture, &[8080], Duration::from_millis(50)));
    let lifecycle = Arc::new(Lifecycle::new());

    // Child exits 7 on USR1; the coordinator is configured to send SIGUSR1
    // even though the triggering signal is SIGTERM.
    let child =
        ChildHandle::spawn(&sh("trap 'exit 7' USR1; trap '' TERM; sleep 10 & wait")).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut config = shutdown_config(Duration::from_millis(100), Duration::from_secs(5), false);
    config.signal_to_app = "SIGUSR1".into();
    let coordinator = Coordinator::new(config, Arc::clone(&lifecycle), monitor, Some(child.clone()));

    coordinator.initiate(SIGTERM).await.unwrap();
    match child.wait().await {
        ChildExit::Exited(status) => assert_eq!(status.code(), Some(7)),
        other => panic!("unexpected exit: {other:?}"),
    }
}

// =========================================================================
// Group 6: metrics exposition
// =========================================================================

// The one test that installs the process-wide recorder; everything else
// runs with the no-op default.
#[tokio::test]
async fn metrics_endpoint_serves_plain_exposition() {
    let handle = quiesce::metrics::install_recorder().unwrap();
    metrics::gauge!(quiesce::metrics::STATE).set(1.0);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(health::serve(
        listener,
        health::metrics_router("/metrics", handle),
    ));

    let resp = reqwest::get(format!("http://{addr}/metrics")).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert!(
        resp.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/plain")
    );

    // Other tests share the process-wide recorder, so assert on series
    // presence rather than exact values.
    let body = resp.text().await.unwrap();
    assert!(body.contains("quiesce_state"));
    assert!(body.contains(r#"quiesce_signals_received_total{signal="SIGTERM"}"#));
    assert!(!body.contains("# HELP"));
    assert!(!body.contains("# TYPE"));
}

// =========================================================================
// Group 7: configuration wiring
// =========================================================================

#[test]
fn monitored_ports_cover_app_and_additional_ports() {
    let vars: HashMap<String, String> = [
        ("QUIESCE_APP_PORT", "8080"),
        ("QUIESCE_APP_ADDITIONAL_PORTS", "8443"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    let config = Config::from_hashmap(&vars).unwrap();
    assert_eq!(config.monitored_ports(), vec![8080, 8443]);
    assert!(config.app.command.is_empty());
}
