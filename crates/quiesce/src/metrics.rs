//! Metric names and the Prometheus recorder.
//!
//! All instrumentation goes through the `metrics` facade; the recorder is
//! only installed when the metrics endpoint is enabled, so the macros are
//! free no-ops otherwise.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::error::SupervisorError;

pub const STATE: &str = "quiesce_state";
pub const UPTIME: &str = "quiesce_uptime_seconds_total";
pub const APP_UPTIME: &str = "quiesce_app_uptime_seconds_total";
pub const ACTIVE_CONNECTIONS: &str = "quiesce_active_connections";
pub const DRAIN_PHASE_ACTIVE: &str = "quiesce_drain_phase_active";
pub const DRAIN_DURATION: &str = "quiesce_drain_duration_seconds";
pub const HEALTH_REQUESTS: &str = "quiesce_health_requests_total";
pub const HEALTH_REQUEST_DURATION: &str = "quiesce_health_request_duration_ms";
pub const HEALTH_APP: &str = "quiesce_health_app";
pub const SIGNALS_RECEIVED: &str = "quiesce_signals_received_total";
pub const SIGNALS_FORWARDED: &str = "quiesce_signals_forwarded_total";

/// Install the process-wide Prometheus recorder and seed the series that
/// should always appear in the exposition, even before their first event.
pub fn install_recorder() -> crate::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| SupervisorError::Metrics(e.to_string()))?;

    gauge!(STATE).set(0.0);
    gauge!(HEALTH_APP).set(0.0);
    gauge!(ACTIVE_CONNECTIONS).set(0.0);
    gauge!(DRAIN_PHASE_ACTIVE).set(0.0);
    counter!(SIGNALS_RECEIVED, "signal" => "SIGTERM").absolute(0);
    counter!(SIGNALS_FORWARDED, "signal" => "SIGTERM").absolute(0);

    Ok(handle)
}

/// Render the exposition text without `# HELP` / `# TYPE` comment lines.
pub fn render_plain(handle: &PrometheusHandle) -> String {
    let mut out = String::new();
    for line in handle.render().lines() {
        if line.starts_with("# HELP") || line.starts_with("# TYPE") {
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}
