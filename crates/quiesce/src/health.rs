//! The lifecycle-aware health endpoint and the optional metrics endpoint.
//!
//! The endpoint binds and serves before the application is spawned so that
//! external probes see a well-formed 503 during startup rather than a
//! connection refused.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tracing::{debug, error};

use crate::metrics::{HEALTH_REQUESTS, HEALTH_REQUEST_DURATION, render_plain};
use crate::probe::AppProbe;
use crate::state::{Lifecycle, LifecycleState};

const BODY_STARTING: &str = r#"{"status":"starting"}"#;
const BODY_HEALTHY: &str = r#"{"status":"healthy"}"#;
const BODY_UNHEALTHY: &str = r#"{"status":"unhealthy"}"#;
const BODY_DRAINING: &str = r#"{"status":"draining"}"#;
const BODY_TERMINATING: &str = r#"{"status":"terminating"}"#;
const BODY_UNKNOWN: &str = r#"{"status":"unknown"}"#;

/// Status and body for a raw state code, with a defensive arm for values
/// outside the enumeration.
pub fn state_response(code: u8) -> (StatusCode, &'static str) {
    match LifecycleState::from_code(code) {
        Some(LifecycleState::Starting) => (StatusCode::SERVICE_UNAVAILABLE, BODY_STARTING),
        Some(LifecycleState::Healthy) => (StatusCode::OK, BODY_HEALTHY),
        Some(LifecycleState::Unhealthy) => (StatusCode::SERVICE_UNAVAILABLE, BODY_UNHEALTHY),
        Some(LifecycleState::Draining) => (StatusCode::SERVICE_UNAVAILABLE, BODY_DRAINING),
        Some(LifecycleState::Terminating) => (StatusCode::SERVICE_UNAVAILABLE, BODY_TERMINATING),
        None => (StatusCode::INTERNAL_SERVER_ERROR, BODY_UNKNOWN),
    }
}

struct Endpoint {
    state: Arc<Lifecycle>,
    probe: Option<AppProbe>,
}

impl Endpoint {
    async fn respond(&self) -> (StatusCode, &'static str) {
        let state = self.state.get();

        // In Healthy/Unhealthy a configured probe overrides the stored state.
        if let Some(probe) = &self.probe {
            match state {
                LifecycleState::Healthy => {
                    return if probe.check().await {
                        (StatusCode::OK, BODY_HEALTHY)
                    } else {
                        (StatusCode::SERVICE_UNAVAILABLE, BODY_UNHEALTHY)
                    };
                }
                LifecycleState::Unhealthy => {
                    return if probe.check().await {
                        self.state.set(LifecycleState::Healthy);
                        (StatusCode::OK, BODY_HEALTHY)
                    } else {
                        (StatusCode::SERVICE_UNAVAILABLE, BODY_UNHEALTHY)
                    };
                }
                _ => {}
            }
        }

        state_response(state.code())
    }
}

/// The health endpoint: one configurable GET path over the shared lifecycle
/// state, with an optional application probe consulted per request.
#[derive(Clone)]
pub struct HealthServer {
    path: String,
    endpoint: Arc<Endpoint>,
}

impl HealthServer {
    pub fn new(
        state: Arc<Lifecycle>,
        probe: Option<AppProbe>,
        path: impl Into<String>,
    ) -> HealthServer {
        HealthServer {
            path: path.into(),
            endpoint: Arc::new(Endpoint { state, probe }),
        }
    }

    /// Router serving the health path.
    pub fn router(&self) -> Router {
        Router::new()
            .route(&self.path, get(health_handler))
            .with_state(Arc::clone(&self.endpoint))
    }

    /// Block until the application probe first succeeds, or `startup_timeout`
    /// elapses. With no probe configured this returns true immediately.
    pub async fn wait_for_app_healthy(&self, startup_timeout: Duration, interval: Duration) -> bool {
        match &self.endpoint.probe {
            None => {
                debug!("no application probe configured, skipping app health wait");
                true
            }
            Some(probe) => probe.wait_until_healthy(startup_timeout, interval).await,
        }
    }
}

async fn health_handler(State(endpoint): State<Arc<Endpoint>>) -> impl IntoResponse {
    let start = Instant::now();
    let (status, body) = endpoint.respond().await;

    counter!(HEALTH_REQUESTS).increment(1);
    gauge!(HEALTH_REQUEST_DURATION).set(start.elapsed().as_secs_f64() * 1000.0);

    (status, [(header::CONTENT_TYPE, "application/json")], body)
}

/// Router serving the Prometheus exposition (comment lines stripped).
pub fn metrics_router(path: &str, handle: PrometheusHandle) -> Router {
    Router::new().route(
        path,
        get(move || {
            let handle = handle.clone();
            async move {
                (
                    [(
                        header::CONTENT_TYPE,
                        "text/plain; version=0.0.4; charset=utf-8",
                    )],
                    render_plain(&handle),
                )
            }
        }),
    )
}

/// Drive an already-bound listener until the process exits.
pub async fn serve(listener: TcpListener, router: Router) {
    if let Err(e) = axum::serve(listener, router).await {
        error!(error = %e, "health server error");
    }
}
