//! Environment-driven configuration.
//!
//! Every knob is a `QUIESCE_*` variable with a default; the application
//! command itself arrives on the command line, not the environment.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use envconfig::Envconfig;

use crate::signals;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid environment value: {0}")]
    Env(envconfig::Error),

    #[error("health check port must be specified")]
    MissingHealthPort,

    #[error("health check path must begin with '/'")]
    InvalidHealthPath,

    #[error("{0} must be positive")]
    NonPositive(&'static str),

    #[error("unknown signal name: {0}")]
    UnknownSignal(String),

    #[error("signal {0} is configured as both pass-through and shutdown")]
    SignalOverlap(String),
}

/// How the health endpoint decides what "healthy" means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthMode {
    /// Healthy as soon as the application has been spawned.
    Standalone,
    /// Healthy only while an HTTP probe against the application succeeds.
    AppDependent,
    /// Healthy only while a probe command exits zero.
    Command,
}

impl FromStr for HealthMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standalone" => Ok(HealthMode::Standalone),
            "app-dependent" => Ok(HealthMode::AppDependent),
            "command" => Ok(HealthMode::Command),
            other => Err(format!("unknown health mode: {other}")),
        }
    }
}

/// Comma-separated list of ports ("8081,8082").
#[derive(Debug, Clone, Default)]
struct PortList(Vec<u16>);

impl FromStr for PortList {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut ports = Vec::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            ports.push(part.parse::<u16>().map_err(|e| format!("{part}: {e}"))?);
        }
        Ok(PortList(ports))
    }
}

/// Comma-separated list of signal names ("SIGHUP,SIGUSR1").
#[derive(Debug, Clone, Default)]
struct SignalList(Vec<String>);

impl FromStr for SignalList {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(SignalList(
            s.split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect(),
        ))
    }
}

#[derive(Envconfig)]
struct RawConfig {
    #[envconfig(from = "QUIESCE_APP_PORT", default = "8080")]
    app_port: u16,

    #[envconfig(from = "QUIESCE_APP_ADDITIONAL_PORTS", default = "")]
    additional_ports: PortList,

    #[envconfig(from = "QUIESCE_APP_HEALTH_URL", default = "http://localhost:8080/health")]
    app_health_url: String,

    #[envconfig(from = "QUIESCE_APP_STARTUP_TIMEOUT", default = "30s")]
    app_startup_timeout: humantime::Duration,

    #[envconfig(from = "QUIESCE_HEALTH_PORT", default = "8888")]
    health_port: u16,

    #[envconfig(from = "QUIESCE_HEALTH_PATH", default = "/health")]
    health_path: String,

    #[envconfig(from = "QUIESCE_HEALTH_MODE", default = "standalone")]
    health_mode: HealthMode,

    #[envconfig(from = "QUIESCE_HEALTH_COMMAND", default = "")]
    health_command: String,

    #[envconfig(from = "QUIESCE_HEALTH_COMMAND_TIMEOUT", default = "5s")]
    health_command_timeout: humantime::Duration,

    #[envconfig(from = "QUIESCE_HEALTH_PROBE_INTERVAL", default = "5s")]
    health_probe_interval: humantime::Duration,

    #[envconfig(from = "QUIESCE_HEALTH_PROBE_TIMEOUT", default = "2s")]
    health_probe_timeout: humantime::Duration,

    #[envconfig(from = "QUIESCE_DRAIN_TIMEOUT", default = "60s")]
    drain_timeout: humantime::Duration,

    #[envconfig(from = "QUIESCE_SHUTDOWN_TIMEOUT", default = "30s")]
    shutdown_timeout: humantime::Duration,

    #[envconfig(from = "QUIESCE_CONNECTION_CHECK_INTERVAL", default = "1s")]
    connection_check_interval: humantime::Duration,

    #[envconfig(from = "QUIESCE_STEADY_STATE_WAIT", default = "0s")]
    steady_state_wait: humantime::Duration,

    #[envconfig(from = "QUIESCE_SIGNAL_TO_APP", default = "SIGTERM")]
    signal_to_app: String,

    #[envconfig(from = "QUIESCE_FORCE_KILL", default = "true")]
    force_kill: bool,

    #[envconfig(from = "QUIESCE_PASSTHROUGH_SIGNALS", default = "SIGHUP,SIGUSR1,SIGUSR2,SIGWINCH")]
    passthrough_signals: SignalList,

    #[envconfig(from = "QUIESCE_SHUTDOWN_SIGNALS", default = "SIGTERM,SIGINT,SIGQUIT")]
    shutdown_signals: SignalList,

    #[envconfig(from = "QUIESCE_LOG_LEVEL", default = "info")]
    log_level: String,

    #[envconfig(from = "QUIESCE_METRICS_ENABLED", default = "false")]
    metrics_enabled: bool,

    #[envconfig(from = "QUIESCE_METRICS_PORT", default = "8888")]
    metrics_port: u16,

    #[envconfig(from = "QUIESCE_METRICS_PATH", default = "/metrics")]
    metrics_path: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Application command; filled from the CLI, never the environment.
    pub command: Vec<String>,
    pub port: u16,
    pub additional_ports: Vec<u16>,
    pub health_url: String,
    pub startup_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub port: u16,
    pub path: String,
    pub mode: HealthMode,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub command: Vec<String>,
    pub command_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    pub drain_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub check_interval: Duration,
    pub steady_state_wait: Duration,
    pub signal_to_app: String,
    pub force_kill_after_timeout: bool,
}

#[derive(Debug, Clone)]
pub struct SignalConfig {
    pub pass_through: Vec<String>,
    pub shutdown: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub app: AppConfig,
    pub health: HealthConfig,
    pub shutdown: ShutdownConfig,
    pub signals: SignalConfig,
    pub metrics: MetricsConfig,
    pub log_level: String,
}

impl Config {
    /// Load and validate configuration from the process environment.
    pub fn from_env() -> Result<Config, ConfigError> {
        let raw = RawConfig::init_from_env().map_err(ConfigError::Env)?;
        Config::from_raw(raw)
    }

    /// Load and validate configuration from an explicit variable map.
    /// Used by tests so they stay hermetic against process-wide env state.
    pub fn from_hashmap(vars: &HashMap<String, String>) -> Result<Config, ConfigError> {
        let raw = RawConfig::init_from_hashmap(vars).map_err(ConfigError::Env)?;
        Config::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Config, ConfigError> {
        let config = Config {
            app: AppConfig {
                command: Vec::new(),
                port: raw.app_port,
                additional_ports: raw.additional_ports.0,
                health_url: raw.app_health_url,
                startup_timeout: raw.app_startup_timeout.into(),
            },
            health: HealthConfig {
                port: raw.health_port,
                path: raw.health_path,
                mode: raw.health_mode,
                probe_interval: raw.health_probe_interval.into(),
                probe_timeout: raw.health_probe_timeout.into(),
                command: raw
                    .health_command
                    .split_whitespace()
                    .map(String::from)
                    .collect(),
                command_timeout: raw.health_command_timeout.into(),
            },
            shutdown: ShutdownConfig {
                drain_timeout: raw.drain_timeout.into(),
                shutdown_timeout: raw.shutdown_timeout.into(),
                check_interval: raw.connection_check_interval.into(),
                steady_state_wait: raw.steady_state_wait.into(),
                signal_to_app: raw.signal_to_app,
                force_kill_after_timeout: raw.force_kill,
            },
            signals: SignalConfig {
                pass_through: raw.passthrough_signals.0,
                shutdown: raw.shutdown_signals.0,
            },
            metrics: MetricsConfig {
                enabled: raw.metrics_enabled,
                port: raw.metrics_port,
                path: raw.metrics_path,
            },
            log_level: raw.log_level,
        };
        config.validate()?;
        Ok(config)
    }

    /// Every port the connection observer should watch.
    pub fn monitored_ports(&self) -> Vec<u16> {
        let mut ports = vec![self.app.port];
        ports.extend(&self.app.additional_ports);
        ports
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.health.port == 0 {
            return Err(ConfigError::MissingHealthPort);
        }
        if !self.health.path.starts_with('/') {
            return Err(ConfigError::InvalidHealthPath);
        }
        if self.shutdown.drain_timeout.is_zero() {
            return Err(ConfigError::NonPositive("drain timeout"));
        }
        if self.shutdown.shutdown_timeout.is_zero() {
            return Err(ConfigError::NonPositive("shutdown timeout"));
        }
        if self.shutdown.check_interval.is_zero() {
            return Err(ConfigError::NonPositive("connection check interval"));
        }
        // A zero interval would turn the app-health wait into a tight loop.
        if self.health.probe_interval.is_zero() {
            return Err(ConfigError::NonPositive("health probe interval"));
        }

        for name in self
            .signals
            .pass_through
            .iter()
            .chain(self.signals.shutdown.iter())
        {
            if signals::parse_signal(name).is_none() {
                return Err(ConfigError::UnknownSignal(name.clone()));
            }
        }
        for name in &self.signals.pass_through {
            if self.signals.shutdown.contains(name) {
                return Err(ConfigError::SignalOverlap(name.clone()));
            }
        }

        Ok(())
    }
}
