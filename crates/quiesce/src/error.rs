use crate::config::ConfigError;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to bind health endpoint: {0}")]
    Bind(std::io::Error),

    #[error("failed to start application: {0}")]
    Spawn(std::io::Error),

    #[error("no application command specified")]
    EmptyCommand,

    #[error("failed to install metrics recorder: {0}")]
    Metrics(String),

    #[error("connection drain timeout reached")]
    DrainTimeout,

    #[error("shutdown timeout reached")]
    ShutdownTimeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
