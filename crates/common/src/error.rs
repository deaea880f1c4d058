use std::time::Duration;

use thiserror::Error;

/// Failures talking to the actuator control service or its device.
///
/// Cloneable so the supervisor can keep the last one in [`crate::ConnectionStatus`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActuatorError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected message from actuator service: {0}")]
    Protocol(String),
    #[error("actuator service rejected request (code {code}): {message}")]
    Rejected { code: i64, message: String },
    #[error("no device found within {0:?}")]
    DiscoveryTimeout(Duration),
    #[error("no device attached")]
    NoDevice,
    #[error("actuator is not ready")]
    NotReady,
    #[error("shutdown in progress")]
    ShuttingDown,
    #[error("connection to actuator service closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}
