use thiserror::Error;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to bind telemetry listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("telemetry transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("telemetry protocol error: {0}")]
    Protocol(#[from] serde_json::Error),
    #[error("telemetry listener error: {0}")]
    Io(#[from] std::io::Error),
}
