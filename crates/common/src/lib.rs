use serde::{Deserialize, Serialize};

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod status;

pub use config::{load_config, ActuatorServerConfig, BridgeConfig};
pub use diagnostics::{BridgeDiagnostics, DiagnosticsSnapshot};
pub use error::{ActuatorError, ConfigError};
pub use status::{ManualCommand, ManualReply, StatusUpdate};

/// Last heart-rate value received from telemetry, in beats per minute.
pub type HeartRateSample = u32;

/// Binary actuation state. There is no intensity; the device is either
/// running or stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ActuationState {
    #[serde(rename = "on")]
    Engaged,
    #[default]
    #[serde(rename = "off")]
    Disengaged,
}

impl ActuationState {
    /// Desired state for a sample: engage below the threshold, disengage at or above it.
    pub fn for_sample(bpm: HeartRateSample, threshold: HeartRateSample) -> Self {
        if bpm < threshold {
            ActuationState::Engaged
        } else {
            ActuationState::Disengaged
        }
    }

    pub fn is_engaged(self) -> bool {
        matches!(self, ActuationState::Engaged)
    }
}

/// Connectivity of the actuator control service as seen by the supervisor.
///
/// `connecting` and `connected` are never both true.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionStatus {
    pub connecting: bool,
    pub connected: bool,
    pub last_error: Option<ActuatorError>,
}

impl ConnectionStatus {
    pub fn connecting(last_error: Option<ActuatorError>) -> Self {
        Self { connecting: true, connected: false, last_error }
    }

    pub fn connected() -> Self {
        Self { connecting: false, connected: true, last_error: None }
    }

    pub fn failed(error: ActuatorError) -> Self {
        Self { connecting: false, connected: false, last_error: Some(error) }
    }

    pub fn disconnected() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn desired_state_switches_at_threshold() {
        assert_eq!(ActuationState::for_sample(99, 100), ActuationState::Engaged);
        assert_eq!(ActuationState::for_sample(100, 100), ActuationState::Disengaged);
        assert_eq!(ActuationState::for_sample(0, 100), ActuationState::Engaged);
        assert_eq!(ActuationState::for_sample(180, 100), ActuationState::Disengaged);
    }

    #[test]
    fn connection_status_flags_are_exclusive() {
        for status in [
            ConnectionStatus::connecting(None),
            ConnectionStatus::connected(),
            ConnectionStatus::failed(ActuatorError::NoDevice),
            ConnectionStatus::disconnected(),
        ] {
            assert!(!(status.connecting && status.connected));
        }
    }
}
