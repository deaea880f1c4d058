use serde::{Deserialize, Serialize};

use crate::{ActuationState, HeartRateSample};

/// Snapshot pushed to the dashboard whenever the sample or the actuation state changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub heart_rate: HeartRateSample,
    pub actuation_state: ActuationState,
}

/// Manual override sent from the dashboard. Bypasses the threshold logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ManualCommand {
    ManualOn,
    ManualOff,
}

impl ManualCommand {
    pub fn target(self) -> ActuationState {
        match self {
            ManualCommand::ManualOn => ActuationState::Engaged,
            ManualCommand::ManualOff => ActuationState::Disengaged,
        }
    }
}

/// Answer to a manual command, as sent back over the dashboard socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualReply {
    pub command: ManualCommand,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
