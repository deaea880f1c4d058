use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use common::{ActuatorError, ConnectionStatus};

/// Boundary to the actuator control service. Implementations own at most
/// one attached device and synchronise internally.
#[async_trait]
pub trait ActuatorClient: Send + Sync {
    /// Connects to the service and waits up to `discovery` for a device.
    async fn connect(&self, url: &str, discovery: Duration) -> Result<(), ActuatorError>;

    async fn engage(&self) -> Result<(), ActuatorError>;

    async fn disengage(&self) -> Result<(), ActuatorError>;

    /// True while a device is attached and the transport is up.
    fn is_ready(&self) -> bool;

    /// Resolves once the current connection to the service has dropped,
    /// immediately if there is none.
    async fn closed(&self);

    async fn disconnect(&self);
}

/// Shared handle given to the control loop and the manual-command path.
///
/// Readiness combines the supervisor's published status with the client's
/// own view, so a device that disappears is noticed before the supervisor
/// learns about it.
#[derive(Clone)]
pub struct ActuatorLink {
    client: Arc<dyn ActuatorClient>,
    status: watch::Receiver<ConnectionStatus>,
}

impl ActuatorLink {
    pub fn new(client: Arc<dyn ActuatorClient>, status: watch::Receiver<ConnectionStatus>) -> Self {
        Self { client, status }
    }

    pub fn is_ready(&self) -> bool {
        self.status.borrow().connected && self.client.is_ready()
    }

    pub async fn engage(&self) -> Result<(), ActuatorError> {
        self.client.engage().await
    }

    pub async fn disengage(&self) -> Result<(), ActuatorError> {
        self.client.disengage().await
    }
}
