use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use common::{ActuatorError, BridgeConfig, BridgeDiagnostics, ConnectionStatus};

use crate::client::{ActuatorClient, ActuatorLink};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SupervisorError {
    #[error("a connection attempt is already in progress")]
    Busy,
    #[error("connection attempt failed: {0}")]
    Connect(#[source] ActuatorError),
    #[error("giving up after {attempts} connection attempts: {last}")]
    Exhausted { attempts: u32, last: ActuatorError },
    #[error("connection supervision cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorSettings {
    pub url: String,
    pub discovery_timeout: Duration,
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl From<&BridgeConfig> for SupervisorSettings {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            url: config.actuator_url.clone(),
            discovery_timeout: config.discovery_timeout(),
            max_attempts: config.connection_retries,
            retry_delay: config.retry_delay(),
        }
    }
}

/// Owns the actuator connection and is the only writer of [`ConnectionStatus`].
pub struct ConnectionSupervisor {
    client: Arc<dyn ActuatorClient>,
    settings: SupervisorSettings,
    status: watch::Sender<ConnectionStatus>,
    in_flight: AtomicBool,
    failures: AtomicU32,
    shutdown: CancellationToken,
    diagnostics: Arc<BridgeDiagnostics>,
}

/// Clears the in-flight flag even if the attempt is dropped mid-way.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ConnectionSupervisor {
    pub fn new(
        client: Arc<dyn ActuatorClient>,
        settings: SupervisorSettings,
        shutdown: CancellationToken,
        diagnostics: Arc<BridgeDiagnostics>,
    ) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::disconnected());
        Self {
            client,
            settings,
            status,
            in_flight: AtomicBool::new(false),
            failures: AtomicU32::new(0),
            shutdown,
            diagnostics,
        }
    }

    pub fn link(&self) -> ActuatorLink {
        ActuatorLink::new(self.client.clone(), self.status.subscribe())
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    /// Consecutive failed attempts since the last success.
    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }

    /// One connection attempt. Rejected with [`SupervisorError::Busy`] while
    /// another attempt is running; the running attempt is unaffected.
    pub async fn connect(&self) -> Result<(), SupervisorError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SupervisorError::Busy);
        }
        let _guard = InFlight(&self.in_flight);

        let previous = self.status.borrow().last_error.clone();
        self.status.send_replace(ConnectionStatus::connecting(previous));
        self.diagnostics.record_connection_attempt();
        info!(url = %self.settings.url, attempt = self.failures() + 1, "connecting to actuator service");

        match self.client.connect(&self.settings.url, self.settings.discovery_timeout).await {
            Ok(()) => {
                self.failures.store(0, Ordering::Release);
                self.status.send_replace(ConnectionStatus::connected());
                info!("actuator ready");
                Ok(())
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::AcqRel);
                self.status.send_replace(ConnectionStatus::failed(e.clone()));
                Err(SupervisorError::Connect(e))
            }
        }
    }

    /// Attempts until one succeeds, the attempt budget is spent, or shutdown
    /// begins. Attempts are spaced by the fixed retry delay.
    pub async fn run(&self) -> Result<(), SupervisorError> {
        loop {
            if self.shutdown.is_cancelled() {
                return Err(SupervisorError::Cancelled);
            }

            let last = match self.connect().await {
                Ok(()) => return Ok(()),
                Err(SupervisorError::Connect(e)) => e,
                Err(other) => return Err(other),
            };

            let attempts = self.failures();
            if attempts >= self.settings.max_attempts {
                error!(attempts, error = %last, "actuator connection failed; giving up");
                return Err(SupervisorError::Exhausted { attempts, last });
            }
            warn!(
                attempts,
                max = self.settings.max_attempts,
                error = %last,
                delay = ?self.settings.retry_delay,
                "actuator connection failed; retrying"
            );

            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(SupervisorError::Cancelled),
                _ = tokio::time::sleep(self.settings.retry_delay) => {}
            }
        }
    }

    /// Keeps the actuator connected. Runs the retry schedule until connected,
    /// then waits for the connection to drop, publishes the loss and starts a
    /// fresh schedule after the retry delay. Ends when a schedule is exhausted
    /// or shutdown begins.
    pub async fn supervise(&self) -> Result<(), SupervisorError> {
        loop {
            self.run().await?;

            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(SupervisorError::Cancelled),
                _ = self.client.closed() => {}
            }
            self.status.send_replace(ConnectionStatus::failed(ActuatorError::Closed));
            warn!(delay = ?self.settings.retry_delay, "actuator service connection lost; reconnecting");

            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(SupervisorError::Cancelled),
                _ = tokio::time::sleep(self.settings.retry_delay) => {}
            }
        }
    }

    pub async fn disconnect(&self) {
        self.client.disconnect().await;
        self.status.send_replace(ConnectionStatus::disconnected());
    }
}
