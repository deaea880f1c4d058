use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use common::{
    ActuationState, ActuatorError, BridgeDiagnostics, HeartRateSample, ManualCommand, StatusUpdate,
};

use crate::client::ActuatorLink;

/// Manual override from the dashboard, answered once the command has run.
#[derive(Debug)]
pub struct ManualRequest {
    pub command: ManualCommand,
    pub reply: oneshot::Sender<Result<ActuationState, ActuatorError>>,
}

/// Heart-rate driven actuation.
///
/// Level-triggered: each tick recomputes the desired state from the latest
/// sample and the current state, so a failed command is simply tried again
/// on the next tick. `state` only changes after the device confirms.
pub struct ControlLoop {
    link: ActuatorLink,
    threshold: HeartRateSample,
    sample: Option<HeartRateSample>,
    state: ActuationState,
    status: watch::Sender<StatusUpdate>,
    diagnostics: Arc<BridgeDiagnostics>,
    shutdown: CancellationToken,
}

impl ControlLoop {
    pub fn new(
        link: ActuatorLink,
        threshold: HeartRateSample,
        status: watch::Sender<StatusUpdate>,
        diagnostics: Arc<BridgeDiagnostics>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            link,
            threshold,
            sample: None,
            state: ActuationState::Disengaged,
            status,
            diagnostics,
            shutdown,
        }
    }

    pub fn state(&self) -> ActuationState {
        self.state
    }

    pub fn sample(&self) -> Option<HeartRateSample> {
        self.sample
    }

    pub fn record_sample(&mut self, bpm: HeartRateSample) {
        self.sample = Some(bpm);
        self.publish();
    }

    /// One evaluation. Returns the new state if a command was issued and succeeded.
    pub async fn tick(&mut self) -> Option<ActuationState> {
        if !self.link.is_ready() || self.shutdown.is_cancelled() {
            return None;
        }
        let bpm = self.sample?;
        let desired = ActuationState::for_sample(bpm, self.threshold);
        if desired == self.state {
            return None;
        }

        match self.command(desired).await {
            Ok(()) => {
                info!(bpm, threshold = self.threshold, state = ?desired, "actuation changed");
                Some(desired)
            }
            Err(e) => {
                warn!(bpm, state = ?desired, error = %e, "actuator command failed; will retry next tick");
                None
            }
        }
    }

    pub async fn apply_manual(&mut self, command: ManualCommand) -> Result<ActuationState, ActuatorError> {
        if self.shutdown.is_cancelled() {
            return Err(ActuatorError::ShuttingDown);
        }
        if !self.link.is_ready() {
            return Err(ActuatorError::NotReady);
        }
        self.command(command.target()).await?;
        info!(?command, state = ?self.state, "manual override applied");
        Ok(self.state)
    }

    async fn command(&mut self, target: ActuationState) -> Result<(), ActuatorError> {
        let result = match target {
            ActuationState::Engaged => self.link.engage().await,
            ActuationState::Disengaged => self.link.disengage().await,
        };
        match &result {
            Ok(()) => {
                match target {
                    ActuationState::Engaged => self.diagnostics.record_engage(),
                    ActuationState::Disengaged => self.diagnostics.record_disengage(),
                }
                self.state = target;
                self.publish();
            }
            Err(_) => self.diagnostics.record_command_failure(),
        }
        result
    }

    fn publish(&self) {
        self.status.send_replace(StatusUpdate {
            heart_rate: self.sample.unwrap_or_default(),
            actuation_state: self.state,
        });
    }

    /// Drives ticks, samples and manual requests from one task until shutdown.
    /// Returns the final actuation state.
    pub async fn run(
        mut self,
        period: Duration,
        mut samples: mpsc::Receiver<HeartRateSample>,
        mut manual: mpsc::Receiver<ManualRequest>,
    ) -> ActuationState {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(threshold = self.threshold, ?period, "control loop started");

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick().await;
                }
                Some(bpm) = samples.recv() => {
                    debug!(bpm, "sample recorded");
                    self.record_sample(bpm);
                }
                Some(request) = manual.recv() => {
                    let result = self.apply_manual(request.command).await;
                    if request.reply.send(result).is_err() {
                        debug!("manual command requester went away");
                    }
                }
            }
        }

        info!(state = ?self.state, "control loop stopped");
        self.state
    }
}
