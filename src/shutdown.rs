//! Ordered, once-only teardown.
//!
//! The first trigger flips the latch, cancels the root token and walks the
//! steps in [`TeardownStep::ORDER`]. A failing step is logged and the rest
//! still run. Every later trigger returns immediately.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStep {
    StopControlLoop,
    ReleaseActuation,
    DisconnectActuator,
    CloseListeners,
    StopActuatorServer,
}

impl TeardownStep {
    pub const ORDER: [TeardownStep; 5] = [
        TeardownStep::StopControlLoop,
        TeardownStep::ReleaseActuation,
        TeardownStep::DisconnectActuator,
        TeardownStep::CloseListeners,
        TeardownStep::StopActuatorServer,
    ];

    pub fn name(self) -> &'static str {
        match self {
            TeardownStep::StopControlLoop => "stop control loop",
            TeardownStep::ReleaseActuation => "release actuation",
            TeardownStep::DisconnectActuator => "disconnect actuator",
            TeardownStep::CloseListeners => "close listeners",
            TeardownStep::StopActuatorServer => "stop actuator server",
        }
    }
}

impl fmt::Display for TeardownStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{step} failed: {reason}")]
pub struct ShutdownError {
    pub step: TeardownStep,
    pub reason: String,
}

/// The resources torn down by the coordinator, one call per step.
#[async_trait]
pub trait Teardown: Send {
    async fn run_step(&mut self, step: TeardownStep) -> Result<(), ShutdownError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    Signal(&'static str),
    Fault(String),
}

impl ShutdownReason {
    pub fn is_fault(&self) -> bool {
        matches!(self, ShutdownReason::Fault(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownOutcome {
    Completed { failed_steps: Vec<TeardownStep>, exit_code: u8 },
    AlreadyInProgress,
}

pub struct ShutdownCoordinator<T> {
    in_progress: AtomicBool,
    token: CancellationToken,
    teardown: Mutex<Option<T>>,
}

impl<T: Teardown> ShutdownCoordinator<T> {
    pub fn new(token: CancellationToken, teardown: T) -> Self {
        Self { in_progress: AtomicBool::new(false), token, teardown: Mutex::new(Some(teardown)) }
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    pub async fn trigger(&self, reason: ShutdownReason) -> ShutdownOutcome {
        if self.in_progress.swap(true, Ordering::AcqRel) {
            info!(?reason, "shutdown already in progress");
            return ShutdownOutcome::AlreadyInProgress;
        }

        match &reason {
            ShutdownReason::Signal(signal) => info!(signal, "shutting down"),
            ShutdownReason::Fault(fault) => error!(fault = %fault, "unrecoverable error; shutting down"),
        }
        self.token.cancel();

        let Some(mut teardown) = self.teardown.lock().await.take() else {
            warn!("teardown resources already released");
            return ShutdownOutcome::Completed { failed_steps: Vec::new(), exit_code: 1 };
        };

        let mut failed_steps = Vec::new();
        for step in TeardownStep::ORDER {
            match teardown.run_step(step).await {
                Ok(()) => debug!(%step, "teardown step complete"),
                Err(e) => {
                    error!(error = %e, "teardown step failed");
                    failed_steps.push(step);
                }
            }
        }

        let exit_code = if failed_steps.is_empty() && !reason.is_fault() { 0 } else { 1 };
        info!(exit_code, "shutdown complete");
        ShutdownOutcome::Completed { failed_steps, exit_code }
    }
}

/// Resolves on SIGINT/Ctrl-C, or SIGTERM on unix.
pub async fn wait_for_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = ctrl_c() => "SIGINT",
                    _ = terminate.recv() => "SIGTERM",
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                ctrl_c().await;
                "SIGINT"
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c().await;
        "Ctrl-C"
    }
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}
