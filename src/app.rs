use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use actuation::{
    ActuatorClient, ActuatorLink, ConnectionSupervisor, ControlLoop, IntifaceClient, SupervisorError,
    SupervisorSettings,
};
use common::{ActuationState, BridgeConfig, BridgeDiagnostics, StatusUpdate};
use telemetry_server::TelemetryServer;

use crate::dashboard::DashboardServer;
use crate::process::ActuatorServerProcess;
use crate::shutdown::{
    wait_for_signal, ShutdownCoordinator, ShutdownError, ShutdownOutcome, ShutdownReason, Teardown,
    TeardownStep,
};

const SAMPLE_QUEUE: usize = 64;
const MANUAL_QUEUE: usize = 16;
const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Spawns `fut`, reporting a panic on `faults` instead of losing it in the JoinHandle.
fn spawn_guarded<F, T>(name: &'static str, fut: F, faults: mpsc::UnboundedSender<String>) -> JoinHandle<Option<T>>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(async move {
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(value) => Some(value),
            Err(_) => {
                error!(task = name, "task panicked");
                let _ = faults.send(format!("{name} panicked"));
                None
            }
        }
    })
}

/// Joins a guarded task. A task still running after [`STEP_TIMEOUT`] is
/// aborted and reaped before the error is returned.
async fn join_within<T>(name: &str, mut handle: JoinHandle<Option<T>>) -> Result<T, String> {
    match tokio::time::timeout(STEP_TIMEOUT, &mut handle).await {
        Ok(Ok(Some(value))) => Ok(value),
        Ok(Ok(None)) => Err(format!("{name} had panicked")),
        Ok(Err(e)) => Err(format!("{name}: {e}")),
        Err(_) => {
            handle.abort();
            let _ = handle.await;
            Err(format!("{name} did not stop within {STEP_TIMEOUT:?}; aborted"))
        }
    }
}

/// Everything the shutdown sequence has to take down.
pub struct AppResources {
    controller: Option<JoinHandle<Option<ActuationState>>>,
    final_state: Option<ActuationState>,
    link: ActuatorLink,
    status: watch::Receiver<StatusUpdate>,
    supervisor: Arc<ConnectionSupervisor>,
    supervisor_task: Option<JoinHandle<()>>,
    listeners_stop: CancellationToken,
    telemetry: Option<JoinHandle<Option<()>>>,
    dashboard: Option<JoinHandle<Option<()>>>,
    server_process: Option<ActuatorServerProcess>,
    diagnostics: Arc<BridgeDiagnostics>,
}

impl AppResources {
    async fn stop_control_loop(&mut self) -> Result<(), String> {
        let Some(handle) = self.controller.take() else {
            return Ok(());
        };
        let state = join_within("control loop", handle).await?;
        debug!(?state, "control loop joined");
        self.final_state = Some(state);
        Ok(())
    }

    /// Uses the loop's own final state; the last published status stands in
    /// when the loop could not be joined.
    async fn release_actuation(&mut self) -> Result<(), String> {
        let state = self.final_state.unwrap_or_else(|| self.status.borrow().actuation_state);
        let engaged = state.is_engaged();
        if !engaged || !self.link.is_ready() {
            debug!(engaged, "nothing to release");
            return Ok(());
        }
        match self.link.disengage().await {
            Ok(()) => {
                self.diagnostics.record_disengage();
                info!("actuator disengaged for shutdown");
                Ok(())
            }
            Err(e) => {
                self.diagnostics.record_command_failure();
                Err(e.to_string())
            }
        }
    }

    async fn disconnect_actuator(&mut self) -> Result<(), String> {
        if let Some(task) = self.supervisor_task.take() {
            task.abort();
            let _ = task.await;
        }
        self.supervisor.disconnect().await;
        Ok(())
    }

    async fn close_listeners(&mut self) -> Result<(), String> {
        self.listeners_stop.cancel();
        let mut problems = Vec::new();
        if let Some(handle) = self.telemetry.take() {
            if let Err(e) = join_within("telemetry server", handle).await {
                problems.push(e);
            }
        }
        if let Some(handle) = self.dashboard.take() {
            if let Err(e) = join_within("dashboard", handle).await {
                problems.push(e);
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems.join("; "))
        }
    }

    async fn stop_actuator_server(&mut self) -> Result<(), String> {
        let Some(process) = self.server_process.take() else {
            return Ok(());
        };
        debug!(pid = ?process.id(), "stopping actuator server");
        process.terminate().await.map_err(|e| e.to_string())
    }
}

#[async_trait]
impl Teardown for AppResources {
    async fn run_step(&mut self, step: TeardownStep) -> Result<(), ShutdownError> {
        let result = match step {
            TeardownStep::StopControlLoop => self.stop_control_loop().await,
            TeardownStep::ReleaseActuation => self.release_actuation().await,
            TeardownStep::DisconnectActuator => self.disconnect_actuator().await,
            TeardownStep::CloseListeners => self.close_listeners().await,
            TeardownStep::StopActuatorServer => self.stop_actuator_server().await,
        };
        result.map_err(|reason| ShutdownError { step, reason })
    }
}

/// Wires every component, waits for a signal or a fault, then shuts down.
/// Returns the process exit code.
pub async fn run(config: BridgeConfig) -> anyhow::Result<u8> {
    let diagnostics = Arc::new(BridgeDiagnostics::default());
    let shutdown = CancellationToken::new();
    let listeners_stop = CancellationToken::new();
    let (fault_tx, mut fault_rx) = mpsc::unbounded_channel();

    let (sample_tx, sample_rx) = mpsc::channel(SAMPLE_QUEUE);
    let (manual_tx, manual_rx) = mpsc::channel(MANUAL_QUEUE);
    let (status_tx, status_rx) = watch::channel(StatusUpdate::default());

    let telemetry = TelemetryServer::bind(
        &config.telemetry_addr(),
        &config.heart_rate_field,
        sample_tx,
        diagnostics.clone(),
    )
    .await?;
    let dashboard = DashboardServer::bind(&config.dashboard_addr(), status_rx.clone(), manual_tx).await?;

    let server_process = match &config.actuator_server {
        Some(server) => Some(
            ActuatorServerProcess::spawn(server)
                .with_context(|| format!("failed to start actuator server {}", server.program))?,
        ),
        None => None,
    };

    let client: Arc<dyn ActuatorClient> = Arc::new(IntifaceClient::new(config.client_name.clone()));
    let supervisor = Arc::new(ConnectionSupervisor::new(
        client,
        SupervisorSettings::from(&config),
        shutdown.clone(),
        diagnostics.clone(),
    ));
    let link = supervisor.link();
    let control = ControlLoop::new(
        link.clone(),
        config.heart_rate_threshold,
        status_tx,
        diagnostics.clone(),
        shutdown.clone(),
    );

    let controller = spawn_guarded(
        "control loop",
        control.run(config.tick_interval(), sample_rx, manual_rx),
        fault_tx.clone(),
    );
    let telemetry = spawn_guarded("telemetry server", telemetry.run(listeners_stop.clone()), fault_tx.clone());
    let dashboard = spawn_guarded("dashboard", dashboard.run(listeners_stop.clone()), fault_tx);
    let supervisor_task = tokio::spawn({
        let supervisor = supervisor.clone();
        async move {
            match supervisor.supervise().await {
                Ok(()) | Err(SupervisorError::Cancelled) => {}
                Err(e) => warn!(error = %e, "actuator unavailable until restart"),
            }
        }
    });

    let coordinator = Arc::new(ShutdownCoordinator::new(
        shutdown,
        AppResources {
            controller: Some(controller),
            final_state: None,
            link,
            status: status_rx,
            supervisor,
            supervisor_task: Some(supervisor_task),
            listeners_stop,
            telemetry: Some(telemetry),
            dashboard: Some(dashboard),
            server_process,
            diagnostics: diagnostics.clone(),
        },
    ));

    let reason = tokio::select! {
        signal = wait_for_signal() => ShutdownReason::Signal(signal),
        Some(fault) = fault_rx.recv() => ShutdownReason::Fault(fault),
    };

    // Signals that arrive while tearing down hit the latch and do nothing.
    let repeat = tokio::spawn({
        let coordinator = coordinator.clone();
        async move {
            loop {
                let signal = wait_for_signal().await;
                coordinator.trigger(ShutdownReason::Signal(signal)).await;
            }
        }
    });

    let outcome = coordinator.trigger(reason).await;
    repeat.abort();

    let summary = diagnostics.snapshot();
    info!(
        samples = summary.samples_accepted,
        ignored = summary.samples_ignored,
        engages = summary.engage_commands,
        disengages = summary.disengage_commands,
        failures = summary.command_failures,
        connection_attempts = summary.connection_attempts,
        "bridge stopped"
    );

    Ok(match outcome {
        ShutdownOutcome::Completed { exit_code, .. } => exit_code,
        ShutdownOutcome::AlreadyInProgress => 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{ActuatorError, ConnectionStatus};
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;

    type Events = Arc<StdMutex<Vec<&'static str>>>;

    #[derive(Default)]
    struct MockActuator {
        disengages: AtomicU32,
        failing: AtomicBool,
        unready: AtomicBool,
        events: Events,
    }

    #[async_trait]
    impl ActuatorClient for MockActuator {
        async fn connect(&self, _url: &str, _discovery: Duration) -> Result<(), ActuatorError> {
            Ok(())
        }

        async fn engage(&self) -> Result<(), ActuatorError> {
            Ok(())
        }

        async fn disengage(&self) -> Result<(), ActuatorError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(ActuatorError::Transport("boom".into()));
            }
            self.disengages.fetch_add(1, Ordering::SeqCst);
            self.events.lock().unwrap().push("disengage");
            Ok(())
        }

        fn is_ready(&self) -> bool {
            !self.unready.load(Ordering::SeqCst)
        }

        async fn closed(&self) {
            std::future::pending::<()>().await
        }

        async fn disconnect(&self) {
            self.events.lock().unwrap().push("disconnect");
        }
    }

    /// Logs its label when dropped, which happens when the owning task is aborted.
    struct OnDrop(Events, &'static str);

    impl Drop for OnDrop {
        fn drop(&mut self) {
            self.0.lock().unwrap().push(self.1);
        }
    }

    async fn resources(actuator: Arc<MockActuator>, published: ActuationState) -> AppResources {
        let diagnostics = Arc::new(BridgeDiagnostics::default());
        let supervisor = Arc::new(ConnectionSupervisor::new(
            actuator,
            SupervisorSettings {
                url: "ws://127.0.0.1:1".into(),
                discovery_timeout: Duration::from_secs(1),
                max_attempts: 1,
                retry_delay: Duration::from_secs(1),
            },
            CancellationToken::new(),
            diagnostics.clone(),
        ));
        supervisor.connect().await.unwrap();
        let (_, status) = watch::channel(StatusUpdate { heart_rate: 80, actuation_state: published });

        AppResources {
            controller: None,
            final_state: None,
            link: supervisor.link(),
            status,
            supervisor,
            supervisor_task: None,
            listeners_stop: CancellationToken::new(),
            telemetry: None,
            dashboard: None,
            server_process: None,
            diagnostics,
        }
    }

    fn finished_loop(state: ActuationState) -> JoinHandle<Option<ActuationState>> {
        tokio::spawn(async move { Some(state) })
    }

    #[tokio::test]
    async fn release_uses_the_loops_final_state() {
        let actuator = Arc::new(MockActuator::default());
        let mut res = resources(actuator.clone(), ActuationState::Disengaged).await;
        res.controller = Some(finished_loop(ActuationState::Engaged));

        res.run_step(TeardownStep::StopControlLoop).await.unwrap();
        res.run_step(TeardownStep::ReleaseActuation).await.unwrap();

        assert_eq!(actuator.disengages.load(Ordering::SeqCst), 1);
        assert_eq!(res.diagnostics.snapshot().disengage_commands, 1);
    }

    #[tokio::test]
    async fn nothing_to_release_when_disengaged() {
        let actuator = Arc::new(MockActuator::default());
        let mut res = resources(actuator.clone(), ActuationState::Engaged).await;
        res.controller = Some(finished_loop(ActuationState::Disengaged));

        res.run_step(TeardownStep::StopControlLoop).await.unwrap();
        res.run_step(TeardownStep::ReleaseActuation).await.unwrap();

        assert_eq!(actuator.disengages.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn nothing_to_release_when_not_ready() {
        let actuator = Arc::new(MockActuator::default());
        let mut res = resources(actuator.clone(), ActuationState::Engaged).await;
        res.controller = Some(finished_loop(ActuationState::Engaged));
        actuator.unready.store(true, Ordering::SeqCst);

        res.run_step(TeardownStep::StopControlLoop).await.unwrap();
        res.run_step(TeardownStep::ReleaseActuation).await.unwrap();

        assert_eq!(actuator.disengages.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_release_is_reported() {
        let actuator = Arc::new(MockActuator::default());
        actuator.failing.store(true, Ordering::SeqCst);
        let mut res = resources(actuator.clone(), ActuationState::Engaged).await;

        let err = res.run_step(TeardownStep::ReleaseActuation).await.unwrap_err();
        assert_eq!(err.step, TeardownStep::ReleaseActuation);
        assert_eq!(res.diagnostics.snapshot().command_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_control_loop_is_aborted_before_release() {
        let actuator = Arc::new(MockActuator::default());
        let mut res = resources(actuator.clone(), ActuationState::Engaged).await;
        let guard = OnDrop(actuator.events.clone(), "control loop dropped");
        res.controller = Some(tokio::spawn(async move {
            let _guard = guard;
            std::future::pending::<Option<ActuationState>>().await
        }));

        let err = res.run_step(TeardownStep::StopControlLoop).await.unwrap_err();
        assert_eq!(err.step, TeardownStep::StopControlLoop);
        res.run_step(TeardownStep::ReleaseActuation).await.unwrap();

        // Published status stands in for the unjoined loop.
        assert_eq!(*actuator.events.lock().unwrap(), vec!["control loop dropped", "disengage"]);
    }

    #[tokio::test]
    async fn supervisor_is_stopped_before_disconnecting() {
        let actuator = Arc::new(MockActuator::default());
        let mut res = resources(actuator.clone(), ActuationState::Disengaged).await;
        let guard = OnDrop(actuator.events.clone(), "supervisor stopped");
        res.supervisor_task = Some(tokio::spawn(async move {
            let _guard = guard;
            std::future::pending::<()>().await
        }));

        res.run_step(TeardownStep::DisconnectActuator).await.unwrap();

        assert_eq!(*actuator.events.lock().unwrap(), vec!["supervisor stopped", "disconnect"]);
        assert_eq!(res.supervisor.status(), ConnectionStatus::disconnected());
        assert!(!res.link.is_ready());
    }

    #[tokio::test]
    async fn closing_listeners_is_not_held_up_by_idle_connections() {
        let actuator = Arc::new(MockActuator::default());
        let mut res = resources(actuator, ActuationState::Disengaged).await;
        let (samples, _samples_rx) = mpsc::channel(1);
        let server = TelemetryServer::bind("127.0.0.1:0", "heartrate", samples, res.diagnostics.clone())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let (faults, _faults_rx) = mpsc::unbounded_channel();
        res.telemetry = Some(spawn_guarded("telemetry server", server.run(res.listeners_stop.clone()), faults));

        let _idle = tokio::net::TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = std::time::Instant::now();
        res.run_step(TeardownStep::CloseListeners).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn clean_shutdown_releases_and_exits_zero() {
        let actuator = Arc::new(MockActuator::default());
        let mut res = resources(actuator.clone(), ActuationState::Engaged).await;
        res.controller = Some(finished_loop(ActuationState::Engaged));
        let coordinator = ShutdownCoordinator::new(CancellationToken::new(), res);

        let outcome = coordinator.trigger(ShutdownReason::Signal("SIGINT")).await;

        assert_eq!(outcome, ShutdownOutcome::Completed { failed_steps: vec![], exit_code: 0 });
        assert_eq!(*actuator.events.lock().unwrap(), vec!["disengage", "disconnect"]);
    }
}
