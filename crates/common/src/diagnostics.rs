use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by the telemetry server, control loop and supervisor.
#[derive(Default, Debug)]
pub struct BridgeDiagnostics {
    pub samples_accepted: AtomicU64,
    pub samples_ignored: AtomicU64,
    pub engage_commands: AtomicU64,
    pub disengage_commands: AtomicU64,
    pub command_failures: AtomicU64,
    pub connection_attempts: AtomicU64,
}

/// Plain copy of the counters, for logging and assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiagnosticsSnapshot {
    pub samples_accepted: u64,
    pub samples_ignored: u64,
    pub engage_commands: u64,
    pub disengage_commands: u64,
    pub command_failures: u64,
    pub connection_attempts: u64,
}

impl BridgeDiagnostics {
    pub fn record_sample(&self) {
        self.samples_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ignored_sample(&self) {
        self.samples_ignored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_engage(&self) {
        self.engage_commands.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disengage(&self) {
        self.disengage_commands.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_command_failure(&self) {
        self.command_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            samples_accepted: self.samples_accepted.load(Ordering::Relaxed),
            samples_ignored: self.samples_ignored.load(Ordering::Relaxed),
            engage_commands: self.engage_commands.load(Ordering::Relaxed),
            disengage_commands: self.disengage_commands.load(Ordering::Relaxed),
            command_failures: self.command_failures.load(Ordering::Relaxed),
            connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
        }
    }
}
