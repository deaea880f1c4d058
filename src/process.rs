use std::process::Stdio;

use tokio::process::{Child, Command};
use tracing::info;

use common::ActuatorServerConfig;

/// Locally launched actuator-service process, killed on shutdown (or drop).
pub struct ActuatorServerProcess {
    program: String,
    child: Child,
}

impl ActuatorServerProcess {
    pub fn spawn(config: &ActuatorServerConfig) -> std::io::Result<Self> {
        let child = Command::new(&config.program)
            .args(&config.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        info!(program = %config.program, pid = ?child.id(), "started actuator server");
        Ok(Self { program: config.program.clone(), child })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub async fn terminate(mut self) -> std::io::Result<()> {
        if let Some(status) = self.child.try_wait()? {
            info!(program = %self.program, %status, "actuator server had already exited");
            return Ok(());
        }
        self.child.kill().await?;
        info!(program = %self.program, "actuator server stopped");
        Ok(())
    }
}
