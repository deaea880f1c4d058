use serde::Deserialize;
use std::fs;
use std::time::Duration;

use crate::error::ConfigError;

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    pub bind_address: String,
    pub telemetry_port: u16,
    pub dashboard_port: u16,
    pub heart_rate_field: String, // input name carrying the bpm text
    pub actuator_url: String,
    pub client_name: String,
    pub connection_retries: u32, // total attempts, not re-attempts
    pub retry_delay_ms: u64,
    pub discovery_timeout_ms: u64,
    pub heart_rate_threshold: u32,
    pub tick_interval_ms: u64,
    pub actuator_server: Option<ActuatorServerConfig>,
}

/// Local actuator-service process to launch before connecting.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ActuatorServerConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            telemetry_port: 4455,
            dashboard_port: 3000,
            heart_rate_field: "heartrate".to_string(),
            actuator_url: "ws://127.0.0.1:12345".to_string(),
            client_name: "heart-rate-bridge".to_string(),
            connection_retries: 5,
            retry_delay_ms: 5_000,
            discovery_timeout_ms: 10_000,
            heart_rate_threshold: 100,
            tick_interval_ms: 500,
            actuator_server: None,
        }
    }
}

pub fn load_config(path: &str) -> Result<BridgeConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_string(),
        source,
    })?;
    let config: BridgeConfig = toml::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

impl BridgeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connection_retries == 0 {
            return Err(ConfigError::Invalid("connection_retries must be at least 1".into()));
        }
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid("tick_interval_ms must be positive".into()));
        }
        if self.heart_rate_field.trim().is_empty() {
            return Err(ConfigError::Invalid("heart_rate_field must not be empty".into()));
        }
        if let Some(server) = &self.actuator_server {
            if server.program.trim().is_empty() {
                return Err(ConfigError::Invalid("actuator_server.program must not be empty".into()));
            }
        }
        Ok(())
    }

    pub fn telemetry_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.telemetry_port)
    }

    pub fn dashboard_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.dashboard_port)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}
