//! Telemetry side of the bridge.
//!
//! Heart-rate producers speak a small subset of the OBS WebSocket v5
//! control protocol. They believe they are updating a text source; the
//! server picks out updates to the configured input name and forwards the
//! parsed bpm to the control loop.

pub mod error;
pub mod protocol;
pub mod server;
pub mod session;

pub use error::TelemetryError;
pub use server::TelemetryServer;
pub use session::{FieldUpdate, Handled, ProtocolSession};
