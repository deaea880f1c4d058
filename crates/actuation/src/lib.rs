//! Actuator side of the bridge: the device-service client, the connection
//! supervisor and the heart-rate control loop.

pub mod client;
pub mod control;
pub mod intiface;
pub mod supervisor;

pub use client::{ActuatorClient, ActuatorLink};
pub use control::{ControlLoop, ManualRequest};
pub use intiface::IntifaceClient;
pub use supervisor::{ConnectionSupervisor, SupervisorError, SupervisorSettings};
