//! IoT Device Simulator Core
//!
//! Simulates a single IoT device on an MQTT broker: it publishes a synthetic
//! temperature reading on a fixed cadence and logs the control commands
//! addressed to it.
//!
//! ## Architecture
//!
//! - **ConnectionManager**: MQTT session, background network service, reconnection
//! - **CommandListener**: decodes and logs commands on `iot/control/command/<device>`
//! - **TelemetryPublisher**: builds and publishes readings on `iot/sensor/data`
//! - **Simulator**: main loop, owns the lifetime until shutdown
//!
//! All components are configured from one immutable [`SimulatorConfig`].

pub mod config;
pub mod connection;
pub mod error;
pub mod listener;
pub mod model;
pub mod simulator;
pub mod telemetry;

// Re-exports for convenience
pub use config::{BrokerConfig, ConfigOverrides, Qos, SimulatorConfig, generate_client_id};
pub use connection::{ConnectionManager, DeviceSession, SessionState};
pub use error::{Result, SimulatorError};
pub use listener::{CommandListener, CommandOutcome, ConnectOutcome, SessionListener};
pub use model::{ControlCommand, SensorReading};
pub use simulator::{RunReport, Simulator, SimulatorState, shutdown_signal};
pub use telemetry::{TEMPERATURE_RANGE, TelemetryPublisher};
