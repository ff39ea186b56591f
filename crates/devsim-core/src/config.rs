//! Simulator configuration.
//!
//! All identities, broker settings and topic names live in one immutable
//! [`SimulatorConfig`] record that is handed to the connection manager and
//! the telemetry publisher at construction time.
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `DEVSIM_*` environment variables, then command-line overrides.
//!
//! ```toml
//! device_id = "69039687a167f6e832c82529"
//! sensor_id = "690396b1a167f6e832c8252e"
//! publish_interval_secs = 5
//! qos = 1
//!
//! [broker]
//! host = "broker.hivemq.com"
//! port = 1883
//! keep_alive_secs = 60
//! ```

use std::path::Path;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, SimulatorError};

/// Default values used when nothing else is configured.
pub mod defaults {
    pub const BROKER_HOST: &str = "broker.hivemq.com";
    pub const BROKER_PORT: u16 = 1883;
    pub const KEEP_ALIVE_SECS: u64 = 60;
    /// Placeholder identities, meant to be replaced by the backend's real ids.
    pub const DEVICE_ID: &str = "69039687a167f6e832c82529";
    pub const SENSOR_ID: &str = "690396b1a167f6e832c8252e";
    pub const PUBLISH_INTERVAL_SECS: u64 = 5;
    pub const CLIENT_ID_PREFIX: &str = "device-sim-";
}

/// MQTT topic names.
pub mod topics {
    /// Topic every sensor reading is published to.
    pub const SENSOR_DATA: &str = "iot/sensor/data";
    /// Prefix of the per-device command topic.
    pub const CONTROL_COMMAND_PREFIX: &str = "iot/control/command/";

    /// Command topic for a device: the prefix followed by the device id.
    pub fn control_command(device_id: &str) -> String {
        format!("{}{}", CONTROL_COMMAND_PREFIX, device_id)
    }
}

/// Environment variable names.
pub mod env_vars {
    pub const BROKER_HOST: &str = "DEVSIM_BROKER_HOST";
    pub const BROKER_PORT: &str = "DEVSIM_BROKER_PORT";
    pub const CLIENT_ID: &str = "DEVSIM_CLIENT_ID";
    pub const DEVICE_ID: &str = "DEVSIM_DEVICE_ID";
    pub const SENSOR_ID: &str = "DEVSIM_SENSOR_ID";
    pub const PUBLISH_INTERVAL: &str = "DEVSIM_PUBLISH_INTERVAL";
    pub const LOG_JSON: &str = "DEVSIM_LOG_JSON";
}

/// MQTT QoS level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum Qos {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl Default for Qos {
    fn default() -> Self {
        Self::AtLeastOnce
    }
}

impl TryFrom<u8> for Qos {
    type Error = String;

    fn try_from(level: u8) -> std::result::Result<Self, Self::Error> {
        match level {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            2 => Ok(Qos::ExactlyOnce),
            other => Err(format!("invalid QoS level {}, expected 0, 1 or 2", other)),
        }
    }
}

impl From<Qos> for u8 {
    fn from(qos: Qos) -> Self {
        qos as u8
    }
}

impl From<Qos> for rumqttc::QoS {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => rumqttc::QoS::AtMostOnce,
            Qos::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            Qos::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

/// Broker connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker host name or address
    pub host: String,

    /// Broker port
    pub port: u16,

    /// Client ID (generated per run if not provided)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// Username for authentication
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Password for authentication
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Keep-alive interval in seconds
    pub keep_alive_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: defaults::BROKER_HOST.to_string(),
            port: defaults::BROKER_PORT,
            client_id: None,
            username: None,
            password: None,
            keep_alive_secs: defaults::KEEP_ALIVE_SECS,
        }
    }
}

impl BrokerConfig {
    /// Get the full broker address.
    pub fn broker_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

/// Complete simulator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Broker settings
    pub broker: BrokerConfig,

    /// Identity of the simulated device, scopes the command topic
    pub device_id: String,

    /// Identity of the simulated sensor, embedded in every reading
    pub sensor_id: String,

    /// Seconds between two readings
    pub publish_interval_secs: u64,

    /// QoS for the published readings and the command subscription
    pub qos: Qos,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            device_id: defaults::DEVICE_ID.to_string(),
            sensor_id: defaults::SENSOR_ID.to_string(),
            publish_interval_secs: defaults::PUBLISH_INTERVAL_SECS,
            qos: Qos::default(),
        }
    }
}

impl SimulatorConfig {
    /// Parse a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| SimulatorError::Configuration(format!("invalid config file: {}", e)))
    }

    /// Load a TOML config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        info!(category = "config", path = %path.display(), "Loaded config file");
        Ok(config)
    }

    /// Topic readings are published to.
    pub fn sensor_data_topic(&self) -> &'static str {
        topics::SENSOR_DATA
    }

    /// Topic this device listens to for control commands.
    pub fn command_topic(&self) -> String {
        topics::control_command(&self.device_id)
    }

    pub fn publish_interval(&self) -> Duration {
        Duration::from_secs(self.publish_interval_secs)
    }

    /// Apply `DEVSIM_*` variables from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_with(|name| std::env::var(name).ok())
    }

    /// Apply environment overrides using a custom lookup.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let overrides = ConfigOverrides {
            broker_host: lookup(env_vars::BROKER_HOST),
            broker_port: lookup(env_vars::BROKER_PORT)
                .map(|v| parse_env_number(env_vars::BROKER_PORT, &v))
                .transpose()?,
            client_id: lookup(env_vars::CLIENT_ID),
            device_id: lookup(env_vars::DEVICE_ID),
            sensor_id: lookup(env_vars::SENSOR_ID),
            publish_interval_secs: lookup(env_vars::PUBLISH_INTERVAL)
                .map(|v| parse_env_number(env_vars::PUBLISH_INTERVAL, &v))
                .transpose()?,
            ..Default::default()
        };
        self.apply(overrides);
        Ok(())
    }

    /// Apply explicit overrides (command-line flags).
    pub fn apply(&mut self, overrides: ConfigOverrides) {
        if let Some(host) = overrides.broker_host {
            self.broker.host = host;
        }
        if let Some(port) = overrides.broker_port {
            self.broker.port = port;
        }
        if let Some(client_id) = overrides.client_id {
            self.broker.client_id = Some(client_id);
        }
        if let Some(username) = overrides.username {
            self.broker.username = Some(username);
        }
        if let Some(password) = overrides.password {
            self.broker.password = Some(password);
        }
        if let Some(keep_alive) = overrides.keep_alive_secs {
            self.broker.keep_alive_secs = keep_alive;
        }
        if let Some(device_id) = overrides.device_id {
            self.device_id = device_id;
        }
        if let Some(sensor_id) = overrides.sensor_id {
            self.sensor_id = sensor_id;
        }
        if let Some(interval) = overrides.publish_interval_secs {
            self.publish_interval_secs = interval;
        }
    }

    /// Check the configuration before any connection is attempted.
    pub fn validate(&self) -> Result<()> {
        if self.broker.host.trim().is_empty() {
            return Err(SimulatorError::Configuration("broker host is empty".into()));
        }
        if self.device_id.trim().is_empty() {
            return Err(SimulatorError::Configuration("device_id is empty".into()));
        }
        if self.sensor_id.trim().is_empty() {
            return Err(SimulatorError::Configuration("sensor_id is empty".into()));
        }
        if let Some(client_id) = &self.broker.client_id {
            if client_id.trim().is_empty() {
                return Err(SimulatorError::Configuration("client_id is empty".into()));
            }
        }
        if self.publish_interval_secs == 0 {
            return Err(SimulatorError::Configuration(
                "publish interval must be at least 1 second".into(),
            ));
        }
        if self.broker.username.is_some() != self.broker.password.is_some() {
            return Err(SimulatorError::Configuration(
                "username and password must be set together".into(),
            ));
        }
        Ok(())
    }
}

/// Optional overrides layered on top of a [`SimulatorConfig`].
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub broker_host: Option<String>,
    pub broker_port: Option<u16>,
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: Option<u64>,
    pub device_id: Option<String>,
    pub sensor_id: Option<String>,
    pub publish_interval_secs: Option<u64>,
}

/// Generate a per-run client identifier of the form `device-sim-NNNN`.
pub fn generate_client_id() -> String {
    let suffix: u16 = rand::thread_rng().gen_range(1000..=9999);
    format!("{}{}", defaults::CLIENT_ID_PREFIX, suffix)
}

fn parse_env_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        SimulatorError::Configuration(format!("{} has an invalid value: {:?}", name, value))
    })
}
