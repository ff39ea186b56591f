//! Session listeners.
//!
//! The connection manager reports connection results and inbound messages to
//! a [`SessionListener`]. [`CommandListener`] is the production listener: it
//! decodes control commands for this device and logs them.

use serde_json::Value;
use tracing::{error, info, warn};

use crate::model::ControlCommand;

/// Result of a connection attempt, as reported by the background service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// Broker accepted the session
    Accepted { session_present: bool },
    /// Broker answered with a non-success return code
    Refused(String),
    /// Transport-level failure before any answer from the broker
    Failed(String),
}

/// Receives session events from the connection manager.
///
/// Called from the background service task, so implementations must not
/// block for long.
pub trait SessionListener: Send + Sync {
    /// Called once per connection attempt that reached a conclusion.
    fn on_connect(&self, outcome: &ConnectOutcome);

    /// Called for every inbound publish.
    fn on_message(&self, topic: &str, payload: &[u8]);
}

/// What the command listener did with one message.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    /// Command decoded and logged
    Received(ControlCommand),
    /// Payload could not be decoded; the reason was logged
    Rejected(String),
    /// Message arrived on a topic other than the command topic
    Ignored,
}

/// Logs control commands addressed to one device.
#[derive(Debug, Clone)]
pub struct CommandListener {
    command_topic: String,
}

impl CommandListener {
    pub fn new(command_topic: impl Into<String>) -> Self {
        Self {
            command_topic: command_topic.into(),
        }
    }

    pub fn command_topic(&self) -> &str {
        &self.command_topic
    }

    /// Decode and log one inbound message. Never fails.
    pub fn handle(&self, topic: &str, payload: &[u8]) -> CommandOutcome {
        if topic != self.command_topic {
            warn!(category = "command", topic = %topic, "Ignoring message on unexpected topic");
            return CommandOutcome::Ignored;
        }

        let text = match std::str::from_utf8(payload) {
            Ok(text) => text,
            Err(e) => {
                let reason = format!("payload is not valid UTF-8: {}", e);
                error!(category = "command", "Error processing command: {}", reason);
                return CommandOutcome::Rejected(reason);
            }
        };

        match ControlCommand::from_payload(text.as_bytes()) {
            Ok(command) => {
                let control = command.control_id.as_deref().unwrap_or("null");
                let value = command
                    .value
                    .as_ref()
                    .map(display_value)
                    .unwrap_or_else(|| "null".to_string());
                info!(
                    category = "command",
                    switch = ?command.switch_state(),
                    "Control {} changed to {}",
                    control,
                    value
                );
                CommandOutcome::Received(command)
            }
            Err(e) => {
                let reason = format!("invalid command JSON: {}", e);
                error!(category = "command", "Error processing command: {}", reason);
                CommandOutcome::Rejected(reason)
            }
        }
    }
}

/// Render a command value for the log. Strings are shown without quotes.
fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl SessionListener for CommandListener {
    fn on_connect(&self, outcome: &ConnectOutcome) {
        match outcome {
            ConnectOutcome::Accepted { session_present } => {
                info!(
                    category = "mqtt",
                    session_present = *session_present,
                    "Connected, listening for commands on {}",
                    self.command_topic
                );
            }
            ConnectOutcome::Refused(code) => {
                error!(category = "mqtt", "Connection refused by broker, code: {}", code);
            }
            ConnectOutcome::Failed(reason) => {
                error!(category = "mqtt", "Connection failed: {}", reason);
            }
        }
    }

    fn on_message(&self, topic: &str, payload: &[u8]) {
        let _ = self.handle(topic, payload);
    }
}
