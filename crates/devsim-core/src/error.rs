//! Error types for the device simulator.

use thiserror::Error;

/// Result type used across the simulator.
pub type Result<T> = std::result::Result<T, SimulatorError>;

/// Simulator error.
#[derive(Debug, Error)]
pub enum SimulatorError {
    /// Invalid or inconsistent configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Operation requires a client session that does not exist yet
    #[error("Client is not connected")]
    NotConnected,

    /// Broker connection or session error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Outbound publish could not be handed to the transport
    #[error("Publish failed: {0}")]
    Publish(String),

    /// JSON encoding/decoding error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error (config files)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A reading could not be published; carries the encoded reading
    #[error("Reading {payload} not published: {source}")]
    ReadingNotPublished {
        payload: String,
        #[source]
        source: Box<SimulatorError>,
    },
}
