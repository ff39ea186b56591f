//! Message payloads exchanged with the broker.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One synthetic sensor measurement, published as
/// `{"sensorId": "...", "value": 23.57}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorReading {
    pub sensor_id: String,
    pub value: f64,
}

impl SensorReading {
    pub fn new(sensor_id: impl Into<String>, value: f64) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            value,
        }
    }

    /// Encode as the JSON payload sent over the wire.
    pub fn to_payload(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// Control command addressed to this device.
///
/// Both fields are optional: a missing key and an explicit `null` are both
/// treated as absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlCommand {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl ControlCommand {
    /// Decode a raw command payload.
    pub fn from_payload(payload: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(payload)
    }

    /// Interpret the value as a switch position.
    ///
    /// Accepts booleans and the integers `0`/`1`; anything else is `None`.
    pub fn switch_state(&self) -> Option<bool> {
        match self.value.as_ref()? {
            Value::Bool(on) => Some(*on),
            Value::Number(n) => match n.as_u64() {
                Some(0) => Some(false),
                Some(1) => Some(true),
                _ => None,
            },
            _ => None,
        }
    }
}
