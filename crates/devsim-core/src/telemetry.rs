//! Synthetic telemetry.

use std::ops::RangeInclusive;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

use crate::config::{Qos, SimulatorConfig};
use crate::connection::DeviceSession;
use crate::error::{Result, SimulatorError};
use crate::model::SensorReading;

/// Simulated ambient temperature range, in degrees Celsius.
pub const TEMPERATURE_RANGE: RangeInclusive<f64> = 20.0..=30.0;

/// Produces one temperature reading per call and publishes it.
pub struct TelemetryPublisher {
    sensor_id: String,
    topic: String,
    qos: Qos,
    rng: StdRng,
}

impl TelemetryPublisher {
    pub fn new(config: &SimulatorConfig) -> Self {
        Self {
            sensor_id: config.sensor_id.clone(),
            topic: config.sensor_data_topic().to_string(),
            qos: config.qos,
            rng: StdRng::from_entropy(),
        }
    }

    /// Use a fixed seed so the sequence of readings is reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Draw the next reading: uniform over [`TEMPERATURE_RANGE`], two decimals.
    pub fn next_reading(&mut self) -> SensorReading {
        let raw = self.rng.gen_range(TEMPERATURE_RANGE);
        SensorReading::new(self.sensor_id.clone(), round_to_hundredths(raw))
    }

    /// Build, serialize and publish one reading.
    ///
    /// Transport errors are returned to the caller as-is; nothing is retried.
    pub async fn publish_once<S>(&mut self, session: &mut S) -> Result<SensorReading>
    where
        S: DeviceSession + ?Sized,
    {
        let reading = self.next_reading();
        let payload = reading.to_payload()?;
        let text = String::from_utf8_lossy(&payload).into_owned();

        if let Err(e) = session.publish(&self.topic, payload, self.qos).await {
            return Err(SimulatorError::ReadingNotPublished {
                payload: text,
                source: Box::new(e),
            });
        }
        info!(category = "telemetry", topic = %self.topic, "Published: {}", text);
        Ok(reading)
    }
}

fn round_to_hundredths(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
