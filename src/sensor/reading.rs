//! Pressure readings published by sensor channels.

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use super::SensorError;
use crate::units::PressureUnit;

/// One decoded pressure sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PressureReading {
    /// Measured value in `unit`.
    pub value: f64,
    /// Unit reported by the transducer.
    pub unit: PressureUnit,
    /// Rate of change in `unit` per second, from the previous sample.
    pub rate: f64,
    /// Monotonic sample counter of the channel.
    pub sequence: u64,
    /// Wall-clock time of the sample.
    pub timestamp: DateTime<Utc>,
    /// Monotonic time of the sample, used for staleness checks.
    pub received_at: Instant,
    /// Whether the value passed decoding checks.
    pub valid: bool,
}

impl PressureReading {
    /// Build a reading taken now, computing the rate from `previous`.
    pub fn new(
        value: f64,
        unit: PressureUnit,
        sequence: u64,
        previous: Option<&PressureReading>,
    ) -> Self {
        let received_at = Instant::now();
        let rate = previous
            .map(|prev| {
                let dt = received_at.duration_since(prev.received_at).as_secs_f64();
                if dt < 0.0001 {
                    0.0
                } else {
                    (value - prev.unit.convert(prev.value, unit)) / dt
                }
            })
            .unwrap_or(0.0);
        Self {
            value,
            unit,
            rate,
            sequence,
            timestamp: Utc::now(),
            received_at,
            valid: value.is_finite(),
        }
    }

    /// Value converted to `unit`.
    pub fn value_in(&self, unit: PressureUnit) -> f64 {
        self.unit.convert(self.value, unit)
    }

    /// Rate converted to `unit` per second.
    pub fn rate_in(&self, unit: PressureUnit) -> f64 {
        self.unit.convert(self.rate, unit)
    }

    /// Age of the reading.
    pub fn age(&self) -> std::time::Duration {
        self.received_at.elapsed()
    }
}

/// What a channel publishes every polling cycle.
pub type SensorSample = Result<PressureReading, SensorError>;
