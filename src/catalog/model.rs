//! Gauge model records.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::units::PressureUnit;

/// Gauge model invariant violations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("Gauge model has no scale points")]
    NoScalePoints,
    #[error("Scale point {index} is not finite")]
    NonFinite { index: usize },
    #[error("Scale pressure not increasing at point {index}: {previous} -> {current}")]
    NonIncreasingPressure {
        index: usize,
        previous: f64,
        current: f64,
    },
    #[error("Scale angle not increasing at point {index}: {previous} -> {current}")]
    NonIncreasingAngle {
        index: usize,
        previous: f64,
        current: f64,
    },
    #[error("Accuracy class must be positive, got {0}")]
    NonPositiveAccuracyClass(f64),
}

/// A (pressure, expected needle angle) pair on the gauge dial.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScalePoint {
    /// Pressure in the model's unit.
    pub pressure: f64,
    /// Expected needle angle in degrees, relative to the first point.
    pub angle: f64,
}

impl ScalePoint {
    pub fn new(pressure: f64, angle: f64) -> Self {
        Self { pressure, angle }
    }
}

/// Immutable description of a gauge model loaded from the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaugeModel {
    pub(crate) name: String,
    pub(crate) unit: PressureUnit,
    pub(crate) printing_template: String,
    pub(crate) accuracy_class: f64,
    pub(crate) scale_points: Vec<ScalePoint>,
}

impl GaugeModel {
    /// Build a model and check its invariants.
    pub fn new(
        name: impl Into<String>,
        unit: PressureUnit,
        accuracy_class: f64,
        scale_points: Vec<ScalePoint>,
    ) -> Result<Self, ModelError> {
        let model = Self {
            name: name.into(),
            unit,
            printing_template: String::new(),
            accuracy_class,
            scale_points,
        };
        model.validate()?;
        Ok(model)
    }

    /// Attach the printing template name carried by the catalog file.
    pub fn with_printing_template(mut self, template: impl Into<String>) -> Self {
        self.printing_template = template.into();
        self
    }

    /// Check the model invariants: at least one point, strictly increasing
    /// pressure and angle, positive accuracy class.
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.scale_points.is_empty() {
            return Err(ModelError::NoScalePoints);
        }
        if !(self.accuracy_class > 0.0) || !self.accuracy_class.is_finite() {
            return Err(ModelError::NonPositiveAccuracyClass(self.accuracy_class));
        }
        for (index, point) in self.scale_points.iter().enumerate() {
            if !point.pressure.is_finite() || !point.angle.is_finite() {
                return Err(ModelError::NonFinite { index });
            }
        }
        for (index, pair) in self.scale_points.windows(2).enumerate() {
            let (prev, cur) = (pair[0], pair[1]);
            if cur.pressure <= prev.pressure {
                return Err(ModelError::NonIncreasingPressure {
                    index: index + 1,
                    previous: prev.pressure,
                    current: cur.pressure,
                });
            }
            if cur.angle <= prev.angle {
                return Err(ModelError::NonIncreasingAngle {
                    index: index + 1,
                    previous: prev.angle,
                    current: cur.angle,
                });
            }
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unit(&self) -> PressureUnit {
        self.unit
    }

    pub fn printing_template(&self) -> &str {
        &self.printing_template
    }

    pub fn accuracy_class(&self) -> f64 {
        self.accuracy_class
    }

    pub fn scale_points(&self) -> &[ScalePoint] {
        &self.scale_points
    }

    /// Node pressures in the model's unit.
    pub fn pressures(&self) -> Vec<f64> {
        self.scale_points.iter().map(|p| p.pressure).collect()
    }

    /// Highest scale pressure (the gauge's upper limit).
    pub fn upper_limit(&self) -> f64 {
        self.scale_points.last().map(|p| p.pressure).unwrap_or(0.0)
    }

    /// Angle swept by the needle between the first and last scale point.
    pub fn angle_span(&self) -> f64 {
        match (self.scale_points.first(), self.scale_points.last()) {
            (Some(first), Some(last)) => last.angle - first.angle,
            _ => 0.0,
        }
    }

    /// Expected needle angle at `pressure` (model unit).
    ///
    /// Linear between neighbouring scale points, extrapolated from the
    /// outermost segment beyond the scale ends.
    pub fn expected_angle_at(&self, pressure: f64) -> f64 {
        let points = &self.scale_points;
        match points.len() {
            0 => 0.0,
            1 => points[0].angle,
            n => {
                let segment = points
                    .windows(2)
                    .position(|w| pressure <= w[1].pressure)
                    .unwrap_or(n - 2);
                let (a, b) = (points[segment], points[segment + 1]);
                let t = (pressure - a.pressure) / (b.pressure - a.pressure);
                a.angle + t * (b.angle - a.angle)
            }
        }
    }
}
