//! Preload coefficients keyed by gauge upper limit and pressure unit.

use serde::{Deserialize, Serialize};

use super::GaugeModel;
use crate::units::PressureUnit;

/// One row of the preload table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PreloadEntry {
    /// Gauge upper limit this coefficient applies to.
    pub upper_limit: f64,
    /// Unit the upper limit is expressed in.
    pub unit: PressureUnit,
    /// Preload coefficient.
    pub coefficient: f64,
}

impl PreloadEntry {
    pub fn new(upper_limit: f64, unit: PressureUnit, coefficient: f64) -> Self {
        Self {
            upper_limit,
            unit,
            coefficient,
        }
    }
}

/// Mapping (upper limit, unit) -> preload coefficient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PreloadTable {
    entries: Vec<PreloadEntry>,
}

impl Default for PreloadTable {
    /// Factory table of the four-channel stand: 0.26 for the 600/400
    /// ranges, 0.35 for 250 and 0.87 for 160/100/60 (MPa ranges are the
    /// kgf ranges divided by ten).
    fn default() -> Self {
        let mut entries = Vec::new();
        for (limit_kgf, limit_mpa, coefficient) in [
            (600.0, 60.0, 0.26),
            (400.0, 40.0, 0.26),
            (250.0, 25.0, 0.35),
            (160.0, 16.0, 0.87),
            (100.0, 10.0, 0.87),
            (60.0, 6.0, 0.87),
        ] {
            entries.push(PreloadEntry::new(limit_kgf, PressureUnit::Kgf, coefficient));
            entries.push(PreloadEntry::new(limit_kgf, PressureUnit::Atm, coefficient));
            entries.push(PreloadEntry::new(limit_mpa, PressureUnit::MPa, coefficient));
        }
        Self { entries }
    }
}

impl PreloadTable {
    /// Create an empty table.
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Create a table from explicit entries.
    pub fn from_entries(entries: Vec<PreloadEntry>) -> Self {
        Self { entries }
    }

    /// Add or replace the coefficient for a limit/unit pair.
    pub fn with_entry(mut self, upper_limit: f64, unit: PressureUnit, coefficient: f64) -> Self {
        self.entries
            .retain(|e| !(e.unit == unit && limits_match(e.upper_limit, upper_limit)));
        self.entries
            .push(PreloadEntry::new(upper_limit, unit, coefficient));
        self
    }

    pub fn entries(&self) -> &[PreloadEntry] {
        &self.entries
    }

    /// Look up the coefficient for a gauge upper limit in `unit`.
    pub fn coefficient(&self, upper_limit: f64, unit: PressureUnit) -> Option<f64> {
        self.entries
            .iter()
            .find(|e| e.unit == unit && limits_match(e.upper_limit, upper_limit))
            .map(|e| e.coefficient)
    }

    /// Preload pressure for `model` in the model unit: the first scale
    /// node above zero times the coefficient for the model's range.
    pub fn preload_limit(&self, model: &GaugeModel) -> Option<f64> {
        let coefficient = self.coefficient(model.upper_limit(), model.unit())?;
        let points = model.scale_points();
        let node = points.get(1).or(points.last())?;
        Some(node.pressure * coefficient)
    }
}

fn limits_match(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-9 * a.abs().max(b.abs()).max(1.0)
}
