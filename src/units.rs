//! Pressure units and conversions.
//!
//! Every conversion goes through kilopascals, matching how the stand's
//! transducer and the catalog files express values.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Pressure unit understood by the sensor, the catalog and the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PressureUnit {
    Pa,
    KPa,
    MPa,
    Bar,
    /// kgf/cm²
    Kgf,
    /// kgf/m²
    KgfM2,
    Atm,
    MmHg,
    MmH2O,
}

impl PressureUnit {
    /// All supported units, in sensor code order.
    pub const ALL: [PressureUnit; 9] = [
        PressureUnit::Kgf,
        PressureUnit::MPa,
        PressureUnit::KPa,
        PressureUnit::Pa,
        PressureUnit::KgfM2,
        PressureUnit::Atm,
        PressureUnit::MmHg,
        PressureUnit::MmH2O,
        PressureUnit::Bar,
    ];

    /// Map the transducer's one-byte unit code.
    pub fn from_sensor_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(PressureUnit::Kgf),
            2 => Some(PressureUnit::MPa),
            3 => Some(PressureUnit::KPa),
            4 => Some(PressureUnit::Pa),
            5 => Some(PressureUnit::KgfM2),
            6 => Some(PressureUnit::Atm),
            7 => Some(PressureUnit::MmHg),
            8 => Some(PressureUnit::MmH2O),
            9 => Some(PressureUnit::Bar),
            _ => None,
        }
    }

    /// Key used in catalog files and settings.
    pub fn key(&self) -> &'static str {
        match self {
            PressureUnit::Pa => "Pa",
            PressureUnit::KPa => "kPa",
            PressureUnit::MPa => "MPa",
            PressureUnit::Bar => "bar",
            PressureUnit::Kgf => "kgf/cm2",
            PressureUnit::KgfM2 => "kgf/m2",
            PressureUnit::Atm => "atm",
            PressureUnit::MmHg => "mmHg",
            PressureUnit::MmH2O => "mmH2O",
        }
    }

    /// Number of kilopascals in one unit.
    fn kpa_factor(&self) -> f64 {
        match self {
            PressureUnit::Pa => 0.001,
            PressureUnit::KPa => 1.0,
            PressureUnit::MPa => 1000.0,
            PressureUnit::Bar => 100.0,
            PressureUnit::Kgf => 98.0665,
            PressureUnit::KgfM2 => 9.80665 / 1000.0,
            PressureUnit::Atm => 101.325,
            PressureUnit::MmHg => 133.322 / 1000.0,
            PressureUnit::MmH2O => 9.80665 / 1000.0,
        }
    }

    /// Convert `value` expressed in `self` into `target`.
    pub fn convert(&self, value: f64, target: PressureUnit) -> f64 {
        if *self == target {
            return value;
        }
        value * self.kpa_factor() / target.kpa_factor()
    }
}

impl fmt::Display for PressureUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Error for unrecognized unit keys.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Unknown pressure unit: {0}")]
pub struct UnknownUnit(pub String);

impl FromStr for PressureUnit {
    type Err = UnknownUnit;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('²', "2");
        let unit = match normalized.as_str() {
            "pa" => PressureUnit::Pa,
            "kpa" => PressureUnit::KPa,
            "mpa" => PressureUnit::MPa,
            "bar" => PressureUnit::Bar,
            "kgf" | "kgf/cm2" | "kgf/cm" => PressureUnit::Kgf,
            "kgf/m2" | "kgf/m" => PressureUnit::KgfM2,
            "atm" => PressureUnit::Atm,
            "mmhg" => PressureUnit::MmHg,
            "mmh2o" => PressureUnit::MmH2O,
            _ => return Err(UnknownUnit(s.trim().to_string())),
        };
        Ok(unit)
    }
}
