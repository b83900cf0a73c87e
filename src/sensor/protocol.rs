//! Request/response framing of the pressure transducer.

use serde::{Deserialize, Serialize};

use super::SensorError;
use crate::units::PressureUnit;

/// Fixed-format exchange with the transducer: one request, one fixed-length
/// response carrying a 4-byte float and a unit code at known offsets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorProtocol {
    /// Bytes sent every cycle.
    pub request: Vec<u8>,
    /// Expected response length in bytes.
    pub response_length: usize,
    /// Offsets of the float bytes, in the order they are assembled.
    /// Descending offsets mean the device sends little-endian.
    pub pressure_byte_indices: [usize; 4],
    /// Offset of the unit code byte.
    pub unit_byte_index: usize,
}

impl Default for SensorProtocol {
    fn default() -> Self {
        Self {
            request: vec![0x01],
            response_length: 5,
            pressure_byte_indices: [4, 3, 2, 1],
            unit_byte_index: 0,
        }
    }
}

impl SensorProtocol {
    pub fn with_request(mut self, request: impl Into<Vec<u8>>) -> Self {
        self.request = request.into();
        self
    }

    pub fn with_response_length(mut self, length: usize) -> Self {
        self.response_length = length;
        self
    }

    pub fn with_pressure_byte_indices(mut self, indices: [usize; 4]) -> Self {
        self.pressure_byte_indices = indices;
        self
    }

    pub fn with_unit_byte_index(mut self, index: usize) -> Self {
        self.unit_byte_index = index;
        self
    }

    /// Check that every configured offset lies inside the response.
    pub fn validate(&self, port: &str) -> Result<(), SensorError> {
        let bad_pressure = self
            .pressure_byte_indices
            .iter()
            .any(|&i| i >= self.response_length);
        if bad_pressure || self.unit_byte_index >= self.response_length {
            return Err(SensorError::IndexOutOfRange {
                port: port.to_string(),
                detail: format!(
                    "pressure offsets {:?} / unit offset {} outside a {}-byte response",
                    self.pressure_byte_indices, self.unit_byte_index, self.response_length
                ),
            });
        }
        if self.request.is_empty() {
            return Err(SensorError::ConfigureFailed {
                port: port.to_string(),
                reason: "empty request frame".to_string(),
            });
        }
        Ok(())
    }

    /// Decode a response frame into a value and unit.
    pub fn decode(&self, port: &str, frame: &[u8]) -> Result<(f64, PressureUnit), SensorError> {
        if frame.len() != self.response_length {
            return Err(SensorError::UnexpectedLength {
                port: port.to_string(),
                got: frame.len(),
                expected: self.response_length,
            });
        }
        self.validate(port)?;

        let idx = self.pressure_byte_indices;
        let bytes = [frame[idx[0]], frame[idx[1]], frame[idx[2]], frame[idx[3]]];
        let ascending = idx.windows(2).all(|w| w[0] <= w[1]);
        let descending = idx.windows(2).all(|w| w[0] >= w[1]);
        let value = if ascending && !descending {
            f32::from_be_bytes(bytes)
        } else {
            f32::from_le_bytes(bytes)
        };
        if !value.is_finite() {
            return Err(SensorError::InvalidPressureValue {
                port: port.to_string(),
            });
        }

        let code = frame[self.unit_byte_index];
        let unit = PressureUnit::from_sensor_code(code).ok_or_else(|| {
            SensorError::InvalidUnitCode {
                port: port.to_string(),
                code,
            }
        })?;
        Ok((value as f64, unit))
    }
}

/// Parse a hex string such as `"01"` or `"01 03 00"` into bytes.
pub fn parse_hex(text: &str) -> Option<Vec<u8>> {
    let digits: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.is_empty() || digits.len() % 2 != 0 {
        return None;
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&digits[i..i + 2], 16).ok())
        .collect()
}
