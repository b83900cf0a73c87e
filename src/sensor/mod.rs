//! Pressure transducer channels.
//!
//! A channel owns the link to one transducer and, once polling, publishes a
//! [`SensorSample`] every cycle into a latest-value cell. Two implementations
//! exist: [`SerialSensorChannel`] talks to real hardware and
//! [`crate::sim::SimulatedSensorChannel`] follows the simulated rig.

mod protocol;
mod reading;
mod serial;

pub use protocol::{parse_hex, SensorProtocol};
pub use reading::{PressureReading, SensorSample};
pub use serial::{LinkError, PollingConfig, SerialLink, SerialSensorChannel, BAUD_RATE};

use thiserror::Error;
use tokio::sync::watch;

/// Sensor connection, protocol and decoding errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SensorError {
    #[error("Sensor port is not set")]
    EmptyPort,
    #[error("Port {port} is already open")]
    AlreadyOpen { port: String },
    #[error("Failed to open port {port} (code {code})")]
    PortOpenFailed { port: String, code: i32 },
    #[error("Failed to configure port {port}: {reason}")]
    ConfigureFailed { port: String, reason: String },
    #[error("Sensor is not connected")]
    NotConnected,
    #[error("Port {port} is already polling")]
    AlreadyPolling { port: String },
    #[error("Write to {port} failed: sent {sent} of {total} bytes (code {code})")]
    WriteFailed {
        port: String,
        sent: usize,
        total: usize,
        code: i32,
    },
    #[error("Read from {port} failed (code {code})")]
    ReadFailed { port: String, code: i32 },
    #[error("Unexpected response length on {port}: got {got}, expected {expected}")]
    UnexpectedLength {
        port: String,
        got: usize,
        expected: usize,
    },
    #[error("Invalid pressure value received on {port}")]
    InvalidPressureValue { port: String },
    #[error("Invalid unit code {code} received on {port}")]
    InvalidUnitCode { port: String, code: u8 },
    #[error("Response offsets out of range on {port}: {detail}; check wiring and protocol settings")]
    IndexOutOfRange { port: String, detail: String },
}

impl SensorError {
    /// Whether the error comes from decoding a received frame.
    pub fn is_decode_failure(&self) -> bool {
        matches!(
            self,
            Self::UnexpectedLength { .. }
                | Self::InvalidPressureValue { .. }
                | Self::InvalidUnitCode { .. }
        )
    }
}

/// A polling session against one pressure transducer.
pub trait PressureSensorChannel: Send + Sync {
    /// Port the channel is bound to, if any.
    fn port(&self) -> Option<&str>;

    /// Whether this channel is the simulated stand-in.
    fn is_stub(&self) -> bool;

    fn is_connected(&self) -> bool;

    /// Open the port.
    fn connect(&mut self, port: &str) -> Result<(), SensorError>;

    /// Begin the cyclic request/response exchange.
    fn start_polling(&mut self) -> Result<(), SensorError>;

    fn is_polling(&self) -> bool;

    /// Stop polling. Does nothing when not polling.
    fn stop_polling(&mut self);

    /// Stop polling and release the port. Does nothing when not connected.
    fn disconnect(&mut self);

    /// Receiver of every published sample.
    fn subscribe(&self) -> watch::Receiver<Option<SensorSample>>;

    /// Most recently published sample.
    fn latest(&self) -> Option<SensorSample> {
        self.subscribe().borrow().clone()
    }
}
