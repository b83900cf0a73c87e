//! Automatic graduation engine.
//!
//! Drives the pressure controller through the scale points of a gauge model,
//! fuses the latest pressure and needle readings at every held point and
//! builds the graduation table. Anomalies suspend the run on an operator
//! checkpoint.

mod checkpoint;
mod config;
mod graduation;
mod session;
mod status;

pub use checkpoint::{Anomaly, CheckpointRequest, Decision};
pub use config::EngineConfig;
pub use graduation::{EngineError, GraduationEngine, PauseReason};
pub use session::{ArchivedSession, CalibrationSession, EngineState};
pub use status::{EngineHandle, EngineStatus};
