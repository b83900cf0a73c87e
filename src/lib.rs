// Copyright 2025 Graduator contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # Graduator
//!
//! Automatic graduation of analog pressure gauges.
//!
//! The stand ramps pressure through a motor and an inlet/outlet valve pair,
//! reads the true pressure from a serial transducer and the needle angle from
//! a camera pipeline, and records a pressure-to-angle table that is checked
//! against the gauge model from the catalog.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use graduator::{
//!     load, EngineConfig, GraduationEngine, PreloadTable, PressureSensorChannel, RigConfig,
//!     SimulatedNeedle, SimulatedRig, SimulatedSensorChannel, StrokeMode,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let catalog = load("models")?;
//!     let model = catalog.models[0].clone();
//!
//!     let rig = SimulatedRig::new(RigConfig::default().with_unit(model.unit()));
//!     let mut sensor = SimulatedSensorChannel::new(rig.clone(), Duration::from_millis(20));
//!     sensor.connect("SIM")?;
//!     sensor.start_polling()?;
//!
//!     let needle = Arc::new(SimulatedNeedle::new(rig.clone(), model.clone()));
//!     let mut engine = GraduationEngine::new(
//!         EngineConfig::default(),
//!         Box::new(sensor),
//!         needle,
//!         Arc::new(rig),
//!         PreloadTable::default(),
//!     );
//!     let mut checkpoints = engine.take_checkpoints().expect("fresh engine");
//!     tokio::spawn(async move {
//!         while let Some(request) = checkpoints.recv().await {
//!             request.confirm();
//!         }
//!     });
//!
//!     engine.initialize(Some(model.clone()), Some(model.unit()), StrokeMode::ForwardAndBackward)?;
//!     let table = engine.run().await?;
//!     let report = table.compute_nonlinearity(&model);
//!     println!("max deviation {:.3} deg, passed: {}", report.max_abs_deviation, report.passed);
//!     Ok(())
//! }
//! ```

pub mod archive;
pub mod catalog;
pub mod cell;
pub mod controller;
pub mod engine;
pub mod journal;
pub mod sensor;
pub mod settings;
pub mod sim;
pub mod table;
pub mod telemetry;
pub mod units;
pub mod vision;

pub use archive::{ArchiveError, ResultArchive, ResultRecord};
pub use catalog::{
    load, CatalogError, CatalogEvent, CatalogLoad, GaugeCatalog, GaugeModel, ModelError,
    PreloadEntry, PreloadTable, ScalePoint,
};
pub use cell::LatestCell;
pub use controller::{
    AbortHandle, Actuator, ActuatorCommand, ActuatorError, ControllerConfig, ControllerError,
    ControllerState, Direction, PressureController, StrokeMode, ValveState,
};
pub use engine::{
    Anomaly, ArchivedSession, CalibrationSession, CheckpointRequest, Decision, EngineConfig,
    EngineError, EngineHandle, EngineState, EngineStatus, GraduationEngine, PauseReason,
};
pub use journal::{JournalEntry, JournalLevel, SessionJournal};
pub use sensor::{
    PollingConfig, PressureReading, PressureSensorChannel, SensorError, SensorProtocol,
    SensorSample, SerialSensorChannel,
};
pub use settings::GraduatorSettings;
pub use sim::{FaultInjector, RigConfig, SimulatedNeedle, SimulatedRig, SimulatedSensorChannel};
pub use table::{GraduationPoint, GraduationTable, NonlinearityReport, TableError};
pub use telemetry::{TelemetryConfig, TelemetryError, TelemetryRecorder};
pub use units::PressureUnit;
pub use vision::{AngleFeed, AngleReading, NeedleAngleSource};
