//! The single active calibration session.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::catalog::GaugeModel;
use crate::controller::{PressureController, Step, StrokeMode};
use crate::table::{GraduationTable, NonlinearityReport};
use crate::units::PressureUnit;

/// Engine lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    Idle,
    Ready,
    Running,
    AwaitingOperator,
    Paused,
    Complete,
    Aborted,
    Faulted,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::AwaitingOperator => "awaiting operator",
            Self::Paused => "paused",
            Self::Complete => "complete",
            Self::Aborted => "aborted",
            Self::Faulted => "faulted",
        };
        f.write_str(s)
    }
}

/// State of one graduation from `initialize` until it completes or ends.
pub struct CalibrationSession {
    pub(crate) id: Uuid,
    pub(crate) model: Arc<GaugeModel>,
    pub(crate) unit: PressureUnit,
    pub(crate) mode: StrokeMode,
    pub(crate) state: EngineState,
    pub(crate) controller: PressureController,
    pub(crate) steps: Vec<Step>,
    pub(crate) cursor: usize,
    pub(crate) aligned: bool,
    pub(crate) table: GraduationTable,
    pub(crate) started_at: DateTime<Local>,
    pub(crate) telemetry_dir: Option<PathBuf>,
}

impl CalibrationSession {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn model(&self) -> &Arc<GaugeModel> {
        &self.model
    }

    pub fn unit(&self) -> PressureUnit {
        self.unit
    }

    pub fn mode(&self) -> StrokeMode {
        self.mode
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn controller(&self) -> &PressureController {
        &self.controller
    }

    /// Planned ramps in execution order.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Next step to execute.
    pub fn next_step(&self) -> Option<Step> {
        self.steps.get(self.cursor).copied()
    }

    pub fn table(&self) -> &GraduationTable {
        &self.table
    }

    pub fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }

    /// Directory of the telemetry series, once recording started.
    pub fn telemetry_dir(&self) -> Option<&Path> {
        self.telemetry_dir.as_deref()
    }
}

/// What remains of a session once it ended.
#[derive(Debug, Clone)]
pub struct ArchivedSession {
    pub id: Uuid,
    pub model: Arc<GaugeModel>,
    pub table: GraduationTable,
    pub outcome: EngineState,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    pub telemetry_dir: Option<PathBuf>,
}

impl ArchivedSession {
    pub fn report(&self) -> NonlinearityReport {
        self.table.compute_nonlinearity(&self.model)
    }
}
