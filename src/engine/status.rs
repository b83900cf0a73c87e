//! Status surface and the cloneable engine handle.

use chrono::{DateTime, Local};
use serde::Serialize;
use tokio::sync::watch;

use super::EngineState;
use crate::cell::LatestCell;
use crate::controller::{AbortHandle, ValveState};
use crate::units::PressureUnit;

/// Snapshot for an external status display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStatus {
    pub pressure: Option<f64>,
    pub unit: Option<PressureUnit>,
    pub rate: Option<f64>,
    pub sensor_error: Option<String>,
    pub valve_state: ValveState,
    pub valve_description: String,
    pub in_progress: bool,
    pub state: EngineState,
    pub captured_points: usize,
    pub planned_points: usize,
    pub started_at: Option<DateTime<Local>>,
    pub finished_at: Option<DateTime<Local>>,
}

impl EngineStatus {
    pub fn format_line(&self) -> String {
        let pressure = match (self.pressure, self.unit) {
            (Some(p), Some(u)) => format!("{:.3} {}", p, u),
            _ => self
                .sensor_error
                .clone()
                .unwrap_or_else(|| "no reading".to_string()),
        };
        format!(
            "{} | {} | {} | {}/{} points",
            self.state, pressure, self.valve_description, self.captured_points, self.planned_points
        )
    }
}

/// Clonable handle for other tasks: abort and status.
#[derive(Clone)]
pub struct EngineHandle {
    pub(crate) abort: AbortHandle,
    pub(crate) status: LatestCell<EngineStatus>,
}

impl EngineHandle {
    /// Stop the stand now; the running session ends at its next sample.
    pub fn abort(&self) {
        self.abort.abort();
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_aborted()
    }

    /// Latest published status.
    pub fn status(&self) -> Option<EngineStatus> {
        self.status.latest()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<Option<EngineStatus>> {
        self.status.subscribe()
    }
}
