//! Graduation table: captured (pressure, angle) points per stroke direction.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::controller::{Direction, StrokeMode};
use crate::units::PressureUnit;

const TARGET_EPSILON: f64 = 1e-9;

/// Table errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TableError {
    #[error("Out-of-order {direction} point: target {target} after {previous}")]
    OutOfOrder {
        direction: Direction,
        previous: f64,
        target: f64,
    },
    #[error("Table is finalized")]
    Finalized,
    #[error("{direction} points are not part of a {mode:?} table")]
    DirectionNotInMode {
        direction: Direction,
        mode: StrokeMode,
    },
    #[error("Table has no points")]
    Empty,
    #[error("Forward targets {forward:?} do not match backward targets {backward:?}")]
    UnmatchedTargets {
        forward: Vec<f64>,
        backward: Vec<f64>,
    },
    #[error("No {direction} point at index {index}")]
    NoSuchPoint { direction: Direction, index: usize },
    #[error("Failed to access {path}: {reason}")]
    Io { path: String, reason: String },
    #[error("Invalid table file {path}: {reason}")]
    Format { path: String, reason: String },
}

/// One captured point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GraduationPoint {
    /// Requested pressure, in the table unit.
    pub target: f64,
    /// Pressure measured at capture, in the table unit.
    pub pressure: f64,
    /// Needle angle at capture, in degrees.
    pub angle: f64,
    pub direction: Direction,
    pub timestamp: DateTime<Utc>,
    pub accepted: bool,
}

impl GraduationPoint {
    pub fn new(target: f64, pressure: f64, angle: f64, direction: Direction) -> Self {
        Self {
            target,
            pressure,
            angle,
            direction,
            timestamp: Utc::now(),
            accepted: true,
        }
    }
}

/// Points captured during one graduation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraduationTable {
    model_name: String,
    unit: PressureUnit,
    mode: StrokeMode,
    forward: Vec<GraduationPoint>,
    backward: Vec<GraduationPoint>,
    finalized: bool,
    created_at: DateTime<Utc>,
}

impl GraduationTable {
    pub fn new(model_name: impl Into<String>, unit: PressureUnit, mode: StrokeMode) -> Self {
        Self {
            model_name: model_name.into(),
            unit,
            mode,
            forward: Vec::new(),
            backward: Vec::new(),
            finalized: false,
            created_at: Utc::now(),
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn unit(&self) -> PressureUnit {
        self.unit
    }

    pub fn mode(&self) -> StrokeMode {
        self.mode
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn points(&self, direction: Direction) -> &[GraduationPoint] {
        match direction {
            Direction::Forward => &self.forward,
            Direction::Backward => &self.backward,
        }
    }

    /// Forward points followed by backward points.
    pub fn all_points(&self) -> impl Iterator<Item = &GraduationPoint> {
        self.forward.iter().chain(self.backward.iter())
    }

    pub fn len(&self) -> usize {
        self.forward.len() + self.backward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a point, keeping forward targets ascending and backward
    /// targets descending.
    pub fn add_point(&mut self, point: GraduationPoint) -> Result<(), TableError> {
        if self.finalized {
            return Err(TableError::Finalized);
        }
        if !self.mode.directions().contains(&point.direction) {
            return Err(TableError::DirectionNotInMode {
                direction: point.direction,
                mode: self.mode,
            });
        }
        let points = match point.direction {
            Direction::Forward => &mut self.forward,
            Direction::Backward => &mut self.backward,
        };
        if let Some(last) = points.last() {
            let ordered = match point.direction {
                Direction::Forward => point.target > last.target,
                Direction::Backward => point.target < last.target,
            };
            if !ordered {
                return Err(TableError::OutOfOrder {
                    direction: point.direction,
                    previous: last.target,
                    target: point.target,
                });
            }
        }
        points.push(point);
        Ok(())
    }

    /// Exclude a point from evaluation.
    pub fn mark_rejected(&mut self, direction: Direction, index: usize) -> Result<(), TableError> {
        if self.finalized {
            return Err(TableError::Finalized);
        }
        let points = match direction {
            Direction::Forward => &mut self.forward,
            Direction::Backward => &mut self.backward,
        };
        let point = points
            .get_mut(index)
            .ok_or(TableError::NoSuchPoint { direction, index })?;
        point.accepted = false;
        Ok(())
    }

    /// Copy of the table with the listed points rejected by the operator,
    /// finalized again. `self` is left untouched.
    pub fn review(&self, rejected: &[(Direction, usize)]) -> Result<Self, TableError> {
        let mut reviewed = self.clone();
        reviewed.finalized = false;
        for &(direction, index) in rejected {
            reviewed.mark_rejected(direction, index)?;
        }
        reviewed.finalize()?;
        Ok(reviewed)
    }

    /// Freeze the table after checking the stroke-mode invariant.
    pub fn finalize(&mut self) -> Result<(), TableError> {
        if self.finalized {
            return Ok(());
        }
        if self.forward.is_empty() {
            return Err(TableError::Empty);
        }
        if self.mode == StrokeMode::ForwardAndBackward {
            let forward: Vec<f64> = self.forward.iter().map(|p| p.target).collect();
            let mut backward: Vec<f64> = self.backward.iter().map(|p| p.target).collect();
            backward.reverse();
            let matched = forward.len() == backward.len()
                && forward
                    .iter()
                    .zip(&backward)
                    .all(|(f, b)| (f - b).abs() <= TARGET_EPSILON);
            if !matched {
                return Err(TableError::UnmatchedTargets { forward, backward });
            }
        }
        self.finalized = true;
        Ok(())
    }

    /// Common column: angle swept between the first and last accepted point
    /// of a direction.
    pub fn angle_span(&self, direction: Direction) -> Option<f64> {
        let mut accepted = self.points(direction).iter().filter(|p| p.accepted);
        let first = accepted.next()?;
        let last = accepted.last().unwrap_or(first);
        Some((last.angle - first.angle).abs())
    }

    /// Backward point captured at the same target as `target`.
    pub(crate) fn backward_at(&self, target: f64) -> Option<&GraduationPoint> {
        self.backward
            .iter()
            .find(|p| p.accepted && (p.target - target).abs() <= TARGET_EPSILON)
    }

    /// Write the table as pretty JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), TableError> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self).map_err(|e| TableError::Format {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_error(path, e))?;
        }
        std::fs::write(path, json).map_err(|e| io_error(path, e))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TableError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| io_error(path, e))?;
        serde_json::from_str(&content).map_err(|e| TableError::Format {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }
}

fn io_error(path: &Path, e: std::io::Error) -> TableError {
    TableError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(target: f64, angle: f64, direction: Direction) -> GraduationPoint {
        GraduationPoint::new(target, target, angle, direction)
    }

    #[test]
    fn test_add_point_enforces_order() {
        let mut table = GraduationTable::new("M", PressureUnit::Kgf, StrokeMode::ForwardAndBackward);
        table.add_point(point(5.0, 45.0, Direction::Forward)).unwrap();
        table.add_point(point(10.0, 90.0, Direction::Forward)).unwrap();
        assert_eq!(
            table.add_point(point(10.0, 90.0, Direction::Forward)),
            Err(TableError::OutOfOrder {
                direction: Direction::Forward,
                previous: 10.0,
                target: 10.0
            })
        );

        table.add_point(point(10.0, 90.5, Direction::Backward)).unwrap();
        assert!(matches!(
            table.add_point(point(12.0, 100.0, Direction::Backward)),
            Err(TableError::OutOfOrder { .. })
        ));
        table.add_point(point(5.0, 45.5, Direction::Backward)).unwrap();
        assert_eq!(table.len(), 4);
    }

    #[test]
    fn test_forward_only_rejects_backward() {
        let mut table = GraduationTable::new("M", PressureUnit::Kgf, StrokeMode::ForwardOnly);
        assert!(matches!(
            table.add_point(point(5.0, 45.0, Direction::Backward)),
            Err(TableError::DirectionNotInMode { .. })
        ));
    }

    #[test]
    fn test_finalize_checks_matching_targets() {
        let mut table = GraduationTable::new("M", PressureUnit::Kgf, StrokeMode::ForwardAndBackward);
        table.add_point(point(5.0, 45.0, Direction::Forward)).unwrap();
        table.add_point(point(10.0, 90.0, Direction::Forward)).unwrap();
        table.add_point(point(10.0, 90.0, Direction::Backward)).unwrap();
        assert!(matches!(
            table.finalize(),
            Err(TableError::UnmatchedTargets { .. })
        ));

        table.add_point(point(5.0, 45.0, Direction::Backward)).unwrap();
        table.finalize().unwrap();
        assert!(table.is_finalized());
        assert_eq!(
            table.add_point(point(1.0, 1.0, Direction::Backward)),
            Err(TableError::Finalized)
        );
        assert_eq!(
            table.mark_rejected(Direction::Forward, 0),
            Err(TableError::Finalized)
        );
    }

    #[test]
    fn test_angle_span_skips_rejected() {
        let mut table = GraduationTable::new("M", PressureUnit::Kgf, StrokeMode::ForwardOnly);
        table.add_point(point(0.0, 0.0, Direction::Forward)).unwrap();
        table.add_point(point(5.0, 45.0, Direction::Forward)).unwrap();
        table.add_point(point(10.0, 91.0, Direction::Forward)).unwrap();
        assert_eq!(table.angle_span(Direction::Forward), Some(91.0));

        table.mark_rejected(Direction::Forward, 2).unwrap();
        assert_eq!(table.angle_span(Direction::Forward), Some(45.0));
        assert_eq!(table.angle_span(Direction::Backward), None);
        assert!(matches!(
            table.mark_rejected(Direction::Forward, 7),
            Err(TableError::NoSuchPoint { index: 7, .. })
        ));
    }

    #[test]
    fn test_review_rejects_on_a_copy() {
        let mut table = GraduationTable::new("M", PressureUnit::Kgf, StrokeMode::ForwardOnly);
        table.add_point(point(0.0, 0.0, Direction::Forward)).unwrap();
        table.add_point(point(5.0, 45.0, Direction::Forward)).unwrap();
        table.finalize().unwrap();

        let reviewed = table.review(&[(Direction::Forward, 1)]).unwrap();
        assert!(reviewed.is_finalized());
        assert!(!reviewed.points(Direction::Forward)[1].accepted);
        assert!(table.points(Direction::Forward)[1].accepted);
        assert!(matches!(
            table.review(&[(Direction::Backward, 0)]),
            Err(TableError::NoSuchPoint { index: 0, .. })
        ));
    }

    #[test]
    fn test_load_reports_bad_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let missing = dir.path().join("missing.json");
        assert!(matches!(
            GraduationTable::load(&missing),
            Err(TableError::Io { .. })
        ));

        let garbage = dir.path().join("garbage.json");
        std::fs::write(&garbage, "{ not json").unwrap();
        assert!(matches!(
            GraduationTable::load(&garbage),
            Err(TableError::Format { .. })
        ));
    }
}
