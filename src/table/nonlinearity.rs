//! Deviation of a graduation table from its gauge model.

use serde::{Deserialize, Serialize};

use super::GraduationTable;
use crate::catalog::GaugeModel;
use crate::controller::Direction;

/// Deviation of one accepted point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeviationRow {
    pub direction: Direction,
    pub target: f64,
    pub pressure: f64,
    pub angle: f64,
    /// Model angle at the captured pressure.
    pub expected: f64,
    /// `angle - expected`, in degrees.
    pub deviation: f64,
}

/// Forward/backward angle difference at one target.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HysteresisRow {
    pub target: f64,
    pub forward_angle: f64,
    pub backward_angle: f64,
    pub difference: f64,
}

/// Result of evaluating a table against a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NonlinearityReport {
    pub rows: Vec<DeviationRow>,
    pub max_abs_deviation: f64,
    /// Permitted deviation: accuracy class percent of the scale angle span.
    pub allowance: f64,
    pub hysteresis: Vec<HysteresisRow>,
    pub max_hysteresis: f64,
    pub forward_span: Option<f64>,
    pub backward_span: Option<f64>,
    pub passed: bool,
}

impl NonlinearityReport {
    pub fn deviations(&self) -> Vec<f64> {
        self.rows.iter().map(|r| r.deviation).collect()
    }
}

impl GraduationTable {
    /// Compare every accepted point with the model curve.
    pub fn compute_nonlinearity(&self, model: &GaugeModel) -> NonlinearityReport {
        let rows: Vec<DeviationRow> = self
            .all_points()
            .filter(|p| p.accepted)
            .map(|p| {
                let pressure = self.unit().convert(p.pressure, model.unit());
                let expected = model.expected_angle_at(pressure);
                DeviationRow {
                    direction: p.direction,
                    target: p.target,
                    pressure: p.pressure,
                    angle: p.angle,
                    expected,
                    deviation: p.angle - expected,
                }
            })
            .collect();
        let max_abs_deviation = rows
            .iter()
            .map(|r| r.deviation.abs())
            .fold(0.0, f64::max);

        let hysteresis: Vec<HysteresisRow> = self
            .points(Direction::Forward)
            .iter()
            .filter(|p| p.accepted)
            .filter_map(|f| {
                self.backward_at(f.target).map(|b| HysteresisRow {
                    target: f.target,
                    forward_angle: f.angle,
                    backward_angle: b.angle,
                    difference: (f.angle - b.angle).abs(),
                })
            })
            .collect();
        let max_hysteresis = hysteresis
            .iter()
            .map(|h| h.difference)
            .fold(0.0, f64::max);

        let allowance = model.accuracy_class() / 100.0 * model.angle_span();
        NonlinearityReport {
            passed: !rows.is_empty()
                && max_abs_deviation <= allowance
                && max_hysteresis <= allowance,
            rows,
            max_abs_deviation,
            allowance,
            hysteresis,
            max_hysteresis,
            forward_span: self.angle_span(Direction::Forward),
            backward_span: self.angle_span(Direction::Backward),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ScalePoint;
    use crate::controller::StrokeMode;
    use crate::table::GraduationPoint;
    use crate::units::PressureUnit;

    fn model() -> GaugeModel {
        GaugeModel::new(
            "MP-20",
            PressureUnit::Kgf,
            1.5,
            vec![
                ScalePoint::new(0.0, 0.0),
                ScalePoint::new(10.0, 9.5),
                ScalePoint::new(20.0, 19.0),
            ],
        )
        .unwrap()
    }

    fn table(points: &[(f64, f64)]) -> GraduationTable {
        let mut table = GraduationTable::new("MP-20", PressureUnit::Kgf, StrokeMode::ForwardOnly);
        for &(pressure, angle) in points {
            table
                .add_point(GraduationPoint::new(pressure, pressure, angle, Direction::Forward))
                .unwrap();
        }
        table
    }

    #[test]
    fn test_exact_angles_have_zero_deviation() {
        let model = model();
        let points: Vec<(f64, f64)> = [0.0, 3.0, 10.0, 17.5, 20.0]
            .iter()
            .map(|&p| (p, model.expected_angle_at(p)))
            .collect();
        let report = table(&points).compute_nonlinearity(&model);
        assert!(report.deviations().iter().all(|d| *d == 0.0));
        assert_eq!(report.max_abs_deviation, 0.0);
        assert!(report.passed);
    }

    #[test]
    fn test_scenario_deviations() {
        let report = table(&[(0.0, 0.0), (10.0, 9.6), (20.0, 18.8)]).compute_nonlinearity(&model());
        let expected = [0.0, 0.1, -0.2];
        for (got, want) in report.deviations().iter().zip(expected) {
            assert!((got - want).abs() < 1e-9, "{got} != {want}");
        }
        assert!((report.max_abs_deviation - 0.2).abs() < 1e-9);
        assert!((report.allowance - 0.285).abs() < 1e-9);
        assert!(report.passed);
        assert_eq!(report.forward_span, Some(18.8));
    }

    #[test]
    fn test_converts_table_unit_to_model_unit() {
        let model = model();
        let mut table = GraduationTable::new("MP-20", PressureUnit::KPa, StrokeMode::ForwardOnly);
        let kpa = PressureUnit::Kgf.convert(10.0, PressureUnit::KPa);
        table
            .add_point(GraduationPoint::new(kpa, kpa, 9.5, Direction::Forward))
            .unwrap();
        let report = table.compute_nonlinearity(&model);
        assert!(report.rows[0].deviation.abs() < 1e-9);
    }

    #[test]
    fn test_hysteresis_against_allowance() {
        let model = model();
        let mut table =
            GraduationTable::new("MP-20", PressureUnit::Kgf, StrokeMode::ForwardAndBackward);
        for (p, a) in [(0.0, 0.0), (10.0, 9.5), (20.0, 19.0)] {
            table
                .add_point(GraduationPoint::new(p, p, a, Direction::Forward))
                .unwrap();
        }
        for (p, a) in [(20.0, 19.0), (10.0, 9.9), (0.0, 0.0)] {
            table
                .add_point(GraduationPoint::new(p, p, a, Direction::Backward))
                .unwrap();
        }
        table.finalize().unwrap();

        let report = table.compute_nonlinearity(&model);
        assert_eq!(report.rows.len(), 6);
        assert_eq!(report.hysteresis.len(), 3);
        assert!((report.max_hysteresis - 0.4).abs() < 1e-9);
        assert!(!report.passed);
    }

    #[test]
    fn test_round_trip_reproduces_deviations() {
        let original = table(&[(0.0, 0.1), (5.0, 4.7), (10.0, 9.6), (20.0, 18.8)]);
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("tables").join("mp20.json");
        original.save(&path).unwrap();

        let reloaded = GraduationTable::load(&path).unwrap();
        assert_eq!(reloaded, original);
        assert_eq!(
            reloaded.compute_nonlinearity(&model()),
            original.compute_nonlinearity(&model())
        );
    }
}
