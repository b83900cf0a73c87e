//! Stroke direction and target sequencing.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Sweep direction of a pressure ramp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Ascending pressure.
    Forward,
    /// Descending pressure.
    Backward,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Forward => f.write_str("forward"),
            Self::Backward => f.write_str("backward"),
        }
    }
}

/// Which sweeps a graduation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StrokeMode {
    /// Ascending points once.
    #[default]
    ForwardOnly,
    /// Ascending then descending over the same targets, for hysteresis.
    ForwardAndBackward,
}

impl StrokeMode {
    pub fn directions(&self) -> &'static [Direction] {
        match self {
            Self::ForwardOnly => &[Direction::Forward],
            Self::ForwardAndBackward => &[Direction::Forward, Direction::Backward],
        }
    }
}

/// One planned ramp of a session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub target: f64,
    pub direction: Direction,
}

/// Expand ascending targets into the ordered ramp list of `mode`.
pub fn plan_steps(targets: &[f64], mode: StrokeMode) -> Vec<Step> {
    let mut steps: Vec<Step> = targets
        .iter()
        .map(|&target| Step {
            target,
            direction: Direction::Forward,
        })
        .collect();
    if mode == StrokeMode::ForwardAndBackward {
        steps.extend(targets.iter().rev().map(|&target| Step {
            target,
            direction: Direction::Backward,
        }));
    }
    steps
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_forward_only() {
        let steps = plan_steps(&[5.0, 10.0, 15.0], StrokeMode::ForwardOnly);
        assert_eq!(steps.len(), 3);
        assert!(steps.iter().all(|s| s.direction == Direction::Forward));
    }

    #[test]
    fn test_plan_forward_and_backward() {
        let steps = plan_steps(&[5.0, 10.0, 15.0], StrokeMode::ForwardAndBackward);
        let targets: Vec<f64> = steps.iter().map(|s| s.target).collect();
        assert_eq!(targets, vec![5.0, 10.0, 15.0, 15.0, 10.0, 5.0]);
        assert_eq!(steps[3].direction, Direction::Backward);
    }
}
