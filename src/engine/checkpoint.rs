//! Operator checkpoints.
//!
//! The engine suspends on a checkpoint until the front end resolves it. A
//! request that is dropped without an answer counts as [`Decision::Cancel`].

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::controller::Direction;

/// Situation that needs the operator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Anomaly {
    /// The needle is further than the margin past the model angle.
    AngleExceeded {
        target: f64,
        direction: Direction,
        measured: f64,
        expected: f64,
    },
    /// The pressure went past the preload limit; acknowledgement only.
    PreloadExceeded { measured: f64, limit: f64 },
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AngleExceeded {
                target,
                direction,
                measured,
                expected,
            } => write!(
                f,
                "Needle angle {:.2} exceeds expected {:.2} at {:.3} ({})",
                measured, expected, target, direction
            ),
            Self::PreloadExceeded { measured, limit } => write!(
                f,
                "Preload exceeded: pressure {:.3} above limit {:.3}",
                measured, limit
            ),
        }
    }
}

/// Operator answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    Continue,
    Cancel,
}

/// Pending checkpoint sent to the front end.
#[derive(Debug)]
pub struct CheckpointRequest {
    pub anomaly: Anomaly,
    responder: oneshot::Sender<Decision>,
}

impl CheckpointRequest {
    pub(crate) fn new(anomaly: Anomaly) -> (Self, oneshot::Receiver<Decision>) {
        let (responder, rx) = oneshot::channel();
        (Self { anomaly, responder }, rx)
    }

    /// Answer the checkpoint.
    pub fn resolve(self, decision: Decision) {
        // The engine may have been aborted meanwhile.
        let _ = self.responder.send(decision);
    }

    pub fn confirm(self) {
        self.resolve(Decision::Continue);
    }

    pub fn cancel(self) {
        self.resolve(Decision::Cancel);
    }
}
