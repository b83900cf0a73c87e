//! Simulated needle that follows the rig pressure along a model curve.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::info;

use super::SimulatedRig;
use crate::catalog::GaugeModel;
use crate::vision::{AngleFeed, AngleReading, NeedleAngleSource};

#[derive(Debug, Clone, Copy)]
struct NeedleFault {
    offset: f64,
    valid: bool,
}

/// Needle angle of an ideal gauge of `model` mounted on the rig, optionally
/// shifted by a fixed offset.
pub struct SimulatedNeedle {
    rig: SimulatedRig,
    model: Arc<GaugeModel>,
    fault: Mutex<NeedleFault>,
}

impl SimulatedNeedle {
    pub fn new(rig: SimulatedRig, model: Arc<GaugeModel>) -> Self {
        Self {
            rig,
            model,
            fault: Mutex::new(NeedleFault {
                offset: 0.0,
                valid: true,
            }),
        }
    }

    pub fn with_offset(self, offset: f64) -> Self {
        self.set_offset(offset);
        self
    }

    /// Shift every reported angle by `offset` degrees.
    pub fn set_offset(&self, offset: f64) {
        self.fault.lock().unwrap_or_else(|p| p.into_inner()).offset = offset;
    }

    /// Mark frames as untrusted.
    pub fn set_valid(&self, valid: bool) {
        self.fault.lock().unwrap_or_else(|p| p.into_inner()).valid = valid;
    }

    /// Publish one frame into `feed` every `frame_interval`, like a camera
    /// pipeline would. Must be called inside a tokio runtime.
    pub fn spawn_camera(
        self: &Arc<Self>,
        feed: AngleFeed,
        frame_interval: Duration,
    ) -> JoinHandle<()> {
        let needle = Arc::clone(self);
        info!("Simulated camera at {}ms per frame", frame_interval.as_millis());
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(frame_interval);
            loop {
                ticker.tick().await;
                if let Some(reading) = needle.latest_angle() {
                    feed.publish_reading(reading);
                }
            }
        })
    }
}

impl NeedleAngleSource for SimulatedNeedle {
    fn latest_angle(&self) -> Option<AngleReading> {
        let fault = *self.fault.lock().unwrap_or_else(|p| p.into_inner());
        let pressure = self.rig.unit().convert(self.rig.pressure(), self.model.unit());
        let angle = self.model.expected_angle_at(pressure) + fault.offset;
        Some(AngleReading::new(angle, fault.valid))
    }
}
