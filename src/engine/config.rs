//! Engine tunables.

use std::time::Duration;

use crate::controller::ControllerConfig;

/// Configuration for [`GraduationEngine`](super::GraduationEngine).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Needle overshoot, in degrees above the model angle, that needs the
    /// operator's confirmation.
    pub angle_margin: f64,
    /// Time allowed to obtain a fresh pressure/angle pair at a held point.
    pub capture_timeout: Duration,
    /// Readings older than this are not captured.
    pub staleness: Duration,
    /// How often the capture loop looks at the latest readings.
    pub capture_interval: Duration,
    /// Vent to the first scale point before the first ramp.
    pub sight_alignment: bool,
    pub controller: ControllerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            angle_margin: 2.0,
            capture_timeout: Duration::from_secs(10),
            staleness: Duration::from_millis(500),
            capture_interval: Duration::from_millis(20),
            sight_alignment: false,
            controller: ControllerConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn with_angle_margin(mut self, margin: f64) -> Self {
        self.angle_margin = margin;
        self
    }

    pub fn with_capture_timeout(mut self, timeout: Duration) -> Self {
        self.capture_timeout = timeout;
        self
    }

    pub fn with_staleness(mut self, staleness: Duration) -> Self {
        self.staleness = staleness;
        self
    }

    pub fn with_capture_interval(mut self, interval: Duration) -> Self {
        self.capture_interval = interval;
        self
    }

    pub fn with_sight_alignment(mut self, enabled: bool) -> Self {
        self.sight_alignment = enabled;
        self
    }

    pub fn with_controller(mut self, controller: ControllerConfig) -> Self {
        self.controller = controller;
        self
    }
}
