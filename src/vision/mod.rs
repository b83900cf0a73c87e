//! Needle angle boundary.
//!
//! The frame pipeline and the angle-detection algorithm live outside this
//! crate. They push results into an [`AngleFeed`]; the engine only ever asks
//! for the latest reading.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::cell::LatestCell;

/// Needle angle measured on one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AngleReading {
    /// Angle in degrees, measured from the scale origin.
    pub angle: f64,
    /// Whether the detector trusted this frame.
    pub valid: bool,
    /// Capture time of the source frame.
    pub timestamp: DateTime<Utc>,
}

impl AngleReading {
    pub fn new(angle: f64, valid: bool) -> Self {
        Self::captured_at(angle, valid, Utc::now())
    }

    pub fn captured_at(angle: f64, valid: bool, timestamp: DateTime<Utc>) -> Self {
        Self {
            angle,
            valid: valid && angle.is_finite(),
            timestamp,
        }
    }

    /// Time since the source frame was captured. Frames stamped in the
    /// future count as fresh.
    pub fn age(&self) -> Duration {
        (Utc::now() - self.timestamp).to_std().unwrap_or_default()
    }

    /// Whether the frame was captured at or after `instant`.
    pub fn captured_since(&self, instant: DateTime<Utc>) -> bool {
        self.timestamp >= instant
    }
}

/// Anything that can report the most recent needle angle.
pub trait NeedleAngleSource: Send + Sync {
    /// Latest reading, or `None` when no frame has been analysed yet.
    fn latest_angle(&self) -> Option<AngleReading>;
}

/// Publish side for an external frame pipeline.
#[derive(Debug, Clone, Default)]
pub struct AngleFeed {
    cell: LatestCell<AngleReading>,
}

impl AngleFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish the result of one frame.
    pub fn publish(&self, angle: f64, valid: bool) {
        self.cell.publish(AngleReading::new(angle, valid));
    }

    pub fn publish_reading(&self, reading: AngleReading) {
        self.cell.publish(reading);
    }

    /// Forget the last reading, e.g. when the camera stops.
    pub fn clear(&self) {
        self.cell.clear();
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<AngleReading>> {
        self.cell.subscribe()
    }
}

impl NeedleAngleSource for AngleFeed {
    fn latest_angle(&self) -> Option<AngleReading> {
        self.cell.latest()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_keeps_latest() {
        let feed = AngleFeed::new();
        assert!(feed.latest_angle().is_none());

        feed.publish(12.0, true);
        feed.publish(13.5, true);
        let reading = feed.latest_angle().unwrap();
        assert_eq!(reading.angle, 13.5);
        assert!(reading.valid);

        feed.clear();
        assert!(feed.latest_angle().is_none());
    }

    #[test]
    fn test_age_follows_frame_timestamp() {
        let feed = AngleFeed::new();
        let held_at = Utc::now();
        let old = held_at - chrono::Duration::seconds(30);
        feed.publish_reading(AngleReading::captured_at(40.0, true, old));

        let reading = feed.latest_angle().unwrap();
        assert!(reading.age() >= Duration::from_secs(30));
        assert!(!reading.captured_since(held_at));

        feed.publish(41.0, true);
        let reading = feed.latest_angle().unwrap();
        assert!(reading.age() < Duration::from_secs(1));
        assert!(reading.captured_since(held_at));
    }

    #[test]
    fn test_non_finite_angle_is_invalid() {
        let feed = AngleFeed::new();
        feed.publish(f64::NAN, true);
        assert!(!feed.latest_angle().unwrap().valid);
    }
}
