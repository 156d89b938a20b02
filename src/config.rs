use crate::error::Error;
use crate::session::SessionConfig;
use crate::tracker::TrackerConfig;

use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    pub device_id: u32,

    pub max_age: u32,
    pub min_hits: u32,
    pub iou_threshold: f32,

    pub session_timeout_seconds: f64,
    pub fps: f64,
    pub min_session_duration_seconds: f64,
    pub max_detection_distance_cm: f32,

    pub outbox_capacity: usize,
    pub stats_interval_frames: u64,
    /// UTC instant of frame 0 for recorded streams
    pub stream_epoch: DateTime<Utc>,
}

impl Default for Config {
    fn default() -> Self {
        let tracker = TrackerConfig::default();
        let session = SessionConfig::default();

        Self {
            device_id: session.device_id,
            max_age: tracker.max_age,
            min_hits: tracker.min_hits,
            iou_threshold: tracker.iou_threshold,
            session_timeout_seconds: session.session_timeout_seconds,
            fps: session.fps,
            min_session_duration_seconds: session.min_session_duration_seconds,
            max_detection_distance_cm: 500.0,
            outbox_capacity: 256,
            stats_interval_frames: 300,
            stream_epoch: session.epoch,
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let file = File::open(path)?;

        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    pub fn validate(&self) -> Result<(), Error> {
        let invalid = |msg: String| Err(Error::InvalidConfig(msg));

        if !(0.0..=1.0).contains(&self.iou_threshold) {
            return invalid(format!("iou_threshold {} not in [0, 1]", self.iou_threshold));
        }

        if !(self.fps.is_finite() && self.fps > 0.0) {
            return invalid(format!("fps must be positive, got {}", self.fps));
        }

        if self.min_hits == 0 {
            return invalid("min_hits must be at least 1".into());
        }

        if !(self.session_timeout_seconds >= 0.0) {
            return invalid(format!(
                "session_timeout_seconds must be non-negative, got {}",
                self.session_timeout_seconds
            ));
        }

        if !(self.min_session_duration_seconds >= 0.0) {
            return invalid(format!(
                "min_session_duration_seconds must be non-negative, got {}",
                self.min_session_duration_seconds
            ));
        }

        if !(self.max_detection_distance_cm > 0.0) {
            return invalid(format!(
                "max_detection_distance_cm must be positive, got {}",
                self.max_detection_distance_cm
            ));
        }

        if self.outbox_capacity == 0 {
            return invalid("outbox_capacity must be at least 1".into());
        }

        Ok(())
    }

    pub fn tracker(&self) -> TrackerConfig {
        TrackerConfig {
            max_age: self.max_age,
            min_hits: self.min_hits,
            iou_threshold: self.iou_threshold,
        }
    }

    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            device_id: self.device_id,
            session_timeout_seconds: self.session_timeout_seconds,
            fps: self.fps,
            min_session_duration_seconds: self.min_session_duration_seconds,
            epoch: self.stream_epoch,
        }
    }
}
