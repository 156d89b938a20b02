//! Per-frame attributes of a tracked person: gaze, distance, demographics.

use crate::frame::Frame;
use crate::session::Demographics;
use crate::track::Track;

pub const MIN_DISTANCE_CM: f32 = 50.0;
pub const MAX_DISTANCE_CM: f32 = 500.0;

// a person filling this share of the frame height stands ~2m away
const REFERENCE_HEIGHT_RATIO: f32 = 0.8;
const REFERENCE_DISTANCE_CM: f32 = 200.0;
const MIN_BOX_HEIGHT_PX: f32 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub is_looking: bool,
    pub distance_cm: f32,
    pub demographics: Demographics,
}

pub trait Observer {
    fn observe(&mut self, frame: &Frame, track: &Track) -> Observation;
}

/// Estimates attributes from box geometry alone.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeometryObserver {
    /// share of the frame, centered, in which a person counts as facing the screen
    pub center_zone: f32,
}

impl Default for GeometryObserver {
    fn default() -> Self {
        Self { center_zone: 0.7 }
    }
}

impl GeometryObserver {
    /// Monocular estimate from apparent height, clamped to the sensor range.
    pub fn distance_cm(&self, box_height: f32, frame_height: u32) -> f32 {
        if box_height.is_nan() || box_height < MIN_BOX_HEIGHT_PX || frame_height == 0 {
            return MAX_DISTANCE_CM;
        }

        let ratio = box_height / frame_height as f32;
        let distance = REFERENCE_HEIGHT_RATIO / ratio * REFERENCE_DISTANCE_CM;

        distance.clamp(MIN_DISTANCE_CM, MAX_DISTANCE_CM)
    }

    pub fn is_looking(&self, center: (f32, f32), dims: (u32, u32)) -> bool {
        let (w, h) = (dims.0 as f32, dims.1 as f32);
        if w <= 0.0 || h <= 0.0 {
            return true;
        }

        let margin = (1.0 - self.center_zone) / 2.0;
        let (x, y) = (center.0 / w, center.1 / h);

        (margin..=1.0 - margin).contains(&x) && (margin..=1.0 - margin).contains(&y)
    }
}

impl Observer for GeometryObserver {
    fn observe(&mut self, frame: &Frame, track: &Track) -> Observation {
        Observation {
            is_looking: self.is_looking(track.bbox.center(), frame.dims),
            distance_cm: self.distance_cm(track.bbox.height(), frame.height()),
            demographics: Demographics::default(),
        }
    }
}

/// Prefers per-detection annotations, filling gaps from `fallback`.
#[derive(Debug, Clone, Default)]
pub struct AnnotatedObserver<O = GeometryObserver> {
    fallback: O,
}

impl<O: Observer> AnnotatedObserver<O> {
    pub fn new(fallback: O) -> Self {
        Self { fallback }
    }
}

impl<O: Observer> Observer for AnnotatedObserver<O> {
    fn observe(&mut self, frame: &Frame, track: &Track) -> Observation {
        let estimate = self.fallback.observe(frame, track);

        match frame.annotation(track.detection_index) {
            Some(a) => Observation {
                is_looking: a.is_looking.unwrap_or(estimate.is_looking),
                distance_cm: a
                    .distance_cm
                    .filter(|d| d.is_finite())
                    .unwrap_or(estimate.distance_cm),
                demographics: a.demographics(),
            },
            None => estimate,
        }
    }
}
