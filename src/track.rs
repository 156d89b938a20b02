use crate::bbox::{BBox, Ltrb};
use crate::predictor::Predictor;
use crate::Detection;
use serde_derive::{Deserialize, Serialize};

pub type TrackId = u64;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Tentative,
    Confirmed,
    Deleted,
}

/// Monotonic track id source. Lives as long as its tracker and is never reset,
/// so an id handed out once is never seen again.
#[derive(Debug, Clone)]
pub struct IdSequence {
    next: TrackId,
}

impl IdSequence {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    #[inline]
    pub fn allocate(&mut self) -> TrackId {
        let id = self.next;
        self.next += 1;
        id
    }

    #[inline]
    pub fn peek(&self) -> TrackId {
        self.next
    }
}

impl Default for IdSequence {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracker-internal record of one physical object.
#[derive(Debug, Clone)]
pub struct Tracklet {
    pub id: TrackId,
    pub filter: Predictor<f32>,
    pub hits: u32,
    pub hit_streak: u32,
    pub state: TrackState,
    // (detection index, confidence) of this frame's match
    matched: Option<(usize, f32)>,
}

impl Tracklet {
    pub fn new(id: TrackId, det: &Detection, det_index: usize, min_hits: u32) -> Self {
        let state = if min_hits <= 1 {
            TrackState::Confirmed
        } else {
            TrackState::Tentative
        };

        Self {
            id,
            filter: Predictor::new(&det.bbox),
            hits: 1,
            hit_streak: 1,
            state,
            matched: Some((det_index, det.confidence)),
        }
    }

    /// Advances the motion model one frame and returns the predicted box.
    pub fn predict(&mut self) -> BBox<Ltrb> {
        // a frame without a match breaks the streak
        if self.filter.time_since_update > 0 {
            self.hit_streak = 0;
        }

        self.matched = None;
        self.filter.predict();
        self.filter.bbox()
    }

    /// Applies a matched detection. Returns `true` when this match confirmed the track.
    pub fn update(&mut self, det: &Detection, det_index: usize, min_hits: u32) -> bool {
        if !self.filter.correct(&det.bbox) {
            log::warn!("track {}: singular innovation covariance, state re-seeded", self.id);
        }

        self.hits += 1;
        self.hit_streak += 1;
        self.matched = Some((det_index, det.confidence));

        if self.state == TrackState::Tentative && self.hit_streak >= min_hits {
            self.state = TrackState::Confirmed;
            return true;
        }

        false
    }

    #[inline]
    pub fn time_since_update(&self) -> u32 {
        self.filter.time_since_update
    }

    #[inline]
    pub fn age(&self) -> u32 {
        self.filter.age
    }

    /// Confirmed and matched in the current frame; coasting tracks stay hidden.
    #[inline]
    pub fn is_visible(&self) -> bool {
        self.state == TrackState::Confirmed && self.filter.time_since_update == 0
    }

    pub fn to_track(&self) -> Option<Track> {
        if !self.is_visible() {
            return None;
        }

        let (detection_index, confidence) = self.matched?;

        Some(Track {
            track_id: self.id,
            bbox: self.filter.bbox(),
            confidence,
            detection_index,
            hits: self.hits,
            age: self.filter.age,
        })
    }
}

/// A confirmed track exposed for the current frame.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Track {
    pub track_id: TrackId,
    pub bbox: BBox<Ltrb>,
    pub confidence: f32,

    // index into the frame's detections this track was matched to
    pub detection_index: usize,

    pub hits: u32,
    pub age: u32,
}
