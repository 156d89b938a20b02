use crate::bbox::{BBox, Ltrb};
use crate::math::{iou_matrix, linear_assignment};
use crate::track::{IdSequence, Track, TrackId, TrackState, Tracklet};
use crate::{Detection, Tracking};

use log::{debug, trace, warn};
use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::rc::Rc;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct TrackerConfig {
    /// frames a track may go unmatched before it is deleted
    pub max_age: u32,
    /// consecutive matches needed before a track is exposed
    pub min_hits: u32,
    /// pairs below this IoU are never matched
    pub iou_threshold: f32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_age: 30,
            min_hits: 3,
            iou_threshold: 0.3,
        }
    }
}

/// SORT-style tracker: Kalman prediction plus IoU-gated optimal assignment.
///
/// Tracks live in an arena keyed by id; iteration follows id order, which is
/// also creation order, so identical inputs always produce identical matches.
pub struct SortTracker {
    config: TrackerConfig,
    tracks: BTreeMap<TrackId, Tracklet>,
    ids: IdSequence,
    visible: Rc<[Track]>,
    deleted: Vec<TrackId>,
    frame_count: u64,
}

impl SortTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            tracks: BTreeMap::new(),
            ids: IdSequence::new(),
            visible: Rc::new([]),
            deleted: Vec::new(),
            frame_count: 0,
        }
    }

    #[inline]
    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    #[inline]
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Number of live (tentative or confirmed) tracks.
    #[inline]
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    #[inline]
    pub fn get(&self, id: TrackId) -> Option<&Tracklet> {
        self.tracks.get(&id)
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &Tracklet> {
        self.tracks.values()
    }

    /// Id the next newborn track will receive.
    #[inline]
    pub fn next_id(&self) -> TrackId {
        self.ids.peek()
    }

    fn predict(&mut self) -> (Vec<TrackId>, Vec<BBox<Ltrb>>) {
        let mut ids = Vec::with_capacity(self.tracks.len());
        let mut boxes = Vec::with_capacity(self.tracks.len());
        let mut broken = Vec::new();

        for (&id, t) in self.tracks.iter_mut() {
            let bbox = t.predict();

            if bbox.is_finite() {
                ids.push(id);
                boxes.push(bbox);
            } else {
                broken.push(id);
            }
        }

        for id in broken {
            warn!("track {}: non-finite prediction, dropped", id);
            self.tracks.remove(&id);
            self.deleted.push(id);
        }

        (ids, boxes)
    }

    fn spawn(&mut self, det: &Detection, det_index: usize) {
        let id = self.ids.allocate();
        let t = Tracklet::new(id, det, det_index, self.config.min_hits);

        debug!("track {} born at {:?}", id, det.bbox.as_slice());
        self.tracks.insert(id, t);
    }

    fn remove_expired(&mut self) {
        let max_age = self.config.max_age;

        for t in self.tracks.values_mut() {
            if t.time_since_update() > max_age {
                debug!("track {} deleted after {} frames", t.id, t.age());
                t.state = TrackState::Deleted;
                self.deleted.push(t.id);
            }
        }

        self.tracks.retain(|_, t| t.state != TrackState::Deleted);
    }
}

impl Tracking for SortTracker {
    fn update(&mut self, detections: &[Detection]) -> Vec<Track> {
        self.frame_count += 1;
        self.deleted.clear();

        let valid: Vec<(usize, &Detection)> = detections
            .iter()
            .enumerate()
            .filter(|(idx, det)| match det.validate(*idx) {
                Ok(()) => true,
                Err(err) => {
                    warn!("frame {}: {}, dropped", self.frame_count, err);
                    false
                }
            })
            .collect();

        let (ids, predicted) = self.predict();

        if !valid.is_empty() {
            let det_boxes: Vec<_> = valid.iter().map(|(_, d)| d.bbox).collect();
            let iou = iou_matrix(&predicted, &det_boxes);

            match linear_assignment(iou.view(), self.config.iou_threshold) {
                Ok(assignment) => {
                    let min_hits = self.config.min_hits;

                    for &(row, col, score) in &assignment.matches {
                        let (det_index, det) = valid[col];
                        trace!("track {} <- detection {} (iou {:.3})", ids[row], det_index, score);

                        if let Some(t) = self.tracks.get_mut(&ids[row]) {
                            if t.update(det, det_index, min_hits) {
                                debug!("track {} confirmed", t.id);
                            }
                        }
                    }

                    for &col in &assignment.unmatched_columns {
                        let (det_index, det) = valid[col];
                        self.spawn(det, det_index);
                    }
                }

                // oversized or unsolvable frame: shed it whole. Tracks coast,
                // nothing is born, and the next frame starts clean.
                Err(err) => warn!("frame {}: association skipped: {}", self.frame_count, err),
            }
        }

        self.remove_expired();

        self.visible = self
            .tracks
            .values()
            .filter_map(Tracklet::to_track)
            .collect::<Vec<_>>()
            .into();

        self.visible.to_vec()
    }

    #[inline]
    fn tracks(&self) -> Rc<[Track]> {
        self.visible.clone()
    }

    #[inline]
    fn deleted(&self) -> &[TrackId] {
        &self.deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(max_age: u32, min_hits: u32) -> SortTracker {
        SortTracker::new(TrackerConfig {
            max_age,
            min_hits,
            iou_threshold: 0.3,
        })
    }

    #[test]
    fn empty_frames_are_noops() {
        let mut t = tracker(1, 3);
        assert!(t.update(&[]).is_empty());
        assert!(t.is_empty());
        assert_eq!(t.next_id(), 1);
    }

    #[test]
    fn every_detection_spawns_without_tracks() {
        let mut t = tracker(1, 3);
        let dets = [
            Detection::new([0.0, 0.0, 10.0, 10.0], 0.9),
            Detection::new([50.0, 50.0, 60.0, 60.0], 0.9),
        ];

        assert!(t.update(&dets).is_empty());
        assert_eq!(t.len(), 2);
        assert!(t.iter().all(|x| x.state == TrackState::Tentative));
    }

    #[test]
    fn tracks_age_without_detections() {
        let mut t = tracker(5, 3);
        t.update(&[Detection::new([0.0, 0.0, 10.0, 10.0], 0.9)]);

        t.update(&[]);
        t.update(&[]);

        let x = t.get(1).unwrap();
        assert_eq!(x.time_since_update(), 2);
        assert_eq!(x.age(), 2);
    }

    #[test]
    fn invalid_detections_are_dropped() {
        let mut t = tracker(1, 1);
        let dets = [
            Detection::new([f32::NAN, 0.0, 10.0, 10.0], 0.9),
            Detection::new([0.0, 0.0, 10.0, 10.0], 0.9),
            Detection::new([0.0, 0.0, 10.0, 10.0], 2.0),
        ];

        let out = t.update(&dets);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].detection_index, 1);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn deleted_after_max_age() {
        let mut t = tracker(2, 1);
        t.update(&[Detection::new([0.0, 0.0, 10.0, 10.0], 0.9)]);

        t.update(&[]);
        t.update(&[]);
        assert_eq!(t.len(), 1);

        assert!(t.deleted().is_empty());

        t.update(&[]);
        assert!(t.is_empty());
        assert_eq!(t.deleted(), &[1]);

        t.update(&[]);
        assert!(t.deleted().is_empty());
    }

    #[test]
    fn oversized_frame_is_shed_whole() {
        let mut t = tracker(5, 1);
        t.update(&[Detection::new([0.0, 0.0, 10.0, 10.0], 0.9)]);

        let crowd: Vec<_> = (0..crate::math::MAX_MATRIX_SIDE + 1)
            .map(|i| {
                let x = (i % 100) as f32 * 20.0;
                let y = (i / 100) as f32 * 20.0;
                Detection::new([x, y, x + 10.0, y + 10.0], 0.5)
            })
            .collect();

        assert!(t.update(&crowd).is_empty());
        assert_eq!(t.len(), 1);
        assert_eq!(t.next_id(), 2);
        assert_eq!(t.get(1).unwrap().time_since_update(), 1);
    }

    #[test]
    fn tracks_exposes_last_frame() {
        let mut t = tracker(1, 1);
        let out = t.update(&[Detection::new([0.0, 0.0, 10.0, 10.0], 0.9)]);

        assert_eq!(&*t.tracks(), &out[..]);
    }
}
