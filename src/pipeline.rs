//! Per-frame driver: detections in, anonymous session payloads out.
//!
//! Each frame is tracked, every visible track is observed and folded into its
//! session, and expired sessions are flushed into the outbox. Nothing here
//! blocks on delivery.

use crate::clock::Clock;
use crate::config::Config;
use crate::frame::Frame;
use crate::observer::{AnnotatedObserver, Observer};
use crate::outbox::Outbox;
use crate::session::{SessionConfig, SessionManager};
use crate::track::Track;
use crate::tracker::SortTracker;
use crate::Tracking;

use log::{info, trace};

#[derive(Debug, Clone, PartialEq)]
pub struct FrameReport {
    pub timestamp: f64,
    pub tracks: Vec<Track>,
    /// tracks that updated a session this frame
    pub observed: usize,
    /// payloads handed to the outbox this frame
    pub flushed: usize,
}

pub struct Pipeline<T = SortTracker, O = AnnotatedObserver> {
    tracker: T,
    observer: O,
    sessions: SessionManager,
    outbox: Outbox,
    clock: Clock,
    max_distance_cm: f32,
    stats_interval: u64,
    frames: u64,
}

impl Pipeline<SortTracker, AnnotatedObserver> {
    pub fn from_config(config: &Config, clock: Clock, outbox: Outbox) -> Self {
        Self::new(
            config,
            SortTracker::new(config.tracker()),
            AnnotatedObserver::default(),
            clock,
            outbox,
        )
    }
}

impl<T: Tracking, O: Observer> Pipeline<T, O> {
    pub fn new(config: &Config, tracker: T, observer: O, clock: Clock, outbox: Outbox) -> Self {
        let sessions = SessionManager::new(SessionConfig {
            epoch: clock.epoch(),
            ..config.session()
        });

        Self {
            tracker,
            observer,
            sessions,
            outbox,
            clock,
            max_distance_cm: config.max_detection_distance_cm,
            stats_interval: config.stats_interval_frames,
            frames: 0,
        }
    }

    #[inline]
    pub fn tracker(&self) -> &T {
        &self.tracker
    }

    #[inline]
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    #[inline]
    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn process(&mut self, frame: &Frame) -> FrameReport {
        self.frames += 1;

        let timestamp = self.clock.timestamp(frame.index);
        let tracks = self.tracker.update(&frame.detections());
        let mut observed = 0;

        for &id in self.tracker.deleted() {
            self.sessions.release(id);
        }

        for track in &tracks {
            let obs = self.observer.observe(frame, track);

            if obs.distance_cm > self.max_distance_cm {
                trace!(
                    "track {}: {:.0}cm is out of range, not counted",
                    track.track_id,
                    obs.distance_cm
                );
                continue;
            }

            if self.sessions.update(
                track.track_id,
                timestamp,
                obs.is_looking,
                obs.distance_cm,
                obs.demographics,
            ) {
                observed += 1;
            }
        }

        let payloads = self.sessions.collect(timestamp);
        let flushed = payloads.len();

        for payload in payloads {
            self.outbox.push(payload);
        }

        if self.stats_interval > 0 && self.frames % self.stats_interval == 0 {
            self.log_stats();
        }

        FrameReport {
            timestamp,
            tracks,
            observed,
            flushed,
        }
    }

    /// End of input: every live session is over. Returns payloads flushed.
    pub fn finish(&mut self) -> usize {
        let payloads = self.sessions.drain();
        let flushed = payloads.len();

        for payload in payloads {
            self.outbox.push(payload);
        }

        self.log_stats();
        flushed
    }

    /// Interrupted: live sessions are incomplete and dropped. Returns how many.
    pub fn shutdown(&mut self) -> usize {
        let abandoned = self.sessions.abandon_all();

        if abandoned > 0 {
            info!("shutdown: {} live sessions abandoned", abandoned);
        }

        self.log_stats();
        abandoned
    }

    pub fn log_stats(&self) {
        let stats = self.sessions.stats();

        info!(
            "frame {}: {} tracks, {} active sessions, {} completed, {} discarded, {} payloads lost",
            self.frames,
            self.tracker.tracks().len(),
            stats.active,
            stats.completed,
            stats.discarded,
            self.outbox.lost()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Annotation, FrameDetection};
    use crate::session::{AgeGroup, Gender};
    use crate::Detection;
    use chrono::{TimeZone, Utc};

    fn config() -> Config {
        Config {
            fps: 10.0,
            min_hits: 1,
            ..Default::default()
        }
    }

    fn pipeline(config: &Config) -> Pipeline {
        let clock = Clock::stream(config.fps, config.stream_epoch);
        Pipeline::from_config(config, clock, Outbox::with_capacity(16))
    }

    fn frame(index: u64, distance_cm: f32, is_looking: bool) -> Frame {
        Frame::new(
            index,
            (640, 480),
            vec![FrameDetection {
                detection: Detection::new([100.0, 100.0, 150.0, 200.0], 0.9),
                annotation: Some(Annotation {
                    is_looking: Some(is_looking),
                    distance_cm: Some(distance_cm),
                    age_group: AgeGroup::From25To34,
                    gender: Gender::Male,
                }),
            }],
        )
    }

    #[test]
    fn session_flushes_after_timeout() {
        let config = config();
        let mut p = pipeline(&config);

        for i in 0..30 {
            let report = p.process(&frame(i, 180.0, i < 21));
            assert_eq!(report.tracks.len(), 1);
            assert_eq!(report.observed, 1);
        }

        // person gone; 3s of empty frames at 10fps
        let mut flushed = 0;
        for i in 30..70 {
            flushed += p.process(&Frame::new(i, (640, 480), vec![])).flushed;
        }
        assert_eq!(flushed, 1);

        let payload = p.outbox().try_pop().unwrap();
        assert_eq!(payload.duration_seconds, 3);
        assert!((payload.attention_seconds - 2.1).abs() < 1e-5);
        assert_eq!(payload.demographics.age_group, AgeGroup::From25To34);
        assert_eq!(payload.demographics.distance_cm, 180);
        assert_eq!(payload.start_time, Utc.timestamp_opt(0, 0).unwrap());
    }

    #[test]
    fn track_returning_after_flush_yields_one_payload() {
        let config = Config {
            fps: 10.0,
            min_hits: 1,
            max_age: 60,
            ..Default::default()
        };
        let mut p = pipeline(&config);
        let mut ids = std::collections::BTreeSet::new();

        for i in 0..75 {
            let f = if (20..55).contains(&i) {
                Frame::new(i, (640, 480), vec![])
            } else {
                frame(i, 180.0, true)
            };

            let report = p.process(&f);
            ids.extend(report.tracks.iter().map(|t| t.track_id));

            if i >= 55 {
                assert_eq!(report.observed, 0);
            }
        }
        p.finish();

        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec![1]);
        assert_eq!(p.outbox().len(), 1);
        assert!(p.sessions().is_retired(1));
    }

    #[test]
    fn deleted_track_releases_its_retired_id() {
        let config = Config {
            fps: 10.0,
            min_hits: 1,
            max_age: 40,
            ..Default::default()
        };
        let mut p = pipeline(&config);

        for i in 0..20 {
            p.process(&frame(i, 180.0, true));
        }
        // swept after 3s, deleted after 40 frames unmatched
        for i in 20..55 {
            p.process(&Frame::new(i, (640, 480), vec![]));
        }
        assert!(p.sessions().is_retired(1));

        for i in 55..65 {
            p.process(&Frame::new(i, (640, 480), vec![]));
        }
        assert!(p.tracker().is_empty());
        assert!(!p.sessions().is_retired(1));
        assert_eq!(p.outbox().len(), 1);
    }

    #[test]
    fn far_observations_are_gated() {
        let config = config();
        let mut p = pipeline(&config);

        let report = p.process(&frame(0, 650.0, true));
        assert_eq!(report.tracks.len(), 1);
        assert_eq!(report.observed, 0);
        assert!(p.sessions().is_empty());
    }

    #[test]
    fn finish_flushes_live_sessions() {
        let config = config();
        let mut p = pipeline(&config);

        for i in 0..20 {
            p.process(&frame(i, 200.0, false));
        }

        assert_eq!(p.finish(), 1);
        assert!(p.sessions().is_empty());
        assert_eq!(p.outbox().try_pop().unwrap().duration_seconds, 2);
    }

    #[test]
    fn shutdown_abandons_live_sessions() {
        let config = config();
        let mut p = pipeline(&config);

        for i in 0..20 {
            p.process(&frame(i, 200.0, false));
        }

        assert_eq!(p.shutdown(), 1);
        assert!(p.outbox().is_empty());
        assert_eq!(p.sessions().stats().abandoned, 1);
    }
}
