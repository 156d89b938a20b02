//! Anonymous per-person sessions.
//!
//! A session aggregates everything observed about one confirmed track while it
//! is visible. Once it has been idle for `session_timeout_seconds` it is swept
//! out of the live set and flushed into a [`SessionPayload`], which carries no
//! track id and no per-frame data.

use crate::rolling_avg::RollingAvg;
use crate::track::TrackId;

use chrono::{DateTime, Duration, Utc};
use log::{debug, trace, warn};
use serde_derive::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AgeGroup {
    #[serde(rename = "0-17")]
    Under18,
    #[serde(rename = "18-24")]
    From18To24,
    #[serde(rename = "25-34")]
    From25To34,
    #[serde(rename = "35-44")]
    From35To44,
    #[serde(rename = "45-54")]
    From45To54,
    #[serde(rename = "55-64")]
    From55To64,
    #[serde(rename = "65+")]
    Over65,
    #[default]
    #[serde(rename = "unknown")]
    Unknown,
}

impl AgeGroup {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgeGroup::Under18 => "0-17",
            AgeGroup::From18To24 => "18-24",
            AgeGroup::From25To34 => "25-34",
            AgeGroup::From35To44 => "35-44",
            AgeGroup::From45To54 => "45-54",
            AgeGroup::From55To64 => "55-64",
            AgeGroup::Over65 => "65+",
            AgeGroup::Unknown => "unknown",
        }
    }
}

impl fmt::Display for AgeGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
    #[default]
    Unknown,
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Gender::Male => "male",
            Gender::Female => "female",
            Gender::Unknown => "unknown",
        })
    }
}

/// Per-frame demographic classification of one track.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Demographics {
    #[serde(default)]
    pub age_group: AgeGroup,
    #[serde(default)]
    pub gender: Gender,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub device_id: u32,
    pub session_timeout_seconds: f64,
    /// nominal frame rate used to turn looking frames into seconds
    pub fps: f64,
    pub min_session_duration_seconds: f64,
    /// UTC instant that timestamp 0.0 corresponds to
    pub epoch: DateTime<Utc>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            device_id: 12,
            session_timeout_seconds: 3.0,
            fps: 30.0,
            min_session_duration_seconds: 1.0,
            epoch: DateTime::<Utc>::from(std::time::UNIX_EPOCH),
        }
    }
}

/// Live aggregate for one track id. Timestamps are seconds on the stream clock.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub track_id: TrackId,
    pub device_id: u32,
    pub start_time: f64,
    pub last_update_time: f64,
    pub frame_count: u32,
    pub looking_frame_count: u32,
    pub age_group: AgeGroup,
    pub gender: Gender,
    distance: RollingAvg,
    // the tracker has already deleted this id
    track_deleted: bool,
}

impl Session {
    fn new(track_id: TrackId, device_id: u32, timestamp: f64) -> Self {
        Self {
            track_id,
            device_id,
            start_time: timestamp,
            last_update_time: timestamp,
            frame_count: 0,
            looking_frame_count: 0,
            age_group: AgeGroup::Unknown,
            gender: Gender::Unknown,
            distance: RollingAvg::new(),
            track_deleted: false,
        }
    }

    fn observe(&mut self, timestamp: f64, is_looking: bool, distance_cm: f32, demo: Demographics) {
        self.frame_count += 1;

        if is_looking {
            self.looking_frame_count += 1;
        }

        self.distance.push(distance_cm);

        // first confident label sticks for the whole session
        if self.age_group == AgeGroup::Unknown {
            self.age_group = demo.age_group;
        }

        if self.gender == Gender::Unknown {
            self.gender = demo.gender;
        }

        if timestamp > self.last_update_time {
            self.last_update_time = timestamp;
        }
    }

    #[inline]
    pub fn duration(&self) -> f64 {
        self.last_update_time - self.start_time
    }

    /// Running mean of every distance sample, if any.
    #[inline]
    pub fn mean_distance_cm(&self) -> Option<f64> {
        self.distance.mean()
    }

    #[inline]
    pub fn is_expired(&self, now: f64, timeout: f64) -> bool {
        now - self.last_update_time >= timeout
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PayloadDemographics {
    pub age_group: AgeGroup,
    pub gender_estimation: Gender,
    pub distance_cm: i32,
}

/// Anonymous aggregate of one finished session.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SessionPayload {
    pub device_id: u32,
    pub start_time: DateTime<Utc>,
    pub duration_seconds: i32,
    pub attention_seconds: f32,
    pub demographics: PayloadDemographics,
}

impl SessionPayload {
    /// Share of the dwell time spent looking at the screen.
    pub fn attention_rate(&self) -> f32 {
        if self.duration_seconds <= 0 {
            return 0.0;
        }

        self.attention_seconds / self.duration_seconds as f32
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub active: usize,
    /// flushed into a payload
    pub completed: u64,
    /// expired but shorter than the minimum duration
    pub discarded: u64,
    /// still live at shutdown
    pub abandoned: u64,
}

pub struct SessionManager {
    config: SessionConfig,
    sessions: BTreeMap<TrackId, Session>,
    // flushed ids whose track is still alive; they never open a second session
    retired: BTreeSet<TrackId>,
    stats: SessionStats,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Self {
        debug!(
            "session manager: timeout {}s, fps {}, min duration {}s",
            config.session_timeout_seconds, config.fps, config.min_session_duration_seconds
        );

        Self {
            config,
            sessions: BTreeMap::new(),
            retired: BTreeSet::new(),
            stats: SessionStats::default(),
        }
    }

    #[inline]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    #[inline]
    pub fn get(&self, track_id: TrackId) -> Option<&Session> {
        self.sessions.get(&track_id)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            active: self.sessions.len(),
            ..self.stats
        }
    }

    /// Whether `track_id` already had its session and may not open another.
    #[inline]
    pub fn is_retired(&self, track_id: TrackId) -> bool {
        self.retired.contains(&track_id)
    }

    /// Folds one frame's observation of `track_id` into its session, creating
    /// the session on first sight. Returns `false` when the observation was
    /// not taken.
    pub fn update(
        &mut self,
        track_id: TrackId,
        timestamp: f64,
        is_looking: bool,
        distance_cm: f32,
        demographics: Demographics,
    ) -> bool {
        if !timestamp.is_finite() {
            warn!("track {}: non-finite timestamp, observation skipped", track_id);
            return false;
        }

        if self.retired.contains(&track_id) {
            trace!("track {}: session already flushed, observation skipped", track_id);
            return false;
        }

        let device_id = self.config.device_id;
        let session = self.sessions.entry(track_id).or_insert_with(|| {
            debug!("session started: track {} at {:.3}s", track_id, timestamp);
            Session::new(track_id, device_id, timestamp)
        });

        session.observe(timestamp, is_looking, distance_cm, demographics);
        true
    }

    /// The tracker deleted `track_id`; the id can never be observed again.
    pub fn release(&mut self, track_id: TrackId) {
        if !self.retired.remove(&track_id) {
            if let Some(session) = self.sessions.get_mut(&track_id) {
                session.track_deleted = true;
            }
        }
    }

    fn retire(&mut self, session: &Session) {
        if !session.track_deleted {
            self.retired.insert(session.track_id);
        }
    }

    /// Removes and returns, in track id order, every session idle for at least
    /// the configured timeout.
    pub fn sweep(&mut self, now: f64) -> Vec<Session> {
        let timeout = self.config.session_timeout_seconds;

        let expired: Vec<TrackId> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.is_expired(now, timeout))
            .map(|(&id, _)| id)
            .collect();

        let mut swept = Vec::with_capacity(expired.len());

        for id in expired {
            if let Some(s) = self.sessions.remove(&id) {
                debug!("session expired: track {} after {:.3}s", s.track_id, s.duration());
                self.retire(&s);
                swept.push(s);
            }
        }

        swept
    }

    /// Consumes an expired session. Sessions shorter than the minimum duration
    /// produce nothing.
    pub fn flush_to_payload(&mut self, session: Session) -> Option<SessionPayload> {
        let duration = session.duration();

        if duration < self.config.min_session_duration_seconds {
            debug!(
                "session discarded: track {} lasted {:.3}s",
                session.track_id, duration
            );
            self.stats.discarded += 1;
            return None;
        }

        let duration_seconds = duration.round() as i32;
        let attention = session.looking_frame_count as f64 / self.config.fps;
        let attention_seconds = (attention as f32).min(duration_seconds as f32).max(0.0);

        let start_time = Duration::microseconds((session.start_time * 1e6).round() as i64);
        let start_time = self
            .config
            .epoch
            .checked_add_signed(start_time)
            .unwrap_or(self.config.epoch);

        self.stats.completed += 1;

        Some(SessionPayload {
            device_id: session.device_id,
            start_time,
            duration_seconds,
            attention_seconds,
            demographics: PayloadDemographics {
                age_group: session.age_group,
                gender_estimation: session.gender,
                distance_cm: session.mean_distance_cm().unwrap_or(0.0) as i32,
            },
        })
    }

    /// Sweeps and flushes in one step.
    pub fn collect(&mut self, now: f64) -> Vec<SessionPayload> {
        self.sweep(now)
            .into_iter()
            .filter_map(|s| self.flush_to_payload(s))
            .collect()
    }

    /// Ends every live session as if it had just expired, e.g. at end of input.
    pub fn drain(&mut self) -> Vec<SessionPayload> {
        let sessions = std::mem::take(&mut self.sessions);

        sessions
            .into_values()
            .filter_map(|s| {
                self.retire(&s);
                self.flush_to_payload(s)
            })
            .collect()
    }

    /// Drops every live session without producing payloads.
    pub fn abandon_all(&mut self) -> usize {
        let count = self.sessions.len();
        self.sessions.clear();
        self.stats.abandoned += count as u64;
        count
    }
}
