use chrono::{DateTime, Utc};

/// Where frame timestamps come from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Clock {
    /// Recorded input: frame `i` happens at `i / fps` seconds after the epoch.
    Stream { fps: f64, epoch: DateTime<Utc> },
    /// Live input: seconds since the Unix epoch at the moment of the call.
    Wall,
}

impl Clock {
    #[inline]
    pub fn stream(fps: f64, epoch: DateTime<Utc>) -> Self {
        Clock::Stream { fps, epoch }
    }

    /// Seconds on the session clock for the given frame.
    pub fn timestamp(&self, frame_index: u64) -> f64 {
        match *self {
            Clock::Stream { fps, .. } => frame_index as f64 / fps,
            Clock::Wall => seconds_since(Self::unix_epoch(), Utc::now()),
        }
    }

    /// UTC instant that timestamp 0.0 refers to.
    pub fn epoch(&self) -> DateTime<Utc> {
        match *self {
            Clock::Stream { epoch, .. } => epoch,
            Clock::Wall => Self::unix_epoch(),
        }
    }

    #[inline]
    pub fn is_live(&self) -> bool {
        matches!(self, Clock::Wall)
    }

    fn unix_epoch() -> DateTime<Utc> {
        DateTime::<Utc>::from(std::time::UNIX_EPOCH)
    }
}

fn seconds_since(epoch: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let elapsed = now.signed_duration_since(epoch);

    match elapsed.num_microseconds() {
        Some(us) => us as f64 / 1e6,
        None => elapsed.num_milliseconds() as f64 / 1e3,
    }
}
