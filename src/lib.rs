pub mod bbox;
pub mod clock;
pub mod config;
pub mod detection;
pub mod error;
pub mod frame;
pub mod math;
pub mod observer;
pub mod outbox;
pub mod pipeline;
pub mod predictor;
pub mod rolling_avg;
pub mod session;
pub mod track;
pub mod tracker;

mod circular_queue;

pub use config::Config;
pub use detection::Detection;
pub use error::Error;
pub use frame::Frame;
pub use session::{SessionManager, SessionPayload};
pub use track::{Track, TrackId};
pub use tracker::{SortTracker, TrackerConfig};

use nalgebra as na;
use std::fmt;
use std::rc::Rc;

pub trait Float:
    na::RealField
    + num_traits::FromPrimitive
    + num_traits::ToPrimitive
    + Copy
    + fmt::Debug
    + PartialEq
    + 'static
{
}

impl<T> Float for T where
    T: na::RealField
        + num_traits::FromPrimitive
        + num_traits::ToPrimitive
        + Copy
        + fmt::Debug
        + PartialEq
        + 'static
{
}

pub trait Tracking {
    /// Processes one frame and returns the confirmed tracks matched in it.
    fn update(&mut self, dets: &[Detection]) -> Vec<Track>;

    /// Tracks returned by the most recent `update`.
    fn tracks(&self) -> Rc<[Track]>;

    /// Ids deleted during the most recent `update`. They never come back.
    fn deleted(&self) -> &[TrackId];
}
