use crate::detection::Detection;
use crate::error::Error;
use crate::session::{AgeGroup, Demographics, Gender};

use serde_derive::{Deserialize, Serialize};

pub const DEFAULT_DIMS: (u32, u32) = (640, 480);

fn default_dims() -> (u32, u32) {
    DEFAULT_DIMS
}

/// Per-detection attributes supplied by an upstream classifier.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Default)]
pub struct Annotation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_looking: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_cm: Option<f32>,
    #[serde(default)]
    pub age_group: AgeGroup,
    #[serde(default)]
    pub gender: Gender,
}

impl Annotation {
    #[inline]
    pub fn demographics(&self) -> Demographics {
        Demographics {
            age_group: self.age_group,
            gender: self.gender,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct FrameDetection {
    #[serde(flatten)]
    pub detection: Detection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation: Option<Annotation>,
}

impl From<Detection> for FrameDetection {
    fn from(detection: Detection) -> Self {
        Self {
            detection,
            annotation: None,
        }
    }
}

/// One video frame's worth of detector output.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Frame {
    pub index: u64,
    /// width, height in pixels
    #[serde(default = "default_dims")]
    pub dims: (u32, u32),
    #[serde(default)]
    pub detections: Vec<FrameDetection>,
}

impl Frame {
    pub fn new(index: u64, dims: (u32, u32), detections: Vec<FrameDetection>) -> Self {
        Self {
            index,
            dims,
            detections,
        }
    }

    /// Parses one JSON line of recorded detector output.
    pub fn from_json(line: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(line)?)
    }

    /// Plain detections in input order, as fed to the tracker.
    pub fn detections(&self) -> Vec<Detection> {
        self.iter().map(|d| d.detection).collect()
    }

    #[inline]
    pub fn annotation(&self, index: usize) -> Option<&Annotation> {
        self.detections.get(index)?.annotation.as_ref()
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.dims.0
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.dims.1
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.detections.len()
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &FrameDetection> {
        self.detections.iter()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }
}
