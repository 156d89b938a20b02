use serde_derive::{Deserialize, Serialize};

use crate::bbox::{BBox, Ltrb};
use crate::error::Error;

/// Single-frame person detection, `bbox` in pixel space.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub bbox: BBox<Ltrb>,
    pub confidence: f32,
}

impl Detection {
    #[inline]
    pub fn new(bbox: [f32; 4], confidence: f32) -> Self {
        Self {
            bbox: bbox.into(),
            confidence,
        }
    }

    /// Rejects anything that must not reach the motion model.
    pub fn validate(&self, index: usize) -> Result<(), Error> {
        let reason = if !self.bbox.is_finite() {
            "non-finite coordinates"
        } else if self.bbox.width() <= 0.0 || self.bbox.height() <= 0.0 {
            "zero or negative area"
        } else if !(0.0..=1.0).contains(&self.confidence) {
            "confidence outside [0, 1]"
        } else {
            return Ok(());
        };

        Err(Error::InvalidDetection { index, reason })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_detection() {
        assert!(Detection::new([100.0, 100.0, 150.0, 200.0], 0.9)
            .validate(0)
            .is_ok());
    }

    #[test]
    fn rejects_malformed_detections() {
        let cases = [
            Detection::new([f32::NAN, 0.0, 10.0, 10.0], 0.5),
            Detection::new([0.0, 0.0, f32::INFINITY, 10.0], 0.5),
            Detection::new([10.0, 0.0, 10.0, 10.0], 0.5),
            Detection::new([0.0, 10.0, 10.0, 5.0], 0.5),
            Detection::new([0.0, 0.0, 10.0, 10.0], 1.5),
            Detection::new([0.0, 0.0, 10.0, 10.0], -0.1),
            Detection::new([0.0, 0.0, 10.0, 10.0], f32::NAN),
        ];

        for (idx, det) in cases.iter().enumerate() {
            match det.validate(idx) {
                Err(Error::InvalidDetection { index, .. }) => assert_eq!(index, idx),
                other => panic!("case {} was not rejected: {:?}", idx, other),
            }
        }
    }

    #[test]
    fn deserializes_from_json() {
        let det: Detection =
            serde_json::from_str(r#"{"bbox": [1, 2, 3, 4], "confidence": 0.5}"#).unwrap();
        assert_eq!(det, Detection::new([1.0, 2.0, 3.0, 4.0], 0.5));
    }
}
