use serde_derive::{Deserialize, Serialize};
use std::marker::PhantomData;

pub trait BBoxFormat: std::fmt::Debug + Copy {}

/// Left-top-right-bottom format, contains left top and right bottom corners
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq)]
pub struct Ltrb;
impl BBoxFormat for Ltrb {}

/// X-y-scale-ratio format, contains coordinates of the center of bbox, its area and w/h ratio
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq)]
pub struct Xysr;
impl BBoxFormat for Xysr {}

#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct BBox<F: BBoxFormat>([f32; 4], PhantomData<F>);

impl<F: BBoxFormat> From<BBox<F>> for [f32; 4] {
    fn from(bbox: BBox<F>) -> Self {
        bbox.0
    }
}

impl<F: BBoxFormat> From<[f32; 4]> for BBox<F> {
    fn from(slice: [f32; 4]) -> Self {
        BBox(slice, Default::default())
    }
}

impl<F: BBoxFormat> BBox<F> {
    #[inline]
    pub fn as_slice(&self) -> &[f32; 4] {
        &self.0
    }

    #[inline]
    pub fn is_finite(&self) -> bool {
        self.0.iter().all(|v| v.is_finite())
    }
}

impl BBox<Ltrb> {
    #[inline]
    pub fn ltrb(x1: f32, x2: f32, x3: f32, x4: f32) -> Self {
        BBox([x1, x2, x3, x4], Default::default())
    }

    #[inline]
    pub fn as_xysr(&self) -> BBox<Xysr> {
        self.into()
    }

    #[inline(always)]
    pub fn left(&self) -> f32 {
        self.0[0]
    }

    #[inline(always)]
    pub fn top(&self) -> f32 {
        self.0[1]
    }

    #[inline(always)]
    pub fn right(&self) -> f32 {
        self.0[2]
    }

    #[inline(always)]
    pub fn bottom(&self) -> f32 {
        self.0[3]
    }

    #[inline(always)]
    pub fn width(&self) -> f32 {
        self.0[2] - self.0[0]
    }

    #[inline(always)]
    pub fn height(&self) -> f32 {
        self.0[3] - self.0[1]
    }

    #[inline]
    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    #[inline]
    pub fn center(&self) -> (f32, f32) {
        (
            self.0[0] + self.width() / 2.0,
            self.0[1] + self.height() / 2.0,
        )
    }

    /// Intersection-over-union in [0, 1]; degenerate unions yield 0.
    pub fn iou(&self, other: &BBox<Ltrb>) -> f32 {
        let i_w = (self.right().min(other.right()) - self.left().max(other.left())).max(0.0);
        let i_h = (self.bottom().min(other.bottom()) - self.top().max(other.top())).max(0.0);
        let i_area = i_w * i_h;
        let union = self.area() + other.area() - i_area;

        if union <= f32::EPSILON || !union.is_finite() {
            return 0.0;
        }

        (i_area / union).clamp(0.0, 1.0)
    }
}

impl BBox<Xysr> {
    #[inline]
    pub fn xysr(x1: f32, x2: f32, x3: f32, x4: f32) -> Self {
        BBox([x1, x2, x3, x4], Default::default())
    }

    #[inline(always)]
    pub fn as_ltrb(&self) -> BBox<Ltrb> {
        self.into()
    }

    #[inline(always)]
    pub fn cx(&self) -> f32 {
        self.0[0]
    }

    #[inline(always)]
    pub fn cy(&self) -> f32 {
        self.0[1]
    }

    #[inline(always)]
    pub fn scale(&self) -> f32 {
        self.0[2]
    }

    #[inline(always)]
    pub fn aspect_ratio(&self) -> f32 {
        self.0[3]
    }
}

impl<'a> From<&'a BBox<Ltrb>> for BBox<Xysr> {
    #[inline]
    fn from(v: &'a BBox<Ltrb>) -> Self {
        let w = v.0[2] - v.0[0];
        let h = v.0[3] - v.0[1];

        Self(
            [v.0[0] + w / 2.0, v.0[1] + h / 2.0, w * h, w / h],
            Default::default(),
        )
    }
}

impl<'a> From<&'a BBox<Xysr>> for BBox<Ltrb> {
    #[inline]
    fn from(v: &'a BBox<Xysr>) -> Self {
        let w = (v.0[2] * v.0[3]).sqrt();
        let h = v.0[2] / w;

        Self(
            [
                v.0[0] - w / 2.0,
                v.0[1] - h / 2.0,
                v.0[0] + w / 2.0,
                v.0[1] + h / 2.0,
            ],
            Default::default(),
        )
    }
}
