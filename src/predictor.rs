use crate::bbox::{BBox, Ltrb, Xysr};
use crate::Float;
use nalgebra as na;

const DIM_X: usize = 7;
const DIM_Z: usize = 4;

type StateVector<F> = na::SVector<F, DIM_X>;
type StateMatrix<F> = na::SMatrix<F, DIM_X, DIM_X>;
type Measurement<F> = na::SVector<F, DIM_Z>;
type MeasurementMatrix<F> = na::SMatrix<F, DIM_Z, DIM_X>;

/// Lower bound for area and aspect ratio after every step; keeps the box
/// non-degenerate so the covariance update never sees a zero-area state.
pub const MIN_SCALE: f32 = 1e-3;

/// Constant-velocity Kalman filter over `[cx, cy, s, r, vcx, vcy, vs]`,
/// where `s` is the box area and `r` the (constant) width/height ratio.
#[derive(Debug, Clone)]
pub struct Predictor<F>
where
    F: Float,
{
    pub x: StateVector<F>,
    pub p: StateMatrix<F>,
    pub age: u32,
    pub time_since_update: u32,
    f: StateMatrix<F>,
    h: MeasurementMatrix<F>,
    q: StateMatrix<F>,
    r: na::SMatrix<F, DIM_Z, DIM_Z>,
}

impl<F> Predictor<F>
where
    F: Float,
{
    pub fn new(bbox: &BBox<Ltrb>) -> Self {
        let one = F::one();

        let mut f = StateMatrix::<F>::identity();
        f[(0, 4)] = one;
        f[(1, 5)] = one;
        f[(2, 6)] = one;

        let h = MeasurementMatrix::<F>::identity();

        let mut r = na::SMatrix::<F, DIM_Z, DIM_Z>::identity();
        r[(2, 2)] = na::convert::<f64, F>(10.0);
        r[(3, 3)] = na::convert::<f64, F>(10.0);

        // unobserved velocities start with high uncertainty
        let mut p = StateMatrix::<F>::identity() * na::convert::<f64, F>(10.0);
        for i in 4..DIM_X {
            p[(i, i)] = na::convert::<f64, F>(10_000.0);
        }

        let mut q = StateMatrix::<F>::identity();
        q[(4, 4)] = na::convert::<f64, F>(0.01);
        q[(5, 5)] = na::convert::<f64, F>(0.01);
        q[(6, 6)] = na::convert::<f64, F>(0.0001);

        let mut x = StateVector::<F>::zeros();
        x.fixed_rows_mut::<DIM_Z>(0).copy_from(&to_measurement(bbox));

        Self {
            x,
            p,
            age: 0,
            time_since_update: 0,
            f,
            h,
            q,
            r,
        }
    }

    /// Advances the state one frame. Never fails.
    pub fn predict(&mut self) {
        // area must not be driven through zero by its own velocity
        if self.x[6] + self.x[2] <= F::zero() {
            self.x[6] = F::zero();
        }

        self.x = self.f * self.x;
        self.p = self.f * self.p * self.f.transpose() + self.q;
        self.clamp_shape();

        self.age += 1;
        self.time_since_update += 1;
    }

    /// Standard linear Kalman correction with the observed box.
    ///
    /// Returns `false` when the innovation covariance is singular; the state is
    /// then re-seeded from the observation instead of corrected.
    pub fn correct(&mut self, bbox: &BBox<Ltrb>) -> bool {
        let z = to_measurement::<F>(bbox);
        self.time_since_update = 0;

        let pht = self.p * self.h.transpose();
        let s = self.h * pht + self.r;

        let s_inv = match s.try_inverse() {
            Some(inv) => inv,
            None => {
                self.x = StateVector::<F>::zeros();
                self.x.fixed_rows_mut::<DIM_Z>(0).copy_from(&z);
                return false;
            }
        };

        let k = pht * s_inv;
        let y = z - self.h * self.x;
        self.x += k * y;

        // Joseph form keeps P symmetric positive definite
        let i_kh = StateMatrix::<F>::identity() - k * self.h;
        self.p = i_kh * self.p * i_kh.transpose() + k * self.r * k.transpose();

        self.clamp_shape();

        true
    }

    #[inline]
    pub fn state(&self) -> BBox<Xysr> {
        BBox::xysr(
            to_f32(self.x[0]),
            to_f32(self.x[1]),
            to_f32(self.x[2]),
            to_f32(self.x[3]),
        )
    }

    #[inline]
    pub fn bbox(&self) -> BBox<Ltrb> {
        self.state().as_ltrb()
    }

    fn clamp_shape(&mut self) {
        let min = F::from_f32(MIN_SCALE).unwrap_or_else(F::zero);

        if !(self.x[2] > min) {
            self.x[2] = min;
        }

        if !(self.x[3] > min) {
            self.x[3] = min;
        }
    }
}

fn to_measurement<F: Float>(bbox: &BBox<Ltrb>) -> Measurement<F> {
    let z = bbox.as_xysr();

    Measurement::<F>::new(
        from_f32(z.cx()),
        from_f32(z.cy()),
        from_f32(z.scale()),
        from_f32(z.aspect_ratio()),
    )
}

#[inline(always)]
fn from_f32<F: Float>(v: f32) -> F {
    F::from_f32(v).unwrap_or_else(F::zero)
}

#[inline(always)]
fn to_f32<F: Float>(v: F) -> f32 {
    v.to_f32().unwrap_or(0.0)
}
