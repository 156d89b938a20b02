/// Running arithmetic mean over every sample pushed so far.
///
/// Accumulates in `f64` so long sessions do not drift.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RollingAvg {
    mean: f64,
    count: u64,
}

impl RollingAvg {
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-finite samples are ignored. Returns whether the sample was taken.
    pub fn push(&mut self, value: f32) -> bool {
        if !value.is_finite() {
            return false;
        }

        self.count += 1;
        self.mean += (value as f64 - self.mean) / self.count as f64;

        true
    }

    #[inline]
    pub fn mean(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.mean)
        }
    }

    #[inline]
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
