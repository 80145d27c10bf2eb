use crate::tensor::Tensor;

/// Tracks the running min/max of everything it sees.
#[derive(Clone, Debug, Default)]
pub struct MinMaxObserver {
    min: Option<f32>,
    max: Option<f32>,
}

impl MinMaxObserver {
    pub fn observe(&mut self, x: &Tensor) {
        let data = x.data();
        if data.is_empty() {
            return;
        }
        let (mut lo, mut hi) = (f32::INFINITY, f32::NEG_INFINITY);
        for &v in data.iter() {
            lo = lo.min(v);
            hi = hi.max(v);
        }
        self.min = Some(self.min.map_or(lo, |m| m.min(lo)));
        self.max = Some(self.max.map_or(hi, |m| m.max(hi)));
    }

    pub fn min_max(&self) -> Option<(f32, f32)> {
        match (self.min, self.max) {
            (Some(lo), Some(hi)) => Some((lo, hi)),
            _ => None,
        }
    }

    pub fn reset(&mut self) {
        self.min = None;
        self.max = None;
    }
}

/// Exponential moving average of per-batch min/max, for activation
/// ranges that drift across calibration batches.
#[derive(Clone, Debug)]
pub struct MovingAverageMinMaxObserver {
    averaging_constant: f32,
    min: Option<f32>,
    max: Option<f32>,
}

impl MovingAverageMinMaxObserver {
    pub fn new(averaging_constant: f32) -> Self {
        MovingAverageMinMaxObserver {
            averaging_constant,
            min: None,
            max: None,
        }
    }

    pub fn observe(&mut self, x: &Tensor) {
        let data = x.data();
        if data.is_empty() {
            return;
        }
        let (mut lo, mut hi) = (f32::INFINITY, f32::NEG_INFINITY);
        for &v in data.iter() {
            lo = lo.min(v);
            hi = hi.max(v);
        }
        let c = self.averaging_constant;
        self.min = Some(match self.min {
            Some(m) => m + c * (lo - m),
            None => lo,
        });
        self.max = Some(match self.max {
            Some(m) => m + c * (hi - m),
            None => hi,
        });
    }

    pub fn min_max(&self) -> Option<(f32, f32)> {
        match (self.min, self.max) {
            (Some(lo), Some(hi)) => Some((lo, hi)),
            _ => None,
        }
    }

    pub fn reset(&mut self) {
        self.min = None;
        self.max = None;
    }
}

impl Default for MovingAverageMinMaxObserver {
    fn default() -> Self {
        MovingAverageMinMaxObserver::new(0.01)
    }
}

/// Enum dispatch keeps fake quantizers cheaply clonable for deep model
/// copies.
#[derive(Clone, Debug)]
pub enum Observer {
    MinMax(MinMaxObserver),
    MovingAverage(MovingAverageMinMaxObserver),
}

impl Observer {
    pub fn min_max_default() -> Self {
        Observer::MinMax(MinMaxObserver::default())
    }

    pub fn moving_average_default() -> Self {
        Observer::MovingAverage(MovingAverageMinMaxObserver::default())
    }

    pub fn observe(&mut self, x: &Tensor) {
        match self {
            Observer::MinMax(o) => o.observe(x),
            Observer::MovingAverage(o) => o.observe(x),
        }
    }

    pub fn min_max(&self) -> Option<(f32, f32)> {
        match self {
            Observer::MinMax(o) => o.min_max(),
            Observer::MovingAverage(o) => o.min_max(),
        }
    }

    pub fn reset(&mut self) {
        match self {
            Observer::MinMax(o) => o.reset(),
            Observer::MovingAverage(o) => o.reset(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minmax_tracks_extremes_across_batches() {
        let mut o = MinMaxObserver::default();
        o.observe(&Tensor::new(vec![1.0, 2.0], &[2]));
        o.observe(&Tensor::new(vec![-3.0, 0.5], &[2]));
        assert_eq!(o.min_max(), Some((-3.0, 2.0)));
    }

    #[test]
    fn moving_average_blends_toward_new_batches() {
        let mut o = MovingAverageMinMaxObserver::new(0.5);
        o.observe(&Tensor::new(vec![0.0, 4.0], &[2]));
        o.observe(&Tensor::new(vec![0.0, 8.0], &[2]));
        let (_, hi) = o.min_max().unwrap();
        assert!((hi - 6.0).abs() < 1e-6);
    }

    #[test]
    fn reset_forgets_history() {
        let mut o = MinMaxObserver::default();
        o.observe(&Tensor::new(vec![5.0], &[1]));
        o.reset();
        assert!(o.min_max().is_none());
    }
}
