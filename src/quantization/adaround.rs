//! Learned weight rounding. Instead of rounding weights to the nearest
//! grid point, each weight carries a continuous variable V whose
//! rectified sigmoid decides between rounding down and up. V is trained
//! against a per-layer reconstruction loss plus a regularizer that
//! pushes every rounding decision to a hard 0 or 1.

use super::config::QuantConfig;
use super::error::{QuantError, Result};
use super::fake_quantize::{fake_quantize_per_tensor, FakeQuantize};
use super::observers::Observer;
use crate::tensor::Tensor;
use std::cell::RefCell;

/// Rectified sigmoid h(V) = clamp(sigmoid(V) * 1.2 - 0.1, 0, 1).
/// The stretch past [0, 1] lets the regularizer drive decisions fully
/// hard without saturating sigmoid gradients.
pub fn clipped_sigmoid(v: &Tensor) -> Tensor {
    v.sigmoid().mul_scalar(1.2).add_scalar(-0.1).clamp(0.0, 1.0)
}

/// Hyperparameters for the rounding optimization.
#[derive(Clone, Debug)]
pub struct AdaRoundConfig {
    pub beta_high: f32,
    pub beta_low: f32,
    pub norm_scaling: f32,
    pub regularization_scaling: f32,
    pub total_epochs: u32,
    /// Optional explicit starting point for V. When absent, V is
    /// initialized lazily from the first weight shape seen.
    pub init_v: Option<Tensor>,
}

impl Default for AdaRoundConfig {
    fn default() -> Self {
        AdaRoundConfig {
            beta_high: 8.0,
            beta_low: 2.0,
            norm_scaling: 10.0,
            regularization_scaling: 0.1,
            total_epochs: 20,
            init_v: None,
        }
    }
}

impl AdaRoundConfig {
    pub fn validate(&self) -> Result<()> {
        if self.beta_low <= 0.0 || self.beta_high < self.beta_low {
            return Err(QuantError::InvalidConfig(format!(
                "beta range [{}, {}] must be positive and ordered",
                self.beta_low, self.beta_high
            )));
        }
        if self.norm_scaling <= 0.0 || self.regularization_scaling <= 0.0 {
            return Err(QuantError::InvalidConfig(
                "loss scalings must be positive".into(),
            ));
        }
        if self.total_epochs == 0 {
            return Err(QuantError::InvalidConfig(
                "total_epochs must be nonzero".into(),
            ));
        }
        Ok(())
    }

    /// Regularization exponent for optimization step `count`, annealed
    /// linearly across the configured epoch budget.
    pub fn beta(&self, count: u32) -> f32 {
        count as f32 / self.total_epochs as f32 * (self.beta_high - self.beta_low) + self.beta_low
    }
}

/// Fake quantizer whose rounding direction is learned per weight.
pub struct AdaRoundFakeQuantize {
    pub base: FakeQuantize,
    pub cfg: AdaRoundConfig,
    continuous_v: RefCell<Option<Tensor>>,
}

impl AdaRoundFakeQuantize {
    pub fn new(qconfig: QuantConfig, cfg: AdaRoundConfig) -> Result<Self> {
        qconfig.validate()?;
        cfg.validate()?;

        let continuous_v = RefCell::new(cfg.init_v.as_ref().map(|t| {
            let mut v = t.detached();
            v.requires_grad = true;
            v
        }));

        Ok(AdaRoundFakeQuantize {
            base: FakeQuantize::new(qconfig, Observer::min_max_default()),
            cfg,
            continuous_v,
        })
    }

    pub fn is_bound(&self) -> bool {
        self.continuous_v.borrow().is_some()
    }

    /// Allocate V for a weight shape. The conventional starting point is
    /// a small constant so every weight initially rounds down, and the
    /// reconstruction loss must argue each one up.
    pub fn bind(&self, shape: &[usize]) -> Result<()> {
        let mut slot = self.continuous_v.borrow_mut();
        if let Some(v) = slot.as_ref() {
            if v.shape() != shape {
                return Err(QuantError::ShapeMismatch {
                    bound: v.shape().to_vec(),
                    got: shape.to_vec(),
                });
            }
            return Ok(());
        }
        *slot = Some(Tensor::full(shape, 1e-4).requires_grad());
        Ok(())
    }

    /// The current V, detached from no graph (shares the live buffer so
    /// an optimizer can update it).
    pub fn rounding_variable(&self) -> Result<Tensor> {
        self.continuous_v
            .borrow()
            .as_ref()
            .cloned()
            .ok_or(QuantError::Unbound)
    }

    /// Soft rounding decisions h(V) in [0, 1].
    pub fn relaxation(&self) -> Result<Tensor> {
        Ok(clipped_sigmoid(&self.rounding_variable()?))
    }

    /// Re-draw V from a fan-in scaled uniform distribution, keeping the
    /// bound shape.
    pub fn randomize(&self) -> Result<()> {
        let slot = self.continuous_v.borrow();
        let v = slot.as_ref().ok_or(QuantError::Unbound)?;
        v.kaiming_uniform_(5.0f32.sqrt());
        Ok(())
    }

    /// Quantize `x` with learned rounding:
    /// scale * clamp(floor(x / scale) + h(V), qmin, qmax).
    /// Gradients flow to V only; floor cuts them off from x.
    pub fn adaround_rounding(&self, x: &Tensor) -> Result<Tensor> {
        let scale = self.base.scale();
        if scale <= 0.0 || !scale.is_finite() {
            return Err(QuantError::DegenerateScale(scale));
        }

        let slot = self.continuous_v.borrow();
        let v = slot.as_ref().ok_or(QuantError::Unbound)?;
        if v.shape() != x.shape() {
            return Err(QuantError::ShapeMismatch {
                bound: v.shape().to_vec(),
                got: x.shape().to_vec(),
            });
        }

        let floored = x.div_scalar(scale).floor();
        let soft = clipped_sigmoid(v);
        let q = (&floored + &soft).clamp(
            self.base.config.quant_min as f32,
            self.base.config.quant_max as f32,
        );
        Ok(q.mul_scalar(scale))
    }

    /// Observer-tracked forward: lazily binds V to the first weight
    /// shape seen, rounds with the current V, then runs the result
    /// through the base fake quantizer so its observer sees the rounded
    /// values.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.bind(x.shape())?;
        let rounded = self.adaround_rounding(x)?;
        Ok(self.base.forward(&rounded))
    }

    /// Combined rounding loss at optimization step `count`.
    ///
    /// With `custom_norm`, `float_weight` is taken to already be the
    /// reconstruction norm (e.g. computed from layer outputs). Otherwise
    /// it is the float weight tensor and the norm is the Frobenius
    /// distance between it and the fake-quantized learned rounding.
    pub fn layer_loss_function(
        &self,
        count: u32,
        float_weight: &Tensor,
        custom_norm: bool,
    ) -> Result<Tensor> {
        let norm = if custom_norm {
            float_weight.clone()
        } else {
            let rounded = self.adaround_rounding(float_weight)?;
            let quantized = fake_quantize_per_tensor(
                &rounded,
                self.base.scale(),
                self.base.zero_point(),
                self.base.config.quant_min,
                self.base.config.quant_max,
            );
            (float_weight - &quantized).frobenius_norm()
        };

        let beta = self.cfg.beta(count);

        // sum(1 - |2 h(V) - 1|^beta): zero once every decision is hard
        let spread = self
            .relaxation()?
            .mul_scalar(2.0)
            .add_scalar(-1.0)
            .abs()
            .powf(beta);
        let regularizer = spread.mul_scalar(-1.0).add_scalar(1.0).sum();

        let scaled_norm = norm.mul_scalar(self.cfg.norm_scaling);
        let scaled_reg = regularizer.mul_scalar(self.cfg.regularization_scaling);
        Ok(&scaled_norm + &scaled_reg)
    }

    /// Harden the learned rounding into a plain tensor: decisions at or
    /// above one half round up, the rest round down. No graph attached.
    pub fn freeze(&self, w: &Tensor) -> Result<Tensor> {
        let scale = self.base.scale();
        if scale <= 0.0 || !scale.is_finite() {
            return Err(QuantError::DegenerateScale(scale));
        }

        let slot = self.continuous_v.borrow();
        let v = slot.as_ref().ok_or(QuantError::Unbound)?;
        if v.shape() != w.shape() {
            return Err(QuantError::ShapeMismatch {
                bound: v.shape().to_vec(),
                got: w.shape().to_vec(),
            });
        }

        let mut v_frozen = v.detached();
        v_frozen.requires_grad = false;
        let h = clipped_sigmoid(&v_frozen);
        let wd = w.data();
        let hd = h.data();
        let (qmin, qmax) = (
            self.base.config.quant_min as f32,
            self.base.config.quant_max as f32,
        );
        let result: Vec<f32> = wd
            .iter()
            .zip(hd.iter())
            .map(|(&w, &h)| {
                let up = if h >= 0.5 { 1.0 } else { 0.0 };
                ((w / scale).floor() + up).clamp(qmin, qmax) * scale
            })
            .collect();
        drop(wd);
        drop(hd);

        Ok(Tensor::new(result, w.shape()))
    }
}

impl Clone for AdaRoundFakeQuantize {
    fn clone(&self) -> Self {
        let v = self.continuous_v.borrow().as_ref().map(|t| {
            let mut c = t.detached();
            c.requires_grad = true;
            c
        });
        AdaRoundFakeQuantize {
            base: self.base.clone(),
            cfg: self.cfg.clone(),
            continuous_v: RefCell::new(v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Tape;

    fn quantizer_with_unit_scale() -> AdaRoundFakeQuantize {
        let aq =
            AdaRoundFakeQuantize::new(QuantConfig::int8(true), AdaRoundConfig::default()).unwrap();
        aq.base.set_quant_params(1.0, 0);
        aq.base.enable_observer(false);
        aq
    }

    #[test]
    fn clipped_sigmoid_maps_zero_to_half() {
        let v = Tensor::new(vec![0.0, -50.0, 50.0], &[3]);
        let h = clipped_sigmoid(&v);
        let d = h.data();
        assert!((d[0] - 0.5).abs() < 1e-6);
        assert_eq!(d[1], 0.0);
        assert_eq!(d[2], 1.0);
    }

    #[test]
    fn rounding_with_neutral_v_adds_half_step() {
        let aq = quantizer_with_unit_scale();
        aq.bind(&[1]).unwrap();
        aq.rounding_variable().unwrap().data_mut()[0] = 0.0;

        // floor(2.3) + h(0) = 2.0 + 0.5
        let x = Tensor::new(vec![2.3], &[1]);
        let y = aq.adaround_rounding(&x).unwrap();
        assert!((y.data()[0] - 2.5).abs() < 1e-6);
    }

    #[test]
    fn rounding_stays_within_one_grid_step() {
        let aq = quantizer_with_unit_scale();
        aq.bind(&[4]).unwrap();
        aq.randomize().unwrap();

        let x = Tensor::new(vec![-3.7, -0.2, 0.4, 5.9], &[4]);
        let y = aq.adaround_rounding(&x).unwrap();
        let xd = x.data();
        let yd = y.data();
        for (&xi, &yi) in xd.iter().zip(yd.iter()) {
            assert!(yi >= xi.floor() - 1e-6 && yi <= xi.floor() + 1.0 + 1e-6);
        }
    }

    #[test]
    fn lazy_bind_starts_near_round_down() {
        let aq = quantizer_with_unit_scale();
        let x = Tensor::new(vec![1.4, 2.6], &[2]);
        aq.forward(&x).unwrap();

        let v = aq.rounding_variable().unwrap();
        assert_eq!(v.shape(), &[2]);
        assert!(v.data().iter().all(|&val| (val - 1e-4).abs() < 1e-9));
    }

    #[test]
    fn mismatched_shape_after_bind_is_an_error() {
        let aq = quantizer_with_unit_scale();
        aq.forward(&Tensor::full(&[2, 3], 0.5)).unwrap();

        let err = aq.forward(&Tensor::full(&[3, 2], 0.5)).unwrap_err();
        match err {
            QuantError::ShapeMismatch { bound, got } => {
                assert_eq!(bound, vec![2, 3]);
                assert_eq!(got, vec![3, 2]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn randomize_changes_values_but_not_shape() {
        let aq = quantizer_with_unit_scale();
        aq.bind(&[4, 8]).unwrap();
        aq.randomize().unwrap();

        let v = aq.rounding_variable().unwrap();
        assert_eq!(v.shape(), &[4, 8]);
        assert!(v.data().iter().any(|&val| (val - 1e-4).abs() > 1e-6));
    }

    #[test]
    fn randomize_before_bind_fails() {
        let aq = quantizer_with_unit_scale();
        assert!(matches!(aq.randomize(), Err(QuantError::Unbound)));
    }

    #[test]
    fn beta_anneals_between_configured_bounds() {
        let cfg = AdaRoundConfig::default();
        assert!((cfg.beta(0) - cfg.beta_low).abs() < 1e-6);
        assert!((cfg.beta(cfg.total_epochs) - cfg.beta_high).abs() < 1e-6);
    }

    #[test]
    fn loss_regularizer_vanishes_for_hard_decisions() {
        let aq = quantizer_with_unit_scale();
        aq.bind(&[2]).unwrap();
        {
            let v = aq.rounding_variable().unwrap();
            let mut d = v.data_mut();
            d[0] = 50.0;
            d[1] = -50.0;
        }

        Tape::reset();
        let norm = Tensor::scalar(0.0);
        let loss = aq.layer_loss_function(0, &norm, true).unwrap();
        assert!(loss.data()[0].abs() < 1e-5);
    }

    #[test]
    fn loss_penalizes_undecided_rounding() {
        let aq = quantizer_with_unit_scale();
        aq.bind(&[1]).unwrap();
        aq.rounding_variable().unwrap().data_mut()[0] = 0.0;

        Tape::reset();
        let norm = Tensor::scalar(0.0);
        let loss = aq.layer_loss_function(0, &norm, true).unwrap();
        // h(0) = 0.5 is maximally undecided: reg = scaling * 1
        assert!((loss.data()[0] - aq.cfg.regularization_scaling).abs() < 1e-5);
    }

    #[test]
    fn freeze_hardens_to_grid_points() {
        let aq = quantizer_with_unit_scale();
        aq.bind(&[2]).unwrap();
        {
            let v = aq.rounding_variable().unwrap();
            let mut d = v.data_mut();
            d[0] = 50.0; // round up
            d[1] = -50.0; // round down
        }

        let w = Tensor::new(vec![2.3, 2.3], &[2]);
        let frozen = aq.freeze(&w).unwrap();
        assert_eq!(frozen.data()[0], 3.0);
        assert_eq!(frozen.data()[1], 2.0);
    }

    #[test]
    fn loss_gradient_reaches_v() {
        let aq = quantizer_with_unit_scale();
        aq.bind(&[3]).unwrap();

        Tape::reset();
        let w = Tensor::new(vec![0.3, 1.7, -0.6], &[3]);
        let loss = aq.layer_loss_function(1, &w, false).unwrap();
        loss.backward();

        let v = aq.rounding_variable().unwrap();
        assert!(v.grad_ref().is_some());
    }
}
