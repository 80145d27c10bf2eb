use super::config::QuantConfig;
use super::observers::Observer;
use crate::tape::Tape;
use crate::tensor::Tensor;
use std::cell::{Cell, RefCell};

/// Quantize-dequantize with a straight-through estimator: forward snaps
/// values to the integer grid, backward passes gradients through
/// unchanged wherever the input stays inside the representable range.
pub fn fake_quantize_per_tensor(
    x: &Tensor,
    scale: f32,
    zero_point: i32,
    quant_min: i32,
    quant_max: i32,
) -> Tensor {
    let result: Vec<f32> = x
        .data()
        .iter()
        .map(|&v| {
            let q = ((v / scale).round() as i32 + zero_point).clamp(quant_min, quant_max);
            (q - zero_point) as f32 * scale
        })
        .collect();

    let mut output = Tensor::new(result, x.shape());

    if x.requires_grad {
        output.requires_grad = true;

        let input = x.clone();
        let out = output.clone();
        let lo = (quant_min - zero_point) as f32 * scale;
        let hi = (quant_max - zero_point) as f32 * scale;

        Tape::push_unary_op(x, &output, move || {
            if let Some(gout) = out.grad.borrow().as_ref() {
                let xd = input.data();
                let masked: Vec<f32> = gout
                    .iter()
                    .zip(xd.iter())
                    .map(|(&g, &v)| if v >= lo && v <= hi { g } else { 0.0 })
                    .collect();
                drop(xd);
                crate::ops::accumulate_grad(&input, &masked);
            }
        });
    }

    output
}

/// Per-tensor fake quantizer with an attached range observer.
///
/// Interior mutability lets a shared `&self` forward pass update
/// observer state and quantization parameters, mirroring how the layer
/// is driven from `Module::forward`.
pub struct FakeQuantize {
    pub config: QuantConfig,
    observer: RefCell<Observer>,
    scale: Cell<f32>,
    zero_point: Cell<i32>,
    observer_enabled: Cell<bool>,
    fake_quant_enabled: Cell<bool>,
}

impl FakeQuantize {
    pub fn new(config: QuantConfig, observer: Observer) -> Self {
        FakeQuantize {
            config,
            observer: RefCell::new(observer),
            scale: Cell::new(1.0),
            zero_point: Cell::new(0),
            observer_enabled: Cell::new(true),
            fake_quant_enabled: Cell::new(true),
        }
    }

    pub fn scale(&self) -> f32 {
        self.scale.get()
    }

    pub fn zero_point(&self) -> i32 {
        self.zero_point.get()
    }

    pub fn set_quant_params(&self, scale: f32, zero_point: i32) {
        self.scale.set(scale);
        self.zero_point.set(zero_point);
    }

    pub fn enable_observer(&self, on: bool) {
        self.observer_enabled.set(on);
    }

    pub fn enable_fake_quant(&self, on: bool) {
        self.fake_quant_enabled.set(on);
    }

    pub fn forward(&self, x: &Tensor) -> Tensor {
        if self.observer_enabled.get() {
            let mut obs = self.observer.borrow_mut();
            obs.observe(x);
            if let Some((lo, hi)) = obs.min_max() {
                let (scale, zp) = self.config.quant_params(lo, hi);
                self.scale.set(scale);
                self.zero_point.set(zp);
            }
        }

        if self.fake_quant_enabled.get() {
            fake_quantize_per_tensor(
                x,
                self.scale.get(),
                self.zero_point.get(),
                self.config.quant_min,
                self.config.quant_max,
            )
        } else {
            x.clone()
        }
    }
}

impl Clone for FakeQuantize {
    fn clone(&self) -> Self {
        FakeQuantize {
            config: self.config,
            observer: RefCell::new(self.observer.borrow().clone()),
            scale: Cell::new(self.scale.get()),
            zero_point: Cell::new(self.zero_point.get()),
            observer_enabled: Cell::new(self.observer_enabled.get()),
            fake_quant_enabled: Cell::new(self.fake_quant_enabled.get()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_quant_snaps_to_grid() {
        let x = Tensor::new(vec![0.24, -0.26, 3.0], &[3]);
        let y = fake_quantize_per_tensor(&x, 0.1, 0, -128, 127);
        let d = y.data();
        assert!((d[0] - 0.2).abs() < 1e-6);
        assert!((d[1] + 0.3).abs() < 1e-6);
        assert!((d[2] - 3.0).abs() < 1e-6);
    }

    #[test]
    fn fake_quant_clamps_outside_the_grid() {
        let x = Tensor::new(vec![100.0], &[1]);
        let y = fake_quantize_per_tensor(&x, 0.1, 0, -128, 127);
        assert!((y.data()[0] - 12.7).abs() < 1e-5);
    }

    #[test]
    fn ste_passes_gradient_inside_range() {
        Tape::reset();
        let x = Tensor::new(vec![0.5, 100.0], &[2]).requires_grad();
        let y = fake_quantize_per_tensor(&x, 0.1, 0, -128, 127).sum();
        y.backward();
        let g = x.grad_ref().unwrap();
        assert_eq!(g[0], 1.0);
        assert_eq!(g[1], 0.0);
    }

    #[test]
    fn observer_updates_params_until_disabled() {
        let fq = FakeQuantize::new(QuantConfig::int8(true), Observer::min_max_default());
        fq.forward(&Tensor::new(vec![-1.0, 1.0], &[2]));
        let s1 = fq.scale();
        assert!((s1 - 1.0 / 127.0).abs() < 1e-7);

        fq.enable_observer(false);
        fq.forward(&Tensor::new(vec![-10.0, 10.0], &[2]));
        assert_eq!(fq.scale(), s1);
    }

    #[test]
    fn disabled_fake_quant_is_identity() {
        let fq = FakeQuantize::new(QuantConfig::int8(true), Observer::min_max_default());
        fq.enable_fake_quant(false);
        let x = Tensor::new(vec![0.123], &[1]);
        let y = fq.forward(&x);
        assert_eq!(y.data()[0], 0.123);
    }
}
