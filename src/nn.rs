use crate::tensor::Tensor;

pub trait Module {
    fn forward(&self, input: &Tensor) -> Tensor;
    fn parameters(&self) -> Vec<Tensor>;
}

/// Fully connected layer: y = x @ W^T + b, weight stored [out, in].
pub struct Linear {
    pub weight: Tensor,
    pub bias: Tensor,
    pub in_features: usize,
    pub out_features: usize,
}

impl Linear {
    pub fn new(in_features: usize, out_features: usize) -> Self {
        // He-uniform init scaled for ReLU nets
        let bound = (6.0 / in_features as f32).sqrt();
        let mut weight = Tensor::full(&[out_features, in_features], 0.0);
        {
            use rand::distributions::{Distribution, Uniform};
            let dist = Uniform::new_inclusive(-bound, bound);
            let mut rng = rand::thread_rng();
            for v in weight.data_mut().iter_mut() {
                *v = dist.sample(&mut rng);
            }
        }
        weight.requires_grad = true;

        let bias = Tensor::full(&[out_features], 0.0).requires_grad();

        Linear {
            weight,
            bias,
            in_features,
            out_features,
        }
    }

    /// Deep copy with fresh parameter buffers.
    pub fn detached(&self) -> Linear {
        Linear {
            weight: self.weight.detached(),
            bias: self.bias.detached(),
            in_features: self.in_features,
            out_features: self.out_features,
        }
    }
}

impl Module for Linear {
    fn forward(&self, input: &Tensor) -> Tensor {
        let wt = self.weight.transpose();
        input.matmul(&wt).add_broadcast(&self.bias)
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![self.weight.clone(), self.bias.clone()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_output_shape() {
        let layer = Linear::new(4, 3);
        let x = Tensor::full(&[2, 4], 1.0);
        let y = layer.forward(&x);
        assert_eq!(y.shape(), &[2, 3]);
    }

    #[test]
    fn linear_bias_applied_per_row() {
        let layer = Linear::new(2, 2);
        layer.weight.data_mut().copy_from_slice(&[0.0; 4]);
        layer.bias.data_mut().copy_from_slice(&[1.0, -1.0]);

        let x = Tensor::full(&[3, 2], 5.0);
        let y = layer.forward(&x);
        let d = y.data();
        for r in 0..3 {
            assert_eq!(d[r * 2], 1.0);
            assert_eq!(d[r * 2 + 1], -1.0);
        }
    }

    #[test]
    fn detached_layer_does_not_alias_weights() {
        let layer = Linear::new(2, 2);
        let copy = layer.detached();
        copy.weight.data_mut()[0] = 99.0;
        assert_ne!(layer.weight.data()[0], 99.0);
    }
}
