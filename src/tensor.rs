use crate::{ops, tape::Tape};
use smallvec::SmallVec;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

#[derive(Clone)]
pub struct Tensor {
    data: Rc<RefCell<Vec<f32>>>,
    pub(crate) shape: SmallVec<[usize; 4]>,
    // In-place gradient accumulation buffer (allocated on demand)
    pub grad: Rc<RefCell<Option<Vec<f32>>>>,
    pub requires_grad: bool,
    pub tape_node: Cell<Option<usize>>,
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("requires_grad", &self.requires_grad)
            .field("has_grad", &self.grad.borrow().is_some())
            .finish()
    }
}

impl Tensor {
    pub fn new(data: Vec<f32>, shape: &[usize]) -> Self {
        debug_assert_eq!(data.len(), shape.iter().product::<usize>());
        Tensor {
            data: Rc::new(RefCell::new(data)),
            shape: shape.iter().cloned().collect(),
            grad: Rc::new(RefCell::new(None)),
            requires_grad: false,
            tape_node: Cell::new(None),
        }
    }

    pub fn scalar(value: f32) -> Self {
        Tensor::new(vec![value], &[1])
    }

    pub fn full(shape: &[usize], value: f32) -> Self {
        let n: usize = shape.iter().product();
        Tensor::new(vec![value; n], shape)
    }

    pub fn requires_grad(mut self) -> Self {
        self.requires_grad = true;
        self
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn data(&self) -> std::cell::Ref<'_, Vec<f32>> {
        self.data.borrow()
    }

    /// Get mutable access to data
    pub fn data_mut(&self) -> std::cell::RefMut<'_, Vec<f32>> {
        self.data.borrow_mut()
    }

    /// Deep copy: fresh buffers, no aliasing with `self`, no tape history.
    /// Experiment variants clone the base model through this so that
    /// in-place mutations in one branch never leak into another.
    pub fn detached(&self) -> Tensor {
        let mut t = Tensor::new(self.data().clone(), &self.shape);
        t.requires_grad = self.requires_grad;
        t
    }

    /// Zero-copy view of gradient buffer, if present.
    pub fn grad_ref(&self) -> Option<std::cell::Ref<'_, Vec<f32>>> {
        let r = self.grad.borrow();
        if r.is_some() {
            Some(std::cell::Ref::map(r, |opt| opt.as_ref().unwrap()))
        } else {
            None
        }
    }

    pub fn backward(&self) {
        // Seed ∂L/∂self = 1
        let ones = vec![1.0; self.len()];
        *self.grad.borrow_mut() = Some(ones);

        // Walk the tape from the node that produced this tensor.
        if let Some(node_id) = self.tape_node.get() {
            crate::tape::backward(node_id);
        }
    }

    pub fn zero_grad(&self) {
        *self.grad.borrow_mut() = None;
    }

    /// Fan-in aware uniform re-initialization (Kaiming uniform with
    /// negative-slope parameter `a`), applied in place. The gradient
    /// buffer is untouched.
    pub fn kaiming_uniform_(&self, a: f32) {
        use rand::distributions::{Distribution, Uniform};

        let fan_in = if self.shape.len() >= 2 {
            self.shape[1..].iter().product::<usize>()
        } else {
            self.shape[0]
        }
        .max(1);

        let gain = (2.0 / (1.0 + a * a)).sqrt();
        let bound = gain * (3.0 / fan_in as f32).sqrt();
        let dist = Uniform::new_inclusive(-bound, bound);

        let mut rng = rand::thread_rng();
        for v in self.data_mut().iter_mut() {
            *v = dist.sample(&mut rng);
        }
    }

    /// Transpose a 2D tensor
    pub fn transpose(&self) -> Tensor {
        assert_eq!(self.shape.len(), 2, "Can only transpose 2D tensors");

        let rows = self.shape[0];
        let cols = self.shape[1];

        let result = {
            let data = self.data();
            let mut result = vec![0.0; data.len()];
            for i in 0..rows {
                for j in 0..cols {
                    result[j * rows + i] = data[i * cols + j];
                }
            }
            result
        };

        let mut output = Tensor::new(result, &[cols, rows]);

        if self.requires_grad {
            output.requires_grad = true;

            let input = self.clone();
            let out = output.clone();

            Tape::push_unary_op(self, &output, move || {
                if let Some(gout) = out.grad.borrow().as_ref() {
                    // grad_input = transpose(grad_output)
                    let mut slot = input.grad.borrow_mut();
                    if slot.is_none() {
                        *slot = Some(vec![0.0; rows * cols]);
                    }
                    let gin = slot.as_mut().unwrap();
                    // gout shape: [cols, rows], gin shape: [rows, cols]
                    for i in 0..rows {
                        for j in 0..cols {
                            gin[i * cols + j] += gout[j * rows + i];
                        }
                    }
                }
            });
        }

        output
    }

    /// Sigmoid activation
    pub fn sigmoid(&self) -> Tensor {
        let result_data: Vec<f32> = self
            .data()
            .iter()
            .map(|&x| 1.0 / (1.0 + (-x).exp()))
            .collect();

        let mut output = Tensor::new(result_data, &self.shape);

        if self.requires_grad {
            output.requires_grad = true;

            let input = self.clone();
            let out = output.clone();

            Tape::push_unary_op(self, &output, move || {
                if let Some(gout) = out.grad.borrow().as_ref() {
                    let y = out.data(); // σ(x) from forward
                    let mut slot = input.grad.borrow_mut();
                    if slot.is_none() {
                        *slot = Some(vec![0.0; y.len()]);
                    }
                    let gin = slot.as_mut().unwrap();
                    for ((gi, &g), &s) in gin.iter_mut().zip(gout.iter()).zip(y.iter()) {
                        *gi += g * s * (1.0 - s);
                    }
                }
            });
        }

        output
    }

    /// Elementwise floor. Zero gradient almost everywhere, so the result
    /// does not participate in autograd.
    pub fn floor(&self) -> Tensor {
        let result: Vec<f32> = self.data().iter().map(|&x| x.floor()).collect();
        Tensor::new(result, &self.shape)
    }

    /// Clamp to `[lo, hi]`. The gradient passes through where the input
    /// lies inside the active range and is cut off outside it.
    pub fn clamp(&self, lo: f32, hi: f32) -> Tensor {
        let result: Vec<f32> = self.data().iter().map(|&x| x.clamp(lo, hi)).collect();

        let mut output = Tensor::new(result, &self.shape);

        if self.requires_grad {
            output.requires_grad = true;

            let input = self.clone();
            let out = output.clone();

            Tape::push_unary_op(self, &output, move || {
                if let Some(gout) = out.grad.borrow().as_ref() {
                    let x = input.data();
                    let mut slot = input.grad.borrow_mut();
                    if slot.is_none() {
                        *slot = Some(vec![0.0; x.len()]);
                    }
                    let gin = slot.as_mut().unwrap();
                    for ((gi, &g), &v) in gin.iter_mut().zip(gout.iter()).zip(x.iter()) {
                        if v >= lo && v <= hi {
                            *gi += g;
                        }
                    }
                }
            });
        }

        output
    }

    pub fn abs(&self) -> Tensor {
        let result: Vec<f32> = self.data().iter().map(|&x| x.abs()).collect();

        let mut output = Tensor::new(result, &self.shape);

        if self.requires_grad {
            output.requires_grad = true;

            let input = self.clone();
            let out = output.clone();

            Tape::push_unary_op(self, &output, move || {
                if let Some(gout) = out.grad.borrow().as_ref() {
                    let x = input.data();
                    let mut slot = input.grad.borrow_mut();
                    if slot.is_none() {
                        *slot = Some(vec![0.0; x.len()]);
                    }
                    let gin = slot.as_mut().unwrap();
                    for ((gi, &g), &v) in gin.iter_mut().zip(gout.iter()).zip(x.iter()) {
                        *gi += g * v.signum();
                    }
                }
            });
        }

        output
    }

    /// Elementwise power with a scalar exponent.
    pub fn powf(&self, p: f32) -> Tensor {
        let result: Vec<f32> = self.data().iter().map(|&x| x.powf(p)).collect();

        let mut output = Tensor::new(result, &self.shape);

        if self.requires_grad {
            output.requires_grad = true;

            let input = self.clone();
            let out = output.clone();

            Tape::push_unary_op(self, &output, move || {
                if let Some(gout) = out.grad.borrow().as_ref() {
                    let x = input.data();
                    let mut slot = input.grad.borrow_mut();
                    if slot.is_none() {
                        *slot = Some(vec![0.0; x.len()]);
                    }
                    let gin = slot.as_mut().unwrap();
                    for ((gi, &g), &v) in gin.iter_mut().zip(gout.iter()).zip(x.iter()) {
                        *gi += g * p * v.powf(p - 1.0);
                    }
                }
            });
        }

        output
    }

    pub fn mul_scalar(&self, c: f32) -> Tensor {
        let result: Vec<f32> = self.data().iter().map(|&x| x * c).collect();

        let mut output = Tensor::new(result, &self.shape);

        if self.requires_grad {
            output.requires_grad = true;

            let input = self.clone();
            let out = output.clone();

            Tape::push_unary_op(self, &output, move || {
                if let Some(gout) = out.grad.borrow().as_ref() {
                    ops::accumulate_grad_scaled(&input, gout, c);
                }
            });
        }

        output
    }

    pub fn div_scalar(&self, c: f32) -> Tensor {
        self.mul_scalar(1.0 / c)
    }

    pub fn add_scalar(&self, c: f32) -> Tensor {
        let result: Vec<f32> = self.data().iter().map(|&x| x + c).collect();

        let mut output = Tensor::new(result, &self.shape);

        if self.requires_grad {
            output.requires_grad = true;

            let input = self.clone();
            let out = output.clone();

            Tape::push_unary_op(self, &output, move || {
                if let Some(gout) = out.grad.borrow().as_ref() {
                    ops::accumulate_grad(&input, gout);
                }
            });
        }

        output
    }

    /// Supports adding [batch, features] + [features] -> [batch, features]
    pub fn add_broadcast(&self, other: &Tensor) -> Tensor {
        // Fast path: identical shapes
        if self.shape == other.shape {
            return self + other;
        }

        assert!(
            self.shape.len() == 2 && other.shape.len() == 1,
            "Unsupported broadcasting shapes: {:?} and {:?}",
            self.shape,
            other.shape
        );
        assert_eq!(
            self.shape[1], other.shape[0],
            "Last dimension must match for broadcasting"
        );

        let batch_size = self.shape[0];
        let features = self.shape[1];

        let result = {
            let self_data = self.data();
            let other_data = other.data();
            let mut result = vec![0.0; self_data.len()];
            for b in 0..batch_size {
                for f in 0..features {
                    let idx = b * features + f;
                    result[idx] = self_data[idx] + other_data[f];
                }
            }
            result
        };

        let mut output = Tensor::new(result, &self.shape);

        if self.requires_grad || other.requires_grad {
            output.requires_grad = true;

            let a = self.clone();
            let b = other.clone();
            let out = output.clone();

            Tape::push_binary_op(self, other, &output, move || {
                if let Some(gout) = out.grad.borrow().as_ref() {
                    // dL/dA = dL/dY
                    if a.requires_grad {
                        ops::accumulate_grad(&a, gout);
                    }

                    // dL/dB[f] = sum_b dL/dY[b,f]
                    if b.requires_grad {
                        let mut bias_grad = vec![0.0; features];
                        for batch in 0..batch_size {
                            for f in 0..features {
                                bias_grad[f] += gout[batch * features + f];
                            }
                        }
                        ops::accumulate_grad(&b, &bias_grad);
                    }
                }
            });
        }

        output
    }

    /// Sum of all elements, as a scalar tensor.
    pub fn sum(&self) -> Tensor {
        let total: f32 = self.data().iter().sum();

        let mut output = Tensor::scalar(total);

        if self.requires_grad {
            output.requires_grad = true;

            let input = self.clone();
            let out = output.clone();

            Tape::push_unary_op(self, &output, move || {
                if let Some(gout) = out.grad.borrow().as_ref() {
                    let grad_vec = vec![gout[0]; input.len()];
                    ops::accumulate_grad(&input, &grad_vec);
                }
            });
        }

        output
    }

    /// Mean of all elements
    pub fn mean(&self) -> Tensor {
        let (mean_val, n) = {
            let data = self.data();
            let n = data.len() as f32;
            (data.iter().sum::<f32>() / n, n)
        };

        let mut output = Tensor::scalar(mean_val);

        if self.requires_grad {
            output.requires_grad = true;

            let input = self.clone();
            let out = output.clone();

            Tape::push_unary_op(self, &output, move || {
                if let Some(gout) = out.grad.borrow().as_ref() {
                    // Each element gets gout / N
                    let g_each = gout[0] / n;
                    let grad_vec = vec![g_each; input.len()];
                    ops::accumulate_grad(&input, &grad_vec);
                }
            });
        }

        output
    }

    /// Frobenius norm: sqrt(sum(x^2)), as a scalar tensor.
    pub fn frobenius_norm(&self) -> Tensor {
        let norm: f32 = self.data().iter().map(|&x| x * x).sum::<f32>().sqrt();

        let mut output = Tensor::scalar(norm);

        if self.requires_grad {
            output.requires_grad = true;

            let input = self.clone();
            let out = output.clone();

            Tape::push_unary_op(self, &output, move || {
                if let Some(gout) = out.grad.borrow().as_ref() {
                    let n = out.data()[0];
                    if n == 0.0 {
                        return;
                    }
                    let g = gout[0];
                    let x = input.data();
                    let mut slot = input.grad.borrow_mut();
                    if slot.is_none() {
                        *slot = Some(vec![0.0; x.len()]);
                    }
                    let gin = slot.as_mut().unwrap();
                    // d||x|| / dx_i = x_i / ||x||
                    for (gi, &v) in gin.iter_mut().zip(x.iter()) {
                        *gi += g * v / n;
                    }
                }
            });
        }

        output
    }

    /// Row-wise argmax of a 2D tensor, returned as a [rows] tensor of
    /// class indices. Not differentiable.
    pub fn argmax_rows(&self) -> Tensor {
        assert_eq!(self.shape.len(), 2, "argmax_rows expects a 2D tensor");
        let rows = self.shape[0];
        let cols = self.shape[1];
        let data = self.data();

        let mut result = Vec::with_capacity(rows);
        for r in 0..rows {
            let row = &data[r * cols..(r + 1) * cols];
            let mut best = 0usize;
            for (c, &v) in row.iter().enumerate() {
                if v > row[best] {
                    best = c;
                }
            }
            result.push(best as f32);
        }
        drop(data);

        Tensor::new(result, &[rows])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Tape;

    #[test]
    fn detached_shares_nothing() {
        let a = Tensor::new(vec![1.0, 2.0], &[2]);
        let b = a.detached();
        b.data_mut()[0] = 42.0;
        assert_eq!(a.data()[0], 1.0);
        assert_eq!(b.data()[0], 42.0);
    }

    #[test]
    fn clamp_cuts_gradient_outside_range() {
        Tape::reset();
        let x = Tensor::new(vec![-2.0, 0.5, 3.0], &[3]).requires_grad();
        let y = x.clamp(0.0, 1.0);
        let s = y.sum();
        s.backward();

        let g = x.grad_ref().unwrap();
        assert_eq!(g[0], 0.0);
        assert_eq!(g[1], 1.0);
        assert_eq!(g[2], 0.0);
    }

    #[test]
    fn floor_breaks_the_graph() {
        Tape::reset();
        let x = Tensor::new(vec![2.7], &[1]).requires_grad();
        let y = x.floor();
        assert_eq!(y.data()[0], 2.0);
        assert!(!y.requires_grad);
    }

    #[test]
    fn frobenius_norm_value_and_grad() {
        Tape::reset();
        let x = Tensor::new(vec![3.0, 4.0], &[2]).requires_grad();
        let n = x.frobenius_norm();
        assert!((n.data()[0] - 5.0).abs() < 1e-6);

        n.backward();
        let g = x.grad_ref().unwrap();
        assert!((g[0] - 0.6).abs() < 1e-6);
        assert!((g[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn kaiming_uniform_respects_fan_in_bound() {
        let t = Tensor::full(&[8, 32], 0.0);
        t.kaiming_uniform_(5.0f32.sqrt());

        // gain = sqrt(2 / (1 + 5)) = sqrt(1/3); bound = 1 / sqrt(fan_in)
        let bound = 1.0 / 32.0f32.sqrt();
        let data = t.data();
        assert!(data.iter().any(|&v| v != 0.0));
        assert!(data.iter().all(|&v| v.abs() <= bound + 1e-6));
    }

    #[test]
    fn argmax_rows_picks_largest() {
        let x = Tensor::new(vec![0.1, 0.9, 0.0, 0.7, 0.2, 0.1], &[2, 3]);
        let idx = x.argmax_rows();
        assert_eq!(idx.data().as_slice(), &[1.0, 0.0]);
    }
}
