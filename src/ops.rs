use crate::gemm;
use crate::tape::Tape;
use crate::tensor::Tensor;
use std::ops::{Add, Mul, Sub};

/// Accumulate `grad` into the tensor's gradient buffer, allocating it
/// on first touch.
pub fn accumulate_grad(tensor: &Tensor, grad: &[f32]) {
    let mut slot = tensor.grad.borrow_mut();
    if slot.is_none() {
        *slot = Some(vec![0.0; tensor.len()]);
    }
    let buf = slot.as_mut().unwrap();
    debug_assert_eq!(buf.len(), grad.len());
    for (b, &g) in buf.iter_mut().zip(grad.iter()) {
        *b += g;
    }
}

/// Like `accumulate_grad` but scales each contribution by `c`.
pub fn accumulate_grad_scaled(tensor: &Tensor, grad: &[f32], c: f32) {
    let mut slot = tensor.grad.borrow_mut();
    if slot.is_none() {
        *slot = Some(vec![0.0; tensor.len()]);
    }
    let buf = slot.as_mut().unwrap();
    debug_assert_eq!(buf.len(), grad.len());
    for (b, &g) in buf.iter_mut().zip(grad.iter()) {
        *b += c * g;
    }
}

impl Add for &Tensor {
    type Output = Tensor;

    fn add(self, other: &Tensor) -> Tensor {
        assert_eq!(self.shape(), other.shape(), "Shape mismatch in add");

        let result: Vec<f32> = self
            .data()
            .iter()
            .zip(other.data().iter())
            .map(|(&a, &b)| a + b)
            .collect();

        let mut output = Tensor::new(result, self.shape());

        if self.requires_grad || other.requires_grad {
            output.requires_grad = true;

            let a = self.clone();
            let b = other.clone();
            let out = output.clone();

            Tape::push_binary_op(self, other, &output, move || {
                if let Some(gout) = out.grad.borrow().as_ref() {
                    if a.requires_grad {
                        accumulate_grad(&a, gout);
                    }
                    if b.requires_grad {
                        accumulate_grad(&b, gout);
                    }
                }
            });
        }

        output
    }
}

impl Sub for &Tensor {
    type Output = Tensor;

    fn sub(self, other: &Tensor) -> Tensor {
        assert_eq!(self.shape(), other.shape(), "Shape mismatch in sub");

        let result: Vec<f32> = self
            .data()
            .iter()
            .zip(other.data().iter())
            .map(|(&a, &b)| a - b)
            .collect();

        let mut output = Tensor::new(result, self.shape());

        if self.requires_grad || other.requires_grad {
            output.requires_grad = true;

            let a = self.clone();
            let b = other.clone();
            let out = output.clone();

            Tape::push_binary_op(self, other, &output, move || {
                if let Some(gout) = out.grad.borrow().as_ref() {
                    if a.requires_grad {
                        accumulate_grad(&a, gout);
                    }
                    if b.requires_grad {
                        accumulate_grad_scaled(&b, gout, -1.0);
                    }
                }
            });
        }

        output
    }
}

impl Mul for &Tensor {
    type Output = Tensor;

    fn mul(self, other: &Tensor) -> Tensor {
        assert_eq!(self.shape(), other.shape(), "Shape mismatch in mul");

        let result: Vec<f32> = self
            .data()
            .iter()
            .zip(other.data().iter())
            .map(|(&a, &b)| a * b)
            .collect();

        let mut output = Tensor::new(result, self.shape());

        if self.requires_grad || other.requires_grad {
            output.requires_grad = true;

            let a = self.clone();
            let b = other.clone();
            let out = output.clone();

            Tape::push_binary_op(self, other, &output, move || {
                if let Some(gout) = out.grad.borrow().as_ref() {
                    if a.requires_grad {
                        let bd = b.data();
                        let scaled: Vec<f32> =
                            gout.iter().zip(bd.iter()).map(|(&g, &v)| g * v).collect();
                        accumulate_grad(&a, &scaled);
                    }
                    if b.requires_grad {
                        let ad = a.data();
                        let scaled: Vec<f32> =
                            gout.iter().zip(ad.iter()).map(|(&g, &v)| g * v).collect();
                        accumulate_grad(&b, &scaled);
                    }
                }
            });
        }

        output
    }
}

impl Tensor {
    /// Matrix multiply: [m, k] x [k, n] -> [m, n].
    pub fn matmul(&self, other: &Tensor) -> Tensor {
        assert_eq!(self.shape().len(), 2, "matmul lhs must be 2D");
        assert_eq!(other.shape().len(), 2, "matmul rhs must be 2D");

        let m = self.shape()[0];
        let kk = self.shape()[1];
        let n = other.shape()[1];
        assert_eq!(
            kk,
            other.shape()[0],
            "Inner dimensions must match in matmul"
        );

        let mut result = vec![0.0; m * n];
        {
            let a = self.data();
            let b = other.data();
            gemm::sgemm_rowmajor(
                gemm::Transpose::None,
                gemm::Transpose::None,
                m,
                n,
                kk,
                1.0,
                &a,
                &b,
                0.0,
                &mut result,
            );
        }

        let mut output = Tensor::new(result, &[m, n]);

        if self.requires_grad || other.requires_grad {
            output.requires_grad = true;

            let lhs = self.clone();
            let rhs = other.clone();
            let out = output.clone();

            Tape::push_binary_op(self, other, &output, move || {
                if let Some(gout) = out.grad.borrow().as_ref() {
                    // dL/dA = dL/dC @ B^T
                    if lhs.requires_grad {
                        let b = rhs.data();
                        let mut slot = lhs.grad.borrow_mut();
                        if slot.is_none() {
                            *slot = Some(vec![0.0; m * kk]);
                        }
                        let ga = slot.as_mut().unwrap();
                        gemm::sgemm_rowmajor(
                            gemm::Transpose::None,
                            gemm::Transpose::Ordinary,
                            m,
                            kk,
                            n,
                            1.0,
                            gout,
                            &b,
                            1.0,
                            ga,
                        );
                    }
                    // dL/dB = A^T @ dL/dC
                    if rhs.requires_grad {
                        let a = lhs.data();
                        let mut slot = rhs.grad.borrow_mut();
                        if slot.is_none() {
                            *slot = Some(vec![0.0; kk * n]);
                        }
                        let gb = slot.as_mut().unwrap();
                        gemm::sgemm_rowmajor(
                            gemm::Transpose::Ordinary,
                            gemm::Transpose::None,
                            kk,
                            n,
                            m,
                            1.0,
                            &a,
                            gout,
                            1.0,
                            gb,
                        );
                    }
                }
            });
        }

        output
    }

    /// ReLU activation
    pub fn relu(&self) -> Tensor {
        let result: Vec<f32> = self.data().iter().map(|&x| x.max(0.0)).collect();

        let mut output = Tensor::new(result, self.shape());

        if self.requires_grad {
            output.requires_grad = true;

            let input = self.clone();
            let out = output.clone();

            Tape::push_unary_op(self, &output, move || {
                if let Some(gout) = out.grad.borrow().as_ref() {
                    let x = input.data();
                    let masked: Vec<f32> = gout
                        .iter()
                        .zip(x.iter())
                        .map(|(&g, &v)| if v > 0.0 { g } else { 0.0 })
                        .collect();
                    drop(x);
                    accumulate_grad(&input, &masked);
                }
            });
        }

        output
    }
}

/// Standard-normal random tensor.
pub fn randn(shape: &[usize]) -> Tensor {
    use rand_distr::{Distribution, StandardNormal};
    let n: usize = shape.iter().product();
    let mut rng = rand::thread_rng();
    let data: Vec<f32> = (0..n).map(|_| StandardNormal.sample(&mut rng)).collect();
    Tensor::new(data, shape)
}
