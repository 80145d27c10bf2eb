use crate::ops;
use crate::tape::Tape;
use crate::tensor::Tensor;

/// Row-wise softmax of 2D logits, numerically stabilized by max
/// subtraction. No autograd hook; use `cross_entropy_loss` for training.
pub fn softmax(logits: &Tensor) -> Tensor {
    assert_eq!(logits.shape().len(), 2, "softmax expects 2D logits");
    let rows = logits.shape()[0];
    let cols = logits.shape()[1];
    let data = logits.data();

    let mut result = vec![0.0; data.len()];
    for r in 0..rows {
        let row = &data[r * cols..(r + 1) * cols];
        let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0;
        for (o, &v) in result[r * cols..(r + 1) * cols].iter_mut().zip(row.iter()) {
            *o = (v - max).exp();
            sum += *o;
        }
        for o in result[r * cols..(r + 1) * cols].iter_mut() {
            *o /= sum;
        }
    }
    drop(data);

    Tensor::new(result, logits.shape())
}

/// Mean cross-entropy between logits [batch, classes] and integer
/// targets [batch]. Backward is the fused (softmax - onehot) / batch.
pub fn cross_entropy_loss(logits: &Tensor, targets: &Tensor) -> Tensor {
    assert_eq!(logits.shape().len(), 2, "logits must be 2D");
    let batch = logits.shape()[0];
    let classes = logits.shape()[1];
    assert_eq!(targets.len(), batch, "one target per row");

    let probs = softmax(logits);

    let loss_val = {
        let p = probs.data();
        let t = targets.data();
        let mut total = 0.0;
        for r in 0..batch {
            let cls = t[r] as usize;
            debug_assert!(cls < classes);
            total -= (p[r * classes + cls] + 1e-12).ln();
        }
        total / batch as f32
    };

    let mut output = Tensor::scalar(loss_val);

    if logits.requires_grad {
        output.requires_grad = true;

        let input = logits.clone();
        let tgt = targets.clone();
        let out = output.clone();

        Tape::push_unary_op(logits, &output, move || {
            if let Some(gout) = out.grad.borrow().as_ref() {
                let g = gout[0];
                let p = probs.data();
                let t = tgt.data();
                let mut grad = vec![0.0; batch * classes];
                for r in 0..batch {
                    let cls = t[r] as usize;
                    for c in 0..classes {
                        let onehot = if c == cls { 1.0 } else { 0.0 };
                        grad[r * classes + c] = g * (p[r * classes + c] - onehot) / batch as f32;
                    }
                }
                drop(p);
                drop(t);
                ops::accumulate_grad(&input, &grad);
            }
        });
    }

    output
}

/// Fraction of rows where the argmax matches the target class.
pub fn accuracy(logits: &Tensor, targets: &Tensor) -> f32 {
    let preds = logits.argmax_rows();
    let p = preds.data();
    let t = targets.data();
    let correct = p
        .iter()
        .zip(t.iter())
        .filter(|(&a, &b)| a as usize == b as usize)
        .count();
    correct as f32 / p.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn softmax_rows_sum_to_one() {
        let logits = Tensor::new(vec![1.0, 2.0, 3.0, -1.0, 0.0, 1.0], &[2, 3]);
        let p = softmax(&logits);
        let d = p.data();
        for r in 0..2 {
            let s: f32 = d[r * 3..(r + 1) * 3].iter().sum();
            assert!((s - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn cross_entropy_gradient_matches_softmax_minus_onehot() {
        Tape::reset();
        let logits = Tensor::new(vec![2.0, 1.0, 0.0], &[1, 3]).requires_grad();
        let targets = Tensor::new(vec![0.0], &[1]);
        let loss = cross_entropy_loss(&logits, &targets);
        loss.backward();

        let p = softmax(&logits);
        let pd = p.data();
        let g = logits.grad_ref().unwrap();
        assert!((g[0] - (pd[0] - 1.0)).abs() < 1e-5);
        assert!((g[1] - pd[1]).abs() < 1e-5);
        assert!((g[2] - pd[2]).abs() < 1e-5);
    }

    #[test]
    fn accuracy_counts_matches() {
        let logits = Tensor::new(vec![0.9, 0.1, 0.2, 0.8], &[2, 2]);
        let targets = Tensor::new(vec![0.0, 0.0], &[2]);
        assert!((accuracy(&logits, &targets) - 0.5).abs() < 1e-6);
    }
}
