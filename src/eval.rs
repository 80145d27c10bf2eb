use crate::data::DataLoader;
use crate::nn::Module;
use crate::tape::Tape;
use crate::tensor::Tensor;

/// Running average over weighted updates.
#[derive(Default, Clone, Copy)]
pub struct AverageMeter {
    pub avg: f32,
    sum: f32,
    count: usize,
}

impl AverageMeter {
    pub fn new() -> Self {
        AverageMeter::default()
    }

    pub fn update(&mut self, val: f32, n: usize) {
        self.sum += val * n as f32;
        self.count += n;
        if self.count > 0 {
            self.avg = self.sum / self.count as f32;
        }
    }
}

/// Fraction of rows where the target appears in the top `k` logits,
/// as a percentage.
fn topk_accuracy(logits: &Tensor, targets: &Tensor, k: usize) -> f32 {
    let rows = logits.shape()[0];
    let cols = logits.shape()[1];
    let d = logits.data();
    let t = targets.data();

    let mut correct = 0usize;
    for r in 0..rows {
        let row = &d[r * cols..(r + 1) * cols];
        let target = t[r] as usize;
        let target_score = row[target];
        // Count how many classes strictly beat the target
        let better = row.iter().filter(|&&v| v > target_score).count();
        if better < k {
            correct += 1;
        }
    }
    100.0 * correct as f32 / rows as f32
}

/// Run `model` over up to `neval_batches` batches and report top-1 and
/// top-5 accuracy meters.
pub fn evaluate(
    model: &dyn Module,
    loader: &mut DataLoader,
    neval_batches: usize,
) -> (AverageMeter, AverageMeter) {
    let mut top1 = AverageMeter::new();
    let mut top5 = AverageMeter::new();

    loader.reset();
    let mut seen = 0;
    while let Some((images, labels)) = loader.next_batch() {
        Tape::reset();
        let logits = model.forward(&images);
        let n = images.shape()[0];
        top1.update(topk_accuracy(&logits, &labels, 1), n);
        top5.update(topk_accuracy(&logits, &labels, 5), n);

        seen += 1;
        if seen >= neval_batches {
            break;
        }
    }

    (top1, top5)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meter_weights_updates_by_count() {
        let mut m = AverageMeter::new();
        m.update(100.0, 1);
        m.update(0.0, 3);
        assert!((m.avg - 25.0).abs() < 1e-6);
    }

    #[test]
    fn topk_rewards_near_misses() {
        // Target class 2 ranks second of three
        let logits = Tensor::new(vec![0.1, 0.9, 0.5], &[1, 3]);
        let targets = Tensor::new(vec![2.0], &[1]);
        assert_eq!(topk_accuracy(&logits, &targets, 1), 0.0);
        assert_eq!(topk_accuracy(&logits, &targets, 2), 100.0);
    }
}
