use crate::tensor::Tensor;

pub trait Optimizer {
    fn step(&mut self);
    fn zero_grad(&self);
    fn get_lr(&self) -> f32;
    fn set_lr(&mut self, lr: f32);
}

/// Adam with bias-corrected first and second moments.
pub struct Adam {
    params: Vec<Tensor>,
    lr: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    m: Vec<Vec<f32>>,
    v: Vec<Vec<f32>>,
    t: u64,
}

impl Adam {
    pub fn new(params: Vec<Tensor>, lr: f32) -> Self {
        let m = params.iter().map(|p| vec![0.0; p.len()]).collect();
        let v = params.iter().map(|p| vec![0.0; p.len()]).collect();
        Adam {
            params,
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            m,
            v,
            t: 0,
        }
    }
}

impl Optimizer for Adam {
    fn step(&mut self) {
        self.t += 1;
        let bc1 = 1.0 - self.beta1.powi(self.t as i32);
        let bc2 = 1.0 - self.beta2.powi(self.t as i32);

        for (i, param) in self.params.iter().enumerate() {
            let grad = param.grad.borrow();
            let Some(g) = grad.as_ref() else { continue };

            let m = &mut self.m[i];
            let v = &mut self.v[i];
            let mut data = param.data_mut();

            for j in 0..g.len() {
                m[j] = self.beta1 * m[j] + (1.0 - self.beta1) * g[j];
                v[j] = self.beta2 * v[j] + (1.0 - self.beta2) * g[j] * g[j];
                let m_hat = m[j] / bc1;
                let v_hat = v[j] / bc2;
                data[j] -= self.lr * m_hat / (v_hat.sqrt() + self.eps);
            }
        }
    }

    fn zero_grad(&self) {
        for p in &self.params {
            p.zero_grad();
        }
    }

    fn get_lr(&self) -> f32 {
        self.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }
}

/// Multiply the learning rate by `gamma` every `step_size` epochs.
pub struct StepLR {
    step_size: u32,
    gamma: f32,
    epoch: u32,
    base_lr: f32,
}

impl StepLR {
    pub fn new(base_lr: f32, step_size: u32, gamma: f32) -> Self {
        StepLR {
            step_size,
            gamma,
            epoch: 0,
            base_lr,
        }
    }

    pub fn step(&mut self, optimizer: &mut dyn Optimizer) {
        self.epoch += 1;
        let decays = self.epoch / self.step_size;
        optimizer.set_lr(self.base_lr * self.gamma.powi(decays as i32));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Tape;

    #[test]
    fn adam_moves_parameter_toward_minimum() {
        let p = Tensor::new(vec![5.0], &[1]).requires_grad();
        let mut opt = Adam::new(vec![p.clone()], 0.1);

        // Minimize p^2 by hand-supplied gradients
        for _ in 0..200 {
            Tape::reset();
            opt.zero_grad();
            let g = 2.0 * p.data()[0];
            *p.grad.borrow_mut() = Some(vec![g]);
            opt.step();
        }
        assert!(p.data()[0].abs() < 0.5);
    }

    #[test]
    fn step_lr_decays_at_boundaries() {
        let p = Tensor::new(vec![0.0], &[1]).requires_grad();
        let mut opt = Adam::new(vec![p], 0.1);
        let mut sched = StepLR::new(0.1, 2, 0.5);

        sched.step(&mut opt);
        assert!((opt.get_lr() - 0.1).abs() < 1e-8);
        sched.step(&mut opt);
        assert!((opt.get_lr() - 0.05).abs() < 1e-8);
    }
}
