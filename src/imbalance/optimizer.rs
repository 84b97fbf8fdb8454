use crate::types::OptimizerKind;
use ndarray::Array1;
use std::f64::consts::PI;

const ADAM_B1: f64 = 0.9;
const ADAM_B2: f64 = 0.999;
const ADAM_EPS: f64 = 1e-8;
const ADAMW_WEIGHT_DECAY: f64 = 1e-4;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LearningRateSchedule {
    Constant(f64),
    /// `init · ½(1 + cos(π · min(step, decay_steps) / decay_steps))`.
    CosineDecay { init: f64, decay_steps: usize },
}

impl LearningRateSchedule {
    pub fn new(learning_rate: f64, decay: bool, total_steps: usize) -> Self {
        if decay {
            LearningRateSchedule::CosineDecay {
                init: learning_rate,
                decay_steps: total_steps,
            }
        } else {
            LearningRateSchedule::Constant(learning_rate)
        }
    }

    pub fn at(&self, step: usize) -> f64 {
        match *self {
            LearningRateSchedule::Constant(lr) => lr,
            LearningRateSchedule::CosineDecay { init, decay_steps } => {
                if decay_steps == 0 {
                    return init;
                }
                let t = step.min(decay_steps) as f64 / decay_steps as f64;
                init * 0.5 * (1.0 + (PI * t).cos())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Optimizer {
    pub kind: OptimizerKind,
    pub schedule: LearningRateSchedule,
}

/// Per-optimizer moment estimates.
#[derive(Debug, Clone, PartialEq)]
pub enum OptimizerState {
    Sgd,
    Adam { mu: Array1<f64>, nu: Array1<f64> },
}

impl Optimizer {
    pub fn init(&self, n_params: usize) -> OptimizerState {
        match self.kind {
            OptimizerKind::Sgd => OptimizerState::Sgd,
            OptimizerKind::Adam | OptimizerKind::AdamW => OptimizerState::Adam {
                mu: Array1::zeros(n_params),
                nu: Array1::zeros(n_params),
            },
        }
    }

    /// Additive update for step `step` (0-based) and the next moment state.
    fn update(
        &self,
        state: OptimizerState,
        grads: &Array1<f64>,
        params: &Array1<f64>,
        step: usize,
    ) -> (Array1<f64>, OptimizerState) {
        let lr = self.schedule.at(step);
        match state {
            OptimizerState::Sgd => (grads * -lr, OptimizerState::Sgd),
            OptimizerState::Adam { mu, nu } => {
                let mu = mu * ADAM_B1 + grads * (1.0 - ADAM_B1);
                let nu = nu * ADAM_B2 + grads.mapv(|g| g * g) * (1.0 - ADAM_B2);
                let t = (step + 1) as i32;
                let bias_c1 = 1.0 - ADAM_B1.powi(t);
                let bias_c2 = 1.0 - ADAM_B2.powi(t);
                let mut direction = ndarray::Zip::from(&mu)
                    .and(&nu)
                    .map_collect(|m, v| (m / bias_c1) / ((v / bias_c2).sqrt() + ADAM_EPS));
                if self.kind == OptimizerKind::AdamW {
                    direction = direction + params * ADAMW_WEIGHT_DECAY;
                }
                (direction * -lr, OptimizerState::Adam { mu, nu })
            }
        }
    }
}

/// Soft-thresholding toward zero by `threshold`; weights never change sign.
pub fn l1_proximal(params: &Array1<f64>, threshold: f64) -> Array1<f64> {
    params.mapv(|w| {
        if w > 0.0 {
            (w - threshold).max(0.0)
        } else if w < 0.0 {
            (w + threshold).min(0.0)
        } else {
            0.0
        }
    })
}

/// Parameters, step counter and optimizer moments, threaded through
/// training by value.
#[derive(Debug, Clone)]
pub struct TrainState {
    pub params: Array1<f64>,
    pub step: usize,
    pub opt_state: OptimizerState,
    optimizer: Optimizer,
}

impl TrainState {
    pub fn create(params: Array1<f64>, optimizer: Optimizer) -> Self {
        let opt_state = optimizer.init(params.len());
        Self {
            params,
            step: 0,
            opt_state,
            optimizer,
        }
    }

    /// Learning rate for the current step counter.
    pub fn learning_rate(&self) -> f64 {
        self.optimizer.schedule.at(self.step)
    }

    pub fn apply_gradients(self, grads: &Array1<f64>) -> Self {
        let (delta, opt_state) =
            self.optimizer
                .update(self.opt_state, grads, &self.params, self.step);
        Self {
            params: self.params + delta,
            step: self.step + 1,
            opt_state,
            optimizer: self.optimizer,
        }
    }

    /// L1 proximal step with the learning rate of the current step counter.
    pub fn apply_l1(self, strength: f64) -> Self {
        if strength == 0.0 {
            return self;
        }
        let threshold = self.learning_rate() * strength;
        Self {
            params: l1_proximal(&self.params, threshold),
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn sgd(lr: f64) -> Optimizer {
        Optimizer {
            kind: OptimizerKind::Sgd,
            schedule: LearningRateSchedule::Constant(lr),
        }
    }

    #[test]
    fn cosine_schedule_decays_to_zero() {
        let s = LearningRateSchedule::new(0.2, true, 10);
        assert_eq!(s.at(0), 0.2);
        assert!((s.at(5) - 0.1).abs() < 1e-15);
        assert!(s.at(10).abs() < 1e-15);
        assert!(s.at(15).abs() < 1e-15);
        assert_eq!(LearningRateSchedule::new(0.2, false, 10).at(7), 0.2);
    }

    #[test]
    fn sgd_steps_against_the_gradient() {
        let state = TrainState::create(array![1.0, -2.0], sgd(0.5));
        let next = state.apply_gradients(&array![2.0, -4.0]);
        assert_eq!(next.params, array![0.0, 0.0]);
        assert_eq!(next.step, 1);
    }

    #[test]
    fn first_adam_step_moves_each_weight_by_the_learning_rate() {
        let opt = Optimizer {
            kind: OptimizerKind::Adam,
            schedule: LearningRateSchedule::Constant(0.01),
        };
        let next = TrainState::create(array![1.0, 1.0], opt).apply_gradients(&array![3.0, -0.5]);
        assert!((next.params[0] - 0.99).abs() < 1e-8);
        assert!((next.params[1] - 1.01).abs() < 1e-8);
    }

    #[test]
    fn adamw_adds_decoupled_weight_decay() {
        let mk = |kind| Optimizer {
            kind,
            schedule: LearningRateSchedule::Constant(0.1),
        };
        let p = array![2.0];
        let g = array![0.0];
        let adam = TrainState::create(p.clone(), mk(OptimizerKind::Adam)).apply_gradients(&g);
        let adamw = TrainState::create(p, mk(OptimizerKind::AdamW)).apply_gradients(&g);
        assert_eq!(adam.params[0], 2.0);
        assert!((adamw.params[0] - (2.0 - 0.1 * 1e-4 * 2.0)).abs() < 1e-15);
    }

    #[test]
    fn l1_step_shrinks_without_crossing_zero() {
        let shrunk = l1_proximal(&array![0.3, -0.05, 0.0, -1.0], 0.1);
        assert!((shrunk[0] - 0.2).abs() < 1e-15);
        assert_eq!(shrunk[1], 0.0);
        assert_eq!(shrunk[2], 0.0);
        assert!((shrunk[3] + 0.9).abs() < 1e-15);

        let state = TrainState::create(array![0.5], sgd(0.1)).apply_l1(2.0);
        assert!((state.params[0] - 0.3).abs() < 1e-15);
    }
}
