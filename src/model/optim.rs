//! Adam with L2 weight decay folded into the gradient.

use ndarray::{Array, Dimension, Zip};
use serde::{Deserialize, Serialize};

use super::Parameters;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdamConfig {
    pub learning_rate: f32,
    pub weight_decay: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.01,
            weight_decay: 5e-4,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Adam {
    config: AdamConfig,
    step: i32,
    m: Parameters,
    v: Parameters,
}

impl Adam {
    pub fn new(config: AdamConfig, params: &Parameters) -> Self {
        Self {
            config,
            step: 0,
            m: Parameters::zeros_like(params),
            v: Parameters::zeros_like(params),
        }
    }

    /// Number of updates applied so far.
    pub fn steps(&self) -> u64 {
        self.step as u64
    }

    /// Apply one update to every tensor.
    pub fn step(&mut self, params: &mut Parameters, grads: &Parameters) {
        self.step = self.step.saturating_add(1);
        let c = &self.config;
        let bias1 = 1.0 - c.beta1.powi(self.step);
        let bias2 = 1.0 - c.beta2.powi(self.step);

        update(&mut params.w1, &grads.w1, &mut self.m.w1, &mut self.v.w1, c, bias1, bias2);
        update(&mut params.we, &grads.we, &mut self.m.we, &mut self.v.we, c, bias1, bias2);
        update(&mut params.b1, &grads.b1, &mut self.m.b1, &mut self.v.b1, c, bias1, bias2);
        update(&mut params.w2, &grads.w2, &mut self.m.w2, &mut self.v.w2, c, bias1, bias2);
        update(&mut params.b2, &grads.b2, &mut self.m.b2, &mut self.v.b2, c, bias1, bias2);
    }
}

fn update<D: Dimension>(
    param: &mut Array<f32, D>,
    grad: &Array<f32, D>,
    m: &mut Array<f32, D>,
    v: &mut Array<f32, D>,
    c: &AdamConfig,
    bias1: f32,
    bias2: f32,
) {
    Zip::from(param)
        .and(grad)
        .and(m)
        .and(v)
        .for_each(|p, &g, m, v| {
            let g = g + c.weight_decay * *p;
            *m = c.beta1 * *m + (1.0 - c.beta1) * g;
            *v = c.beta2 * *v + (1.0 - c.beta2) * g * g;
            let m_hat = *m / bias1;
            let v_hat = *v / bias2;
            *p -= c.learning_rate * m_hat / (v_hat.sqrt() + c.epsilon);
        });
}
