// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::{PureResult, Tensor, TensorError};
use serde::{Deserialize, Serialize};

/// Hyper-parameters of the Adam update rule.
///
/// `weight_decay` is the classic L2 form: the decay term is folded into the
/// gradient before the moment estimates are updated.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdamConfig {
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    pub weight_decay: f32,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
        }
    }
}

impl AdamConfig {
    pub fn with_learning_rate(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            ..Self::default()
        }
    }

    pub fn weight_decay(mut self, weight_decay: f32) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    pub fn validate(&self) -> PureResult<()> {
        if !(self.learning_rate > 0.0) || !self.learning_rate.is_finite() {
            return Err(TensorError::NonPositiveLearningRate {
                rate: self.learning_rate,
            });
        }
        if !(0.0..1.0).contains(&self.beta1) || !(0.0..1.0).contains(&self.beta2) {
            return Err(TensorError::InvalidValue { label: "adam_betas" });
        }
        if self.epsilon <= 0.0 || self.weight_decay < 0.0 {
            return Err(TensorError::InvalidValue {
                label: "adam_epsilon_or_decay",
            });
        }
        Ok(())
    }
}

/// Per-parameter Adam moment buffers.
#[derive(Clone, Debug)]
pub struct AdamTape {
    config: AdamConfig,
    first: Vec<f32>,
    second: Vec<f32>,
    step: u64,
}

impl AdamTape {
    pub fn new(config: AdamConfig, rows: usize, cols: usize) -> PureResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            first: vec![0.0; rows * cols],
            second: vec![0.0; rows * cols],
            step: 0,
        })
    }

    pub fn config(&self) -> &AdamConfig {
        &self.config
    }

    pub fn steps(&self) -> u64 {
        self.step
    }

    /// Updates the moments from `gradient` and moves `value` accordingly.
    pub fn apply(&mut self, value: &mut Tensor, gradient: &Tensor) -> PureResult<()> {
        if value.shape() != gradient.shape() || value.data().len() != self.first.len() {
            return Err(TensorError::ShapeMismatch {
                left: value.shape(),
                right: gradient.shape(),
            });
        }
        self.step += 1;
        let AdamConfig {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            weight_decay,
        } = self.config;
        let bias1 = 1.0 - beta1.powi(self.step as i32);
        let bias2 = 1.0 - beta2.powi(self.step as i32);
        let step_size = learning_rate / bias1;
        for (((w, &g), m), v) in value
            .data_mut()
            .iter_mut()
            .zip(gradient.data().iter())
            .zip(self.first.iter_mut())
            .zip(self.second.iter_mut())
        {
            let g = g + weight_decay * *w;
            *m = beta1 * *m + (1.0 - beta1) * g;
            *v = beta2 * *v + (1.0 - beta2) * g * g;
            let denom = (*v / bias2).sqrt() + epsilon;
            *w -= step_size * *m / denom;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_step_moves_by_learning_rate() {
        let mut tape = AdamTape::new(AdamConfig::with_learning_rate(0.1), 1, 2).unwrap();
        let mut value = Tensor::from_vec(1, 2, vec![1.0, -1.0]).unwrap();
        let grad = Tensor::from_vec(1, 2, vec![0.5, -2.0]).unwrap();
        tape.apply(&mut value, &grad).unwrap();
        assert!((value.data()[0] - 0.9).abs() < 1e-5);
        assert!((value.data()[1] + 0.9).abs() < 1e-5);
        assert_eq!(tape.steps(), 1);
    }

    #[test]
    fn invalid_learning_rate_is_rejected() {
        assert!(AdamTape::new(AdamConfig::with_learning_rate(0.0), 1, 1).is_err());
    }
}
