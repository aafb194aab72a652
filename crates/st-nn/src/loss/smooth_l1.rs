// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::Loss;
use crate::{PureResult, Tensor};
use st_tensor::TensorError;

/// Huber loss with mean reduction: quadratic inside `|d| < beta`, linear outside.
#[derive(Debug, Clone, Copy)]
pub struct SmoothL1 {
    beta: f32,
}

impl Default for SmoothL1 {
    fn default() -> Self {
        Self { beta: 1.0 }
    }
}

impl SmoothL1 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_beta(beta: f32) -> PureResult<Self> {
        if !(beta > 0.0) {
            return Err(TensorError::InvalidValue {
                label: "smooth_l1_beta",
            });
        }
        Ok(Self { beta })
    }
}

impl Loss for SmoothL1 {
    fn forward(&mut self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor> {
        let beta = self.beta;
        let per_entry = prediction.zip_map(target, |p, t| {
            let d = (p - t).abs();
            if d < beta {
                0.5 * d * d / beta
            } else {
                d - 0.5 * beta
            }
        })?;
        Tensor::from_vec(1, 1, vec![per_entry.mean()])
    }

    fn backward(&mut self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor> {
        let beta = self.beta;
        let n = prediction.data().len() as f32;
        prediction.zip_map(target, |p, t| {
            let d = p - t;
            if d.abs() < beta {
                d / beta / n
            } else {
                d.signum() / n
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quadratic_and_linear_regions() {
        let mut loss = SmoothL1::new();
        let prediction = Tensor::from_vec(1, 2, vec![0.5, 3.0]).unwrap();
        let target = Tensor::zeros(1, 2).unwrap();
        let value = loss.forward(&prediction, &target).unwrap();
        assert!((value.data()[0] - (0.125 + 2.5) / 2.0).abs() < 1e-6);
        let grad = loss.backward(&prediction, &target).unwrap();
        assert!((grad.data()[0] - 0.25).abs() < 1e-6);
        assert!((grad.data()[1] - 0.5).abs() < 1e-6);
    }
}
