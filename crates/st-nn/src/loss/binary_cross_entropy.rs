// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::Loss;
use crate::{PureResult, Tensor};

const LOG_FLOOR: f32 = -100.0;
const PROB_EPS: f32 = 1e-12;

/// Binary cross-entropy on probabilities with mean reduction. Log terms are
/// floored at `-100` so saturated predictions stay finite.
#[derive(Debug, Default, Clone, Copy)]
pub struct BinaryCrossEntropy;

impl BinaryCrossEntropy {
    pub fn new() -> Self {
        Self
    }
}

impl Loss for BinaryCrossEntropy {
    fn forward(&mut self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor> {
        let per_entry = prediction.zip_map(target, |p, y| {
            let log_p = p.ln().max(LOG_FLOOR);
            let log_q = (1.0 - p).ln().max(LOG_FLOOR);
            -(y * log_p + (1.0 - y) * log_q)
        })?;
        Tensor::from_vec(1, 1, vec![per_entry.mean()])
    }

    fn backward(&mut self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor> {
        let n = prediction.data().len() as f32;
        prediction.zip_map(target, |p, y| {
            let denom = (p * (1.0 - p)).max(PROB_EPS);
            (p - y) / denom / n
        })
    }
}
