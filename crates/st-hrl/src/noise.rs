// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};

use crate::config::NoiseKind;

const OU_DT: f32 = 1e-2;

/// Additive exploration noise clipped back into the action box.
#[derive(Clone, Debug)]
pub struct ExplorationNoise {
    kind: NoiseKind,
    sigma: f32,
    ou_state: Vec<f32>,
}

impl ExplorationNoise {
    pub fn new(kind: NoiseKind, sigma: f32) -> Self {
        Self {
            kind,
            sigma,
            ou_state: Vec::new(),
        }
    }

    /// Clears the temporally correlated state at episode boundaries.
    pub fn reset(&mut self) {
        self.ou_state.clear();
    }

    pub fn perturb(
        &mut self,
        action: &[f32],
        low: &[f32],
        high: &[f32],
        rng: &mut StdRng,
    ) -> Vec<f32> {
        let noise: Vec<f32> = match self.kind {
            NoiseKind::Normal => action
                .iter()
                .map(|_| {
                    let z: f32 = StandardNormal.sample(&mut *rng);
                    self.sigma * z
                })
                .collect(),
            NoiseKind::OrnsteinUhlenbeck { theta } => {
                if self.ou_state.len() != action.len() {
                    self.ou_state = vec![0.0; action.len()];
                }
                for x in &mut self.ou_state {
                    let z: f32 = StandardNormal.sample(&mut *rng);
                    *x += -theta * *x * OU_DT + self.sigma * OU_DT.sqrt() * z;
                }
                self.ou_state.clone()
            }
        };
        action
            .iter()
            .zip(noise)
            .zip(low.iter().zip(high))
            .map(|((a, n), (lo, hi))| (a + n).max(*lo).min(*hi))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn perturbed_actions_stay_in_bounds() {
        let mut rng = StdRng::seed_from_u64(3);
        for kind in [NoiseKind::Normal, NoiseKind::OrnsteinUhlenbeck { theta: 0.15 }] {
            let mut noise = ExplorationNoise::new(kind, 5.0);
            for _ in 0..50 {
                let out = noise.perturb(&[0.9, -0.9], &[-1.0, -1.0], &[1.0, 1.0], &mut rng);
                assert!(out.iter().all(|v| (-1.0..=1.0).contains(v)));
            }
        }
    }

    #[test]
    fn zero_sigma_is_identity() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut noise = ExplorationNoise::new(NoiseKind::Normal, 0.0);
        let out = noise.perturb(&[0.25, -0.5], &[-1.0, -1.0], &[1.0, 1.0], &mut rng);
        assert_eq!(out, vec![0.25, -0.5]);
    }
}
