// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Subgoal geometry shared by both levels of the hierarchy.
//!
//! In relative mode a subgoal is a displacement over the first
//! `subgoal_dims` state features. After each primitive step it is re-derived
//! as `state[:d] + goal − next_state[:d]`, which keeps the target fixed in
//! absolute space. In absolute mode the subgoal never changes.

use st_tensor::Tensor;

use crate::config::EnvConfig;
use crate::error::HrlResult;

const BINARY_REWARD_RADIUS: f32 = 1.414;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GoalSpace {
    pub subgoal_dims: usize,
    pub masked_dims: usize,
    pub absolute: bool,
}

impl GoalSpace {
    pub fn from_env(env: &EnvConfig) -> Self {
        Self {
            subgoal_dims: env.subgoal_dims,
            masked_dims: env.masked_dims(),
            absolute: env.absolute_goal,
        }
    }

    pub fn transition(&self, state: &[f32], subgoal: &[f32], next_state: &[f32]) -> Vec<f32> {
        if self.absolute {
            return subgoal.to_vec();
        }
        subgoal
            .iter()
            .zip(state)
            .zip(next_state)
            .map(|((g, s), n)| s + g - n)
            .collect()
    }

    pub fn transition_batch(&self, state: &Tensor, subgoal: &Tensor, next_state: &Tensor) -> HrlResult<Tensor> {
        if self.absolute {
            return Ok(subgoal.clone());
        }
        let d = self.subgoal_dims;
        Ok(state
            .narrow_cols(0, d)?
            .add(subgoal)?
            .sub(&next_state.narrow_cols(0, d)?)?)
    }

    /// Goal handed to the controller at every step of a recorded interval
    /// that started with `subgoal`. `states` holds `steps` rows per
    /// transition, transition-major.
    pub fn sequence(&self, states: &Tensor, subgoal: &Tensor, steps: usize) -> HrlResult<Tensor> {
        let repeated = subgoal.repeat_rows(steps)?;
        if self.absolute {
            return Ok(repeated);
        }
        let d = self.subgoal_dims;
        let positions = states.narrow_cols(0, d)?;
        let origins: Vec<usize> = (0..states.rows()).map(|r| r - r % steps).collect();
        let first = positions.gather_rows(&origins)?;
        Ok(repeated.add(&first)?.sub(&positions)?)
    }

    /// Hides the leading position features from the controller.
    pub fn clean(&self, state: &Tensor) -> HrlResult<Tensor> {
        if self.masked_dims == 0 {
            return Ok(state.clone());
        }
        Ok(state.zero_cols(0, self.masked_dims)?)
    }

    pub fn clean_row(&self, state: &[f32]) -> Vec<f32> {
        let mut out = state.to_vec();
        for v in out.iter_mut().take(self.masked_dims) {
            *v = 0.0;
        }
        out
    }

    /// Dense or binary distance reward for reaching the subgoal.
    pub fn intrinsic_reward(
        &self,
        state: &[f32],
        subgoal: &[f32],
        next_state: &[f32],
        scale: f32,
        binary: bool,
    ) -> f32 {
        let distance = subgoal
            .iter()
            .zip(state)
            .zip(next_state)
            .map(|((g, s), n)| {
                let target = if self.absolute { *g } else { s + g };
                (target - n) * (target - n)
            })
            .sum::<f32>()
            .sqrt();
        if binary {
            if distance <= BINARY_REWARD_RADIUS {
                scale
            } else {
                0.0
            }
        } else {
            -distance * scale
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relative() -> GoalSpace {
        GoalSpace {
            subgoal_dims: 2,
            masked_dims: 2,
            absolute: false,
        }
    }

    #[test]
    fn transition_round_trips_the_absolute_target() {
        let space = relative();
        let state = [1.0, 2.0, 9.0];
        let next = [1.5, 1.0, 8.0];
        let subgoal = [0.25, -3.0];
        let moved = space.transition(&state, &subgoal, &next);
        let rebuilt: Vec<f32> = moved.iter().zip(&next).map(|(g, n)| g + n).collect();
        assert_eq!(rebuilt, vec![1.25, -1.0]);
    }

    #[test]
    fn sequence_matches_stepwise_transitions() {
        let space = relative();
        let states = Tensor::from_vec(
            6,
            3,
            vec![
                0.0, 0.0, 1.0, 1.0, 0.5, 1.0, 2.0, 1.0, 1.0, //
                5.0, 5.0, 0.0, 4.0, 5.0, 0.0, 3.0, 6.0, 0.0,
            ],
        )
        .unwrap();
        let subgoal = Tensor::from_vec(2, 2, vec![3.0, 3.0, -2.0, 1.0]).unwrap();
        let seq = space.sequence(&states, &subgoal, 3).unwrap();

        let mut goal = vec![3.0, 3.0];
        let rows: Vec<&[f32]> = (0..3).map(|r| states.row(r).unwrap()).collect();
        assert_eq!(seq.row(0).unwrap(), goal.as_slice());
        for t in 1..3 {
            goal = space.transition(rows[t - 1], &goal, rows[t]);
            assert_eq!(seq.row(t).unwrap(), goal.as_slice());
        }
        assert_eq!(seq.row(5).unwrap(), &[0.0, 0.0]);
    }

    #[test]
    fn absolute_mode_keeps_the_goal() {
        let space = GoalSpace {
            absolute: true,
            masked_dims: 0,
            ..relative()
        };
        assert_eq!(space.transition(&[0.0, 0.0], &[3.0, 4.0], &[1.0, 1.0]), vec![3.0, 4.0]);
        assert_eq!(space.intrinsic_reward(&[9.0, 9.0], &[3.0, 4.0], &[0.0, 0.0], 2.0, false), -10.0);
        assert_eq!(space.clean_row(&[1.0, 2.0]), vec![1.0, 2.0]);
    }

    #[test]
    fn relative_reward_and_masking() {
        let space = relative();
        assert_eq!(space.intrinsic_reward(&[0.0, 0.0], &[3.0, 4.0], &[0.0, 0.0], 1.0, false), -5.0);
        assert_eq!(space.intrinsic_reward(&[0.0, 0.0], &[1.0, 0.5], &[0.0, 0.0], 2.0, true), 2.0);
        assert_eq!(space.clean_row(&[1.0, 2.0, 3.0]), vec![0.0, 0.0, 3.0]);
    }
}
