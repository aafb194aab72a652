// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Imagined safety rollouts.
//!
//! Starting from real states, the controller's deterministic action is
//! chained through the dynamics model in mean mode while the subgoal follows
//! the transition law. The cost model scores either every imagined state or
//! only the last one. The rollout keeps every intermediate tensor so the
//! safety estimate can be differentiated back into the actor (through time,
//! through the frozen dynamics and cost model).

use rand::rngs::StdRng;
use rand::Rng;
use st_tensor::Tensor;

use crate::cost_model::CostModel;
use crate::dynamics::DynamicsModel;
use crate::error::HrlResult;
use crate::family::ActorFamily;
use crate::goal::GoalSpace;

/// Horizon and accumulation mode of one rollout.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RolloutPlan {
    pub horizon: usize,
    pub all_steps: bool,
    pub normalize: bool,
}

impl RolloutPlan {
    /// Full horizon when every step is scored, otherwise a single horizon
    /// drawn uniformly from `[1, max_horizon]`.
    pub fn draw(max_horizon: usize, all_steps: bool, normalize: bool, rng: &mut StdRng) -> Self {
        let horizon = if all_steps || max_horizon == 0 {
            max_horizon
        } else {
            rng.gen_range(1..=max_horizon)
        };
        Self {
            horizon,
            all_steps,
            normalize,
        }
    }
}

/// Collaborators a rollout runs through.
#[derive(Clone, Copy)]
pub struct Imagination<'a> {
    pub space: GoalSpace,
    pub cost_model: &'a CostModel,
    pub dynamics: &'a dyn DynamicsModel,
}

#[derive(Clone, Debug)]
pub struct Rollout {
    /// `horizon + 1` states, the first one real.
    states: Vec<Tensor>,
    goals: Vec<Tensor>,
    observations: Vec<Tensor>,
    actions: Vec<Tensor>,
    /// Encoded cost inputs with the state index they score and their weight.
    scored: Vec<(usize, Tensor, f32)>,
    /// Per-row imagined safety estimate.
    pub safety: Tensor,
}

impl Rollout {
    pub fn horizon(&self) -> usize {
        self.actions.len()
    }

    pub fn final_state(&self) -> Option<&Tensor> {
        self.states.last()
    }
}

impl<'a> Imagination<'a> {
    fn score(&self, states: &[Tensor], index: usize) -> HrlResult<Tensor> {
        let start = (index + 1).saturating_sub(self.cost_model.encoder().frame_stack());
        let history: Vec<&Tensor> = states[start..=index].iter().collect();
        self.cost_model.encoder().encode_states(&history)
    }

    pub fn rollout(
        &self,
        family: &dyn ActorFamily,
        state: &Tensor,
        subgoal: &Tensor,
        plan: RolloutPlan,
        rng: &mut StdRng,
    ) -> HrlResult<Rollout> {
        let mut states = vec![state.clone()];
        let mut goals = Vec::with_capacity(plan.horizon);
        let mut observations = Vec::with_capacity(plan.horizon);
        let mut actions = Vec::with_capacity(plan.horizon);
        let mut goal = subgoal.clone();
        for h in 0..plan.horizon {
            let current = &states[h];
            let observation = self.space.clean(current)?;
            let action = family.mean_action(&observation, &goal)?;
            let next = self.dynamics.step(current, &action, true, rng)?.next_state;
            let next_goal = self.space.transition_batch(current, &goal, &next)?;
            goals.push(goal);
            observations.push(observation);
            actions.push(action);
            states.push(next);
            goal = next_goal;
        }

        let scored_indices: Vec<usize> = if plan.horizon == 0 {
            vec![0]
        } else if plan.all_steps {
            (1..=plan.horizon).collect()
        } else {
            vec![plan.horizon]
        };
        let weight = if plan.all_steps && plan.normalize && plan.horizon > 0 {
            1.0 / plan.horizon as f32
        } else {
            1.0
        };
        let mut safety = Tensor::zeros(state.rows(), 1)?;
        let mut scored = Vec::with_capacity(scored_indices.len());
        for index in scored_indices {
            let input = self.score(&states, index)?;
            safety.add_scaled(&self.cost_model.predict(&input)?, weight)?;
            scored.push((index, input, weight));
        }
        Ok(Rollout {
            states,
            goals,
            observations,
            actions,
            scored,
            safety,
        })
    }

    /// Accumulates `∂(Σ grad_safety·safety)/∂θ` into the actor of `family`.
    pub fn backpropagate(
        &self,
        family: &mut dyn ActorFamily,
        rollout: &Rollout,
        grad_safety: &Tensor,
    ) -> HrlResult<()> {
        let horizon = rollout.horizon();
        if horizon == 0 {
            return Ok(());
        }
        let rows = grad_safety.rows();
        let state_dim = rollout.states[0].cols();
        let mut adj_states = Vec::with_capacity(horizon + 1);
        for _ in 0..=horizon {
            adj_states.push(Tensor::zeros(rows, state_dim)?);
        }
        let encoder = self.cost_model.encoder();
        for (index, input, weight) in &rollout.scored {
            let grad_p = grad_safety.scale(*weight)?;
            let grad_input = self.cost_model.input_gradient(input, &grad_p)?;
            let start = (index + 1).saturating_sub(encoder.frame_stack());
            let grads = encoder.states_gradient(&grad_input, index + 1 - start)?;
            for (offset, grad) in grads.iter().enumerate() {
                adj_states[start + offset].add_scaled(grad, 1.0)?;
            }
        }

        let mut adj_goal = Tensor::zeros(rows, rollout.goals[0].cols())?;
        for h in (0..horizon).rev() {
            let mut total = adj_states[h + 1].clone();
            if !self.space.absolute {
                // g' = s[:d] + g - s'[:d]
                total.add_into_cols(0, &adj_goal.scale(-1.0)?)?;
                adj_states[h].add_into_cols(0, &adj_goal)?;
            }
            let (grad_state, grad_action) =
                self.dynamics
                    .backward_step(&rollout.states[h], &rollout.actions[h], &total)?;
            let (grad_observation, grad_goal) =
                family.backward_mean(&rollout.observations[h], &rollout.goals[h], &grad_action)?;
            adj_states[h].add_scaled(&grad_state, 1.0)?;
            adj_states[h].add_scaled(&self.space.clean(&grad_observation)?, 1.0)?;
            adj_goal.add_scaled(&grad_goal, 1.0)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ControllerConfig, CostInputConfig, CostModelConfig, DynamicsConfig, EnvConfig};
    use crate::dynamics::EnsembleDynamics;
    use crate::family::build_family;
    use rand::SeedableRng;
    use st_nn::Parameter;

    fn env() -> EnvConfig {
        EnvConfig {
            state_dim: 3,
            action_dim: 2,
            goal_dim: 2,
            subgoal_dims: 2,
            subgoal_scale: vec![1.0, 1.0],
            ..EnvConfig::default()
        }
    }

    fn parts(input: CostInputConfig) -> (CostModel, EnsembleDynamics, Box<dyn ActorFamily>) {
        let env = env();
        let cost = CostModel::new(
            &CostModelConfig {
                hidden: vec![8],
                input,
                ..CostModelConfig::default()
            },
            &env,
            StdRng::seed_from_u64(1),
        )
        .unwrap();
        let dynamics = EnsembleDynamics::new(
            &DynamicsConfig {
                num_networks: 2,
                num_elites: 2,
                hidden: vec![8],
                ..DynamicsConfig::default()
            },
            3,
            2,
            StdRng::seed_from_u64(2),
        )
        .unwrap();
        let family = build_family(
            &ControllerConfig {
                hidden: vec![8],
                ..ControllerConfig::default()
            },
            &env,
            &mut StdRng::seed_from_u64(3),
        )
        .unwrap();
        (cost, dynamics, family)
    }

    fn batch() -> (Tensor, Tensor) {
        let mut rng = StdRng::seed_from_u64(10);
        (
            Tensor::random_uniform(3, 3, -1.0, 1.0, &mut rng).unwrap(),
            Tensor::random_uniform(3, 2, -1.0, 1.0, &mut rng).unwrap(),
        )
    }

    #[test]
    fn zero_horizon_scores_the_initial_state() {
        let (cost, dynamics, family) = parts(CostInputConfig::State);
        let imagination = Imagination {
            space: GoalSpace::from_env(&env()),
            cost_model: &cost,
            dynamics: &dynamics,
        };
        let (state, goal) = batch();
        let mut rng = StdRng::seed_from_u64(0);
        for all_steps in [true, false] {
            let plan = RolloutPlan::draw(0, all_steps, true, &mut rng);
            let rollout = imagination.rollout(family.as_ref(), &state, &goal, plan, &mut rng).unwrap();
            assert_eq!(rollout.safety, cost.predict(&state).unwrap());
        }
    }

    #[test]
    fn single_step_horizon_is_drawn_in_range() {
        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..100 {
            let plan = RolloutPlan::draw(5, false, false, &mut rng);
            assert!((1..=5).contains(&plan.horizon));
        }
        assert_eq!(RolloutPlan::draw(5, true, false, &mut rng).horizon, 5);
    }

    fn actor_gradient_check(input: CostInputConfig, all_steps: bool) {
        let (cost, dynamics, mut family) = parts(input);
        let imagination = Imagination {
            space: GoalSpace::from_env(&env()),
            cost_model: &cost,
            dynamics: &dynamics,
        };
        let (state, goal) = batch();
        let plan = RolloutPlan {
            horizon: 3,
            all_steps,
            normalize: true,
        };
        let mut rng = StdRng::seed_from_u64(0);
        let rollout = imagination.rollout(family.as_ref(), &state, &goal, plan, &mut rng).unwrap();
        let ones = Tensor::full(3, 1, 1.0).unwrap();
        imagination.backpropagate(family.as_mut(), &rollout, &ones).unwrap();

        let mut analytic = 0.0;
        family
            .actor_mut()
            .visit_parameters(&mut |p: &Parameter| {
                if p.name() == "controller_actor::l1::weight" {
                    analytic = p.gradient().map(|g| g.data()[17]).unwrap_or(0.0);
                }
                Ok(())
            })
            .unwrap();

        let nudge = |family: &mut Box<dyn ActorFamily>, delta: f32| {
            family
                .actor_mut()
                .visit_parameters_mut(&mut |p: &mut Parameter| {
                    if p.name() == "controller_actor::l1::weight" {
                        p.value_mut().data_mut()[17] += delta;
                    }
                    Ok(())
                })
                .unwrap();
        };
        // an unmasked state input feeding the first hidden layer
        let eps = 5e-3;
        nudge(&mut family, eps);
        let plus = imagination
            .rollout(family.as_ref(), &state, &goal, plan, &mut rng)
            .unwrap()
            .safety
            .sum();
        nudge(&mut family, -2.0 * eps);
        let minus = imagination
            .rollout(family.as_ref(), &state, &goal, plan, &mut rng)
            .unwrap()
            .safety
            .sum();
        let numeric = (plus - minus) / (2.0 * eps);
        assert!(
            (analytic - numeric).abs() < 5e-4 + 5e-2 * numeric.abs(),
            "analytic={analytic} numeric={numeric}"
        );
    }

    #[test]
    fn all_steps_gradient_matches_finite_differences() {
        actor_gradient_check(CostInputConfig::State, true);
    }

    #[test]
    fn final_state_gradient_matches_finite_differences() {
        actor_gradient_check(CostInputConfig::State, false);
    }

    #[test]
    fn stacked_frame_gradient_matches_finite_differences() {
        actor_gradient_check(
            CostInputConfig::Lidar {
                position_dims: 2,
                lidar_dims: 1,
                frame_stack: 2,
            },
            true,
        );
    }
}
