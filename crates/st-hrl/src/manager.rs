// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! High-level policy proposing subgoals every `manager_propose_freq` steps.

use rand::rngs::StdRng;
use st_nn::{hard_update, soft_update, AdamConfig, Module, ModuleArchive, Tensor};
use tracing::debug;

use crate::buffer::{ManagerBatch, ManagerTransition, RingBuffer};
use crate::config::{EnvConfig, HrlConfig, ManagerConfig};
use crate::controller::{Controller, UpdateSchedule};
use crate::cost_model::CostModel;
use crate::error::{ensure_finite, HrlError, HrlResult};
use crate::goal::GoalSpace;
use crate::networks::{DeterministicActor, TwinCritic};
use crate::reachability::ReachabilityTerm;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ManagerReport {
    pub actor_loss: f32,
    pub critic_loss: f32,
    /// Mean reachability hinge, before the goal-loss coefficient.
    pub goal_loss: Option<f32>,
    /// Mean weighted cost-model prediction at the proposed subgoals.
    pub safety_loss: Option<f32>,
    pub grad_norm: f32,
}

struct ManagerObjective {
    loss: f32,
    goal_loss: Option<f32>,
    safety_loss: Option<f32>,
}

#[derive(Debug)]
pub struct Manager {
    actor: DeterministicActor,
    actor_target: DeterministicActor,
    critic: TwinCritic,
    critic_target: TwinCritic,
    config: ManagerConfig,
    space: GoalSpace,
    scale: Vec<f32>,
    rng: StdRng,
}

impl Manager {
    pub fn new(config: &HrlConfig, mut rng: StdRng) -> HrlResult<Self> {
        let env: &EnvConfig = &config.env;
        let manager = &config.manager;
        let (low, high) = env.subgoal_bounds();
        let build = |rng: &mut StdRng| {
            DeterministicActor::new(
                "manager_actor",
                env.state_dim,
                env.goal_dim,
                &manager.hidden,
                &low,
                &high,
                rng,
            )
        };
        let mut actor = build(&mut rng)?;
        let mut actor_target = build(&mut rng)?;
        hard_update(&mut actor_target, &actor)?;
        actor.attach_adam(AdamConfig::with_learning_rate(manager.actor_lr))?;

        let critic_build = |rng: &mut StdRng| {
            TwinCritic::new(
                "manager_critic",
                env.state_dim,
                env.goal_dim,
                env.subgoal_dims,
                &manager.hidden,
                rng,
            )
        };
        let mut critic = critic_build(&mut rng)?;
        let mut critic_target = critic_build(&mut rng)?;
        hard_update(&mut critic_target, &critic)?;
        critic.attach_adam(AdamConfig::with_learning_rate(manager.critic_lr).weight_decay(1e-4))?;

        Ok(Self {
            actor,
            actor_target,
            critic,
            critic_target,
            config: manager.clone(),
            space: GoalSpace::from_env(env),
            scale: env.subgoal_scale.clone(),
            rng,
        })
    }

    pub fn schedule(&self) -> UpdateSchedule {
        UpdateSchedule {
            iterations: 0,
            batch_size: self.config.batch_size,
            discount: self.config.discount,
            tau: self.config.tau,
        }
    }

    pub fn subgoal_bounds(&self) -> (&[f32], &[f32]) {
        (self.actor.low(), self.actor.high())
    }

    /// Proposes a subgoal for one observation.
    pub fn sample_goal(&self, state: &[f32], desired_goal: Option<&[f32]>) -> HrlResult<Vec<f32>> {
        let desired_goal = desired_goal.ok_or(HrlError::MissingInput("desired goal"))?;
        let state = Tensor::from_vec(1, state.len(), state.to_vec())?;
        let goal = Tensor::from_vec(1, desired_goal.len(), desired_goal.to_vec())?;
        Ok(self.actor.act(&state, &goal)?.into_vec())
    }

    pub fn value_estimate(
        &self,
        state: &Tensor,
        desired_goal: &Tensor,
        subgoal: &Tensor,
    ) -> HrlResult<(Tensor, Tensor)> {
        Ok(self.critic.values(state, desired_goal, subgoal)?)
    }

    /// Relabeling candidates per transition: the stored subgoal, the
    /// realised displacement, then Gaussian draws around the displacement.
    pub fn candidate_set(&mut self, batch: &ManagerBatch) -> HrlResult<Vec<Tensor>> {
        let mut candidates = vec![batch.subgoal.clone()];
        if self.config.candidate_goals == 0 {
            return Ok(candidates);
        }
        let d = self.space.subgoal_dims;
        let displacement = batch
            .next_state
            .narrow_cols(0, d)?
            .sub(&batch.state.narrow_cols(0, d)?)?;
        let spread: Vec<f32> = self.scale.iter().map(|s| 0.5 * s).collect();
        let low: Vec<f32> = self.scale.iter().map(|s| -s).collect();
        for _ in 1..self.config.candidate_goals {
            let noise = Tensor::random_normal(batch.len(), d, 0.0, 1.0, &mut self.rng)?;
            let draw = noise
                .scale_columns(&spread)?
                .add(&displacement)?
                .clamp_columns(&low, &self.scale)?;
            candidates.push(draw);
        }
        candidates.insert(1, displacement);
        Ok(candidates)
    }

    /// Index of the candidate that best reproduces the recorded actions
    /// under the current controller. Ties keep the earliest candidate.
    pub fn select_candidates(
        &self,
        controller: &Controller,
        batch: &ManagerBatch,
        candidates: &[Tensor],
    ) -> HrlResult<Vec<usize>> {
        let steps = batch.steps;
        let mut best = vec![0usize; batch.len()];
        let mut best_score = vec![f32::NEG_INFINITY; batch.len()];
        for (index, candidate) in candidates.iter().enumerate() {
            let goals = controller.multi_subgoal_transition(&batch.state_seq, candidate, steps)?;
            let predicted = controller.policy_actions(&batch.state_seq, &goals)?;
            // padded actions are -inf and drop out as zero error
            let error = predicted
                .sub(&batch.action_seq)?
                .replace_non_finite(0.0)
                .map(|v| v * v)
                .sum_axis1();
            for (row, chunk) in error.data().chunks(steps).enumerate() {
                let score = -0.5 * chunk.iter().sum::<f32>();
                if score > best_score[row] {
                    best_score[row] = score;
                    best[row] = index;
                }
            }
        }
        Ok(best)
    }

    /// Relabels the stored subgoals of `batch` with the candidate that best
    /// explains its recorded low-level actions.
    ///
    /// `batch.subgoal` holds the stored subgoals, and `batch.state_seq` and
    /// `batch.action_seq` hold the state and action subsequences, padded to
    /// `batch.steps` rows per record. `batch.state` and `batch.next_state`
    /// give the displacement candidate. The result has `batch.len()` rows.
    pub fn off_policy_corrections(&mut self, controller: &Controller, batch: &ManagerBatch) -> HrlResult<Tensor> {
        if self.config.candidate_goals == 0 {
            return Ok(batch.subgoal.clone());
        }
        let candidates = self.candidate_set(batch)?;
        let chosen = self.select_candidates(controller, batch, &candidates)?;
        let d = self.space.subgoal_dims;
        Ok(Tensor::from_fn(batch.len(), d, |r, c| {
            candidates[chosen[r]].data()[r * d + c]
        })?)
    }

    pub fn td_targets(&mut self, batch: &ManagerBatch, discount: f32) -> HrlResult<Tensor> {
        let next_action = self.actor_target.act(&batch.next_state, &batch.desired_goal)?;
        let noise = Tensor::random_normal(
            next_action.rows(),
            next_action.cols(),
            0.0,
            self.config.policy_noise,
            &mut self.rng,
        )?
        .clamp(-self.config.noise_clip, self.config.noise_clip);
        let next_action = next_action
            .add(&noise)?
            .clamp_columns(self.actor.low(), self.actor.high())?;
        let (q1, q2) = self
            .critic_target
            .values(&batch.next_state, &batch.desired_goal, &next_action)?;
        Ok(q1
            .minimum(&q2)?
            .hadamard(&batch.not_done)?
            .scale(discount)?
            .add(&batch.reward)?)
    }

    /// Absolute position targeted by `subgoal` from `state`.
    fn absolute_target(&self, state: &Tensor, subgoal: &Tensor) -> HrlResult<Tensor> {
        if self.space.absolute {
            return Ok(subgoal.clone());
        }
        Ok(state.narrow_cols(0, self.space.subgoal_dims)?.add(subgoal)?)
    }

    fn actor_objective(
        &mut self,
        state: &Tensor,
        desired_goal: &Tensor,
        cost_model: Option<&CostModel>,
        reachability: Option<ReachabilityTerm<'_>>,
    ) -> HrlResult<ManagerObjective> {
        let rows = state.rows();
        let n = rows as f32;
        let action = self.actor.act(state, desired_goal)?;
        let q1 = self.critic.q1(state, desired_goal, &action)?;
        let mut loss = -q1.mean();
        let ones = Tensor::full(rows, 1, 1.0)?;
        let mut grad = self
            .critic
            .q1_action_gradient(state, desired_goal, &action, &ones)?
            .scale(-1.0 / n)?;

        let reg = self.config.action_norm_reg;
        if reg > 0.0 {
            let norm = action.squared_l2_norm().sqrt();
            loss += reg * norm;
            if norm > 0.0 {
                grad.add_scaled(&action, reg / norm)?;
            }
        }

        let target = self.absolute_target(state, &action)?;
        let mut goal_loss = None;
        if let Some(term) = reachability {
            let origin = state.narrow_cols(0, self.space.subgoal_dims)?;
            let diff = term
                .embedding
                .embed(&origin)?
                .sub(&term.embedding.embed(&target)?)?
                .map(|v| v + 1e-6);
            let distance = diff.row_norms();
            let hinge = distance.map(|d| (d - term.margin).max(0.0)).mean();
            loss += self.config.goal_loss_coeff * hinge;
            goal_loss = Some(hinge);

            let weight = self.config.goal_loss_coeff / n;
            let dist = distance.data();
            let width = diff.cols();
            let grad_embedding = Tensor::from_fn(rows, width, |r, c| {
                if dist[r] > term.margin {
                    -weight * diff.data()[r * width + c] / dist[r]
                } else {
                    0.0
                }
            })?;
            grad.add_scaled(&term.embedding.embed_backward(&target, &grad_embedding)?, 1.0)?;
        }

        let mut safety_loss = None;
        if let Some(coefficient) = self.config.modelfree_safety {
            let cost_model = cost_model.ok_or(HrlError::MissingInput("cost model for subgoal safety"))?;
            let encoder = cost_model.encoder();
            let input = encoder.encode_query(&target, state)?;
            let safety = coefficient * cost_model.predict(&input)?.mean();
            loss += safety;
            safety_loss = Some(safety);
            let grad_input = cost_model.input_gradient(&input, &Tensor::full(rows, 1, coefficient / n)?)?;
            grad.add_scaled(&encoder.query_gradient(&grad_input)?, 1.0)?;
        }

        ensure_finite("manager_actor_loss", loss)?;
        self.actor.backward_action(state, desired_goal, &grad)?;
        Ok(ManagerObjective {
            loss,
            goal_loss,
            safety_loss,
        })
    }

    pub fn train(
        &mut self,
        controller: &Controller,
        store: &RingBuffer<ManagerTransition>,
        cost_model: Option<&CostModel>,
        reachability: Option<ReachabilityTerm<'_>>,
        schedule: UpdateSchedule,
    ) -> HrlResult<ManagerReport> {
        let mut report = ManagerReport::default();
        let mut goal_total = 0.0f32;
        let mut safety_total = 0.0f32;
        for _ in 0..schedule.iterations {
            let records = store.sample(schedule.batch_size, &mut self.rng, "manager")?;
            let batch = ManagerBatch::from_records(&records)?;
            let subgoal = if self.config.correction && !self.space.absolute {
                self.off_policy_corrections(controller, &batch)?
            } else {
                batch.subgoal.clone()
            };

            let target = self.td_targets(&batch, schedule.discount)?;
            report.critic_loss += self.critic.fit(
                &batch.state,
                &batch.desired_goal,
                &subgoal,
                &target,
                "manager_critic_loss",
            )?;

            let objective = self.actor_objective(&batch.state, &batch.desired_goal, cost_model, reachability)?;
            report.actor_loss += objective.loss;
            goal_total += objective.goal_loss.unwrap_or(0.0);
            safety_total += objective.safety_loss.unwrap_or(0.0);
            if self.config.grad_clip > 0.0 {
                self.actor.clip_gradient_norm(self.config.grad_clip)?;
            }
            report.grad_norm += self.actor.gradient_norm()?;
            self.actor.apply_step(0.0)?;

            soft_update(&mut self.critic_target, &self.critic, schedule.tau)?;
            soft_update(&mut self.actor_target, &self.actor, schedule.tau)?;
        }
        if schedule.iterations > 0 {
            let n = schedule.iterations as f32;
            report.actor_loss /= n;
            report.critic_loss /= n;
            report.grad_norm /= n;
            if reachability.is_some() {
                report.goal_loss = Some(goal_total / n);
            }
            if self.config.modelfree_safety.is_some() {
                report.safety_loss = Some(safety_total / n);
            }
        }
        debug!(
            actor_loss = report.actor_loss,
            critic_loss = report.critic_loss,
            grad_norm = report.grad_norm,
            "manager update"
        );
        Ok(report)
    }

    pub fn save(&self, archive: &mut ModuleArchive) -> HrlResult<()> {
        archive.insert_module("manager_actor", &self.actor)?;
        archive.insert_module("manager_actor_target", &self.actor_target)?;
        archive.insert_module("manager_critic", &self.critic)?;
        archive.insert_module("manager_critic_target", &self.critic_target)?;
        Ok(())
    }

    pub fn check(&self, archive: &ModuleArchive) -> HrlResult<()> {
        archive.check_module("manager_actor", &self.actor)?;
        archive.check_module("manager_actor_target", &self.actor_target)?;
        archive.check_module("manager_critic", &self.critic)?;
        archive.check_module("manager_critic_target", &self.critic_target)?;
        Ok(())
    }

    /// Restores every network, or none of them when any entry is missing or
    /// has the wrong shape.
    pub fn load(&mut self, archive: &ModuleArchive) -> HrlResult<()> {
        self.check(archive)?;
        archive.restore_module("manager_actor", &mut self.actor)?;
        archive.restore_module("manager_actor_target", &mut self.actor_target)?;
        archive.restore_module("manager_critic", &mut self.critic)?;
        archive.restore_module("manager_critic_target", &mut self.critic_target)?;
        Ok(())
    }
}
