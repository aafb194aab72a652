// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Low-level policy: maps `(state, subgoal)` to primitive actions.
//!
//! Each update fits the twin critic (and the optional twin cost critic)
//! first, then differentiates the actor objective against the freshly
//! stepped critics, and only then Polyak-averages the targets. The actor
//! objective composes, in order:
//!
//! 1. the family's base loss (`-Q1`, or `α·log π − Q1`);
//! 2. with a cost critic, `(base + λ·Qc1) / (1 + λ)`;
//! 3. with imagination, the rollout estimate either scaled, thresholded or
//!    folded into the same `λ` renormalisation.

use rand::rngs::StdRng;
use st_nn::{hard_update, soft_update, AdamConfig, Module, ModuleArchive, Tensor};
use tracing::debug;

use crate::buffer::{RingBuffer, Transition, TransitionBatch};
use crate::config::{HrlConfig, ImaginationConfig, ImaginedSafety};
use crate::cost_model::CostModel;
use crate::dynamics::DynamicsModel;
use crate::error::{ensure_finite, HrlError, HrlResult};
use crate::family::{build_family, ActorFamily};
use crate::goal::GoalSpace;
use crate::imagination::{Imagination, RolloutPlan};
use crate::lagrange::PidLagrangian;
use crate::networks::TwinCritic;

/// Iteration count and optimisation constants of one training call.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UpdateSchedule {
    pub iterations: usize,
    pub batch_size: usize,
    pub discount: f32,
    pub tau: f32,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ControllerReport {
    pub actor_loss: f32,
    pub critic_loss: f32,
    pub cost_critic_loss: Option<f32>,
    /// Mean imagined safety estimate fed to the actor.
    pub imagined_safety: Option<f32>,
    pub penalty: f32,
    pub grad_norm: f32,
}

/// Scalar loss with the pieces needed to differentiate it.
struct ActorObjective {
    loss: f32,
    safety: Option<f32>,
}

/// Running actor loss together with the weights its reward and cost
/// gradients carry after every renormalisation.
#[derive(Clone, Copy, Debug, PartialEq)]
struct ObjectiveWeights {
    loss: f32,
    /// Weight on `-Q1` and on the entropy term.
    base: f32,
    /// Weight on the cost critic's `Qc`.
    cost: Option<f32>,
}

impl ObjectiveWeights {
    fn new(loss: f32) -> Self {
        Self {
            loss,
            base: 1.0,
            cost: None,
        }
    }

    /// `(loss + λ·mean Qc) / (1 + λ)`.
    fn with_cost_critic(self, cost_mean: f32, penalty: f32) -> Self {
        Self {
            loss: (self.loss + penalty * cost_mean) / (1.0 + penalty),
            base: self.base / (1.0 + penalty),
            cost: Some(penalty / (1.0 + penalty)),
        }
    }

    /// Adds the imagined safety term and returns the per-row gradient of the
    /// loss with respect to `safety`.
    fn with_imagined(
        &mut self,
        objective: &ImaginedSafety,
        safety: &Tensor,
        penalty: f32,
        threshold: Option<f32>,
    ) -> HrlResult<Tensor> {
        let n = safety.rows() as f32;
        match *objective {
            ImaginedSafety::Scaled { coefficient } => {
                self.loss += coefficient * safety.mean();
                Ok(Tensor::full(safety.rows(), 1, coefficient / n)?)
            }
            ImaginedSafety::Thresholded { coefficient } => {
                let threshold = threshold.ok_or(HrlError::MissingInput("safe threshold"))?;
                self.loss += coefficient * safety.map(|s| s.max(threshold) / threshold).mean();
                Ok(safety.map(|s| if s > threshold { coefficient / (n * threshold) } else { 0.0 }))
            }
            ImaginedSafety::Penalized => {
                self.loss = (self.loss + penalty * safety.mean()) / (1.0 + penalty);
                self.base /= 1.0 + penalty;
                self.cost = self.cost.map(|w| w / (1.0 + penalty));
                Ok(Tensor::full(safety.rows(), 1, penalty / ((1.0 + penalty) * n))?)
            }
        }
    }
}

#[derive(Debug)]
struct CostCritic {
    online: TwinCritic,
    target: TwinCritic,
}

#[derive(Debug)]
pub struct Controller {
    family: Box<dyn ActorFamily>,
    critic: TwinCritic,
    critic_target: TwinCritic,
    cost_critic: Option<CostCritic>,
    lagrangian: Option<PidLagrangian>,
    imagination: Option<ImaginationConfig>,
    safe_threshold: Option<f32>,
    space: GoalSpace,
    grad_clip: f32,
    max_action: f32,
    rng: StdRng,
}

fn twin_pair(
    name: &str,
    config: &HrlConfig,
    lr: f32,
    rng: &mut StdRng,
) -> HrlResult<(TwinCritic, TwinCritic)> {
    let env = &config.env;
    let hidden = &config.controller.hidden;
    let mut online = TwinCritic::new(name, env.state_dim, env.subgoal_dims, env.action_dim, hidden, rng)?;
    let mut target = TwinCritic::new(name, env.state_dim, env.subgoal_dims, env.action_dim, hidden, rng)?;
    hard_update(&mut target, &online)?;
    online.attach_adam(AdamConfig::with_learning_rate(lr).weight_decay(1e-4))?;
    Ok((online, target))
}

impl Controller {
    pub fn new(config: &HrlConfig, mut rng: StdRng) -> HrlResult<Self> {
        let ctrl = &config.controller;
        let family = build_family(ctrl, &config.env, &mut rng)?;
        let (critic, critic_target) = twin_pair("controller_critic", config, ctrl.critic_lr, &mut rng)?;
        let cost_critic = if ctrl.cost_critic {
            let (online, target) = twin_pair("controller_cost_critic", config, ctrl.critic_lr, &mut rng)?;
            Some(CostCritic { online, target })
        } else {
            None
        };
        let safe_threshold = config.safe_threshold();
        let lagrangian = match (&ctrl.lagrangian, safe_threshold) {
            (Some(pid), Some(threshold)) => Some(PidLagrangian::new(pid.clone(), threshold)?),
            (Some(_), None) => {
                return Err(HrlError::config(
                    "controller.lagrangian",
                    "the Lagrangian penalty requires a cost_budget",
                ))
            }
            _ => None,
        };
        if cost_critic.is_some() && lagrangian.is_none() {
            return Err(HrlError::config(
                "controller.cost_critic",
                "the cost critic is weighted by the Lagrangian penalty",
            ));
        }
        Ok(Self {
            family,
            critic,
            critic_target,
            cost_critic,
            lagrangian,
            imagination: ctrl.imagination.clone(),
            safe_threshold,
            space: GoalSpace::from_env(&config.env),
            grad_clip: ctrl.grad_clip,
            max_action: config.env.max_action,
            rng,
        })
    }

    pub fn family_name(&self) -> &'static str {
        self.family.name()
    }

    pub fn goal_space(&self) -> GoalSpace {
        self.space
    }

    pub fn clean_obs(&self, state: &Tensor) -> HrlResult<Tensor> {
        self.space.clean(state)
    }

    pub fn subgoal_transition(&self, state: &[f32], subgoal: &[f32], next_state: &[f32]) -> Vec<f32> {
        self.space.transition(state, subgoal, next_state)
    }

    pub fn multi_subgoal_transition(&self, states: &Tensor, subgoal: &Tensor, steps: usize) -> HrlResult<Tensor> {
        self.space.sequence(states, subgoal, steps)
    }

    pub fn penalty_enabled(&self) -> bool {
        self.lagrangian.is_some()
    }

    /// Current Lagrange multiplier, zero without a Lagrangian.
    pub fn penalty(&self) -> f32 {
        self.lagrangian.as_ref().map_or(0.0, PidLagrangian::penalty)
    }

    pub fn imagination(&self) -> Option<&ImaginationConfig> {
        self.imagination.as_ref()
    }

    /// Overrides the coefficient of the scaled or thresholded imagined
    /// safety term.
    pub fn set_safety_coefficient(&mut self, value: f32) {
        if let Some(img) = self.imagination.as_mut() {
            match &mut img.objective {
                ImaginedSafety::Scaled { coefficient } | ImaginedSafety::Thresholded { coefficient } => {
                    *coefficient = value;
                }
                ImaginedSafety::Penalized => {}
            }
        }
    }

    /// Action for one observation. Evaluation always uses the mean action.
    pub fn select_action(&mut self, state: &[f32], goal: &[f32], evaluation: bool) -> HrlResult<Vec<f32>> {
        let state = Tensor::from_vec(1, state.len(), self.space.clean_row(state))?;
        let goal = Tensor::from_vec(1, goal.len(), goal.to_vec())?;
        let action = if evaluation {
            self.family.mean_action(&state, &goal)?
        } else {
            self.family.explore(&state, &goal, &mut self.rng)?
        };
        Ok(action.into_vec())
    }

    /// Deterministic actions for raw (unmasked) states.
    pub fn policy_actions(&self, states: &Tensor, goals: &Tensor) -> HrlResult<Tensor> {
        self.family.mean_action(&self.space.clean(states)?, goals)
    }

    /// Feeds one episode cost into the PID law. Returns the new penalty.
    pub fn pid_update(&mut self, episode_mean_cost: f32) -> Option<f32> {
        let penalty = self.lagrangian.as_mut()?.update(episode_mean_cost);
        debug!(episode_mean_cost, penalty, "lagrangian update");
        Some(penalty)
    }

    /// Imagined safety of `subgoal` from `state`, without gradients.
    pub fn state_safety_on_horizon(
        &mut self,
        state: &Tensor,
        subgoal: &Tensor,
        cost_model: &CostModel,
        dynamics: &dyn DynamicsModel,
        all_steps: bool,
        normalize: bool,
    ) -> HrlResult<Tensor> {
        let horizon = self.imagination.as_ref().map_or(0, |img| img.horizon);
        let plan = RolloutPlan::draw(horizon, all_steps, normalize, &mut self.rng);
        let imagination = Imagination {
            space: self.space,
            cost_model,
            dynamics,
        };
        Ok(imagination
            .rollout(self.family.as_ref(), state, subgoal, plan, &mut self.rng)?
            .safety)
    }

    /// Bootstrapped reward and cost targets for a sampled batch.
    pub fn td_targets(&mut self, batch: &TransitionBatch, discount: f32) -> HrlResult<(Tensor, Option<Tensor>)> {
        let next_goal = self.space.transition_batch(&batch.state, &batch.goal, &batch.next_state)?;
        let next_state = self.space.clean(&batch.next_state)?;
        let (next_action, entropy) = self.family.target_action(&next_state, &next_goal, &mut self.rng)?;
        let (q1, q2) = self.critic_target.values(&next_state, &next_goal, &next_action)?;
        let mut bootstrap = q1.minimum(&q2)?;
        if let Some(entropy) = entropy {
            bootstrap = bootstrap.sub(&entropy)?;
        }
        let reward_target = bootstrap
            .hadamard(&batch.not_done)?
            .scale(discount)?
            .add(&batch.reward)?;

        let cost_target = match (&self.cost_critic, &batch.cost) {
            (Some(cost_critic), Some(cost)) => {
                let (c1, c2) = cost_critic.target.values(&next_state, &next_goal, &next_action)?;
                Some(c1.maximum(&c2)?.hadamard(&batch.not_done)?.scale(discount)?.add(cost)?)
            }
            (Some(_), None) => return Err(HrlError::MissingInput("transition cost")),
            _ => None,
        };
        Ok((reward_target, cost_target))
    }

    /// Accumulates the actor gradient for one batch and returns the loss.
    fn actor_objective(
        &mut self,
        batch: &TransitionBatch,
        cost_model: Option<&CostModel>,
        dynamics: Option<&dyn DynamicsModel>,
    ) -> HrlResult<ActorObjective> {
        let n = batch.len() as f32;
        let state = self.space.clean(&batch.state)?;
        let goal = &batch.goal;
        let draw = self.family.policy_draw(&state, goal, &mut self.rng)?;
        let q1 = self.critic.q1(&state, goal, &draw.action)?;
        let alpha = self.family.alpha();

        let mut loss = -q1.mean();
        if let (Some(alpha), Some(log_prob)) = (alpha, &draw.log_prob) {
            loss += alpha * log_prob.mean();
        }
        let penalty = self.penalty();
        let mut weights = ObjectiveWeights::new(loss);
        if let Some(cost_critic) = &self.cost_critic {
            let qc = cost_critic.online.q1(&state, goal, &draw.action)?;
            weights = weights.with_cost_critic(qc.mean(), penalty);
        }

        let mut imagined = None;
        if let Some(img) = self.imagination.clone() {
            let (Some(cost_model), Some(dynamics)) = (cost_model, dynamics) else {
                return Err(HrlError::MissingInput("cost model and dynamics for imagination"));
            };
            let imagination = Imagination {
                space: self.space,
                cost_model,
                dynamics,
            };
            let plan = RolloutPlan::draw(img.horizon, img.all_steps, img.normalize_in_training, &mut self.rng);
            let rollout = imagination.rollout(self.family.as_ref(), &batch.state, goal, plan, &mut self.rng)?;
            let safety = &rollout.safety;
            let grad_safety = weights.with_imagined(&img.objective, safety, penalty, self.safe_threshold)?;
            imagined = Some(safety.mean());
            imagination.backpropagate(self.family.as_mut(), &rollout, &grad_safety)?;
        }
        let ObjectiveWeights {
            loss,
            base: base_scale,
            cost: cost_term,
        } = weights;
        ensure_finite("controller_actor_loss", loss)?;

        let ones = Tensor::full(batch.len(), 1, 1.0)?;
        let mut grad_action = self
            .critic
            .q1_action_gradient(&state, goal, &draw.action, &ones)?
            .scale(-base_scale / n)?;
        if let (Some(weight), Some(cost_critic)) = (cost_term, &self.cost_critic) {
            let grad_cost = cost_critic
                .online
                .q1_action_gradient(&state, goal, &draw.action, &ones)?;
            grad_action.add_scaled(&grad_cost, weight / n)?;
        }
        let grad_log_prob = match alpha {
            Some(alpha) => Some(Tensor::full(batch.len(), 1, base_scale * alpha / n)?),
            None => None,
        };
        self.family
            .backward_draw(&state, goal, &draw, &grad_action, grad_log_prob.as_ref())?;
        Ok(ActorObjective {
            loss,
            safety: imagined,
        })
    }

    pub fn train(
        &mut self,
        store: &RingBuffer<Transition>,
        cost_model: Option<&CostModel>,
        dynamics: Option<&dyn DynamicsModel>,
        schedule: UpdateSchedule,
        episode_mean_cost: Option<f32>,
    ) -> HrlResult<ControllerReport> {
        let mut report = ControllerReport::default();
        let mut cost_loss = 0.0f32;
        let mut safety_total = 0.0f32;
        for _ in 0..schedule.iterations {
            let records = store.sample(schedule.batch_size, &mut self.rng, "controller")?;
            let batch = TransitionBatch::from_records(&records)?;
            let (reward_target, cost_target) = self.td_targets(&batch, schedule.discount)?;
            let state = self.space.clean(&batch.state)?;

            report.critic_loss += self.critic.fit(
                &state,
                &batch.goal,
                &batch.action,
                &reward_target,
                "controller_critic_loss",
            )?;
            if let (Some(cost_critic), Some(target)) = (self.cost_critic.as_mut(), cost_target.as_ref()) {
                cost_loss += cost_critic.online.fit(
                    &state,
                    &batch.goal,
                    &batch.action,
                    target,
                    "controller_cost_critic_loss",
                )?;
            }

            let objective = self.actor_objective(&batch, cost_model, dynamics)?;
            report.actor_loss += objective.loss;
            safety_total += objective.safety.unwrap_or(0.0);
            let actor = self.family.actor_mut();
            if self.grad_clip > 0.0 {
                actor.clip_gradient_norm(self.grad_clip)?;
            }
            report.grad_norm += actor.gradient_norm()?;
            actor.apply_step(0.0)?;

            soft_update(&mut self.critic_target, &self.critic, schedule.tau)?;
            if let Some(cost_critic) = self.cost_critic.as_mut() {
                soft_update(&mut cost_critic.target, &cost_critic.online, schedule.tau)?;
            }
            self.family.update_targets(schedule.tau)?;
        }
        if schedule.iterations > 0 {
            let n = schedule.iterations as f32;
            report.actor_loss /= n;
            report.critic_loss /= n;
            report.grad_norm /= n;
            if self.cost_critic.is_some() {
                report.cost_critic_loss = Some(cost_loss / n);
            }
            if self.imagination.is_some() {
                report.imagined_safety = Some(safety_total / n);
            }
        }
        if let Some(cost) = episode_mean_cost {
            self.pid_update(cost);
        }
        report.penalty = self.penalty();
        debug!(
            family = self.family.name(),
            actor_loss = report.actor_loss,
            critic_loss = report.critic_loss,
            penalty = report.penalty,
            "controller update"
        );
        Ok(report)
    }

    pub fn save(&self, archive: &mut ModuleArchive) -> HrlResult<()> {
        self.family.save(archive)?;
        archive.insert_module("controller_critic", &self.critic)?;
        archive.insert_module("controller_critic_target", &self.critic_target)?;
        if let Some(cost_critic) = &self.cost_critic {
            archive.insert_module("controller_cost_critic", &cost_critic.online)?;
            archive.insert_module("controller_cost_critic_target", &cost_critic.target)?;
        }
        if let Some(pid) = &self.lagrangian {
            pid.save(archive, "controller_pid");
        }
        Ok(())
    }

    pub fn check(&self, archive: &ModuleArchive) -> HrlResult<()> {
        self.family.check(archive)?;
        archive.check_module("controller_critic", &self.critic)?;
        archive.check_module("controller_critic_target", &self.critic_target)?;
        if let Some(cost_critic) = &self.cost_critic {
            archive.check_module("controller_cost_critic", &cost_critic.online)?;
            archive.check_module("controller_cost_critic_target", &cost_critic.target)?;
        }
        if let Some(pid) = &self.lagrangian {
            pid.check(archive, "controller_pid")?;
        }
        Ok(())
    }

    /// All-or-nothing restore of the actor family, critics and multiplier.
    pub fn load(&mut self, archive: &ModuleArchive) -> HrlResult<()> {
        self.check(archive)?;
        self.family.load(archive)?;
        archive.restore_module("controller_critic", &mut self.critic)?;
        archive.restore_module("controller_critic_target", &mut self.critic_target)?;
        if let Some(cost_critic) = self.cost_critic.as_mut() {
            archive.restore_module("controller_cost_critic", &mut cost_critic.online)?;
            archive.restore_module("controller_cost_critic_target", &mut cost_critic.target)?;
        }
        if let Some(pid) = self.lagrangian.as_mut() {
            pid.load(archive, "controller_pid")?;
        }
        Ok(())
    }

    pub fn max_action(&self) -> f32 {
        self.max_action
    }
}
