// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Controller action-selection strategies, chosen once at construction.

use rand::rngs::StdRng;
use st_nn::{hard_update, soft_update, AdamConfig, Module, ModuleArchive, Tensor};

use crate::config::{ActionFamily, ControllerConfig, EnvConfig};
use crate::error::HrlResult;
use crate::networks::{DeterministicActor, GaussianActor, GaussianSample};

/// Action drawn for the actor loss, retained for the backward pass.
#[derive(Clone, Debug)]
pub struct PolicyDraw {
    pub action: Tensor,
    pub log_prob: Option<Tensor>,
    sample: Option<GaussianSample>,
}

pub trait ActorFamily: std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Deterministic action, differentiable through [`ActorFamily::backward_mean`].
    fn mean_action(&self, state: &Tensor, goal: &Tensor) -> HrlResult<Tensor>;

    /// Accumulates actor gradients for `∂L/∂mean_action` and returns the
    /// gradients with respect to `(state, goal)`.
    fn backward_mean(&mut self, state: &Tensor, goal: &Tensor, grad_action: &Tensor) -> HrlResult<(Tensor, Tensor)>;

    /// Action executed in the environment during training.
    fn explore(&self, state: &Tensor, goal: &Tensor, rng: &mut StdRng) -> HrlResult<Tensor>;

    /// Bootstrap action for the critic target together with the entropy
    /// term `α·log π` subtracted from the twin minimum, if any.
    fn target_action(
        &self,
        next_state: &Tensor,
        next_goal: &Tensor,
        rng: &mut StdRng,
    ) -> HrlResult<(Tensor, Option<Tensor>)>;

    fn policy_draw(&self, state: &Tensor, goal: &Tensor, rng: &mut StdRng) -> HrlResult<PolicyDraw>;

    fn backward_draw(
        &mut self,
        state: &Tensor,
        goal: &Tensor,
        draw: &PolicyDraw,
        grad_action: &Tensor,
        grad_log_prob: Option<&Tensor>,
    ) -> HrlResult<()>;

    /// Entropy temperature of stochastic families.
    fn alpha(&self) -> Option<f32>;

    fn actor_mut(&mut self) -> &mut dyn Module;

    fn update_targets(&mut self, tau: f32) -> HrlResult<()>;

    fn save(&self, archive: &mut ModuleArchive) -> HrlResult<()>;

    /// Fails when [`ActorFamily::load`] would, without touching the actor.
    fn check(&self, archive: &ModuleArchive) -> HrlResult<()>;

    fn load(&mut self, archive: &ModuleArchive) -> HrlResult<()>;
}

/// Builds the configured family.
pub fn build_family(
    config: &ControllerConfig,
    env: &EnvConfig,
    rng: &mut StdRng,
) -> HrlResult<Box<dyn ActorFamily>> {
    let adam = AdamConfig::with_learning_rate(config.actor_lr);
    match config.family {
        ActionFamily::Deterministic {
            policy_noise,
            noise_clip,
        } => {
            let low = vec![-env.max_action; env.action_dim];
            let high = vec![env.max_action; env.action_dim];
            let build = |rng: &mut StdRng| {
                DeterministicActor::new(
                    "controller_actor",
                    env.state_dim,
                    env.subgoal_dims,
                    &config.hidden,
                    &low,
                    &high,
                    rng,
                )
            };
            let mut actor = build(&mut *rng)?;
            let mut actor_target = build(&mut *rng)?;
            hard_update(&mut actor_target, &actor)?;
            actor.attach_adam(adam)?;
            Ok(Box::new(DeterministicFamily {
                actor,
                actor_target,
                policy_noise,
                noise_clip,
                max_action: env.max_action,
            }))
        }
        ActionFamily::Stochastic { alpha } => {
            let mut actor = GaussianActor::new(
                "controller_actor",
                env.state_dim,
                env.subgoal_dims,
                env.action_dim,
                &config.hidden,
                env.max_action,
                rng,
            )?;
            actor.attach_adam(adam)?;
            Ok(Box::new(StochasticFamily { actor, alpha }))
        }
    }
}

/// Deterministic actor with a Polyak-averaged target and clipped target
/// policy smoothing.
#[derive(Debug)]
pub struct DeterministicFamily {
    actor: DeterministicActor,
    actor_target: DeterministicActor,
    policy_noise: f32,
    noise_clip: f32,
    max_action: f32,
}

impl ActorFamily for DeterministicFamily {
    fn name(&self) -> &'static str {
        "deterministic"
    }

    fn mean_action(&self, state: &Tensor, goal: &Tensor) -> HrlResult<Tensor> {
        Ok(self.actor.act(state, goal)?)
    }

    fn backward_mean(&mut self, state: &Tensor, goal: &Tensor, grad_action: &Tensor) -> HrlResult<(Tensor, Tensor)> {
        Ok(self.actor.backward_action(state, goal, grad_action)?)
    }

    fn explore(&self, state: &Tensor, goal: &Tensor, _rng: &mut StdRng) -> HrlResult<Tensor> {
        self.mean_action(state, goal)
    }

    fn target_action(
        &self,
        next_state: &Tensor,
        next_goal: &Tensor,
        rng: &mut StdRng,
    ) -> HrlResult<(Tensor, Option<Tensor>)> {
        let action = self.actor_target.act(next_state, next_goal)?;
        let noise = Tensor::random_normal(action.rows(), action.cols(), 0.0, self.policy_noise, rng)?
            .clamp(-self.noise_clip, self.noise_clip);
        let m = self.max_action;
        Ok((action.add(&noise)?.clamp(-m, m), None))
    }

    fn policy_draw(&self, state: &Tensor, goal: &Tensor, _rng: &mut StdRng) -> HrlResult<PolicyDraw> {
        Ok(PolicyDraw {
            action: self.actor.act(state, goal)?,
            log_prob: None,
            sample: None,
        })
    }

    fn backward_draw(
        &mut self,
        state: &Tensor,
        goal: &Tensor,
        _draw: &PolicyDraw,
        grad_action: &Tensor,
        _grad_log_prob: Option<&Tensor>,
    ) -> HrlResult<()> {
        self.actor.backward_action(state, goal, grad_action)?;
        Ok(())
    }

    fn alpha(&self) -> Option<f32> {
        None
    }

    fn actor_mut(&mut self) -> &mut dyn Module {
        &mut self.actor
    }

    fn update_targets(&mut self, tau: f32) -> HrlResult<()> {
        Ok(soft_update(&mut self.actor_target, &self.actor, tau)?)
    }

    fn save(&self, archive: &mut ModuleArchive) -> HrlResult<()> {
        archive.insert_module("controller_actor", &self.actor)?;
        archive.insert_module("controller_actor_target", &self.actor_target)?;
        Ok(())
    }

    fn check(&self, archive: &ModuleArchive) -> HrlResult<()> {
        archive.check_module("controller_actor", &self.actor)?;
        archive.check_module("controller_actor_target", &self.actor_target)?;
        Ok(())
    }

    fn load(&mut self, archive: &ModuleArchive) -> HrlResult<()> {
        self.check(archive)?;
        archive.restore_module("controller_actor", &mut self.actor)?;
        archive.restore_module("controller_actor_target", &mut self.actor_target)?;
        Ok(())
    }
}

/// Tanh-Gaussian actor with a fixed entropy temperature and no target
/// actor.
#[derive(Debug)]
pub struct StochasticFamily {
    actor: GaussianActor,
    alpha: f32,
}

impl ActorFamily for StochasticFamily {
    fn name(&self) -> &'static str {
        "stochastic"
    }

    fn mean_action(&self, state: &Tensor, goal: &Tensor) -> HrlResult<Tensor> {
        Ok(self.actor.mean_action(state, goal)?)
    }

    fn backward_mean(&mut self, state: &Tensor, goal: &Tensor, grad_action: &Tensor) -> HrlResult<(Tensor, Tensor)> {
        Ok(self.actor.backward_mean(state, goal, grad_action)?)
    }

    fn explore(&self, state: &Tensor, goal: &Tensor, rng: &mut StdRng) -> HrlResult<Tensor> {
        Ok(self.actor.sample(state, goal, rng)?.action)
    }

    fn target_action(
        &self,
        next_state: &Tensor,
        next_goal: &Tensor,
        rng: &mut StdRng,
    ) -> HrlResult<(Tensor, Option<Tensor>)> {
        let sample = self.actor.sample(next_state, next_goal, rng)?;
        let entropy = sample.log_prob.scale(self.alpha)?;
        Ok((sample.action, Some(entropy)))
    }

    fn policy_draw(&self, state: &Tensor, goal: &Tensor, rng: &mut StdRng) -> HrlResult<PolicyDraw> {
        let sample = self.actor.sample(state, goal, rng)?;
        Ok(PolicyDraw {
            action: sample.action.clone(),
            log_prob: Some(sample.log_prob.clone()),
            sample: Some(sample),
        })
    }

    fn backward_draw(
        &mut self,
        _state: &Tensor,
        _goal: &Tensor,
        draw: &PolicyDraw,
        grad_action: &Tensor,
        grad_log_prob: Option<&Tensor>,
    ) -> HrlResult<()> {
        let Some(sample) = draw.sample.as_ref() else {
            return Err(crate::error::HrlError::MissingInput("stochastic policy draw"));
        };
        let zeros;
        let grad_log_prob = match grad_log_prob {
            Some(grad) => grad,
            None => {
                zeros = Tensor::zeros(grad_action.rows(), 1)?;
                &zeros
            }
        };
        self.actor.backward_sample(sample, grad_action, grad_log_prob)?;
        Ok(())
    }

    fn alpha(&self) -> Option<f32> {
        Some(self.alpha)
    }

    fn actor_mut(&mut self) -> &mut dyn Module {
        &mut self.actor
    }

    fn update_targets(&mut self, _tau: f32) -> HrlResult<()> {
        Ok(())
    }

    fn save(&self, archive: &mut ModuleArchive) -> HrlResult<()> {
        Ok(archive.insert_module("controller_actor", &self.actor)?)
    }

    fn check(&self, archive: &ModuleArchive) -> HrlResult<()> {
        Ok(archive.check_module("controller_actor", &self.actor)?)
    }

    fn load(&mut self, archive: &ModuleArchive) -> HrlResult<()> {
        Ok(archive.restore_module("controller_actor", &mut self.actor)?)
    }
}
