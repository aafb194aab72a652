// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Validated configuration record for a hierarchical safe learning run.
//!
//! Every hyperparameter is threaded through component constructors from a
//! single [`HrlConfig`]; nothing is read from process-wide state. Optional
//! subsystems (cost model, dynamics ensemble, Lagrangian penalty, imagined
//! safety) are `Option` sections so that a TOML file enables them simply by
//! declaring the table.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{HrlError, HrlResult};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HrlConfig {
    pub run: RunConfig,
    pub env: EnvConfig,
    pub manager: ManagerConfig,
    pub controller: ControllerConfig,
    pub cost_model: Option<CostModelConfig>,
    pub dynamics: Option<DynamicsConfig>,
    pub exploration: ExplorationConfig,
    pub reachability: ReachabilityConfig,
}

/// Cadence of the hierarchical training loop.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    pub seed: u64,
    pub max_timesteps: usize,
    pub eval_freq: usize,
    pub eval_episodes: usize,
    /// Random-action steps used to seed the dynamics and cost stores.
    pub initial_exploration_steps: usize,
    pub pretrain_epochs: usize,
    pub train_manager_freq: usize,
    pub manager_propose_freq: usize,
    /// The dynamics ensemble trains on the first episode and every
    /// `dynamics_train_freq` episodes after that.
    pub dynamics_train_freq: usize,
    pub inner_dones: bool,
    pub pid_cost_window: usize,
    pub pid_warmup_episodes: usize,
    pub curriculum: Option<CurriculumConfig>,
    pub checkpoint_dir: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            seed: 2,
            max_timesteps: 1_000_000,
            eval_freq: 30_000,
            eval_episodes: 5,
            initial_exploration_steps: 10_000,
            pretrain_epochs: 0,
            train_manager_freq: 10,
            manager_propose_freq: 10,
            dynamics_train_freq: 40,
            inner_dones: false,
            pid_cost_window: 10,
            pid_warmup_episodes: 10,
            curriculum: None,
            checkpoint_dir: None,
        }
    }
}

/// Switches the scaled imagined-safety coefficient once training passes
/// `start_step`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CurriculumConfig {
    pub start_step: usize,
    pub coefficient: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EnvConfig {
    pub state_dim: usize,
    pub action_dim: usize,
    /// Width of the environment's desired goal.
    pub goal_dim: usize,
    /// Width of the subgoal, a prefix of the state.
    pub subgoal_dims: usize,
    pub max_action: f32,
    pub max_episode_steps: usize,
    pub absolute_goal: bool,
    /// Leading state features hidden from the controller in relative mode.
    pub position_mask_dims: usize,
    pub subgoal_scale: Vec<f32>,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            state_dim: 18,
            action_dim: 2,
            goal_dim: 2,
            subgoal_dims: 2,
            max_action: 1.0,
            max_episode_steps: 1000,
            absolute_goal: false,
            position_mask_dims: 2,
            subgoal_scale: vec![2.2, 2.2],
        }
    }
}

impl EnvConfig {
    /// Lower and upper bounds of a subgoal proposal.
    pub fn subgoal_bounds(&self) -> (Vec<f32>, Vec<f32>) {
        if self.absolute_goal {
            let high = self.subgoal_scale.iter().map(|s| 2.0 * s).collect();
            (vec![0.0; self.subgoal_scale.len()], high)
        } else {
            let low = self.subgoal_scale.iter().map(|s| -s).collect();
            (low, self.subgoal_scale.clone())
        }
    }

    /// Number of masked leading dims actually applied by the controller.
    pub fn masked_dims(&self) -> usize {
        if self.absolute_goal {
            0
        } else {
            self.position_mask_dims
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ManagerConfig {
    pub actor_lr: f32,
    pub critic_lr: f32,
    pub hidden: Vec<usize>,
    pub batch_size: usize,
    pub buffer_size: usize,
    pub discount: f32,
    pub tau: f32,
    pub reward_scale: f32,
    pub policy_noise: f32,
    pub noise_clip: f32,
    /// Non-original relabeling candidates: the displacement first, then
    /// Gaussian samples around it.
    pub candidate_goals: usize,
    pub correction: bool,
    pub action_norm_reg: f32,
    pub goal_loss_coeff: f32,
    pub grad_clip: f32,
    /// Weight of the cost model's prediction at the proposed subgoal.
    pub modelfree_safety: Option<f32>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            actor_lr: 1e-4,
            critic_lr: 1e-3,
            hidden: vec![300, 300],
            batch_size: 100,
            buffer_size: 200_000,
            discount: 0.99,
            tau: 0.005,
            reward_scale: 0.1,
            policy_noise: 0.2,
            noise_clip: 0.5,
            candidate_goals: 9,
            correction: true,
            action_norm_reg: 0.0,
            goal_loss_coeff: 0.0,
            grad_clip: 0.0,
            modelfree_safety: None,
        }
    }
}

/// Action-selection family of the controller.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionFamily {
    /// Deterministic actor with clipped-noise target smoothing.
    Deterministic { policy_noise: f32, noise_clip: f32 },
    /// Tanh-squashed Gaussian actor with a fixed entropy temperature.
    Stochastic { alpha: f32 },
}

impl Default for ActionFamily {
    fn default() -> Self {
        ActionFamily::Deterministic {
            policy_noise: 0.2,
            noise_clip: 0.5,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControllerConfig {
    pub actor_lr: f32,
    pub critic_lr: f32,
    pub hidden: Vec<usize>,
    pub batch_size: usize,
    pub buffer_size: usize,
    pub discount: f32,
    pub tau: f32,
    pub reward_scale: f32,
    pub binary_reward: bool,
    pub grad_clip: f32,
    pub family: ActionFamily,
    /// Adds a twin cost critic whose Q1 joins the actor loss under the
    /// Lagrangian penalty.
    pub cost_critic: bool,
    /// Episode cost budget. Required whenever a threshold is used.
    pub cost_budget: Option<f32>,
    pub lagrangian: Option<PidConfig>,
    pub imagination: Option<ImaginationConfig>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            actor_lr: 1e-4,
            critic_lr: 1e-3,
            hidden: vec![300, 300],
            batch_size: 128,
            buffer_size: 200_000,
            discount: 0.95,
            tau: 0.005,
            reward_scale: 1.0,
            binary_reward: false,
            grad_clip: 0.0,
            family: ActionFamily::default(),
            cost_critic: false,
            cost_budget: None,
            lagrangian: None,
            imagination: None,
        }
    }
}

/// PID gains for the adaptive Lagrangian penalty.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PidConfig {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
    pub d_delay: usize,
    pub delta_p_ema_alpha: f32,
    pub delta_d_ema_alpha: f32,
    pub multiplier_init: f32,
}

impl Default for PidConfig {
    fn default() -> Self {
        Self {
            kp: 0.1,
            ki: 0.003,
            kd: 0.1,
            d_delay: 10,
            delta_p_ema_alpha: 0.95,
            delta_d_ema_alpha: 0.95,
            multiplier_init: 0.0,
        }
    }
}

/// How the imagined safety estimate enters the controller's actor loss.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImaginedSafety {
    /// `loss += coefficient · mean(safety)`.
    Scaled { coefficient: f32 },
    /// `loss += coefficient · mean(max(safety, threshold) / threshold)`.
    Thresholded { coefficient: f32 },
    /// Folded into the Lagrangian penalty and renormalisation.
    Penalized,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImaginationConfig {
    pub horizon: usize,
    /// Accumulate the predicted cost at every imagined state rather than
    /// only the final one.
    pub all_steps: bool,
    pub objective: ImaginedSafety,
    pub normalize_in_training: bool,
    pub normalize_in_evaluation: bool,
}

impl Default for ImaginationConfig {
    fn default() -> Self {
        Self {
            horizon: 10,
            all_steps: true,
            objective: ImaginedSafety::Scaled { coefficient: 1.0 },
            normalize_in_training: true,
            normalize_in_evaluation: false,
        }
    }
}

/// Feature layout consumed by the cost model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CostInputConfig {
    State,
    Lidar {
        position_dims: usize,
        lidar_dims: usize,
        frame_stack: usize,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CostModelConfig {
    pub lr: f32,
    pub hidden: Vec<usize>,
    pub loss_coef: f32,
    pub batch_size: usize,
    pub buffer_size: usize,
    pub input: CostInputConfig,
}

impl Default for CostModelConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            hidden: vec![256, 256],
            loss_coef: 1.0,
            batch_size: 128,
            buffer_size: 1_000_000,
            input: CostInputConfig::State,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DynamicsConfig {
    pub num_networks: usize,
    pub num_elites: usize,
    pub hidden: Vec<usize>,
    pub lr: f32,
    pub weight_decay: f32,
    pub batch_size: usize,
    pub train_iterations: usize,
    pub holdout_size: usize,
    pub buffer_size: usize,
    pub predict_reward: bool,
    pub predict_cost: bool,
    pub max_logvar: f32,
    pub min_logvar: f32,
}

impl Default for DynamicsConfig {
    fn default() -> Self {
        Self {
            num_networks: 8,
            num_elites: 6,
            hidden: vec![200, 200, 200, 200],
            lr: 1e-3,
            weight_decay: 5e-5,
            batch_size: 256,
            train_iterations: 200,
            holdout_size: 1000,
            buffer_size: 1_000_000,
            predict_reward: false,
            predict_cost: false,
            max_logvar: 0.5,
            min_logvar: -10.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NoiseKind {
    Normal,
    OrnsteinUhlenbeck { theta: f32 },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExplorationConfig {
    pub noise: NoiseKind,
    pub manager_sigma: f32,
    pub controller_sigma: f32,
}

impl Default for ExplorationConfig {
    fn default() -> Self {
        Self {
            noise: NoiseKind::Normal,
            manager_sigma: 1.0,
            controller_sigma: 1.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReachabilityConfig {
    pub margin_pos: f32,
    pub margin_neg: f32,
    /// Number of episodes collected before the external learner is invoked.
    pub trajectory_buffer_size: usize,
}

impl Default for ReachabilityConfig {
    fn default() -> Self {
        Self {
            margin_pos: 1.0,
            margin_neg: 1.2,
            trajectory_buffer_size: 100,
        }
    }
}

impl ReachabilityConfig {
    /// Hinge margin applied to the embedded distance.
    pub fn margin(&self) -> f32 {
        0.5 * (self.margin_pos + self.margin_neg)
    }
}

impl HrlConfig {
    pub fn from_toml_str(text: &str) -> HrlResult<Self> {
        let config: HrlConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> HrlResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Threshold compared against the (scaled) episode cost and the imagined
    /// safety estimate. With imagination enabled the budget is rescaled to
    /// the imagination horizon.
    pub fn safe_threshold(&self) -> Option<f32> {
        let budget = self.controller.cost_budget?;
        Some(match &self.controller.imagination {
            Some(img) => budget / self.env.max_episode_steps as f32 * img.horizon as f32,
            None => budget,
        })
    }

    /// Rejects contradictory combinations before any component is built.
    pub fn validate(&self) -> HrlResult<()> {
        let env = &self.env;
        for (field, value) in [
            ("env.state_dim", env.state_dim),
            ("env.action_dim", env.action_dim),
            ("env.goal_dim", env.goal_dim),
            ("env.subgoal_dims", env.subgoal_dims),
            ("env.max_episode_steps", env.max_episode_steps),
            ("run.manager_propose_freq", self.run.manager_propose_freq),
            ("run.train_manager_freq", self.run.train_manager_freq),
            ("run.dynamics_train_freq", self.run.dynamics_train_freq),
            ("run.pid_cost_window", self.run.pid_cost_window),
            ("manager.batch_size", self.manager.batch_size),
            ("manager.buffer_size", self.manager.buffer_size),
            ("controller.batch_size", self.controller.batch_size),
            ("controller.buffer_size", self.controller.buffer_size),
        ] {
            if value == 0 {
                return Err(HrlError::config(field, "must be non-zero"));
            }
        }
        if env.subgoal_dims > env.state_dim {
            return Err(HrlError::config(
                "env.subgoal_dims",
                format!("{} exceeds state_dim {}", env.subgoal_dims, env.state_dim),
            ));
        }
        if env.masked_dims() > env.state_dim {
            return Err(HrlError::config(
                "env.position_mask_dims",
                "cannot mask more dims than the state has",
            ));
        }
        if env.subgoal_scale.len() != env.subgoal_dims {
            return Err(HrlError::config(
                "env.subgoal_scale",
                format!(
                    "expected {} entries, got {}",
                    env.subgoal_dims,
                    env.subgoal_scale.len()
                ),
            ));
        }
        if env.subgoal_scale.iter().any(|s| !(*s > 0.0)) || !(env.max_action > 0.0) {
            return Err(HrlError::config(
                "env",
                "subgoal_scale and max_action must be positive",
            ));
        }
        for (field, discount, tau) in [
            ("manager", self.manager.discount, self.manager.tau),
            ("controller", self.controller.discount, self.controller.tau),
        ] {
            if !(0.0..=1.0).contains(&discount) {
                return Err(HrlError::config(field, format!("discount {discount} outside [0, 1]")));
            }
            if !(0.0..=1.0).contains(&tau) {
                return Err(HrlError::config(field, format!("tau {tau} outside [0, 1]")));
            }
        }
        for (field, lr) in [
            ("manager.actor_lr", self.manager.actor_lr),
            ("manager.critic_lr", self.manager.critic_lr),
            ("controller.actor_lr", self.controller.actor_lr),
            ("controller.critic_lr", self.controller.critic_lr),
        ] {
            if !(lr > 0.0) {
                return Err(HrlError::config(field, "learning rate must be positive"));
            }
        }
        if let ActionFamily::Deterministic { noise_clip, policy_noise } = self.controller.family {
            if noise_clip < 0.0 || policy_noise < 0.0 {
                return Err(HrlError::config("controller.family", "noise must be non-negative"));
            }
        }
        if let ActionFamily::Stochastic { alpha } = self.controller.family {
            if !(alpha >= 0.0) {
                return Err(HrlError::config("controller.family", "alpha must be non-negative"));
            }
        }

        let ctrl = &self.controller;
        if let Some(budget) = ctrl.cost_budget {
            if !(budget > 0.0) {
                return Err(HrlError::config("controller.cost_budget", "must be positive"));
            }
        }
        if let Some(pid) = &ctrl.lagrangian {
            if ctrl.cost_budget.is_none() {
                return Err(HrlError::config(
                    "controller.lagrangian",
                    "the Lagrangian penalty requires a cost_budget",
                ));
            }
            if pid.d_delay == 0 {
                return Err(HrlError::config("controller.lagrangian.d_delay", "must be non-zero"));
            }
            for alpha in [pid.delta_p_ema_alpha, pid.delta_d_ema_alpha] {
                if !(0.0..=1.0).contains(&alpha) {
                    return Err(HrlError::config(
                        "controller.lagrangian",
                        "EMA alphas must lie in [0, 1]",
                    ));
                }
            }
        }
        if ctrl.cost_critic && ctrl.lagrangian.is_none() {
            return Err(HrlError::config(
                "controller.cost_critic",
                "the cost critic is weighted by the Lagrangian penalty",
            ));
        }
        if let Some(img) = &ctrl.imagination {
            if self.cost_model.is_none() || self.dynamics.is_none() {
                return Err(HrlError::config(
                    "controller.imagination",
                    "imagined safety needs both [cost_model] and [dynamics]",
                ));
            }
            match img.objective {
                ImaginedSafety::Penalized if ctrl.lagrangian.is_none() => {
                    return Err(HrlError::config(
                        "controller.imagination.objective",
                        "penalized imagination requires [controller.lagrangian]",
                    ));
                }
                ImaginedSafety::Thresholded { .. } if ctrl.cost_budget.is_none() => {
                    return Err(HrlError::config(
                        "controller.imagination.objective",
                        "thresholded imagination requires a cost_budget",
                    ));
                }
                _ => {}
            }
        }
        if self.manager.modelfree_safety.is_some() && self.cost_model.is_none() {
            return Err(HrlError::config(
                "manager.modelfree_safety",
                "model-free safety needs [cost_model]",
            ));
        }
        if let Some(cost) = &self.cost_model {
            if cost.batch_size == 0 || cost.buffer_size == 0 {
                return Err(HrlError::config("cost_model", "batch and buffer sizes must be non-zero"));
            }
            if let CostInputConfig::Lidar {
                position_dims,
                lidar_dims,
                frame_stack,
            } = cost.input
            {
                if frame_stack == 0 || position_dims == 0 || position_dims + lidar_dims > env.state_dim {
                    return Err(HrlError::config(
                        "cost_model.input",
                        "lidar layout does not fit the state",
                    ));
                }
                if position_dims != env.subgoal_dims {
                    return Err(HrlError::config(
                        "cost_model.input.position_dims",
                        "must match env.subgoal_dims",
                    ));
                }
            }
        }
        if let Some(dynamics) = &self.dynamics {
            if dynamics.num_networks == 0
                || dynamics.num_elites == 0
                || dynamics.num_elites > dynamics.num_networks
            {
                return Err(HrlError::config(
                    "dynamics.num_elites",
                    "need 1 <= num_elites <= num_networks",
                ));
            }
            if !(dynamics.min_logvar < dynamics.max_logvar) {
                return Err(HrlError::config("dynamics", "min_logvar must be below max_logvar"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        HrlConfig::default().validate().unwrap();
    }

    #[test]
    fn lagrangian_requires_budget() {
        let mut config = HrlConfig::default();
        config.controller.lagrangian = Some(PidConfig::default());
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            HrlError::Config {
                field: "controller.lagrangian",
                ..
            }
        ));
        config.controller.cost_budget = Some(25.0);
        config.validate().unwrap();
    }

    #[test]
    fn penalized_imagination_requires_lagrangian() {
        let mut config = HrlConfig::default();
        config.cost_model = Some(CostModelConfig::default());
        config.dynamics = Some(DynamicsConfig::default());
        config.controller.cost_budget = Some(25.0);
        config.controller.imagination = Some(ImaginationConfig {
            objective: ImaginedSafety::Penalized,
            ..ImaginationConfig::default()
        });
        assert!(config.validate().is_err());
        config.controller.lagrangian = Some(PidConfig::default());
        config.validate().unwrap();
    }

    #[test]
    fn threshold_is_rescaled_to_the_imagination_horizon() {
        let mut config = HrlConfig::default();
        config.controller.cost_budget = Some(20.0);
        assert_eq!(config.safe_threshold(), Some(20.0));
        config.controller.imagination = Some(ImaginationConfig {
            horizon: 10,
            ..ImaginationConfig::default()
        });
        assert!((config.safe_threshold().unwrap() - 0.2).abs() < 1e-6);
    }

    #[test]
    fn toml_sections_enable_subsystems() {
        let text = r#"
            [env]
            state_dim = 6
            subgoal_scale = [1.0, 1.0]

            [controller]
            cost_budget = 10.0

            [controller.family]
            kind = "stochastic"
            alpha = 0.2

            [controller.lagrangian]
            kp = 0.5

            [cost_model.input]
            kind = "state"
        "#;
        let config = HrlConfig::from_toml_str(text).unwrap();
        assert_eq!(config.env.state_dim, 6);
        assert_eq!(config.controller.family, ActionFamily::Stochastic { alpha: 0.2 });
        assert_eq!(config.controller.lagrangian.as_ref().unwrap().kp, 0.5);
        assert!(config.cost_model.is_some());
        assert!(config.dynamics.is_none());
    }

    #[test]
    fn mismatched_subgoal_scale_is_rejected() {
        let mut config = HrlConfig::default();
        config.env.subgoal_scale = vec![1.0];
        assert!(config.validate().is_err());
    }

    #[test]
    fn absolute_mode_bounds_and_mask() {
        let mut env = EnvConfig::default();
        env.absolute_goal = true;
        let (low, high) = env.subgoal_bounds();
        assert_eq!(low, vec![0.0, 0.0]);
        assert_eq!(high, vec![4.4, 4.4]);
        assert_eq!(env.masked_dims(), 0);
    }
}
