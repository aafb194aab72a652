// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Episode-driven coordinator of the hierarchy.
//!
//! Interaction and learning alternate strictly: an episode is rolled out to
//! completion, then the learners are updated in a fixed order.
//!
//! 1. cost model (one step per episode step);
//! 2. dynamics ensemble on the first episode and every
//!    `dynamics_train_freq` episodes;
//! 3. controller (one iteration per episode step, PID update included);
//! 4. manager, once `train_manager_freq` steps have accumulated;
//! 5. evaluation and checkpointing on the `eval_freq` cadence;
//! 6. the reachability learner whenever its trajectory buffer fills.

use std::collections::VecDeque;
use std::path::Path;

use rand::rngs::StdRng;
use spiral_config::determinism::DeterminismConfig;
use st_nn::{ModuleArchive, Tensor};
use tracing::{debug, info, warn};

use crate::buffer::{CostSample, ManagerTransition, RingBuffer, Transition};
use crate::config::HrlConfig;
use crate::controller::{Controller, ControllerReport, UpdateSchedule};
use crate::cost_model::{CostDataset, CostModel, CostTrainReport, CostValidation};
use crate::dynamics::{DynamicsModel, DynamicsReport, EnsembleDynamics};
use crate::env::{Environment, Observation};
use crate::error::{HrlError, HrlResult};
use crate::goal::GoalSpace;
use crate::manager::{Manager, ManagerReport};
use crate::noise::ExplorationNoise;
use crate::reachability::{ReachabilityLearner, ReachabilityTerm, TrajectoryBuffer};

const MANAGER_ARCHIVE: &str = "manager.bin";
const CONTROLLER_ARCHIVE: &str = "controller.bin";
const COST_MODEL_ARCHIVE: &str = "cost_model.bin";
const DYNAMICS_ARCHIVE: &str = "dynamics.bin";

/// Statistics of one training episode and the updates that followed it.
#[derive(Clone, Debug, Default)]
pub struct EpisodeReport {
    pub episode: usize,
    pub steps: usize,
    pub total_timesteps: usize,
    pub reward: f32,
    pub controller_reward: f32,
    pub cost: f32,
    /// Fraction of proposed subgoals that land on a costly position.
    pub subgoal_cost_rate: f32,
    /// Mean one-step imagination position error, once the model is trained.
    pub imagination_error: Option<f32>,
    pub cost_model: Option<CostTrainReport>,
    pub dynamics: Option<DynamicsReport>,
    pub controller: Option<ControllerReport>,
    pub manager: Option<ManagerReport>,
    pub evaluation: Option<EvaluationReport>,
    pub reachability_loss: Option<f32>,
}

/// Greedy-policy statistics averaged over evaluation episodes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EvaluationReport {
    pub episodes: usize,
    pub avg_reward: f32,
    pub avg_cost: f32,
    pub avg_controller_reward: f32,
    pub avg_steps: f32,
    pub goal_success_rate: f32,
    pub subgoal_cost_rate: f32,
    /// Episode cost per proposed subgoal.
    pub real_subgoal_cost: f32,
    pub imagined_subgoal_safety: Option<f32>,
    pub cost_model: Option<CostValidation>,
}

#[derive(Clone, Debug, Default)]
pub struct TrainingSummary {
    pub episodes: usize,
    pub total_timesteps: usize,
    pub penalty: f32,
    pub evaluations: Vec<(usize, EvaluationReport)>,
    pub last_episode: Option<EpisodeReport>,
}

/// Free-running imagined trajectory re-synchronised with the real state
/// every `horizon` steps; reports the mean position error per window.
#[derive(Clone, Debug)]
struct ImaginationMonitor {
    horizon: usize,
    dims: usize,
    imagined: Option<Tensor>,
    window: f32,
    accumulated: f32,
    windows: usize,
}

impl ImaginationMonitor {
    fn new(horizon: usize, dims: usize) -> Self {
        Self {
            horizon: horizon.max(1),
            dims,
            imagined: None,
            window: 0.0,
            accumulated: 0.0,
            windows: 0,
        }
    }

    fn observe(
        &mut self,
        dynamics: &dyn DynamicsModel,
        action: &[f32],
        state: &[f32],
        step: usize,
        rng: &mut StdRng,
    ) -> HrlResult<()> {
        let real = Tensor::from_vec(1, state.len(), state.to_vec())?;
        let imagined = match self.imagined.take() {
            Some(previous) if step % self.horizon != 0 => {
                let action = Tensor::from_vec(1, action.len(), action.to_vec())?;
                dynamics.step(&previous, &action, true, rng)?.next_state
            }
            _ => real.clone(),
        };
        let error = imagined
            .narrow_cols(0, self.dims)?
            .sub(&real.narrow_cols(0, self.dims)?)?
            .squared_l2_norm()
            .sqrt();
        self.window += error;
        if step % self.horizon == 0 {
            self.accumulated += self.window / self.horizon as f32;
            self.windows += 1;
            self.window = 0.0;
        }
        self.imagined = Some(imagined);
        Ok(())
    }

    fn mean_error(&self) -> Option<f32> {
        (self.windows > 0).then(|| self.accumulated / self.windows as f32)
    }
}

/// Mutable bookkeeping of the running episode.
struct Episode {
    state: Vec<f32>,
    goal: Option<Vec<f32>>,
    subgoal: Vec<f32>,
    transition: ManagerTransition,
    cost_history: VecDeque<Vec<f32>>,
    steps: usize,
    since_subgoal: usize,
    reward: f32,
    controller_reward: f32,
    cost: f32,
    subgoal_cost: f32,
    subgoals: usize,
    monitor: Option<ImaginationMonitor>,
}

pub struct HierarchicalTrainer<E: Environment> {
    config: HrlConfig,
    env: E,
    space: GoalSpace,
    manager: Manager,
    controller: Controller,
    cost_model: Option<CostModel>,
    dynamics: Option<EnsembleDynamics>,
    reachability: Option<Box<dyn ReachabilityLearner>>,
    cost_dataset: Option<CostDataset>,
    controller_store: RingBuffer<Transition>,
    manager_store: RingBuffer<ManagerTransition>,
    cost_store: Option<RingBuffer<CostSample>>,
    dynamics_store: Option<RingBuffer<Transition>>,
    trajectories: TrajectoryBuffer,
    manager_noise: ExplorationNoise,
    controller_noise: ExplorationNoise,
    pid_costs: VecDeque<f32>,
    episode_num: usize,
    total_timesteps: usize,
    since_eval: usize,
    since_manager: usize,
    rng: StdRng,
}

impl<E: Environment> HierarchicalTrainer<E> {
    pub fn new(config: HrlConfig, env: E) -> HrlResult<Self> {
        config.validate()?;
        let seeds = DeterminismConfig::new(config.run.seed);
        let manager = Manager::new(&config, seeds.rng_for("manager"))?;
        let controller = Controller::new(&config, seeds.rng_for("controller"))?;
        let cost_model = match &config.cost_model {
            Some(cfg) => Some(CostModel::new(cfg, &config.env, seeds.rng_for("cost_model"))?),
            None => None,
        };
        let dynamics = match &config.dynamics {
            Some(cfg) => Some(EnsembleDynamics::new(
                cfg,
                config.env.state_dim,
                config.env.action_dim,
                seeds.rng_for("dynamics"),
            )?),
            None => None,
        };
        let cost_store = match &config.cost_model {
            Some(cfg) => Some(RingBuffer::new(cfg.buffer_size)?),
            None => None,
        };
        let dynamics_store = match &config.dynamics {
            Some(cfg) => Some(RingBuffer::new(cfg.buffer_size)?),
            None => None,
        };
        let exploration = &config.exploration;
        Ok(Self {
            space: GoalSpace::from_env(&config.env),
            manager,
            controller,
            cost_model,
            dynamics,
            reachability: None,
            cost_dataset: None,
            controller_store: RingBuffer::new(config.controller.buffer_size)?,
            manager_store: RingBuffer::new(config.manager.buffer_size)?,
            cost_store,
            dynamics_store,
            trajectories: TrajectoryBuffer::new(&config.reachability, config.env.subgoal_dims),
            manager_noise: ExplorationNoise::new(exploration.noise.clone(), exploration.manager_sigma),
            controller_noise: ExplorationNoise::new(exploration.noise.clone(), exploration.controller_sigma),
            pid_costs: VecDeque::with_capacity(config.run.pid_cost_window),
            episode_num: 0,
            total_timesteps: 0,
            since_eval: 0,
            since_manager: 0,
            rng: seeds.rng_for("exploration"),
            config,
            env,
        })
    }

    /// Attaches the external reachability learner.
    pub fn with_reachability(mut self, learner: Box<dyn ReachabilityLearner>) -> Self {
        self.reachability = Some(learner);
        self
    }

    /// Trains and validates the cost model on an offline dataset instead of
    /// the collected store.
    pub fn with_cost_dataset(mut self, dataset: CostDataset) -> Self {
        self.cost_dataset = Some(dataset);
        self
    }

    pub fn config(&self) -> &HrlConfig {
        &self.config
    }

    pub fn manager(&self) -> &Manager {
        &self.manager
    }

    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    pub fn cost_model(&self) -> Option<&CostModel> {
        self.cost_model.as_ref()
    }

    pub fn dynamics(&self) -> Option<&EnsembleDynamics> {
        self.dynamics.as_ref()
    }

    pub fn environment(&self) -> &E {
        &self.env
    }

    pub fn total_timesteps(&self) -> usize {
        self.total_timesteps
    }

    pub fn episodes(&self) -> usize {
        self.episode_num
    }

    pub fn controller_store(&self) -> &RingBuffer<Transition> {
        &self.controller_store
    }

    pub fn manager_store(&self) -> &RingBuffer<ManagerTransition> {
        &self.manager_store
    }

    fn cost_sample(&self, history: &VecDeque<Vec<f32>>, cost: f32) -> HrlResult<Option<CostSample>> {
        let Some(model) = &self.cost_model else {
            return Ok(None);
        };
        let frames: Vec<&[f32]> = history.iter().map(Vec::as_slice).collect();
        Ok(Some(CostSample {
            input: model.encoder().encode_row(&frames)?,
            cost,
        }))
    }

    fn push_history(&self, history: &mut VecDeque<Vec<f32>>, state: &[f32]) {
        let depth = self
            .cost_model
            .as_ref()
            .map_or(1, |model| model.encoder().frame_stack());
        if history.len() == depth {
            history.pop_front();
        }
        history.push_back(state.to_vec());
    }

    /// Fills the dynamics and cost stores with uniformly random actions.
    pub fn explore(&mut self) -> HrlResult<usize> {
        let budget = self.config.run.initial_exploration_steps;
        if budget == 0 || (self.cost_store.is_none() && self.dynamics_store.is_none()) {
            return Ok(0);
        }
        let mut steps = 0;
        while steps < budget {
            let mut state = self.env.reset()?.state;
            let mut history = VecDeque::new();
            self.push_history(&mut history, &state);
            let mut episode_steps = 0;
            loop {
                let action = self.env.sample_action();
                let outcome = self.env.step(&action)?;
                let next_state = outcome.observation.state;
                let cost = outcome.info.safety_cost;
                if let Some(store) = self.dynamics_store.as_mut() {
                    store.push(Transition {
                        state: state.clone(),
                        next_state: next_state.clone(),
                        goal: Vec::new(),
                        action,
                        reward: outcome.reward,
                        done: outcome.done,
                        cost: Some(cost),
                    });
                }
                self.push_history(&mut history, &next_state);
                if let Some(sample) = self.cost_sample(&history, cost)? {
                    if let Some(store) = self.cost_store.as_mut() {
                        store.push(sample);
                    }
                }
                state = next_state;
                steps += 1;
                episode_steps += 1;
                if outcome.done || episode_steps >= self.config.env.max_episode_steps || steps >= budget {
                    break;
                }
            }
        }
        info!(steps, "initial random exploration finished");
        Ok(steps)
    }

    fn train_cost_model(&mut self, iterations: usize) -> HrlResult<Option<CostTrainReport>> {
        let Some(model) = self.cost_model.as_mut() else {
            return Ok(None);
        };
        if let Some(dataset) = &self.cost_dataset {
            return Ok(Some(model.train_on_dataset(dataset, 1)?));
        }
        match &self.cost_store {
            Some(store) if !store.is_empty() => Ok(Some(model.train(store, iterations)?)),
            _ => Ok(None),
        }
    }

    fn train_dynamics(&mut self) -> HrlResult<Option<DynamicsReport>> {
        let (Some(dynamics), Some(store), Some(cfg)) =
            (self.dynamics.as_mut(), self.dynamics_store.as_ref(), self.config.dynamics.as_ref())
        else {
            return Ok(None);
        };
        if store.is_empty() {
            return Ok(None);
        }
        Ok(Some(dynamics.train(store, cfg.batch_size)?))
    }

    /// Pretraining epochs of the dynamics ensemble and cost model on the
    /// explored data.
    pub fn pretrain(&mut self) -> HrlResult<()> {
        let epochs = self.config.run.pretrain_epochs;
        for epoch in 0..epochs {
            let dynamics = self.train_dynamics()?;
            let cost = self.train_cost_model(self.config.env.max_episode_steps)?;
            info!(
                epoch,
                epochs,
                dynamics_loss = ?dynamics.map(|r| r.loss),
                cost_loss = ?cost.map(|r| r.loss),
                "pretraining"
            );
        }
        Ok(())
    }

    /// Explores, pretrains, then trains until `max_timesteps` and finishes
    /// with an evaluation.
    pub fn run(&mut self) -> HrlResult<TrainingSummary> {
        self.explore()?;
        self.pretrain()?;
        let mut summary = TrainingSummary::default();
        while self.total_timesteps < self.config.run.max_timesteps {
            let report = self.train_episode()?;
            if let Some(evaluation) = &report.evaluation {
                summary.evaluations.push((report.total_timesteps, evaluation.clone()));
            }
            summary.last_episode = Some(report);
        }
        let evaluation = self.evaluate(self.config.run.eval_episodes)?;
        summary.evaluations.push((self.total_timesteps, evaluation));
        summary.episodes = self.episode_num;
        summary.total_timesteps = self.total_timesteps;
        summary.penalty = self.controller.penalty();
        info!(
            episodes = summary.episodes,
            total_timesteps = summary.total_timesteps,
            penalty = summary.penalty,
            "training finished"
        );
        Ok(summary)
    }

    /// Proposes a perturbed subgoal and scores it against the true cost map.
    fn propose(&mut self, state: &[f32], goal: Option<&[f32]>) -> HrlResult<(Vec<f32>, f32)> {
        let proposal = self.manager.sample_goal(state, goal)?;
        let (low, high) = self.manager.subgoal_bounds();
        let subgoal = self.manager_noise.perturb(&proposal, low, high, &mut self.rng);
        let cost = self.env.cost_func(&self.absolute_subgoal(state, &subgoal));
        Ok((subgoal, cost))
    }

    fn absolute_subgoal(&self, state: &[f32], subgoal: &[f32]) -> Vec<f32> {
        if self.space.absolute {
            subgoal.to_vec()
        } else {
            state.iter().zip(subgoal).map(|(s, g)| s + g).collect()
        }
    }

    fn begin_episode(&mut self) -> HrlResult<Episode> {
        let Observation {
            state, desired_goal, ..
        } = self.env.reset()?;
        self.manager_noise.reset();
        self.controller_noise.reset();
        self.trajectories.append(&state);
        let (subgoal, subgoal_cost) = self.propose(&state, desired_goal.as_deref())?;
        let transition = ManagerTransition::open(&state, desired_goal.as_deref().unwrap_or(&[]), &subgoal);
        let mut cost_history = VecDeque::new();
        self.push_history(&mut cost_history, &state);
        let monitor = match (&self.dynamics, self.episode_num > 1) {
            (Some(_), true) => {
                let horizon = self
                    .config
                    .controller
                    .imagination
                    .as_ref()
                    .map_or(self.config.run.manager_propose_freq, |img| img.horizon);
                Some(ImaginationMonitor::new(horizon, self.config.env.subgoal_dims))
            }
            _ => None,
        };
        Ok(Episode {
            state,
            goal: desired_goal,
            subgoal,
            transition,
            cost_history,
            steps: 0,
            since_subgoal: 0,
            reward: 0.0,
            controller_reward: 0.0,
            cost: 0.0,
            subgoal_cost,
            subgoals: 1,
            monitor,
        })
    }

    /// Executes one primitive step. Returns whether the episode ended.
    fn step_episode(&mut self, episode: &mut Episode) -> HrlResult<bool> {
        let run = &self.config.run;
        let propose_freq = run.manager_propose_freq;
        let inner_dones = run.inner_dones;
        let max_action = self.controller.max_action();
        let action_dim = self.config.env.action_dim;

        let action = self.controller.select_action(&episode.state, &episode.subgoal, false)?;
        let action = self.controller_noise.perturb(
            &action,
            &vec![-max_action; action_dim],
            &vec![max_action; action_dim],
            &mut self.rng,
        );
        let outcome = self.env.step(&action)?;
        let next_state = outcome.observation.state;
        let cost = outcome.info.safety_cost;
        let ctrl = &self.config.controller;

        episode.transition.record_step(
            &action,
            &next_state,
            outcome.reward * self.config.manager.reward_scale,
        );
        self.trajectories.append(&next_state);

        let controller_reward = self.space.intrinsic_reward(
            &episode.state,
            &episode.subgoal,
            &next_state,
            ctrl.reward_scale,
            ctrl.binary_reward,
        );
        let next_subgoal = self
            .controller
            .subgoal_transition(&episode.state, &episode.subgoal, &next_state);
        let steps_after = episode.steps + 1;
        let done = outcome.done
            || steps_after >= self.config.env.max_episode_steps
            || self.total_timesteps + 1 >= run.max_timesteps;
        let ctrl_done = done || (inner_dones && (episode.since_subgoal + 1) % propose_freq == 0);

        let mut history = std::mem::take(&mut episode.cost_history);
        self.push_history(&mut history, &next_state);
        if let Some(sample) = self.cost_sample(&history, cost)? {
            if let Some(store) = self.cost_store.as_mut() {
                store.push(sample);
            }
        }
        episode.cost_history = history;

        let transition = Transition {
            state: episode.state.clone(),
            next_state: next_state.clone(),
            goal: episode.subgoal.clone(),
            action: action.clone(),
            reward: controller_reward,
            done: ctrl_done,
            cost: Some(cost),
        };
        if let Some(store) = self.dynamics_store.as_mut() {
            store.push(transition.clone());
        }
        self.controller_store.push(transition);

        episode.state = next_state;
        episode.goal = outcome.observation.desired_goal;
        episode.subgoal = next_subgoal;
        episode.reward += outcome.reward;
        episode.controller_reward += controller_reward;
        episode.cost += cost;
        episode.steps = steps_after;
        episode.since_subgoal += 1;
        self.total_timesteps += 1;
        self.since_eval += 1;
        self.since_manager += 1;

        if done && self.controller.penalty_enabled() {
            let scaled = match &self.config.controller.imagination {
                Some(img) => episode.cost / self.config.env.max_episode_steps as f32 * img.horizon as f32,
                None => episode.cost,
            };
            if self.pid_costs.len() == self.config.run.pid_cost_window {
                self.pid_costs.pop_front();
            }
            self.pid_costs.push_back(scaled);
        }
        if let Some(curriculum) = &self.config.run.curriculum {
            if curriculum.start_step <= self.total_timesteps {
                self.controller.set_safety_coefficient(curriculum.coefficient);
            }
        }
        if let (Some(monitor), Some(dynamics)) = (episode.monitor.as_mut(), self.dynamics.as_ref()) {
            monitor.observe(dynamics, &action, &episode.state, episode.steps, &mut self.rng)?;
        }

        if episode.since_subgoal % propose_freq == 0 && !done {
            let previous = std::mem::replace(
                &mut episode.transition,
                ManagerTransition::open(&episode.state, &[], &[]),
            );
            self.manager_store.push(previous.close(&episode.state, done));
            let (subgoal, subgoal_cost) = self.propose(&episode.state, episode.goal.as_deref())?;
            episode.subgoal_cost += subgoal_cost;
            episode.subgoals += 1;
            episode.transition = ManagerTransition::open(
                &episode.state,
                episode.goal.as_deref().unwrap_or(&[]),
                &subgoal,
            );
            episode.subgoal = subgoal;
            episode.since_subgoal = 0;
        }
        Ok(done)
    }

    /// Rolls out one episode and runs the end-of-episode updates.
    pub fn train_episode(&mut self) -> HrlResult<EpisodeReport> {
        self.episode_num += 1;
        let mut episode = self.begin_episode()?;
        while !self.step_episode(&mut episode)? {}

        let mut report = EpisodeReport {
            episode: self.episode_num,
            steps: episode.steps,
            total_timesteps: self.total_timesteps,
            reward: episode.reward,
            controller_reward: episode.controller_reward,
            cost: episode.cost,
            subgoal_cost_rate: episode.subgoal_cost / episode.subgoals as f32,
            imagination_error: episode.monitor.as_ref().and_then(ImaginationMonitor::mean_error),
            ..EpisodeReport::default()
        };

        report.cost_model = self.train_cost_model(episode.steps)?;
        let freq = self.config.run.dynamics_train_freq;
        if self.episode_num == 1 || self.episode_num % freq == 0 {
            report.dynamics = self.train_dynamics()?;
        }

        let episode_mean_cost = if self.controller.penalty_enabled()
            && self.episode_num > self.config.run.pid_warmup_episodes
            && !self.pid_costs.is_empty()
        {
            Some(self.pid_costs.iter().sum::<f32>() / self.pid_costs.len() as f32)
        } else {
            None
        };
        let ctrl = &self.config.controller;
        let schedule = UpdateSchedule {
            iterations: episode.steps,
            batch_size: ctrl.batch_size,
            discount: ctrl.discount,
            tau: ctrl.tau,
        };
        report.controller = Some(self.controller.train(
            &self.controller_store,
            self.cost_model.as_ref(),
            self.dynamics.as_ref().map(|d| d as &dyn DynamicsModel),
            schedule,
            episode_mean_cost,
        )?);

        let train_manager_freq = self.config.run.train_manager_freq;
        if self.since_manager >= train_manager_freq {
            self.since_manager = 0;
            if self.manager_store.is_empty() {
                debug!(episode = self.episode_num, "manager store still empty");
            } else {
                let schedule = UpdateSchedule {
                    iterations: episode.steps.div_ceil(train_manager_freq),
                    ..self.manager.schedule()
                };
                let term = match &self.reachability {
                    Some(learner) if self.config.manager.goal_loss_coeff > 0.0 => Some(ReachabilityTerm {
                        embedding: learner.embedding(),
                        margin: self.config.reachability.margin(),
                    }),
                    _ => None,
                };
                report.manager = Some(self.manager.train(
                    &self.controller,
                    &self.manager_store,
                    self.cost_model.as_ref(),
                    term,
                    schedule,
                )?);
            }
        }

        if self.since_eval >= self.config.run.eval_freq {
            self.since_eval = 0;
            let evaluation = self.evaluate(self.config.run.eval_episodes)?;
            if let Some(dir) = self.config.run.checkpoint_dir.clone() {
                self.save(&dir)?;
            }
            report.evaluation = Some(evaluation);
        }

        if self.trajectories.finish_episode() {
            if let Some(learner) = self.reachability.as_mut() {
                let loss = learner.train(self.trajectories.episodes())?;
                info!(loss, episodes = self.trajectories.episodes().len(), "reachability learner trained");
                report.reachability_loss = Some(loss);
            }
            self.trajectories.clear();
        }

        if episode.transition.steps() > 0 {
            let closed = episode.transition.close(&episode.state, true);
            self.manager_store.push(closed);
        }

        info!(
            episode = report.episode,
            steps = report.steps,
            total_timesteps = report.total_timesteps,
            reward = report.reward,
            cost = report.cost,
            penalty = self.controller.penalty(),
            "episode finished"
        );
        Ok(report)
    }

    /// Greedy rollouts without exploration noise or learning.
    pub fn evaluate(&mut self, episodes: usize) -> HrlResult<EvaluationReport> {
        let mut report = EvaluationReport {
            episodes,
            ..EvaluationReport::default()
        };
        if let (Some(model), Some(dataset)) = (&self.cost_model, &self.cost_dataset) {
            report.cost_model = Some(model.validate(dataset)?);
        }
        if episodes == 0 {
            return Ok(report);
        }
        let propose_freq = self.config.run.manager_propose_freq;
        let ctrl = self.config.controller.clone();
        let imagine = ctrl.imagination.is_some() && !self.space.absolute;
        let mut imagined_total = 0.0f32;
        for _ in 0..episodes {
            let Observation {
                mut state,
                desired_goal: mut goal,
                ..
            } = self.env.reset()?;
            let mut subgoal = Vec::new();
            let (mut steps, mut subgoals) = (0usize, 0usize);
            let (mut cost, mut subgoal_cost, mut imagined) = (0.0f32, 0.0f32, 0.0f32);
            let mut reached = false;
            loop {
                if steps % propose_freq == 0 {
                    subgoal = self.manager.sample_goal(&state, goal.as_deref())?;
                    subgoal_cost += self.env.cost_func(&self.absolute_subgoal(&state, &subgoal));
                    if let (true, Some(model), Some(dynamics), Some(img)) =
                        (imagine, &self.cost_model, &self.dynamics, &ctrl.imagination)
                    {
                        let s = Tensor::from_vec(1, state.len(), state.clone())?;
                        let g = Tensor::from_vec(1, subgoal.len(), subgoal.clone())?;
                        let safety = self.controller.state_safety_on_horizon(
                            &s,
                            &g,
                            model,
                            dynamics,
                            true,
                            img.normalize_in_evaluation,
                        )?;
                        imagined += safety.data()[0];
                    }
                    subgoals += 1;
                }
                let action = self.controller.select_action(&state, &subgoal, true)?;
                let outcome = self.env.step(&action)?;
                let next_state = outcome.observation.state;
                steps += 1;
                report.avg_reward += outcome.reward;
                report.avg_controller_reward += self.space.intrinsic_reward(
                    &state,
                    &subgoal,
                    &next_state,
                    ctrl.reward_scale,
                    ctrl.binary_reward,
                );
                cost += outcome.info.safety_cost;
                reached |= outcome.info.goal_met;
                subgoal = self.controller.subgoal_transition(&state, &subgoal, &next_state);
                state = next_state;
                goal = outcome.observation.desired_goal;
                if outcome.done || steps >= self.config.env.max_episode_steps {
                    break;
                }
            }
            let count = subgoals.max(1) as f32;
            report.avg_cost += cost;
            report.avg_steps += steps as f32;
            report.goal_success_rate += if reached { 1.0 } else { 0.0 };
            report.subgoal_cost_rate += subgoal_cost / count;
            report.real_subgoal_cost += cost / count;
            imagined_total += imagined / count;
        }
        let n = episodes as f32;
        report.avg_reward /= n;
        report.avg_cost /= n;
        report.avg_controller_reward /= n;
        report.avg_steps /= n;
        report.goal_success_rate /= n;
        report.subgoal_cost_rate /= n;
        report.real_subgoal_cost /= n;
        if imagine && self.cost_model.is_some() && self.dynamics.is_some() {
            report.imagined_subgoal_safety = Some(imagined_total / n);
        }
        info!(
            episodes,
            avg_reward = report.avg_reward,
            avg_cost = report.avg_cost,
            avg_steps = report.avg_steps,
            goal_success_rate = report.goal_success_rate,
            "evaluation"
        );
        Ok(report)
    }

    /// Writes one archive per component under `dir`.
    pub fn save(&self, dir: &Path) -> HrlResult<()> {
        std::fs::create_dir_all(dir)?;
        let mut archive = ModuleArchive::new();
        self.manager.save(&mut archive)?;
        archive.save(dir.join(MANAGER_ARCHIVE))?;

        let mut archive = ModuleArchive::new();
        self.controller.save(&mut archive)?;
        archive.save(dir.join(CONTROLLER_ARCHIVE))?;

        if let Some(model) = &self.cost_model {
            let mut archive = ModuleArchive::new();
            model.save(&mut archive)?;
            archive.save(dir.join(COST_MODEL_ARCHIVE))?;
        }
        if let Some(dynamics) = &self.dynamics {
            let mut archive = ModuleArchive::new();
            dynamics.save(&mut archive)?;
            archive.save(dir.join(DYNAMICS_ARCHIVE))?;
        }
        info!(dir = %dir.display(), "checkpoint saved");
        Ok(())
    }

    /// Restores every configured component from `dir`.
    ///
    /// Every archive is decoded and checked against the live networks before
    /// anything is written, so a missing archive or a mismatched entry leaves
    /// the whole hierarchy as it was.
    pub fn load(&mut self, dir: &Path) -> HrlResult<()> {
        let open = |name: &str| -> HrlResult<ModuleArchive> {
            let path = dir.join(name);
            if !path.exists() {
                return Err(HrlError::checkpoint(format!("missing archive {}", path.display())));
            }
            Ok(ModuleArchive::load(&path)?)
        };
        let manager = open(MANAGER_ARCHIVE)?;
        let controller = open(CONTROLLER_ARCHIVE)?;
        let cost_model = self.cost_model.as_ref().map(|_| open(COST_MODEL_ARCHIVE)).transpose()?;
        let dynamics = self.dynamics.as_ref().map(|_| open(DYNAMICS_ARCHIVE)).transpose()?;

        let checked = self
            .manager
            .check(&manager)
            .and_then(|_| self.controller.check(&controller))
            .and_then(|_| match (&self.cost_model, &cost_model) {
                (Some(model), Some(archive)) => model.check(archive),
                _ => Ok(()),
            })
            .and_then(|_| match (&self.dynamics, &dynamics) {
                (Some(model), Some(archive)) => model.check(archive),
                _ => Ok(()),
            });
        if let Err(err) = checked {
            warn!(dir = %dir.display(), error = %err, "checkpoint rejected");
            return Err(err);
        }

        self.manager.load(&manager)?;
        self.controller.load(&controller)?;
        if let (Some(model), Some(archive)) = (self.cost_model.as_mut(), &cost_model) {
            model.load(archive)?;
        }
        if let (Some(model), Some(archive)) = (self.dynamics.as_mut(), &dynamics) {
            model.load(archive)?;
        }
        info!(dir = %dir.display(), "checkpoint loaded");
        Ok(())
    }
}
