// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use st_hrl::config::{CostModelConfig, DynamicsConfig, ImaginationConfig, ImaginedSafety};
use st_hrl::{
    CostDataset, CostInputConfig, CostSample, DynamicsModel, Environment, HierarchicalTrainer, HrlConfig,
    HrlError, HrlResult, Observation, PidConfig, StepInfo, StepOutcome,
};
use st_tensor::Tensor;

const GOAL: [f32; 2] = [2.0, 2.0];
const HAZARD: [f32; 2] = [0.5, 0.5];
const HAZARD_RADIUS: f32 = 0.3;

/// Point mass on a plane with a single circular hazard between the origin
/// and the goal. The state is `[x, y, gx - x, gy - y]`.
struct HazardPlane {
    position: [f32; 2],
    rng: StdRng,
}

impl HazardPlane {
    fn new(seed: u64) -> Self {
        Self {
            position: [0.0, 0.0],
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn observe(&self) -> Observation {
        let [x, y] = self.position;
        Observation {
            state: vec![x, y, GOAL[0] - x, GOAL[1] - y],
            desired_goal: Some(GOAL.to_vec()),
            achieved_goal: Some(self.position.to_vec()),
        }
    }
}

impl Environment for HazardPlane {
    fn reset(&mut self) -> HrlResult<Observation> {
        self.position = [0.0, 0.0];
        Ok(self.observe())
    }

    fn step(&mut self, action: &[f32]) -> HrlResult<StepOutcome> {
        self.position[0] += 0.05 * action[0];
        self.position[1] += 0.05 * action[1];
        let distance = ((GOAL[0] - self.position[0]).powi(2) + (GOAL[1] - self.position[1]).powi(2)).sqrt();
        Ok(StepOutcome {
            observation: self.observe(),
            reward: -distance,
            done: false,
            info: StepInfo {
                safety_cost: self.cost_func(&self.position),
                goal_met: distance < 0.2,
            },
        })
    }

    fn cost_func(&self, position: &[f32]) -> f32 {
        let dx = position[0] - HAZARD[0];
        let dy = position[1] - HAZARD[1];
        if dx * dx + dy * dy <= HAZARD_RADIUS * HAZARD_RADIUS {
            1.0
        } else {
            0.0
        }
    }

    fn sample_action(&mut self) -> Vec<f32> {
        (0..2).map(|_| self.rng.gen_range(-1.0..1.0)).collect()
    }
}

fn plain_config(seed: u64) -> HrlConfig {
    let mut config = HrlConfig::default();
    config.run.seed = seed;
    config.run.max_timesteps = 120;
    config.run.eval_freq = 60;
    config.run.eval_episodes = 1;
    config.run.initial_exploration_steps = 40;
    config.run.pretrain_epochs = 1;
    config.run.train_manager_freq = 10;
    config.run.manager_propose_freq = 5;
    config.run.dynamics_train_freq = 2;
    config.run.pid_cost_window = 3;
    config.run.pid_warmup_episodes = 1;

    config.env.state_dim = 4;
    config.env.max_episode_steps = 20;
    config.env.subgoal_scale = vec![1.0, 1.0];

    config.manager.hidden = vec![16, 16];
    config.manager.batch_size = 8;
    config.manager.buffer_size = 1000;
    config.manager.candidate_goals = 4;

    config.controller.hidden = vec![16, 16];
    config.controller.batch_size = 16;
    config.controller.buffer_size = 1000;
    config
}

fn safe_config(seed: u64) -> HrlConfig {
    let mut config = plain_config(seed);
    config.manager.modelfree_safety = Some(1.0);
    config.controller.cost_budget = Some(2.0);
    config.controller.cost_critic = true;
    config.controller.lagrangian = Some(PidConfig::default());
    config.controller.imagination = Some(ImaginationConfig {
        horizon: 3,
        objective: ImaginedSafety::Scaled { coefficient: 1.0 },
        ..ImaginationConfig::default()
    });
    config.cost_model = Some(CostModelConfig {
        hidden: vec![16],
        batch_size: 16,
        buffer_size: 1000,
        input: CostInputConfig::State,
        ..CostModelConfig::default()
    });
    config.dynamics = Some(DynamicsConfig {
        num_networks: 2,
        num_elites: 1,
        hidden: vec![16],
        batch_size: 16,
        train_iterations: 2,
        holdout_size: 16,
        buffer_size: 1000,
        ..DynamicsConfig::default()
    });
    config
}

#[test]
fn short_run_trains_every_component() {
    let _ = spiral_config::init_tracing();
    let mut trainer = HierarchicalTrainer::new(safe_config(7), HazardPlane::new(7)).unwrap();
    let summary = trainer.run().unwrap();

    assert_eq!(summary.total_timesteps, 120);
    assert_eq!(summary.episodes, 6);
    // Two cadence evaluations plus the closing one.
    assert_eq!(summary.evaluations.len(), 3);
    assert_eq!(trainer.controller_store().len(), 120);
    // Three interval closings and one end-of-episode closing per episode.
    assert_eq!(trainer.manager_store().len(), 24);

    let last = summary.last_episode.expect("at least one episode");
    assert_eq!(last.steps, 20);
    assert!(last.cost_model.is_some());
    assert!(last.dynamics.is_some());
    assert!(last.manager.is_some());
    assert!(last.imagination_error.is_some());
    let controller = last.controller.expect("controller trains every episode");
    assert!(controller.cost_critic_loss.is_some());
    let safety = controller.imagined_safety.expect("imagined safety enters the actor loss");
    assert!(safety.is_finite() && safety >= 0.0);
    assert!(controller.critic_loss.is_finite());
    assert!(summary.penalty >= 0.0);
    assert!((0.0..=1.0).contains(&last.subgoal_cost_rate));

    let (_, evaluation) = summary.evaluations.last().unwrap();
    assert_eq!(evaluation.episodes, 1);
    assert_eq!(evaluation.avg_steps, 20.0);
    assert!(evaluation.imagined_subgoal_safety.is_some());
}

#[test]
fn checkpoint_round_trip_restores_policies() {
    let dir = tempfile::tempdir().unwrap();
    let mut trained = HierarchicalTrainer::new(safe_config(11), HazardPlane::new(11)).unwrap();
    trained.explore().unwrap();
    trained.train_episode().unwrap();
    trained.save(dir.path()).unwrap();

    let mut restored = HierarchicalTrainer::new(safe_config(12), HazardPlane::new(12)).unwrap();
    let state = [0.3, -0.2, 1.7, 2.2];
    let before = restored.manager().sample_goal(&state, Some(&GOAL[..])).unwrap();
    restored.load(dir.path()).unwrap();

    let expected = trained.manager().sample_goal(&state, Some(&GOAL[..])).unwrap();
    let actual = restored.manager().sample_goal(&state, Some(&GOAL[..])).unwrap();
    assert_eq!(expected, actual);
    assert_ne!(before, actual);

    let states = Tensor::from_vec(2, 4, vec![0.3, -0.2, 1.7, 2.2, 1.0, 1.0, 1.0, 1.0]).unwrap();
    let goals = Tensor::from_vec(2, 2, vec![0.5, 0.5, -0.4, 0.1]).unwrap();
    let expected = trained.controller().policy_actions(&states, &goals).unwrap();
    let actual = restored.controller().policy_actions(&states, &goals).unwrap();
    assert_eq!(expected.data(), actual.data());
}

#[test]
fn loading_an_empty_directory_is_a_checkpoint_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut trainer = HierarchicalTrainer::new(plain_config(3), HazardPlane::new(3)).unwrap();
    let err = trainer.load(dir.path()).unwrap_err();
    assert!(matches!(err, HrlError::Checkpoint { .. }));
}

/// Outputs of every checkpointed component on a fixed query.
fn fingerprint(trainer: &HierarchicalTrainer<HazardPlane>) -> Vec<Vec<f32>> {
    let state = [0.3, -0.2, 1.7, 2.2];
    let states = Tensor::from_vec(2, 4, vec![0.3, -0.2, 1.7, 2.2, 1.0, 1.0, 1.0, 1.0]).unwrap();
    let goals = Tensor::from_vec(2, 2, vec![0.5, 0.5, -0.4, 0.1]).unwrap();
    let actions = trainer.controller().policy_actions(&states, &goals).unwrap();
    let mut prints = vec![
        trainer.manager().sample_goal(&state, Some(&GOAL[..])).unwrap(),
        actions.data().to_vec(),
    ];
    if let Some(model) = trainer.cost_model() {
        prints.push(model.predict(&states).unwrap().data().to_vec());
    }
    if let Some(dynamics) = trainer.dynamics() {
        let mut rng = StdRng::seed_from_u64(0);
        let step = dynamics.step(&states, &actions, true, &mut rng).unwrap();
        prints.push(step.next_state.data().to_vec());
    }
    prints
}

#[test]
fn missing_later_archive_leaves_earlier_components_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let mut trained = HierarchicalTrainer::new(safe_config(21), HazardPlane::new(21)).unwrap();
    trained.explore().unwrap();
    trained.save(dir.path()).unwrap();
    std::fs::remove_file(dir.path().join("controller.bin")).unwrap();

    let mut trainer = HierarchicalTrainer::new(safe_config(22), HazardPlane::new(22)).unwrap();
    let before = fingerprint(&trainer);
    let err = trainer.load(dir.path()).unwrap_err();
    assert!(matches!(err, HrlError::Checkpoint { .. }));
    assert_eq!(fingerprint(&trainer), before);
    assert_ne!(fingerprint(&trained)[0], before[0]);
}

#[test]
fn mismatched_dynamics_archive_leaves_every_component_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let mut narrow = safe_config(23);
    if let Some(dynamics) = narrow.dynamics.as_mut() {
        dynamics.hidden = vec![8];
    }
    let trained = HierarchicalTrainer::new(narrow, HazardPlane::new(23)).unwrap();
    trained.save(dir.path()).unwrap();

    // manager, controller and cost model archives all fit; only the last one
    // restored does not
    let mut trainer = HierarchicalTrainer::new(safe_config(24), HazardPlane::new(24)).unwrap();
    let before = fingerprint(&trainer);
    assert!(trainer.load(dir.path()).is_err());
    assert_eq!(fingerprint(&trainer), before);

    let fitting = HierarchicalTrainer::new(safe_config(25), HazardPlane::new(25)).unwrap();
    fitting.save(dir.path()).unwrap();
    trainer.load(dir.path()).unwrap();
    assert_eq!(fingerprint(&trainer), fingerprint(&fitting));
}

#[test]
fn bundled_config_parses_and_validates() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/configs/safe_point_maze.toml");
    let config = HrlConfig::from_path(path).unwrap();
    assert_eq!(config.env.state_dim, 34);
    assert_eq!(
        config.cost_model.as_ref().map(|c| c.input.clone()),
        Some(CostInputConfig::Lidar {
            position_dims: 2,
            lidar_dims: 16,
            frame_stack: 2,
        })
    );
    assert!(config.controller.lagrangian.is_some());
    assert_eq!(config.run.curriculum.as_ref().map(|c| c.start_step), Some(500_000));
    let threshold = config.safe_threshold().unwrap();
    assert!((threshold - 0.1).abs() < 1e-6);
}

#[test]
fn inner_dones_close_every_subgoal_interval() {
    let mut config = plain_config(5);
    config.run.inner_dones = true;
    let mut trainer = HierarchicalTrainer::new(config, HazardPlane::new(5)).unwrap();
    let report = trainer.train_episode().unwrap();
    assert_eq!(report.steps, 20);

    let dones: Vec<bool> = trainer.controller_store().iter().map(|t| t.done).collect();
    let expected: Vec<bool> = (0..20).map(|i| (i + 1) % 5 == 0).collect();
    assert_eq!(dones, expected);
    // Stored goals are the subgoals in force before each transition.
    assert!(trainer.controller_store().iter().all(|t| t.goal.len() == 2));
}

#[test]
fn evaluation_validates_the_cost_model_on_a_dataset() {
    let mut config = plain_config(9);
    config.cost_model = Some(CostModelConfig {
        hidden: vec![8],
        batch_size: 8,
        buffer_size: 256,
        input: CostInputConfig::State,
        ..CostModelConfig::default()
    });
    let samples: Vec<CostSample> = (0..16)
        .map(|i| {
            let x = i as f32 * 0.1;
            CostSample {
                input: vec![x, HAZARD[1], GOAL[0] - x, GOAL[1] - HAZARD[1]],
                cost: if (3..=7).contains(&i) { 1.0 } else { 0.0 },
            }
        })
        .collect();
    let dataset = CostDataset::new(&samples).unwrap();
    let mut trainer = HierarchicalTrainer::new(config, HazardPlane::new(9))
        .unwrap()
        .with_cost_dataset(dataset);

    let report = trainer.evaluate(1).unwrap();
    let validation = report.cost_model.expect("dataset validation");
    assert!((validation.mean_true - 5.0 / 16.0).abs() < 1e-6);
    assert!((0.0..=1.0).contains(&validation.mean_pred));
    assert!(validation.roc_auc.is_some());
    assert_eq!(report.avg_steps, 20.0);
    assert!(report.imagined_subgoal_safety.is_none());
}
