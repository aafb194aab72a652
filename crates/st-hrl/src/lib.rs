// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Hierarchical safe reinforcement learning.
//!
//! A [`Manager`] proposes subgoals every few steps and a [`Controller`]
//! chases them with primitive actions. Safety enters through a learned
//! [`CostModel`], imagined rollouts of an [`EnsembleDynamics`] model and a
//! PID-tuned Lagrange multiplier ([`PidLagrangian`]). The
//! [`HierarchicalTrainer`] interleaves environment interaction with the
//! updates of every learner.

pub mod buffer;
pub mod config;
pub mod controller;
pub mod cost_model;
pub mod dynamics;
pub mod env;
mod error;
pub mod family;
pub mod goal;
pub mod imagination;
pub mod lagrange;
pub mod manager;
pub mod networks;
pub mod noise;
pub mod reachability;
pub mod training;

pub use buffer::{CostSample, ManagerBatch, ManagerTransition, RingBuffer, Transition, TransitionBatch};
pub use config::{
    ActionFamily, ControllerConfig, CostInputConfig, CostModelConfig, DynamicsConfig, EnvConfig, HrlConfig,
    ImaginationConfig, ImaginedSafety, ManagerConfig, NoiseKind, PidConfig, RunConfig,
};
pub use controller::{Controller, ControllerReport, UpdateSchedule};
pub use cost_model::{CostDataset, CostEncoder, CostModel, CostTrainReport, CostValidation};
pub use dynamics::{DynamicsModel, DynamicsReport, EnsembleDynamics, ImaginedStep};
pub use env::{Environment, Observation, StepInfo, StepOutcome};
pub use error::{HrlError, HrlResult};
pub use family::ActorFamily;
pub use goal::GoalSpace;
pub use imagination::{Imagination, Rollout, RolloutPlan};
pub use lagrange::PidLagrangian;
pub use manager::{Manager, ManagerReport};
pub use noise::ExplorationNoise;
pub use reachability::{ReachabilityEmbedding, ReachabilityLearner, ReachabilityTerm};
pub use training::{EpisodeReport, EvaluationReport, HierarchicalTrainer, TrainingSummary};
