// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::error::HrlResult;

/// Goal-conditioned observation returned by an environment.
#[derive(Clone, Debug, PartialEq)]
pub struct Observation {
    pub state: Vec<f32>,
    pub desired_goal: Option<Vec<f32>>,
    pub achieved_goal: Option<Vec<f32>>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct StepInfo {
    /// Realised constraint cost of the transition.
    pub safety_cost: f32,
    pub goal_met: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StepOutcome {
    pub observation: Observation,
    pub reward: f32,
    pub done: bool,
    pub info: StepInfo,
}

/// Simulator consumed by the hierarchical trainer.
pub trait Environment {
    fn reset(&mut self) -> HrlResult<Observation>;

    fn step(&mut self, action: &[f32]) -> HrlResult<StepOutcome>;

    /// Ground-truth cost of standing at `position`.
    fn cost_func(&self, position: &[f32]) -> f32;

    /// Uniform sample from the action box.
    fn sample_action(&mut self) -> Vec<f32>;
}
