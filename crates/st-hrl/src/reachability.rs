// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Seams for the auxiliary reachability embedding.
//!
//! The learner behind the embedding is external; the hierarchy only decides
//! when to hand it collected trajectories and consumes the trained
//! embedding inside the manager's hinge loss.

use st_nn::Tensor;

use crate::config::ReachabilityConfig;
use crate::error::HrlResult;

/// Differentiable map from a state prefix to an embedding in which
/// Euclidean distance approximates reachability.
pub trait ReachabilityEmbedding {
    fn embed(&self, positions: &Tensor) -> HrlResult<Tensor>;

    /// `∂(Σ grad·embed(positions))/∂positions`.
    fn embed_backward(&self, positions: &Tensor, grad_output: &Tensor) -> HrlResult<Tensor>;
}

/// External trainer of the embedding, invoked with whole episodes of
/// visited state prefixes.
pub trait ReachabilityLearner {
    fn train(&mut self, trajectories: &[Vec<Vec<f32>>]) -> HrlResult<f32>;

    fn embedding(&self) -> &dyn ReachabilityEmbedding;
}

/// Embedding handed to the manager together with its hinge margin.
#[derive(Clone, Copy)]
pub struct ReachabilityTerm<'a> {
    pub embedding: &'a dyn ReachabilityEmbedding,
    pub margin: f32,
}

/// Collects episode trajectories and reports when the learner is due.
#[derive(Clone, Debug)]
pub struct TrajectoryBuffer {
    capacity: usize,
    episodes: Vec<Vec<Vec<f32>>>,
    current: Vec<Vec<f32>>,
    dims: usize,
}

impl TrajectoryBuffer {
    pub fn new(config: &ReachabilityConfig, dims: usize) -> Self {
        Self {
            capacity: config.trajectory_buffer_size.max(1),
            episodes: Vec::new(),
            current: Vec::new(),
            dims,
        }
    }

    pub fn append(&mut self, state: &[f32]) {
        let end = self.dims.min(state.len());
        self.current.push(state[..end].to_vec());
    }

    /// Closes the running episode. Returns `true` once the buffer is full.
    pub fn finish_episode(&mut self) -> bool {
        if !self.current.is_empty() {
            self.episodes.push(std::mem::take(&mut self.current));
        }
        self.is_full()
    }

    pub fn is_full(&self) -> bool {
        self.episodes.len() >= self.capacity
    }

    pub fn episodes(&self) -> &[Vec<Vec<f32>>] {
        &self.episodes
    }

    pub fn clear(&mut self) {
        self.episodes.clear();
        self.current.clear();
    }
}
