// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Constraint-violation classifier.
//!
//! The model maps an encoded observation to a probability in `[0, 1]`. With
//! a lidar layout the encoding is `[query_position, (position, lidar) × k]`
//! over the last `k` states, oldest first; missing frames at the start of an
//! episode are zero-filled. The same encoder is shared by the trainer when
//! filling the store, by the manager's model-free loss and by imagined
//! rollouts, and it can scatter input gradients back onto the states.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use st_nn::{
    AdamConfig, BinaryCrossEntropy, Loss, Module, ModuleArchive, Sequential, Sigmoid,
    Tensor,
};
use tracing::debug;

use crate::buffer::{CostSample, RingBuffer};
use crate::config::{CostInputConfig, CostModelConfig, EnvConfig};
use crate::error::{ensure_finite, HrlError, HrlResult};

const COST_WEIGHT_DECAY: f32 = 1e-4;
const CLASSIFICATION_THRESHOLD: f32 = 0.5;

/// Layout of the cost model input.
#[derive(Clone, Debug, PartialEq)]
pub struct CostEncoder {
    layout: CostInputConfig,
    state_dim: usize,
    position_dims: usize,
}

impl CostEncoder {
    pub fn new(layout: CostInputConfig, state_dim: usize, position_dims: usize) -> Self {
        Self {
            layout,
            state_dim,
            position_dims,
        }
    }

    pub fn input_dim(&self) -> usize {
        match self.layout {
            CostInputConfig::State => self.state_dim,
            CostInputConfig::Lidar {
                position_dims,
                lidar_dims,
                frame_stack,
            } => position_dims + frame_stack * (position_dims + lidar_dims),
        }
    }

    /// Number of trailing states the encoding looks at.
    pub fn frame_stack(&self) -> usize {
        match self.layout {
            CostInputConfig::State => 1,
            CostInputConfig::Lidar { frame_stack, .. } => frame_stack,
        }
    }

    fn lidar_start(&self, lidar_dims: usize) -> usize {
        self.state_dim - lidar_dims
    }

    /// Encodes one observation window; `history` ends with the evaluated
    /// state.
    pub fn encode_row(&self, history: &[&[f32]]) -> HrlResult<Vec<f32>> {
        let Some(current) = history.last() else {
            return Err(HrlError::MissingInput("cost model history"));
        };
        match self.layout {
            CostInputConfig::State => Ok(current.to_vec()),
            CostInputConfig::Lidar {
                position_dims,
                lidar_dims,
                frame_stack,
            } => {
                let mut row = Vec::with_capacity(self.input_dim());
                row.extend_from_slice(&current[..position_dims]);
                let start = history.len().saturating_sub(frame_stack);
                let window = &history[start..];
                for _ in window.len()..frame_stack {
                    row.extend(std::iter::repeat(0.0).take(position_dims + lidar_dims));
                }
                let lidar = self.lidar_start(lidar_dims);
                for frame in window {
                    row.extend_from_slice(&frame[..position_dims]);
                    row.extend_from_slice(&frame[lidar..]);
                }
                Ok(row)
            }
        }
    }

    /// Batched form of [`CostEncoder::encode_row`] over state tensors.
    pub fn encode_states(&self, history: &[&Tensor]) -> HrlResult<Tensor> {
        let Some(current) = history.last() else {
            return Err(HrlError::MissingInput("cost model history"));
        };
        match self.layout {
            CostInputConfig::State => Ok((*current).clone()),
            CostInputConfig::Lidar {
                position_dims,
                lidar_dims,
                frame_stack,
            } => {
                let rows = current.rows();
                let mut parts = vec![current.narrow_cols(0, position_dims)?];
                let start = history.len().saturating_sub(frame_stack);
                let window = &history[start..];
                for _ in window.len()..frame_stack {
                    parts.push(Tensor::zeros(rows, position_dims + lidar_dims)?);
                }
                for frame in window {
                    parts.push(frame.narrow_cols(0, position_dims)?);
                    if lidar_dims > 0 {
                        parts.push(frame.narrow_cols(self.lidar_start(lidar_dims), lidar_dims)?);
                    }
                }
                let refs: Vec<&Tensor> = parts.iter().collect();
                Ok(Tensor::cat_cols(&refs)?)
            }
        }
    }

    /// Scatters `∂L/∂input` of [`CostEncoder::encode_states`] back onto the
    /// history. Entry `i` of the result belongs to `history[i]`.
    pub fn states_gradient(&self, grad_input: &Tensor, history_len: usize) -> HrlResult<Vec<Tensor>> {
        let rows = grad_input.rows();
        let mut grads = Vec::with_capacity(history_len);
        for _ in 0..history_len {
            grads.push(Tensor::zeros(rows, self.state_dim)?);
        }
        let Some(last) = history_len.checked_sub(1) else {
            return Err(HrlError::MissingInput("cost model history"));
        };
        match self.layout {
            CostInputConfig::State => grads[last] = grad_input.clone(),
            CostInputConfig::Lidar {
                position_dims,
                lidar_dims,
                frame_stack,
            } => {
                grads[last].add_into_cols(0, &grad_input.narrow_cols(0, position_dims)?)?;
                let width = position_dims + lidar_dims;
                let used = history_len.min(frame_stack);
                let first_slot = frame_stack - used;
                for (offset, slot) in (first_slot..frame_stack).enumerate() {
                    let index = history_len - used + offset;
                    let base = position_dims + slot * width;
                    grads[index].add_into_cols(0, &grad_input.narrow_cols(base, position_dims)?)?;
                    if lidar_dims > 0 {
                        grads[index].add_into_cols(
                            self.lidar_start(lidar_dims),
                            &grad_input.narrow_cols(base + position_dims, lidar_dims)?,
                        )?;
                    }
                }
            }
        }
        Ok(grads)
    }

    /// Input for a hypothetical position under the current observation
    /// context; used to score proposed subgoal positions.
    pub fn encode_query(&self, position: &Tensor, context: &Tensor) -> HrlResult<Tensor> {
        match self.layout {
            CostInputConfig::State => {
                if self.state_dim == position.cols() {
                    return Ok(position.clone());
                }
                let width = position.cols();
                let rest = context.narrow_cols(width, self.state_dim - width)?;
                Ok(Tensor::cat_cols(&[position, &rest])?)
            }
            CostInputConfig::Lidar {
                position_dims,
                lidar_dims,
                frame_stack,
            } => {
                let mut parts = vec![position.clone()];
                for _ in 0..frame_stack {
                    parts.push(context.narrow_cols(0, position_dims)?);
                    if lidar_dims > 0 {
                        parts.push(context.narrow_cols(self.lidar_start(lidar_dims), lidar_dims)?);
                    }
                }
                let refs: Vec<&Tensor> = parts.iter().collect();
                Ok(Tensor::cat_cols(&refs)?)
            }
        }
    }

    /// Gradient of [`CostEncoder::encode_query`] with respect to `position`.
    pub fn query_gradient(&self, grad_input: &Tensor) -> HrlResult<Tensor> {
        Ok(grad_input.narrow_cols(0, self.position_dims)?)
    }
}

/// Labelled cost samples held in memory for offline training and
/// validation.
#[derive(Clone, Debug)]
pub struct CostDataset {
    inputs: Tensor,
    labels: Vec<f32>,
}

impl CostDataset {
    pub fn new(samples: &[CostSample]) -> HrlResult<Self> {
        if samples.is_empty() {
            return Err(HrlError::EmptyBatch { store: "cost dataset" });
        }
        let rows: Vec<&[f32]> = samples.iter().map(|s| s.input.as_slice()).collect();
        Ok(Self {
            inputs: Tensor::from_rows(&rows)?,
            labels: samples.iter().map(|s| binary_label(s.cost)).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Averages over one training call.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CostTrainReport {
    pub loss: f32,
    pub mean_true: f32,
    pub mean_pred: f32,
}

/// Classification quality on a labelled dataset.
#[derive(Clone, Debug, PartialEq)]
pub struct CostValidation {
    pub mean_true: f32,
    pub mean_pred: f32,
    pub f1: f32,
    /// Undefined when the dataset holds a single class.
    pub roc_auc: Option<f32>,
}

fn binary_label(cost: f32) -> f32 {
    if cost > 0.0 {
        1.0
    } else {
        0.0
    }
}

#[derive(Debug)]
pub struct CostModel {
    net: Sequential,
    encoder: CostEncoder,
    loss_coef: f32,
    batch_size: usize,
    rng: StdRng,
}

impl CostModel {
    pub fn new(config: &CostModelConfig, env: &EnvConfig, mut rng: StdRng) -> HrlResult<Self> {
        let encoder = CostEncoder::new(config.input.clone(), env.state_dim, env.subgoal_dims);
        let mut dims = vec![encoder.input_dim()];
        dims.extend_from_slice(&config.hidden);
        dims.push(1);
        let mut net = Sequential::mlp("cost_model", &dims, &mut rng)?;
        net.push(Sigmoid::new());
        net.attach_adam(AdamConfig::with_learning_rate(config.lr).weight_decay(COST_WEIGHT_DECAY))?;
        Ok(Self {
            net,
            encoder,
            loss_coef: config.loss_coef,
            batch_size: config.batch_size,
            rng,
        })
    }

    pub fn encoder(&self) -> &CostEncoder {
        &self.encoder
    }

    /// Violation probability per row of encoded inputs.
    pub fn predict(&self, inputs: &Tensor) -> HrlResult<Tensor> {
        Ok(self.net.forward(inputs)?)
    }

    /// `∂(Σ grad·p)/∂inputs` without touching the classifier's accumulators.
    pub fn input_gradient(&self, inputs: &Tensor, grad_output: &Tensor) -> HrlResult<Tensor> {
        Ok(self.net.backward_input(inputs, grad_output)?)
    }

    fn step(&mut self, inputs: &Tensor, labels: &Tensor) -> HrlResult<(f32, f32)> {
        let mut criterion = BinaryCrossEntropy::new();
        let prediction = self.net.forward(inputs)?;
        let loss = self.loss_coef * criterion.forward(&prediction, labels)?.data()[0];
        ensure_finite("cost_model_loss", loss)?;
        let grad = criterion.backward(&prediction, labels)?.scale(self.loss_coef)?;
        self.net.backward(inputs, &grad)?;
        self.net.apply_step(0.0)?;
        Ok((loss, prediction.mean()))
    }

    /// One gradient step per sampled mini-batch.
    pub fn train(&mut self, store: &RingBuffer<CostSample>, iterations: usize) -> HrlResult<CostTrainReport> {
        let mut report = CostTrainReport::default();
        if iterations == 0 {
            return Ok(report);
        }
        for _ in 0..iterations {
            let batch = store.sample(self.batch_size, &mut self.rng, "cost model")?;
            let rows: Vec<&[f32]> = batch.iter().map(|s| s.input.as_slice()).collect();
            let inputs = Tensor::from_rows(&rows)?;
            let labels: Vec<f32> = batch.iter().map(|s| binary_label(s.cost)).collect();
            let labels = Tensor::from_vec(labels.len(), 1, labels)?;
            let (loss, mean_pred) = self.step(&inputs, &labels)?;
            report.loss += loss;
            report.mean_true += labels.mean();
            report.mean_pred += mean_pred;
        }
        let n = iterations as f32;
        report.loss /= n;
        report.mean_true /= n;
        report.mean_pred /= n;
        debug!(loss = report.loss, mean_true = report.mean_true, mean_pred = report.mean_pred, "cost model update");
        Ok(report)
    }

    /// Full passes over an offline dataset, shuffled each epoch.
    pub fn train_on_dataset(&mut self, dataset: &CostDataset, epochs: usize) -> HrlResult<CostTrainReport> {
        let mut report = CostTrainReport::default();
        let mut batches = 0usize;
        let mut order: Vec<usize> = (0..dataset.len()).collect();
        for _ in 0..epochs {
            order.shuffle(&mut self.rng);
            for chunk in order.chunks(self.batch_size) {
                let inputs = dataset.inputs.gather_rows(chunk)?;
                let labels: Vec<f32> = chunk.iter().map(|&i| dataset.labels[i]).collect();
                let labels = Tensor::from_vec(labels.len(), 1, labels)?;
                let (loss, mean_pred) = self.step(&inputs, &labels)?;
                report.loss += loss;
                report.mean_true += labels.mean();
                report.mean_pred += mean_pred;
                batches += 1;
            }
        }
        if batches > 0 {
            let n = batches as f32;
            report.loss /= n;
            report.mean_true /= n;
            report.mean_pred /= n;
        }
        Ok(report)
    }

    pub fn validate(&self, dataset: &CostDataset) -> HrlResult<CostValidation> {
        let scores = self.predict(&dataset.inputs)?.into_vec();
        let labels = &dataset.labels;
        let n = labels.len() as f32;
        let (mut tp, mut fp, mut fn_) = (0.0f32, 0.0f32, 0.0f32);
        for (&score, &label) in scores.iter().zip(labels) {
            let predicted = score >= CLASSIFICATION_THRESHOLD;
            match (predicted, label > 0.5) {
                (true, true) => tp += 1.0,
                (true, false) => fp += 1.0,
                (false, true) => fn_ += 1.0,
                (false, false) => {}
            }
        }
        let f1 = if tp > 0.0 {
            2.0 * tp / (2.0 * tp + fp + fn_)
        } else {
            0.0
        };
        Ok(CostValidation {
            mean_true: labels.iter().sum::<f32>() / n,
            mean_pred: scores.iter().sum::<f32>() / n,
            f1,
            roc_auc: roc_auc(&scores, labels),
        })
    }

    pub fn save(&self, archive: &mut ModuleArchive) -> HrlResult<()> {
        Ok(archive.insert_module("cost_model", &self.net)?)
    }

    pub fn check(&self, archive: &ModuleArchive) -> HrlResult<()> {
        Ok(archive.check_module("cost_model", &self.net)?)
    }

    pub fn load(&mut self, archive: &ModuleArchive) -> HrlResult<()> {
        Ok(archive.restore_module("cost_model", &mut self.net)?)
    }
}

/// Mann-Whitney estimate of the area under the ROC curve, with tied scores
/// sharing their average rank.
pub fn roc_auc(scores: &[f32], labels: &[f32]) -> Option<f32> {
    let positives = labels.iter().filter(|&&l| l > 0.5).count();
    let negatives = labels.len() - positives;
    if positives == 0 || negatives == 0 {
        return None;
    }
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));
    let mut rank_sum = 0.0f64;
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        let average_rank = (i + j) as f64 / 2.0 + 1.0;
        for &idx in &order[i..=j] {
            if labels[idx] > 0.5 {
                rank_sum += average_rank;
            }
        }
        i = j + 1;
    }
    let p = positives as f64;
    let auc = (rank_sum - p * (p + 1.0) / 2.0) / (p * negatives as f64);
    Some(auc as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;

    fn lidar_encoder() -> CostEncoder {
        CostEncoder::new(
            CostInputConfig::Lidar {
                position_dims: 2,
                lidar_dims: 2,
                frame_stack: 3,
            },
            5,
            2,
        )
    }

    #[test]
    fn lidar_rows_zero_fill_missing_frames() {
        let encoder = lidar_encoder();
        let s0 = [1.0, 2.0, 9.0, 0.1, 0.2];
        let s1 = [3.0, 4.0, 9.0, 0.3, 0.4];
        let row = encoder.encode_row(&[&s0, &s1]).unwrap();
        assert_eq!(row.len(), encoder.input_dim());
        assert_eq!(
            row,
            vec![3.0, 4.0, 0.0, 0.0, 0.0, 0.0, 1.0, 2.0, 0.1, 0.2, 3.0, 4.0, 0.3, 0.4]
        );
    }

    #[test]
    fn batched_encoding_matches_rows_and_scatters_back() {
        let encoder = lidar_encoder();
        let s0 = Tensor::from_vec(1, 5, vec![1.0, 2.0, 9.0, 0.1, 0.2]).unwrap();
        let s1 = Tensor::from_vec(1, 5, vec![3.0, 4.0, 9.0, 0.3, 0.4]).unwrap();
        let encoded = encoder.encode_states(&[&s0, &s1]).unwrap();
        let row = encoder.encode_row(&[s0.data(), s1.data()]).unwrap();
        assert_eq!(encoded.data(), row.as_slice());

        let ones = Tensor::full(1, encoder.input_dim(), 1.0).unwrap();
        let grads = encoder.states_gradient(&ones, 2).unwrap();
        assert_eq!(grads[0].data(), &[1.0, 1.0, 0.0, 1.0, 1.0]);
        // query position plus its own frame
        assert_eq!(grads[1].data(), &[2.0, 2.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn state_query_swaps_in_the_position() {
        let encoder = CostEncoder::new(CostInputConfig::State, 4, 2);
        let position = Tensor::from_vec(1, 2, vec![0.5, -0.5]).unwrap();
        let context = Tensor::full(1, 4, 7.0).unwrap();
        let input = encoder.encode_query(&position, &context).unwrap();
        assert_eq!(input.data(), &[0.5, -0.5, 7.0, 7.0]);
    }

    #[test]
    fn auc_handles_ties_and_perfect_ranking() {
        assert_eq!(roc_auc(&[0.1, 0.2, 0.8, 0.9], &[0.0, 0.0, 1.0, 1.0]), Some(1.0));
        assert_abs_diff_eq!(
            roc_auc(&[0.5, 0.5], &[0.0, 1.0]).unwrap(),
            0.5,
            epsilon = 1e-6
        );
        assert_eq!(roc_auc(&[0.1, 0.2], &[1.0, 1.0]), None);
    }

    #[test]
    fn all_safe_labels_drive_predictions_to_zero() {
        let env = EnvConfig {
            state_dim: 3,
            subgoal_dims: 2,
            subgoal_scale: vec![1.0, 1.0],
            ..EnvConfig::default()
        };
        let config = CostModelConfig {
            hidden: vec![16],
            lr: 1e-2,
            batch_size: 16,
            ..CostModelConfig::default()
        };
        let mut model = CostModel::new(&config, &env, StdRng::seed_from_u64(4)).unwrap();
        let mut store = RingBuffer::new(64).unwrap();
        let mut rng = StdRng::seed_from_u64(8);
        for _ in 0..64 {
            let input = Tensor::random_uniform(1, 3, -1.0, 1.0, &mut rng).unwrap().into_vec();
            store.push(CostSample { input, cost: 0.0 });
        }
        model.train(&store, 300).unwrap();
        let report = model.train(&store, 1).unwrap();
        assert!(report.mean_pred < 0.05, "mean_pred={}", report.mean_pred);
        assert_eq!(report.mean_true, 0.0);
    }

    #[test]
    fn validation_reports_f1_and_auc() {
        let env = EnvConfig {
            state_dim: 1,
            subgoal_dims: 1,
            subgoal_scale: vec![1.0],
            ..EnvConfig::default()
        };
        let config = CostModelConfig {
            hidden: vec![8],
            lr: 2e-2,
            batch_size: 8,
            ..CostModelConfig::default()
        };
        let mut model = CostModel::new(&config, &env, StdRng::seed_from_u64(1)).unwrap();
        let samples: Vec<CostSample> = (0..16)
            .map(|i| {
                let x = i as f32 / 8.0 - 1.0;
                CostSample {
                    input: vec![x],
                    cost: if x > 0.0 { 1.0 } else { 0.0 },
                }
            })
            .collect();
        let dataset = CostDataset::new(&samples).unwrap();
        model.train_on_dataset(&dataset, 300).unwrap();
        let metrics = model.validate(&dataset).unwrap();
        assert_abs_diff_eq!(metrics.mean_true, 7.0 / 16.0, epsilon = 1e-6);
        assert!(metrics.f1 > 0.8, "f1={}", metrics.f1);
        assert!(metrics.roc_auc.unwrap() > 0.95);
    }
}
