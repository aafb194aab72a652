// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Learned forward model used for imagined rollouts.
//!
//! [`EnsembleDynamics`] keeps `num_networks` Gaussian MLPs that predict the
//! state delta (plus optional reward and cost heads) from standardised
//! `[state, action]` inputs. The members with the lowest holdout error form
//! the elite set; deterministic queries return the mean of the elite means so
//! imagined rollouts stay reproducible inside a differentiable loss.

use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use st_nn::{AdamConfig, Loss, MeanSquaredError, Module, ModuleArchive, Sequential, Tensor};
use tracing::info;

use crate::buffer::{stack, RingBuffer, Transition};
use crate::config::DynamicsConfig;
use crate::error::{ensure_finite, HrlError, HrlResult};

/// One imagined transition.
#[derive(Clone, Debug)]
pub struct ImaginedStep {
    pub next_state: Tensor,
    pub reward: Option<Tensor>,
    pub cost: Option<Tensor>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DynamicsReport {
    /// Mean Gaussian negative log-likelihood over the training steps.
    pub loss: f32,
    /// Mean holdout MSE of the elite members.
    pub holdout_mse: f32,
    pub elites: Vec<usize>,
}

/// Forward model contract consumed by the controller and the trainer.
pub trait DynamicsModel {
    fn train(&mut self, store: &RingBuffer<Transition>, batch_size: usize) -> HrlResult<DynamicsReport>;

    fn step(
        &self,
        state: &Tensor,
        action: &Tensor,
        deterministic: bool,
        rng: &mut StdRng,
    ) -> HrlResult<ImaginedStep>;

    /// Vector-Jacobian product of the deterministic next state with respect
    /// to `(state, action)`.
    fn backward_step(
        &self,
        state: &Tensor,
        action: &Tensor,
        grad_next_state: &Tensor,
    ) -> HrlResult<(Tensor, Tensor)>;

    fn save(&self, archive: &mut ModuleArchive) -> HrlResult<()>;

    /// Fails when [`DynamicsModel::load`] would, without touching the model.
    fn check(&self, archive: &ModuleArchive) -> HrlResult<()>;

    fn load(&mut self, archive: &ModuleArchive) -> HrlResult<()>;
}

#[derive(Debug)]
pub struct EnsembleDynamics {
    members: Vec<Sequential>,
    elites: Vec<usize>,
    input_mean: Vec<f32>,
    input_std: Vec<f32>,
    state_dim: usize,
    action_dim: usize,
    config: DynamicsConfig,
    rng: StdRng,
}

impl EnsembleDynamics {
    pub fn new(
        config: &DynamicsConfig,
        state_dim: usize,
        action_dim: usize,
        mut rng: StdRng,
    ) -> HrlResult<Self> {
        if config.num_elites == 0 || config.num_elites > config.num_networks {
            return Err(HrlError::config("dynamics.num_elites", "need 1 <= num_elites <= num_networks"));
        }
        let targets = state_dim + usize::from(config.predict_reward) + usize::from(config.predict_cost);
        let mut dims = vec![state_dim + action_dim];
        dims.extend_from_slice(&config.hidden);
        dims.push(2 * targets);
        let adam = AdamConfig::with_learning_rate(config.lr).weight_decay(config.weight_decay);
        let mut members = Vec::with_capacity(config.num_networks);
        for index in 0..config.num_networks {
            let mut member = Sequential::mlp(&format!("dynamics::m{index}"), &dims, &mut rng)?;
            member.attach_adam(adam)?;
            members.push(member);
        }
        Ok(Self {
            members,
            elites: (0..config.num_elites).collect(),
            input_mean: vec![0.0; state_dim + action_dim],
            input_std: vec![1.0; state_dim + action_dim],
            state_dim,
            action_dim,
            config: config.clone(),
            rng,
        })
    }

    fn target_dim(&self) -> usize {
        self.state_dim + usize::from(self.config.predict_reward) + usize::from(self.config.predict_cost)
    }

    pub fn elites(&self) -> &[usize] {
        &self.elites
    }

    fn normalise(&self, state: &Tensor, action: &Tensor) -> HrlResult<Tensor> {
        let mut input = Tensor::cat_cols(&[state, action])?;
        let shift: Vec<f32> = self.input_mean.iter().map(|m| -m).collect();
        input.add_row_inplace(&shift)?;
        let inv: Vec<f32> = self.input_std.iter().map(|s| 1.0 / s).collect();
        Ok(input.scale_columns(&inv)?)
    }

    fn fit_scaler(&mut self, records: &[&Transition]) {
        let width = self.state_dim + self.action_dim;
        let n = records.len() as f32;
        let mut mean = vec![0.0f32; width];
        for record in records {
            for (m, v) in mean.iter_mut().zip(record.state.iter().chain(&record.action)) {
                *m += v / n;
            }
        }
        let mut var = vec![0.0f32; width];
        for record in records {
            for ((s, m), v) in var.iter_mut().zip(&mean).zip(record.state.iter().chain(&record.action)) {
                *s += (v - m) * (v - m) / n;
            }
        }
        self.input_std = var
            .into_iter()
            .map(|v| if v.sqrt() < 1e-12 { 1.0 } else { v.sqrt() })
            .collect();
        self.input_mean = mean;
    }

    fn targets(&self, records: &[&Transition]) -> HrlResult<Tensor> {
        let mut data = Vec::with_capacity(records.len() * self.target_dim());
        for record in records {
            data.extend(record.next_state.iter().zip(&record.state).map(|(n, s)| n - s));
            if self.config.predict_reward {
                data.push(record.reward);
            }
            if self.config.predict_cost {
                data.push(record.cost.ok_or(HrlError::MissingInput("transition cost"))?);
            }
        }
        Ok(Tensor::from_vec(records.len(), self.target_dim(), data)?)
    }

    fn split_heads(&self, output: &Tensor) -> HrlResult<(Tensor, Tensor)> {
        let t = self.target_dim();
        let mean = output.narrow_cols(0, t)?;
        let (lo, hi) = (self.config.min_logvar, self.config.max_logvar);
        let logvar = output.narrow_cols(t, t)?.clamp(lo, hi);
        Ok((mean, logvar))
    }

    fn batch(&self, records: &[&Transition]) -> HrlResult<(Tensor, Tensor)> {
        let state = stack(records.iter().map(|t| t.state.as_slice()))?;
        let action = stack(records.iter().map(|t| t.action.as_slice()))?;
        Ok((self.normalise(&state, &action)?, self.targets(records)?))
    }

    /// Gaussian NLL step on one member; returns the loss.
    fn fit_member(&mut self, index: usize, input: &Tensor, target: &Tensor) -> HrlResult<f32> {
        let t = self.target_dim();
        let (lo, hi) = (self.config.min_logvar, self.config.max_logvar);
        let output = self.members[index].forward(input)?;
        let mean = output.narrow_cols(0, t)?;
        let raw_logvar = output.narrow_cols(t, t)?;
        let logvar = raw_logvar.clamp(lo, hi);
        let inv_var = logvar.map(|lv| (-lv).exp());
        let err = mean.sub(target)?;
        let sq = err.hadamard(&err)?;
        let count = (err.rows() * t) as f32;
        let loss = sq.hadamard(&inv_var)?.add(&logvar)?.mean();
        ensure_finite("dynamics_loss", loss)?;

        let grad_mean = err.hadamard(&inv_var)?.scale(2.0 / count)?;
        let active = raw_logvar.map(|v| if (lo..=hi).contains(&v) { 1.0 } else { 0.0 });
        let grad_logvar = sq
            .hadamard(&inv_var)?
            .map(|v| (1.0 - v) / count)
            .hadamard(&active)?;
        let member = &mut self.members[index];
        member.backward(input, &Tensor::cat_cols(&[&grad_mean, &grad_logvar])?)?;
        member.apply_step(0.0)?;
        Ok(loss)
    }

    fn elite_means(&self, input: &Tensor) -> HrlResult<Vec<Tensor>> {
        self.elites
            .iter()
            .map(|&e| {
                let output = self.members[e].forward(input)?;
                Ok(self.split_heads(&output)?.0)
            })
            .collect()
    }
}

impl DynamicsModel for EnsembleDynamics {
    fn train(&mut self, store: &RingBuffer<Transition>, batch_size: usize) -> HrlResult<DynamicsReport> {
        if store.is_empty() {
            return Err(HrlError::EmptyBatch { store: "dynamics" });
        }
        let all: Vec<&Transition> = store.iter().collect();
        self.fit_scaler(&all);

        let mut total = 0.0f32;
        let mut steps = 0usize;
        for _ in 0..self.config.train_iterations {
            for index in 0..self.members.len() {
                let records = store.sample(batch_size, &mut self.rng, "dynamics")?;
                let (input, target) = self.batch(&records)?;
                total += self.fit_member(index, &input, &target)?;
                steps += 1;
            }
        }

        let holdout = store.sample(self.config.holdout_size.max(1), &mut self.rng, "dynamics")?;
        let (input, target) = self.batch(&holdout)?;
        let mut criterion = MeanSquaredError::new();
        let mut scores = Vec::with_capacity(self.members.len());
        for (index, member) in self.members.iter().enumerate() {
            let (mean, _) = self.split_heads(&member.forward(&input)?)?;
            let mse = criterion.forward(&mean, &target)?.data()[0];
            scores.push((index, ensure_finite("dynamics_holdout_mse", mse)?));
        }
        scores.sort_by(|a, b| a.1.total_cmp(&b.1));
        self.elites = scores
            .iter()
            .take(self.config.num_elites)
            .map(|&(index, _)| index)
            .collect();
        let holdout_mse = scores
            .iter()
            .take(self.config.num_elites)
            .map(|&(_, mse)| mse)
            .sum::<f32>()
            / self.config.num_elites as f32;
        let report = DynamicsReport {
            loss: if steps > 0 { total / steps as f32 } else { 0.0 },
            holdout_mse,
            elites: self.elites.clone(),
        };
        info!(
            loss = report.loss,
            holdout_mse = report.holdout_mse,
            samples = store.len(),
            "dynamics ensemble trained"
        );
        Ok(report)
    }

    fn step(
        &self,
        state: &Tensor,
        action: &Tensor,
        deterministic: bool,
        rng: &mut StdRng,
    ) -> HrlResult<ImaginedStep> {
        let input = self.normalise(state, action)?;
        let t = self.target_dim();
        let prediction = if deterministic {
            let means = self.elite_means(&input)?;
            let mut acc = Tensor::zeros(state.rows(), t)?;
            for mean in &means {
                acc.add_scaled(mean, 1.0 / means.len() as f32)?;
            }
            acc
        } else {
            let outputs: Vec<(Tensor, Tensor)> = self
                .elites
                .iter()
                .map(|&e| self.split_heads(&self.members[e].forward(&input)?))
                .collect::<HrlResult<_>>()?;
            let mut data = Vec::with_capacity(state.rows() * t);
            for row in 0..state.rows() {
                let (mean, logvar) = &outputs[rng.gen_range(0..outputs.len())];
                for (m, lv) in mean.row(row)?.iter().zip(logvar.row(row)?) {
                    let z: f32 = StandardNormal.sample(&mut *rng);
                    data.push(m + (0.5 * lv).exp() * z);
                }
            }
            Tensor::from_vec(state.rows(), t, data)?
        };
        let next_state = state.add(&prediction.narrow_cols(0, self.state_dim)?)?;
        next_state.ensure_finite("imagined_state")?;
        let mut head = self.state_dim;
        let reward = if self.config.predict_reward {
            head += 1;
            Some(prediction.narrow_cols(head - 1, 1)?)
        } else {
            None
        };
        let cost = if self.config.predict_cost {
            Some(prediction.narrow_cols(head, 1)?)
        } else {
            None
        };
        Ok(ImaginedStep {
            next_state,
            reward,
            cost,
        })
    }

    fn backward_step(
        &self,
        state: &Tensor,
        action: &Tensor,
        grad_next_state: &Tensor,
    ) -> HrlResult<(Tensor, Tensor)> {
        let input = self.normalise(state, action)?;
        let t = self.target_dim();
        let mut grad_output = Tensor::zeros(state.rows(), 2 * t)?;
        grad_output.add_into_cols(0, &grad_next_state.scale(1.0 / self.elites.len() as f32)?)?;
        let mut grad_input = Tensor::zeros(state.rows(), self.state_dim + self.action_dim)?;
        for &e in &self.elites {
            grad_input.add_scaled(&self.members[e].backward_input(&input, &grad_output)?, 1.0)?;
        }
        let inv: Vec<f32> = self.input_std.iter().map(|s| 1.0 / s).collect();
        let grad_input = grad_input.scale_columns(&inv)?;
        let grad_state = grad_input.narrow_cols(0, self.state_dim)?.add(grad_next_state)?;
        let grad_action = grad_input.narrow_cols(self.state_dim, self.action_dim)?;
        Ok((grad_state, grad_action))
    }

    fn save(&self, archive: &mut ModuleArchive) -> HrlResult<()> {
        for (index, member) in self.members.iter().enumerate() {
            archive.insert_module(&format!("dynamics::m{index}"), member)?;
        }
        archive.insert_vector("dynamics::input_mean", self.input_mean.iter().map(|&v| v as f64).collect());
        archive.insert_vector("dynamics::input_std", self.input_std.iter().map(|&v| v as f64).collect());
        archive.insert_vector("dynamics::elites", self.elites.iter().map(|&v| v as f64).collect());
        Ok(())
    }

    fn check(&self, archive: &ModuleArchive) -> HrlResult<()> {
        let width = self.state_dim + self.action_dim;
        let mean = archive.vector("dynamics::input_mean")?;
        let std = archive.vector("dynamics::input_std")?;
        let elites = archive.vector("dynamics::elites")?;
        if mean.len() != width || std.len() != width {
            return Err(HrlError::checkpoint("dynamics input scaler has the wrong width"));
        }
        if elites.is_empty() || elites.iter().any(|&e| e as usize >= self.members.len()) {
            return Err(HrlError::checkpoint("dynamics elite indices out of range"));
        }
        for (index, member) in self.members.iter().enumerate() {
            archive.check_module(&format!("dynamics::m{index}"), member)?;
        }
        Ok(())
    }

    fn load(&mut self, archive: &ModuleArchive) -> HrlResult<()> {
        self.check(archive)?;
        for (index, member) in self.members.iter_mut().enumerate() {
            archive.restore_module(&format!("dynamics::m{index}"), member)?;
        }
        self.input_mean = archive.vector("dynamics::input_mean")?.iter().map(|&v| v as f32).collect();
        self.input_std = archive.vector("dynamics::input_std")?.iter().map(|&v| v as f32).collect();
        self.elites = archive.vector("dynamics::elites")?.iter().map(|&v| v as usize).collect();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn config() -> DynamicsConfig {
        DynamicsConfig {
            num_networks: 3,
            num_elites: 2,
            hidden: vec![16],
            lr: 1e-2,
            batch_size: 32,
            train_iterations: 150,
            holdout_size: 64,
            ..DynamicsConfig::default()
        }
    }

    fn linear_store() -> RingBuffer<Transition> {
        let mut rng = StdRng::seed_from_u64(6);
        let mut store = RingBuffer::new(256).unwrap();
        for _ in 0..256 {
            let state: Vec<f32> = (0..2).map(|_| rng.gen_range(-1.0..1.0)).collect();
            let action: Vec<f32> = vec![rng.gen_range(-1.0..1.0)];
            let next_state = vec![state[0] + 0.5 * action[0], state[1]];
            store.push(Transition {
                state,
                next_state,
                goal: vec![0.0, 0.0],
                action,
                reward: 0.0,
                done: false,
                cost: None,
            });
        }
        store
    }

    #[test]
    fn ensemble_learns_a_linear_system() {
        let store = linear_store();
        let mut model = EnsembleDynamics::new(&config(), 2, 1, StdRng::seed_from_u64(1)).unwrap();
        let report = model.train(&store, 32).unwrap();
        assert_eq!(report.elites.len(), 2);
        assert!(report.holdout_mse < 0.03, "holdout={}", report.holdout_mse);

        let mut rng = StdRng::seed_from_u64(0);
        let state = Tensor::from_vec(1, 2, vec![0.2, -0.4]).unwrap();
        let action = Tensor::from_vec(1, 1, vec![0.6]).unwrap();
        let step = model.step(&state, &action, true, &mut rng).unwrap();
        assert!((step.next_state.data()[0] - 0.5).abs() < 0.15);
        assert!(step.reward.is_none());
    }

    #[test]
    fn deterministic_steps_are_reproducible() {
        let model = EnsembleDynamics::new(&config(), 2, 1, StdRng::seed_from_u64(2)).unwrap();
        let state = Tensor::from_vec(2, 2, vec![0.1, 0.2, 0.3, 0.4]).unwrap();
        let action = Tensor::from_vec(2, 1, vec![0.5, -0.5]).unwrap();
        let a = model.step(&state, &action, true, &mut StdRng::seed_from_u64(1)).unwrap();
        let b = model.step(&state, &action, true, &mut StdRng::seed_from_u64(99)).unwrap();
        assert_eq!(a.next_state, b.next_state);
    }

    #[test]
    fn backward_step_matches_finite_differences() {
        let model = EnsembleDynamics::new(&config(), 2, 1, StdRng::seed_from_u64(3)).unwrap();
        let state = Tensor::from_vec(1, 2, vec![0.1, -0.2]).unwrap();
        let action = Tensor::from_vec(1, 1, vec![0.3]).unwrap();
        let weights = Tensor::from_vec(1, 2, vec![0.7, -1.3]).unwrap();
        let (gs, ga) = model.backward_step(&state, &action, &weights).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let objective = |s: &Tensor, a: &Tensor, rng: &mut StdRng| {
            let next = model.step(s, a, true, rng).unwrap().next_state;
            next.hadamard(&weights).unwrap().sum()
        };
        let eps = 1e-3;
        let plus = Tensor::from_vec(1, 1, vec![0.3 + eps]).unwrap();
        let minus = Tensor::from_vec(1, 1, vec![0.3 - eps]).unwrap();
        let numeric = (objective(&state, &plus, &mut rng) - objective(&state, &minus, &mut rng)) / (2.0 * eps);
        assert!((ga.data()[0] - numeric).abs() < 1e-2, "{} vs {numeric}", ga.data()[0]);
        let s_plus = Tensor::from_vec(1, 2, vec![0.1 + eps, -0.2]).unwrap();
        let s_minus = Tensor::from_vec(1, 2, vec![0.1 - eps, -0.2]).unwrap();
        let numeric = (objective(&s_plus, &action, &mut rng) - objective(&s_minus, &action, &mut rng)) / (2.0 * eps);
        assert!((gs.data()[0] - numeric).abs() < 1e-2, "{} vs {numeric}", gs.data()[0]);
    }

    #[test]
    fn archive_round_trip_restores_predictions() {
        let store = linear_store();
        let mut model = EnsembleDynamics::new(&config(), 2, 1, StdRng::seed_from_u64(1)).unwrap();
        model.train(&store, 32).unwrap();
        let mut archive = ModuleArchive::new();
        model.save(&mut archive).unwrap();
        let mut restored = EnsembleDynamics::new(&config(), 2, 1, StdRng::seed_from_u64(50)).unwrap();
        restored.load(&archive).unwrap();
        let state = Tensor::from_vec(1, 2, vec![0.2, -0.4]).unwrap();
        let action = Tensor::from_vec(1, 1, vec![0.6]).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(
            model.step(&state, &action, true, &mut rng).unwrap().next_state,
            restored.step(&state, &action, true, &mut rng).unwrap().next_state
        );
    }

    #[test]
    fn rejected_archive_leaves_the_ensemble_untouched() {
        let state = Tensor::from_vec(1, 2, vec![0.2, -0.4]).unwrap();
        let action = Tensor::from_vec(1, 1, vec![0.6]).unwrap();
        let mut model = EnsembleDynamics::new(&config(), 2, 1, StdRng::seed_from_u64(4)).unwrap();
        let before = model.step(&state, &action, true, &mut StdRng::seed_from_u64(0)).unwrap();
        let elites = model.elites.clone();

        // members and scaler fit, elites point past the ensemble
        let donor = EnsembleDynamics::new(&config(), 2, 1, StdRng::seed_from_u64(9)).unwrap();
        let mut archive = ModuleArchive::new();
        donor.save(&mut archive).unwrap();
        archive.insert_vector("dynamics::elites", vec![0.0, 7.0]);
        assert!(matches!(model.load(&archive), Err(HrlError::Checkpoint { .. })));

        // narrower hidden layers in every member
        let narrow = DynamicsConfig { hidden: vec![8], ..config() };
        let donor = EnsembleDynamics::new(&narrow, 2, 1, StdRng::seed_from_u64(9)).unwrap();
        let mut archive = ModuleArchive::new();
        donor.save(&mut archive).unwrap();
        assert!(model.check(&archive).is_err());
        assert!(model.load(&archive).is_err());

        let after = model.step(&state, &action, true, &mut StdRng::seed_from_u64(0)).unwrap();
        assert_eq!(before.next_state, after.next_state);
        assert_eq!(model.elites, elites);
    }
}
