// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Goal-conditioned actor and critic networks.
//!
//! All networks take their conditioning inputs as separate tensors and
//! concatenate them column-wise. Backward helpers split the input gradient
//! back into the same pieces so callers can chain through subgoals and
//! states during imagined rollouts.

use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};
use st_nn::{Loss, Module, Parameter, PureResult, Scaler, Sequential, SmoothL1, Tanh, Tensor};

use crate::error::{ensure_finite, HrlResult};

const LOG_STD_MIN: f32 = -20.0;
const LOG_STD_MAX: f32 = 2.0;
const SQUASH_EPS: f32 = 1e-6;
const HALF_LN_TWO_PI: f32 = 0.918_938_5;

fn dims(input: usize, hidden: &[usize], output: usize) -> Vec<usize> {
    let mut dims = Vec::with_capacity(hidden.len() + 2);
    dims.push(input);
    dims.extend_from_slice(hidden);
    dims.push(output);
    dims
}

fn split(grad: &Tensor, widths: &[usize]) -> PureResult<Vec<Tensor>> {
    let mut start = 0;
    let mut parts = Vec::with_capacity(widths.len());
    for &width in widths {
        parts.push(grad.narrow_cols(start, width)?);
        start += width;
    }
    Ok(parts)
}

macro_rules! delegate_parameters {
    ($($field:ident),+) => {
        fn visit_parameters(
            &self,
            visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
        ) -> PureResult<()> {
            $(self.$field.visit_parameters(visitor)?;)+
            Ok(())
        }

        fn visit_parameters_mut(
            &mut self,
            visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
        ) -> PureResult<()> {
            $(self.$field.visit_parameters_mut(visitor)?;)+
            Ok(())
        }
    };
}

/// Deterministic actor `tanh(mlp([state, goal]))` mapped onto `[low, high]`.
#[derive(Debug)]
pub struct DeterministicActor {
    net: Sequential,
    state_dim: usize,
    goal_dim: usize,
    low: Vec<f32>,
    high: Vec<f32>,
}

impl DeterministicActor {
    pub fn new(
        name: &str,
        state_dim: usize,
        goal_dim: usize,
        hidden: &[usize],
        low: &[f32],
        high: &[f32],
        rng: &mut StdRng,
    ) -> PureResult<Self> {
        let gain = low.iter().zip(high).map(|(l, h)| 0.5 * (h - l)).collect();
        let offset = low.iter().zip(high).map(|(l, h)| 0.5 * (h + l)).collect();
        let mut net = Sequential::mlp(name, &dims(state_dim + goal_dim, hidden, low.len()), rng)?;
        net.push(Tanh::new());
        net.push(Scaler::with_offset(gain, offset)?);
        Ok(Self {
            net,
            state_dim,
            goal_dim,
            low: low.to_vec(),
            high: high.to_vec(),
        })
    }

    pub fn act(&self, state: &Tensor, goal: &Tensor) -> PureResult<Tensor> {
        self.net.forward(&Tensor::cat_cols(&[state, goal])?)
    }

    /// Accumulates parameter gradients for `∂L/∂action` and returns the
    /// gradients with respect to `(state, goal)`.
    pub fn backward_action(
        &mut self,
        state: &Tensor,
        goal: &Tensor,
        grad_action: &Tensor,
    ) -> PureResult<(Tensor, Tensor)> {
        let grad = self
            .net
            .backward(&Tensor::cat_cols(&[state, goal])?, grad_action)?;
        let mut parts = split(&grad, &[self.state_dim, self.goal_dim])?.into_iter();
        match (parts.next(), parts.next()) {
            (Some(s), Some(g)) => Ok((s, g)),
            _ => Err(st_nn::TensorError::EmptyInput("DeterministicActor::backward_action")),
        }
    }

    pub fn low(&self) -> &[f32] {
        &self.low
    }

    pub fn high(&self) -> &[f32] {
        &self.high
    }
}

impl Module for DeterministicActor {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        self.net.forward(input)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        self.net.backward(input, grad_output)
    }

    fn backward_input(&self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        self.net.backward_input(input, grad_output)
    }

    delegate_parameters!(net);
}

/// Reparameterised draw from a [`GaussianActor`], kept so the same draw can
/// be differentiated afterwards.
#[derive(Clone, Debug)]
pub struct GaussianSample {
    pub action: Tensor,
    pub log_prob: Tensor,
    input: Tensor,
    noise: Tensor,
    squashed: Tensor,
    std: Tensor,
    log_std_active: Tensor,
}

/// Tanh-squashed Gaussian policy with a state-dependent log standard
/// deviation, scaled to `±max_action`.
#[derive(Debug)]
pub struct GaussianActor {
    net: Sequential,
    state_dim: usize,
    goal_dim: usize,
    action_dim: usize,
    max_action: f32,
}

impl GaussianActor {
    pub fn new(
        name: &str,
        state_dim: usize,
        goal_dim: usize,
        action_dim: usize,
        hidden: &[usize],
        max_action: f32,
        rng: &mut StdRng,
    ) -> PureResult<Self> {
        let net = Sequential::mlp(name, &dims(state_dim + goal_dim, hidden, 2 * action_dim), rng)?;
        Ok(Self {
            net,
            state_dim,
            goal_dim,
            action_dim,
            max_action,
        })
    }

    fn heads(&self, input: &Tensor) -> PureResult<(Tensor, Tensor)> {
        let out = self.net.forward(input)?;
        Ok((
            out.narrow_cols(0, self.action_dim)?,
            out.narrow_cols(self.action_dim, self.action_dim)?,
        ))
    }

    /// `max_action · tanh(μ)`.
    pub fn mean_action(&self, state: &Tensor, goal: &Tensor) -> PureResult<Tensor> {
        let (mu, _) = self.heads(&Tensor::cat_cols(&[state, goal])?)?;
        let m = self.max_action;
        Ok(mu.map(|v| m * v.tanh()))
    }

    pub fn backward_mean(
        &mut self,
        state: &Tensor,
        goal: &Tensor,
        grad_action: &Tensor,
    ) -> PureResult<(Tensor, Tensor)> {
        let input = Tensor::cat_cols(&[state, goal])?;
        let (mu, _) = self.heads(&input)?;
        let m = self.max_action;
        let grad_mu = mu.zip_map(grad_action, |u, g| {
            let t = u.tanh();
            g * m * (1.0 - t * t)
        })?;
        let zeros = Tensor::zeros(grad_mu.rows(), self.action_dim)?;
        let grad = self.net.backward(&input, &Tensor::cat_cols(&[&grad_mu, &zeros])?)?;
        let parts = split(&grad, &[self.state_dim, self.goal_dim])?;
        let mut parts = parts.into_iter();
        match (parts.next(), parts.next()) {
            (Some(s), Some(g)) => Ok((s, g)),
            _ => Err(st_nn::TensorError::EmptyInput("GaussianActor::backward_mean")),
        }
    }

    pub fn sample(&self, state: &Tensor, goal: &Tensor, rng: &mut StdRng) -> PureResult<GaussianSample> {
        let noise = Tensor::from_fn(state.rows(), self.action_dim, |_, _| {
            StandardNormal.sample(&mut *rng)
        })?;
        self.sample_with_noise(state, goal, noise)
    }

    /// Deterministic given `noise`; used by [`GaussianActor::sample`].
    pub fn sample_with_noise(
        &self,
        state: &Tensor,
        goal: &Tensor,
        noise: Tensor,
    ) -> PureResult<GaussianSample> {
        let input = Tensor::cat_cols(&[state, goal])?;
        let (mu, raw_log_std) = self.heads(&input)?;
        let log_std = raw_log_std.clamp(LOG_STD_MIN, LOG_STD_MAX);
        let log_std_active =
            raw_log_std.map(|v| if (LOG_STD_MIN..=LOG_STD_MAX).contains(&v) { 1.0 } else { 0.0 });
        let std = log_std.map(f32::exp);
        let pre_tanh = mu.add(&std.hadamard(&noise)?)?;
        let squashed = pre_tanh.map(f32::tanh);
        let m = self.max_action;
        let action = squashed.map(|t| m * t);

        let gaussian = noise.zip_map(&log_std, |e, ls| -0.5 * e * e - ls - HALF_LN_TWO_PI)?;
        let jacobian = squashed.map(|t| (m * (1.0 - t * t) + SQUASH_EPS).ln());
        let log_prob = gaussian.sub(&jacobian)?.sum_axis1();
        Ok(GaussianSample {
            action,
            log_prob,
            input,
            noise,
            squashed,
            std,
            log_std_active,
        })
    }

    /// Backpropagates `∂L/∂action` and `∂L/∂log_prob` through a stored draw.
    pub fn backward_sample(
        &mut self,
        sample: &GaussianSample,
        grad_action: &Tensor,
        grad_log_prob: &Tensor,
    ) -> PureResult<()> {
        let m = self.max_action;
        let glp = grad_log_prob.broadcast_cols(self.action_dim)?;
        // d(-ln(m(1-t²)+eps))/du = 2mt(1-t²)/(m(1-t²)+eps)
        let dlogp_du = sample.squashed.map(|t| {
            let d = 1.0 - t * t;
            2.0 * m * t * d / (m * d + SQUASH_EPS)
        });
        let du_from_action = grad_action.zip_map(&sample.squashed, |g, t| g * m * (1.0 - t * t))?;
        let grad_u = du_from_action.add(&glp.hadamard(&dlogp_du)?)?;
        let grad_mu = grad_u.clone();
        let grad_log_std = grad_u
            .hadamard(&sample.std.hadamard(&sample.noise)?)?
            .sub(&glp)?
            .hadamard(&sample.log_std_active)?;
        self.net
            .backward(&sample.input, &Tensor::cat_cols(&[&grad_mu, &grad_log_std])?)?;
        Ok(())
    }
}

impl Module for GaussianActor {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        self.net.forward(input)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        self.net.backward(input, grad_output)
    }

    fn backward_input(&self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        self.net.backward_input(input, grad_output)
    }

    delegate_parameters!(net);
}

/// Two independent Q networks over `[state, goal, action]`.
///
/// As a [`Module`] the pair maps an input to a two-column tensor `[Q1, Q2]`.
#[derive(Debug)]
pub struct TwinCritic {
    q1: Sequential,
    q2: Sequential,
    widths: [usize; 3],
}

impl TwinCritic {
    pub fn new(
        name: &str,
        state_dim: usize,
        goal_dim: usize,
        action_dim: usize,
        hidden: &[usize],
        rng: &mut StdRng,
    ) -> PureResult<Self> {
        let layout = dims(state_dim + goal_dim + action_dim, hidden, 1);
        Ok(Self {
            q1: Sequential::mlp(&format!("{name}::q1"), &layout, rng)?,
            q2: Sequential::mlp(&format!("{name}::q2"), &layout, rng)?,
            widths: [state_dim, goal_dim, action_dim],
        })
    }

    fn joint(state: &Tensor, goal: &Tensor, action: &Tensor) -> PureResult<Tensor> {
        Tensor::cat_cols(&[state, goal, action])
    }

    pub fn values(&self, state: &Tensor, goal: &Tensor, action: &Tensor) -> PureResult<(Tensor, Tensor)> {
        let input = Self::joint(state, goal, action)?;
        Ok((self.q1.forward(&input)?, self.q2.forward(&input)?))
    }

    pub fn q1(&self, state: &Tensor, goal: &Tensor, action: &Tensor) -> PureResult<Tensor> {
        self.q1.forward(&Self::joint(state, goal, action)?)
    }

    /// `∂(Σ grad·Q1)/∂action` with both networks left untouched.
    pub fn q1_action_gradient(
        &self,
        state: &Tensor,
        goal: &Tensor,
        action: &Tensor,
        grad_q: &Tensor,
    ) -> PureResult<Tensor> {
        let grad = self
            .q1
            .backward_input(&Self::joint(state, goal, action)?, grad_q)?;
        grad.narrow_cols(self.widths[0] + self.widths[1], self.widths[2])
    }

    /// One smooth-L1 regression step of both heads towards `target`.
    /// Returns `loss(Q1) + loss(Q2)`.
    pub fn fit(
        &mut self,
        state: &Tensor,
        goal: &Tensor,
        action: &Tensor,
        target: &Tensor,
        label: &'static str,
    ) -> HrlResult<f32> {
        let input = Self::joint(state, goal, action)?;
        let mut criterion = SmoothL1::new();
        let mut total = 0.0;
        for head in [&mut self.q1, &mut self.q2] {
            let prediction = head.forward(&input)?;
            total += criterion.forward(&prediction, target)?.data()[0];
            let grad = criterion.backward(&prediction, target)?;
            head.backward(&input, &grad)?;
        }
        ensure_finite(label, total)?;
        self.apply_step(0.0)?;
        Ok(total)
    }
}

impl Module for TwinCritic {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        Tensor::cat_cols(&[&self.q1.forward(input)?, &self.q2.forward(input)?])
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let mut grad = self.q1.backward(input, &grad_output.narrow_cols(0, 1)?)?;
        grad.add_scaled(&self.q2.backward(input, &grad_output.narrow_cols(1, 1)?)?, 1.0)?;
        Ok(grad)
    }

    fn backward_input(&self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let mut grad = self.q1.backward_input(input, &grad_output.narrow_cols(0, 1)?)?;
        grad.add_scaled(&self.q2.backward_input(input, &grad_output.narrow_cols(1, 1)?)?, 1.0)?;
        Ok(grad)
    }

    delegate_parameters!(q1, q2);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use st_nn::{soft_update, AdamConfig};

    fn batch(rows: usize, cols: usize, seed: u64) -> Tensor {
        let mut rng = StdRng::seed_from_u64(seed);
        Tensor::random_uniform(rows, cols, -1.0, 1.0, &mut rng).unwrap()
    }

    fn perturb_first(module: &mut dyn Module, delta: f32) {
        let mut done = false;
        module
            .visit_parameters_mut(&mut |param: &mut Parameter| {
                if !done {
                    param.value_mut().data_mut()[0] += delta;
                    done = true;
                }
                Ok(())
            })
            .unwrap();
    }

    fn first_gradient(module: &dyn Module) -> f32 {
        let mut value = None;
        module
            .visit_parameters(&mut |param: &Parameter| {
                if value.is_none() {
                    value = param.gradient().map(|g| g.data()[0]);
                }
                Ok(())
            })
            .unwrap();
        value.unwrap_or(0.0)
    }

    #[test]
    fn deterministic_actor_respects_bounds() {
        let mut rng = StdRng::seed_from_u64(5);
        let actor =
            DeterministicActor::new("a", 3, 2, &[8], &[0.0, -2.0], &[4.0, 2.0], &mut rng).unwrap();
        let out = actor.act(&batch(16, 3, 1), &batch(16, 2, 2)).unwrap();
        for row in out.data().chunks(2) {
            assert!((0.0..=4.0).contains(&row[0]));
            assert!((-2.0..=2.0).contains(&row[1]));
        }
    }

    #[test]
    fn gaussian_log_prob_gradient_matches_finite_differences() {
        let mut rng = StdRng::seed_from_u64(9);
        let mut actor = GaussianActor::new("pi", 3, 2, 2, &[6], 1.5, &mut rng).unwrap();
        let state = batch(4, 3, 11);
        let goal = batch(4, 2, 12);
        let noise = batch(4, 2, 13);
        let weights = batch(4, 2, 14);
        let objective = |actor: &GaussianActor| {
            let s = actor.sample_with_noise(&state, &goal, noise.clone()).unwrap();
            s.action.hadamard(&weights).unwrap().sum() + 0.3 * s.log_prob.sum()
        };

        let sample = actor.sample_with_noise(&state, &goal, noise.clone()).unwrap();
        let grad_lp = Tensor::full(4, 1, 0.3).unwrap();
        actor.backward_sample(&sample, &weights, &grad_lp).unwrap();
        let analytic = first_gradient(&actor);

        let eps = 1e-3;
        perturb_first(&mut actor, eps);
        let plus = objective(&actor);
        perturb_first(&mut actor, -2.0 * eps);
        let minus = objective(&actor);
        let numeric = (plus - minus) / (2.0 * eps);
        assert!(
            (analytic - numeric).abs() < 2e-2 * (1.0 + numeric.abs()),
            "analytic={analytic} numeric={numeric}"
        );
    }

    #[test]
    fn critic_fit_reduces_regression_error() {
        let mut rng = StdRng::seed_from_u64(21);
        let mut critic = TwinCritic::new("q", 3, 2, 1, &[16], &mut rng).unwrap();
        critic.attach_adam(AdamConfig::with_learning_rate(1e-2)).unwrap();
        let (s, g, a) = (batch(32, 3, 1), batch(32, 2, 2), batch(32, 1, 3));
        let target = Tensor::full(32, 1, 2.0).unwrap();
        let first = critic.fit(&s, &g, &a, &target, "critic_loss").unwrap();
        let mut last = first;
        for _ in 0..200 {
            last = critic.fit(&s, &g, &a, &target, "critic_loss").unwrap();
        }
        assert!(last < 0.1 * first, "first={first} last={last}");
    }

    #[test]
    fn twin_critic_targets_soft_update_by_name() {
        let mut rng = StdRng::seed_from_u64(2);
        let online = TwinCritic::new("q", 2, 1, 1, &[4], &mut rng).unwrap();
        let mut target = TwinCritic::new("q", 2, 1, 1, &[4], &mut rng).unwrap();
        soft_update(&mut target, &online, 1.0).unwrap();
        assert_eq!(target.state_dict().unwrap(), online.state_dict().unwrap());
    }
}
