// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::optim::{AdamConfig, AdamTape};
use st_tensor::{PureResult, Tensor, TensorError};
use std::collections::HashMap;

/// Trainable parameter that either relies on an attached Adam tape or falls
/// back to plain gradient descent.
pub struct Parameter {
    name: String,
    value: Tensor,
    gradient: Option<Tensor>,
    adam: Option<AdamTape>,
}

impl core::fmt::Debug for Parameter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let (rows, cols) = self.value.shape();
        write!(
            f,
            "Parameter(name={},shape=({},{}),has_grad={},has_adam={})",
            self.name,
            rows,
            cols,
            self.gradient.is_some(),
            self.adam.is_some()
        )
    }
}

impl Parameter {
    /// Creates a new parameter with the provided tensor value.
    pub fn new(name: impl Into<String>, value: Tensor) -> Self {
        Self {
            name: name.into(),
            value,
            gradient: None,
            adam: None,
        }
    }

    /// Returns the identifier assigned to the parameter.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Provides an immutable view into the underlying tensor value.
    pub fn value(&self) -> &Tensor {
        &self.value
    }

    /// Provides a mutable view into the underlying tensor value.
    pub fn value_mut(&mut self) -> &mut Tensor {
        &mut self.value
    }

    /// Returns the accumulated gradient, if any backward pass touched the parameter.
    pub fn gradient(&self) -> Option<&Tensor> {
        self.gradient.as_ref()
    }

    /// Attaches an Adam tape to the parameter.
    pub fn attach_adam(&mut self, config: AdamConfig) -> PureResult<()> {
        let (rows, cols) = self.value.shape();
        self.adam = Some(AdamTape::new(config, rows, cols)?);
        Ok(())
    }

    pub fn adam(&self) -> Option<&AdamTape> {
        self.adam.as_ref()
    }

    pub(crate) fn assert_shape(&self, tensor: &Tensor) -> PureResult<()> {
        if tensor.shape() != self.value.shape() {
            return Err(TensorError::ShapeMismatch {
                left: self.value.shape(),
                right: tensor.shape(),
            });
        }
        Ok(())
    }

    /// Adds `update` to the gradient accumulator.
    pub fn accumulate_euclidean(&mut self, update: &Tensor) -> PureResult<()> {
        self.assert_shape(update)?;
        match self.gradient.as_mut() {
            Some(grad) => grad.add_scaled(update, 1.0)?,
            None => self.gradient = Some(update.clone()),
        }
        Ok(())
    }

    /// Clears the cached gradient.
    pub fn zero_gradient(&mut self) {
        if let Some(grad) = self.gradient.as_mut() {
            for value in grad.data_mut() {
                *value = 0.0;
            }
        }
    }

    /// Applies the accumulated gradient either through the Adam tape or by
    /// using the supplied fallback learning rate, then clears it.
    pub fn apply_step(&mut self, fallback_lr: f32) -> PureResult<()> {
        let Some(grad) = self.gradient.as_mut() else {
            return Ok(());
        };
        match self.adam.as_mut() {
            Some(tape) => tape.apply(&mut self.value, grad)?,
            None => self.value.add_scaled(grad, -fallback_lr)?,
        }
        for value in grad.data_mut() {
            *value = 0.0;
        }
        Ok(())
    }

    /// Scales the accumulated gradient by the provided factor.
    pub fn scale_accumulators(&mut self, factor: f32) {
        if !factor.is_finite() {
            return;
        }
        if let Some(grad) = self.gradient.as_mut() {
            for value in grad.data_mut() {
                *value *= factor;
            }
        }
    }

    /// Squared L2 norm of the accumulated gradient.
    pub fn accumulators_norm_sq(&self) -> f64 {
        self.gradient
            .as_ref()
            .map(|grad| grad.data().iter().map(|&v| (v as f64) * (v as f64)).sum())
            .unwrap_or(0.0)
    }

    /// Overwrites the value after validating the shape.
    pub fn load_value(&mut self, value: &Tensor) -> PureResult<()> {
        self.assert_shape(value)?;
        self.value = value.clone();
        Ok(())
    }
}

/// Module trait mirroring `nn.Module`.
///
/// Modules are stateless between calls: `backward` recomputes whatever
/// activations it needs from `input`. Gradients arriving in `grad_output` are
/// already reduced by the loss, so parameter accumulators receive plain sums
/// over the batch.
pub trait Module {
    /// Runs a forward pass.
    fn forward(&self, input: &Tensor) -> PureResult<Tensor>;

    /// Propagates a gradient backwards. Implementations populate the relevant
    /// parameter accumulators before returning the gradient with respect to
    /// `input`.
    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor>;

    /// Returns the gradient with respect to `input` without touching any
    /// accumulator, for networks that act as frozen judges inside another
    /// network's loss.
    fn backward_input(&self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor>;

    /// Visits immutable parameters.
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()>;

    /// Visits mutable parameters.
    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()>;

    /// Attaches an Adam tape to every parameter.
    fn attach_adam(&mut self, config: AdamConfig) -> PureResult<()> {
        self.visit_parameters_mut(&mut |param| param.attach_adam(config))
    }

    /// Applies every parameter update.
    fn apply_step(&mut self, fallback_lr: f32) -> PureResult<()> {
        self.visit_parameters_mut(&mut |param| param.apply_step(fallback_lr))
    }

    /// Clears accumulators across every parameter.
    fn zero_accumulators(&mut self) -> PureResult<()> {
        self.visit_parameters_mut(&mut |param| {
            param.zero_gradient();
            Ok(())
        })
    }

    /// Global L2 norm of the accumulated gradients.
    fn gradient_norm(&self) -> PureResult<f32> {
        let mut total = 0.0f64;
        self.visit_parameters(&mut |param| {
            total += param.accumulators_norm_sq();
            Ok(())
        })?;
        Ok(total.sqrt() as f32)
    }

    /// Rescales the accumulated gradients so that their global norm does not
    /// exceed `max_norm`. Returns the norm measured before clipping.
    fn clip_gradient_norm(&mut self, max_norm: f32) -> PureResult<f32> {
        let norm = self.gradient_norm()?;
        if max_norm > 0.0 && norm > max_norm {
            let factor = max_norm / (norm + 1e-6);
            self.visit_parameters_mut(&mut |param| {
                param.scale_accumulators(factor);
                Ok(())
            })?;
        }
        Ok(norm)
    }

    /// Number of scalar parameters.
    fn parameter_count(&self) -> PureResult<usize> {
        let mut count = 0usize;
        self.visit_parameters(&mut |param| {
            count += param.value().data().len();
            Ok(())
        })?;
        Ok(count)
    }

    /// Captures a copy of every parameter tensor keyed by its canonical name.
    fn state_dict(&self) -> PureResult<HashMap<String, Tensor>> {
        let mut state = HashMap::new();
        self.visit_parameters(&mut |param| {
            state.insert(param.name().to_string(), param.value().clone());
            Ok(())
        })?;
        Ok(state)
    }

    /// Checks that `state` names every parameter with a matching shape,
    /// without touching the module.
    fn check_state_dict(&self, state: &HashMap<String, Tensor>) -> PureResult<()> {
        self.visit_parameters(&mut |param| {
            let Some(value) = state.get(param.name()) else {
                return Err(TensorError::MissingParameter {
                    name: param.name().to_string(),
                });
            };
            param.assert_shape(value)
        })
    }

    /// Restores parameters from a state dictionary produced by
    /// [`Module::state_dict`]. Nothing is written unless every parameter
    /// passes [`Module::check_state_dict`].
    fn load_state_dict(&mut self, state: &HashMap<String, Tensor>) -> PureResult<()> {
        self.check_state_dict(state)?;
        self.visit_parameters_mut(&mut |param| match state.get(param.name()) {
            Some(value) => param.load_value(value),
            None => Err(TensorError::MissingParameter {
                name: param.name().to_string(),
            }),
        })
    }
}

/// Polyak averaging `θ_target ← τ·θ_online + (1 − τ)·θ_target`.
///
/// Parameters are matched by name, so `target` must be a structural copy of
/// `online` built with the same layer names.
pub fn soft_update<T, O>(target: &mut T, online: &O, tau: f32) -> PureResult<()>
where
    T: Module + ?Sized,
    O: Module + ?Sized,
{
    if !(0.0..=1.0).contains(&tau) {
        return Err(TensorError::InvalidValue { label: "tau" });
    }
    let source = online.state_dict()?;
    target.visit_parameters_mut(&mut |param| {
        let Some(online_value) = source.get(param.name()) else {
            return Err(TensorError::MissingParameter {
                name: param.name().to_string(),
            });
        };
        let blended = param
            .value()
            .zip_map(online_value, |t, o| tau * o + (1.0 - tau) * t)?;
        param.load_value(&blended)
    })
}

/// Copies every parameter of `online` into `target`.
pub fn hard_update<T, O>(target: &mut T, online: &O) -> PureResult<()>
where
    T: Module + ?Sized,
    O: Module + ?Sized,
{
    target.load_state_dict(&online.state_dict()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::linear::Linear;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn pair() -> (Linear, Linear) {
        let mut rng = StdRng::seed_from_u64(1);
        let online = Linear::with_rng("fc", 3, 2, &mut rng).unwrap();
        let target = Linear::with_rng("fc", 3, 2, &mut rng).unwrap();
        (online, target)
    }

    #[test]
    fn soft_update_is_a_convex_combination() {
        let (online, mut target) = pair();
        let before = target.weight().value().clone();
        soft_update(&mut target, &online, 0.3).unwrap();
        let after = target.weight().value();
        for ((&t0, &t1), &o) in before
            .data()
            .iter()
            .zip(after.data().iter())
            .zip(online.weight().value().data().iter())
        {
            let (lo, hi) = if t0 < o { (t0, o) } else { (o, t0) };
            assert!(t1 >= lo - 1e-6 && t1 <= hi + 1e-6);
        }
    }

    #[test]
    fn soft_update_extremes() {
        let (online, mut target) = pair();
        let before = target.state_dict().unwrap();
        soft_update(&mut target, &online, 0.0).unwrap();
        assert_eq!(target.state_dict().unwrap(), before);
        soft_update(&mut target, &online, 1.0).unwrap();
        assert_eq!(target.state_dict().unwrap(), online.state_dict().unwrap());
        assert!(soft_update(&mut target, &online, 1.5).is_err());
    }

    #[test]
    fn clipping_bounds_the_gradient_norm() {
        let (mut online, _) = pair();
        let input = Tensor::from_vec(1, 3, vec![10.0, -10.0, 10.0]).unwrap();
        let grad = Tensor::from_vec(1, 2, vec![5.0, 5.0]).unwrap();
        online.backward(&input, &grad).unwrap();
        let before = online.clip_gradient_norm(1.0).unwrap();
        assert!(before > 1.0);
        assert!((online.gradient_norm().unwrap() - 1.0).abs() < 1e-3);
    }

    #[test]
    fn missing_parameter_fails_restore() {
        let (mut online, _) = pair();
        let mut state = online.state_dict().unwrap();
        state.remove("fc::bias");
        assert!(matches!(
            online.load_state_dict(&state),
            Err(TensorError::MissingParameter { .. })
        ));
    }

    #[test]
    fn rejected_restore_leaves_every_parameter_untouched() {
        let (mut online, target) = pair();
        let before = online.state_dict().unwrap();
        // the weight is visited before the bias, so a late failure must not
        // leave the weight already overwritten
        let mut state = target.state_dict().unwrap();
        state.insert("fc::bias".into(), Tensor::zeros(1, 5).unwrap());
        assert!(matches!(
            online.load_state_dict(&state),
            Err(TensorError::ShapeMismatch { .. })
        ));
        assert_eq!(online.state_dict().unwrap(), before);

        state.remove("fc::bias");
        assert!(online.check_state_dict(&state).is_err());
        assert!(online.load_state_dict(&state).is_err());
        assert_eq!(online.state_dict().unwrap(), before);
    }
}
