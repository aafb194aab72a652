// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::layers::activation::Relu;
use crate::layers::linear::Linear;
use crate::module::{Module, Parameter};
use crate::{PureResult, Tensor, TensorError};
use rand::Rng;

/// Sequential container that mirrors `nn.Sequential`.
#[derive(Default)]
pub struct Sequential {
    layers: Vec<Box<dyn Module>>,
}

impl core::fmt::Debug for Sequential {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Sequential(num_layers={})", self.layers.len())
    }
}

impl Sequential {
    /// Creates an empty container.
    pub fn new() -> Self {
        Self { layers: Vec::new() }
    }

    /// Builds a ReLU multilayer perceptron over `dims = [input, hidden.., output]`.
    /// The output layer is linear; callers push their own head activation.
    pub fn mlp<R: Rng + ?Sized>(name: &str, dims: &[usize], rng: &mut R) -> PureResult<Self> {
        if dims.len() < 2 {
            return Err(TensorError::InvalidValue { label: "mlp_dims" });
        }
        let mut seq = Self::new();
        let last = dims.len() - 2;
        for (idx, pair) in dims.windows(2).enumerate() {
            seq.push(Linear::with_rng(
                format!("{name}::l{}", idx + 1),
                pair[0],
                pair[1],
                rng,
            )?);
            if idx < last {
                seq.push(Relu::new());
            }
        }
        Ok(seq)
    }

    /// Appends a new layer to the sequence.
    pub fn push<M>(&mut self, layer: M)
    where
        M: Module + 'static,
    {
        self.layers.push(Box::new(layer));
    }

    /// Returns the number of layers registered in the container.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Returns `true` when the container does not hold any layers.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    fn activations(&self, input: &Tensor) -> PureResult<Vec<Tensor>> {
        let mut activations = Vec::with_capacity(self.layers.len());
        let mut current = input.clone();
        for layer in &self.layers {
            let next = layer.forward(&current)?;
            activations.push(current);
            current = next;
        }
        Ok(activations)
    }
}

impl Module for Sequential {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let mut activ = input.clone();
        for layer in &self.layers {
            activ = layer.forward(&activ)?;
        }
        Ok(activ)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let inputs = self.activations(input)?;
        let mut grad = grad_output.clone();
        for (layer, layer_input) in self.layers.iter_mut().zip(inputs.iter()).rev() {
            grad = layer.backward(layer_input, &grad)?;
        }
        Ok(grad)
    }

    fn backward_input(&self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let inputs = self.activations(input)?;
        let mut grad = grad_output.clone();
        for (layer, layer_input) in self.layers.iter().zip(inputs.iter()).rev() {
            grad = layer.backward_input(layer_input, &grad)?;
        }
        Ok(grad)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for layer in &self.layers {
            layer.visit_parameters(visitor)?;
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for layer in &mut self.layers {
            layer.visit_parameters_mut(visitor)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optim::AdamConfig;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn sequential_forward_and_backward() {
        let mut seq = Sequential::new();
        seq.push(Linear::new("l1", 2, 3).unwrap());
        seq.push(Linear::new("l2", 3, 1).unwrap());
        seq.attach_adam(AdamConfig::with_learning_rate(0.05)).unwrap();

        let input = Tensor::from_vec(1, 2, vec![0.5, -0.1]).unwrap();
        let target = Tensor::from_vec(1, 1, vec![0.2]).unwrap();
        let output = seq.forward(&input).unwrap();
        let grad_out = output.sub(&target).unwrap();
        let _ = seq.backward(&input, &grad_out).unwrap();
        seq.apply_step(0.01).unwrap();
        let new_output = seq.forward(&input).unwrap();
        assert_ne!(output, new_output);
    }

    #[test]
    fn mlp_input_gradient_matches_finite_differences() {
        let mut rng = StdRng::seed_from_u64(11);
        let net = Sequential::mlp("probe", &[3, 8, 2], &mut rng).unwrap();
        let x = vec![0.3f32, -0.7, 0.2];
        let input = Tensor::from_vec(1, 3, x.clone()).unwrap();
        let ones = Tensor::full(1, 2, 1.0).unwrap();
        let analytic = net.backward_input(&input, &ones).unwrap();
        let eps = 1e-3;
        for i in 0..3 {
            let mut plus = x.clone();
            plus[i] += eps;
            let mut minus = x.clone();
            minus[i] -= eps;
            let f = |v: Vec<f32>| {
                net.forward(&Tensor::from_vec(1, 3, v).unwrap())
                    .unwrap()
                    .sum()
            };
            let numeric = (f(plus) - f(minus)) / (2.0 * eps);
            assert!((numeric - analytic.data()[i]).abs() < 1e-2);
        }
    }

    #[test]
    fn mlp_names_layers_by_position() {
        let mut rng = StdRng::seed_from_u64(0);
        let net = Sequential::mlp("critic", &[4, 5, 1], &mut rng).unwrap();
        let state = net.state_dict().unwrap();
        assert!(state.contains_key("critic::l1::weight"));
        assert!(state.contains_key("critic::l2::bias"));
        assert_eq!(net.len(), 3);
    }
}
