// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::{Module, Parameter};
use crate::{PureResult, Tensor, TensorError};

fn check_shapes(input: &Tensor, grad_output: &Tensor) -> PureResult<()> {
    if input.shape() != grad_output.shape() {
        return Err(TensorError::ShapeMismatch {
            left: input.shape(),
            right: grad_output.shape(),
        });
    }
    Ok(())
}

macro_rules! stateless_parameters {
    () => {
        fn visit_parameters(
            &self,
            _visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
        ) -> PureResult<()> {
            Ok(())
        }

        fn visit_parameters_mut(
            &mut self,
            _visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
        ) -> PureResult<()> {
            Ok(())
        }
    };
}

/// Lightweight ReLU activation. The layer is stateless and therefore does not
/// participate in parameter visits.
#[derive(Debug, Default, Clone, Copy)]
pub struct Relu;

impl Relu {
    /// Creates a new ReLU layer.
    pub fn new() -> Self {
        Self
    }
}

impl Module for Relu {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        Ok(input.map(|v| v.max(0.0)))
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        self.backward_input(input, grad_output)
    }

    fn backward_input(&self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        check_shapes(input, grad_output)?;
        input.zip_map(grad_output, |x, g| if x > 0.0 { g } else { 0.0 })
    }

    stateless_parameters!();
}

/// Hyperbolic tangent squashing.
#[derive(Debug, Default, Clone, Copy)]
pub struct Tanh;

impl Tanh {
    pub fn new() -> Self {
        Self
    }
}

impl Module for Tanh {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        Ok(input.map(f32::tanh))
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        self.backward_input(input, grad_output)
    }

    fn backward_input(&self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        check_shapes(input, grad_output)?;
        input.zip_map(grad_output, |x, g| {
            let t = x.tanh();
            g * (1.0 - t * t)
        })
    }

    stateless_parameters!();
}

/// Logistic sigmoid, used as the probability head of binary classifiers.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sigmoid;

impl Sigmoid {
    pub fn new() -> Self {
        Self
    }
}

/// Numerically stable logistic function.
pub fn sigmoid(x: f32) -> f32 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

impl Module for Sigmoid {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        Ok(input.map(sigmoid))
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        self.backward_input(input, grad_output)
    }

    fn backward_input(&self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        check_shapes(input, grad_output)?;
        input.zip_map(grad_output, |x, g| {
            let s = sigmoid(x);
            g * s * (1.0 - s)
        })
    }

    stateless_parameters!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relu_forward_backward() {
        let relu = Relu::new();
        let input = Tensor::from_vec(1, 4, vec![-1.0, -0.5, 0.2, 1.5]).unwrap();
        let output = relu.forward(&input).unwrap();
        assert_eq!(output.data(), &[0.0, 0.0, 0.2, 1.5]);

        let mut relu = relu;
        let grad_output = Tensor::from_vec(1, 4, vec![0.3, 0.4, 0.5, 0.6]).unwrap();
        let grad_input = relu.backward(&input, &grad_output).unwrap();
        assert_eq!(grad_input.data(), &[0.0, 0.0, 0.5, 0.6]);
    }

    #[test]
    fn tanh_and_sigmoid_derivatives_match_finite_differences() {
        let eps = 1e-3f32;
        for x in [-1.5f32, -0.2, 0.0, 0.7, 2.0] {
            let input = Tensor::from_vec(1, 1, vec![x]).unwrap();
            let one = Tensor::from_vec(1, 1, vec![1.0]).unwrap();
            let numeric_tanh = ((x + eps).tanh() - (x - eps).tanh()) / (2.0 * eps);
            let analytic = Tanh.backward_input(&input, &one).unwrap().data()[0];
            assert!((numeric_tanh - analytic).abs() < 1e-3);
            let numeric_sig = (sigmoid(x + eps) - sigmoid(x - eps)) / (2.0 * eps);
            let analytic = Sigmoid.backward_input(&input, &one).unwrap().data()[0];
            assert!((numeric_sig - analytic).abs() < 1e-3);
        }
    }
}
