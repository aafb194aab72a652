// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::{Module, Parameter};
use crate::{PureResult, Tensor, TensorError};

/// Fixed feature-wise affine map `y = x ⊙ gain + offset`.
///
/// Used to stretch a `tanh` output onto per-dimension action bounds. The gain
/// and offset are part of the architecture, not of the learned state, so the
/// layer exposes no parameters.
#[derive(Debug, Clone)]
pub struct Scaler {
    gain: Vec<f32>,
    offset: Vec<f32>,
}

impl Scaler {
    /// Creates a scaler with the provided gain and a zero offset.
    pub fn new(gain: Vec<f32>) -> PureResult<Self> {
        let features = gain.len();
        Self::with_offset(gain, vec![0.0; features])
    }

    /// Creates a scaler with an explicit gain and offset.
    pub fn with_offset(gain: Vec<f32>, offset: Vec<f32>) -> PureResult<Self> {
        if gain.is_empty() {
            return Err(TensorError::InvalidDimensions { rows: 1, cols: 0 });
        }
        if gain.len() != offset.len() {
            return Err(TensorError::DataLength {
                expected: gain.len(),
                got: offset.len(),
            });
        }
        Ok(Self { gain, offset })
    }

    pub fn gain(&self) -> &[f32] {
        &self.gain
    }

    pub fn offset(&self) -> &[f32] {
        &self.offset
    }
}

impl Module for Scaler {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let mut out = input.scale_columns(&self.gain)?;
        out.add_row_inplace(&self.offset)?;
        Ok(out)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        self.backward_input(input, grad_output)
    }

    fn backward_input(&self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        if input.shape() != grad_output.shape() {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: grad_output.shape(),
            });
        }
        grad_output.scale_columns(&self.gain)
    }

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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scaler_maps_unit_box_onto_bounds() {
        let scaler = Scaler::with_offset(vec![2.0, 0.5], vec![2.0, 0.0]).unwrap();
        let input = Tensor::from_vec(2, 2, vec![-1.0, -1.0, 1.0, 1.0]).unwrap();
        let out = scaler.forward(&input).unwrap();
        assert_eq!(out.data(), &[0.0, -0.5, 4.0, 0.5]);
        let grad = scaler
            .backward_input(&input, &Tensor::full(2, 2, 1.0).unwrap())
            .unwrap();
        assert_eq!(grad.data(), &[2.0, 0.5, 2.0, 0.5]);
    }
}
