// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Pure Rust dense tensor used by the learning stack.
//!
//! Tensors are row-major `f32` matrices. Batches are laid out one sample per
//! row, features along the columns. Every operator validates shapes and
//! reports mismatches through [`TensorError`] instead of panicking, which lets
//! training loops surface numeric faults as ordinary errors.

use core::fmt;
use rand::distributions::{Distribution, Uniform};
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::error::Error;

/// Result alias used throughout the pure module.
pub type PureResult<T> = Result<T, TensorError>;

/// Errors emitted by tensor utilities.
#[derive(Clone, Debug, PartialEq)]
pub enum TensorError {
    /// A tensor constructor received an invalid shape.
    InvalidDimensions { rows: usize, cols: usize },
    /// Data provided to a constructor or operator does not match the tensor shape.
    DataLength { expected: usize, got: usize },
    /// An operator was asked to combine tensors of incompatible shapes.
    ShapeMismatch {
        left: (usize, usize),
        right: (usize, usize),
    },
    /// Learning rate must be positive for optimizers.
    NonPositiveLearningRate { rate: f32 },
    /// Computation received an empty input which would otherwise trigger a panic.
    EmptyInput(&'static str),
    /// Attempted to load or update a parameter that was missing from the state dict.
    MissingParameter { name: String },
    /// Wrapper around I/O failures when persisting or restoring tensors.
    IoError { message: String },
    /// Wrapper around serde failures when deserialising tensors.
    SerializationError { message: String },
    /// Numeric guard detected a non-finite value that would otherwise propagate NaNs.
    NonFiniteValue { label: &'static str, value: f32 },
    /// A column or row range fell outside of the tensor.
    OutOfRange {
        label: &'static str,
        index: usize,
        len: usize,
    },
    /// Generic configuration violation for pure-language helpers.
    InvalidValue { label: &'static str },
}

impl fmt::Display for TensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TensorError::InvalidDimensions { rows, cols } => {
                write!(
                    f,
                    "invalid tensor dimensions ({rows} x {cols}); both axes must be non-zero"
                )
            }
            TensorError::DataLength { expected, got } => {
                write!(f, "data length mismatch: expected {expected}, got {got}")
            }
            TensorError::ShapeMismatch { left, right } => {
                write!(
                    f,
                    "shape mismatch: left={:?}, right={:?} cannot be combined",
                    left, right
                )
            }
            TensorError::NonPositiveLearningRate { rate } => {
                write!(f, "learning rate must be positive, got {rate}")
            }
            TensorError::EmptyInput(label) => {
                write!(f, "{label} received an empty input")
            }
            TensorError::MissingParameter { name } => {
                write!(f, "parameter '{name}' is missing from the state dict")
            }
            TensorError::IoError { message } => write!(f, "i/o failure: {message}"),
            TensorError::SerializationError { message } => {
                write!(f, "serialization failure: {message}")
            }
            TensorError::NonFiniteValue { label, value } => {
                write!(f, "{label} produced a non-finite value ({value})")
            }
            TensorError::OutOfRange { label, index, len } => {
                write!(f, "{label}: index {index} is out of range for length {len}")
            }
            TensorError::InvalidValue { label } => write!(f, "invalid value for {label}"),
        }
    }
}

impl Error for TensorError {}

/// Row-major dense matrix of `f32` values.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl Tensor {
    /// Creates a tensor filled with zeros.
    pub fn zeros(rows: usize, cols: usize) -> PureResult<Self> {
        Self::full(rows, cols, 0.0)
    }

    /// Creates a tensor filled with a constant.
    pub fn full(rows: usize, cols: usize, value: f32) -> PureResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        Ok(Self {
            rows,
            cols,
            data: vec![value; rows * cols],
        })
    }

    /// Wraps an owned buffer.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<f32>) -> PureResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        if data.len() != rows * cols {
            return Err(TensorError::DataLength {
                expected: rows * cols,
                got: data.len(),
            });
        }
        Ok(Self { rows, cols, data })
    }

    /// Builds a tensor by evaluating `f(row, col)` for every entry.
    pub fn from_fn<F>(rows: usize, cols: usize, mut f: F) -> PureResult<Self>
    where
        F: FnMut(usize, usize) -> f32,
    {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        let mut data = Vec::with_capacity(rows * cols);
        for r in 0..rows {
            for c in 0..cols {
                data.push(f(r, c));
            }
        }
        Ok(Self { rows, cols, data })
    }

    /// Stacks equally sized rows into a matrix.
    pub fn from_rows<R: AsRef<[f32]>>(rows: &[R]) -> PureResult<Self> {
        let Some(first) = rows.first() else {
            return Err(TensorError::EmptyInput("Tensor::from_rows"));
        };
        let cols = first.as_ref().len();
        let mut data = Vec::with_capacity(rows.len() * cols);
        for row in rows {
            let row = row.as_ref();
            if row.len() != cols {
                return Err(TensorError::DataLength {
                    expected: cols,
                    got: row.len(),
                });
            }
            data.extend_from_slice(row);
        }
        Self::from_vec(rows.len(), cols, data)
    }

    /// Samples every entry from `N(mean, std²)`.
    pub fn random_normal<R: Rng + ?Sized>(
        rows: usize,
        cols: usize,
        mean: f32,
        std: f32,
        rng: &mut R,
    ) -> PureResult<Self> {
        Self::from_fn(rows, cols, |_, _| {
            let z: f32 = StandardNormal.sample(&mut *rng);
            mean + std * z
        })
    }

    /// Samples every entry uniformly from `[low, high)`.
    pub fn random_uniform<R: Rng + ?Sized>(
        rows: usize,
        cols: usize,
        low: f32,
        high: f32,
        rng: &mut R,
    ) -> PureResult<Self> {
        if !(low < high) {
            return Err(TensorError::InvalidValue {
                label: "uniform_bounds",
            });
        }
        let dist = Uniform::new(low, high);
        Self::from_fn(rows, cols, |_, _| dist.sample(&mut *rng))
    }

    /// Returns `(rows, cols)`.
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Immutable view of the row-major buffer.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Mutable view of the row-major buffer.
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Consumes the tensor and returns its buffer.
    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    /// Borrows a single row.
    pub fn row(&self, index: usize) -> PureResult<&[f32]> {
        if index >= self.rows {
            return Err(TensorError::OutOfRange {
                label: "Tensor::row",
                index,
                len: self.rows,
            });
        }
        Ok(&self.data[index * self.cols..(index + 1) * self.cols])
    }

    fn ensure_same_shape(&self, other: &Tensor) -> PureResult<()> {
        if self.shape() != other.shape() {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        Ok(())
    }

    /// Matrix product `self · other`.
    pub fn matmul(&self, other: &Tensor) -> PureResult<Tensor> {
        if self.cols != other.rows {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        let mut out = vec![0.0f32; self.rows * other.cols];
        for r in 0..self.rows {
            let lhs = &self.data[r * self.cols..(r + 1) * self.cols];
            let dst = &mut out[r * other.cols..(r + 1) * other.cols];
            for (k, &a) in lhs.iter().enumerate() {
                if a == 0.0 {
                    continue;
                }
                let rhs = &other.data[k * other.cols..(k + 1) * other.cols];
                for (d, &b) in dst.iter_mut().zip(rhs.iter()) {
                    *d += a * b;
                }
            }
        }
        Tensor::from_vec(self.rows, other.cols, out)
    }

    /// Returns the transposed matrix.
    pub fn transpose(&self) -> Tensor {
        let mut data = vec![0.0f32; self.data.len()];
        for r in 0..self.rows {
            for c in 0..self.cols {
                data[c * self.rows + r] = self.data[r * self.cols + c];
            }
        }
        Tensor {
            rows: self.cols,
            cols: self.rows,
            data,
        }
    }

    /// Applies `f` to every entry.
    pub fn map<F: FnMut(f32) -> f32>(&self, mut f: F) -> Tensor {
        Tensor {
            rows: self.rows,
            cols: self.cols,
            data: self.data.iter().map(|&v| f(v)).collect(),
        }
    }

    /// Combines two equally shaped tensors entry by entry.
    pub fn zip_map<F: FnMut(f32, f32) -> f32>(&self, other: &Tensor, mut f: F) -> PureResult<Tensor> {
        self.ensure_same_shape(other)?;
        Ok(Tensor {
            rows: self.rows,
            cols: self.cols,
            data: self
                .data
                .iter()
                .zip(other.data.iter())
                .map(|(&a, &b)| f(a, b))
                .collect(),
        })
    }

    pub fn add(&self, other: &Tensor) -> PureResult<Tensor> {
        self.zip_map(other, |a, b| a + b)
    }

    pub fn sub(&self, other: &Tensor) -> PureResult<Tensor> {
        self.zip_map(other, |a, b| a - b)
    }

    /// Element-wise product.
    pub fn hadamard(&self, other: &Tensor) -> PureResult<Tensor> {
        self.zip_map(other, |a, b| a * b)
    }

    /// Element-wise maximum.
    pub fn maximum(&self, other: &Tensor) -> PureResult<Tensor> {
        self.zip_map(other, f32::max)
    }

    /// Element-wise minimum.
    pub fn minimum(&self, other: &Tensor) -> PureResult<Tensor> {
        self.zip_map(other, f32::min)
    }

    /// Multiplies every entry by `factor`.
    pub fn scale(&self, factor: f32) -> PureResult<Tensor> {
        if !factor.is_finite() {
            return Err(TensorError::NonFiniteValue {
                label: "Tensor::scale",
                value: factor,
            });
        }
        Ok(self.map(|v| v * factor))
    }

    /// In-place `self += alpha · other`.
    pub fn add_scaled(&mut self, other: &Tensor, alpha: f32) -> PureResult<()> {
        self.ensure_same_shape(other)?;
        for (dst, &src) in self.data.iter_mut().zip(other.data.iter()) {
            *dst += alpha * src;
        }
        Ok(())
    }

    /// Adds `row` to every row in place.
    pub fn add_row_inplace(&mut self, row: &[f32]) -> PureResult<()> {
        if row.len() != self.cols {
            return Err(TensorError::DataLength {
                expected: self.cols,
                got: row.len(),
            });
        }
        for chunk in self.data.chunks_mut(self.cols) {
            for (dst, &b) in chunk.iter_mut().zip(row.iter()) {
                *dst += b;
            }
        }
        Ok(())
    }

    /// Multiplies column `c` by `factors[c]`.
    pub fn scale_columns(&self, factors: &[f32]) -> PureResult<Tensor> {
        if factors.len() != self.cols {
            return Err(TensorError::DataLength {
                expected: self.cols,
                got: factors.len(),
            });
        }
        let mut out = self.clone();
        for chunk in out.data.chunks_mut(self.cols) {
            for (dst, &f) in chunk.iter_mut().zip(factors.iter()) {
                *dst *= f;
            }
        }
        Ok(out)
    }

    /// Multiplies row `r` by `factors[r]`.
    pub fn scale_rows(&self, factors: &[f32]) -> PureResult<Tensor> {
        if factors.len() != self.rows {
            return Err(TensorError::DataLength {
                expected: self.rows,
                got: factors.len(),
            });
        }
        let mut out = self.clone();
        for (chunk, &f) in out.data.chunks_mut(self.cols).zip(factors.iter()) {
            for dst in chunk.iter_mut() {
                *dst *= f;
            }
        }
        Ok(out)
    }

    /// Clamps every column into `[low[c], high[c]]`.
    pub fn clamp_columns(&self, low: &[f32], high: &[f32]) -> PureResult<Tensor> {
        if low.len() != self.cols || high.len() != self.cols {
            return Err(TensorError::DataLength {
                expected: self.cols,
                got: low.len().min(high.len()),
            });
        }
        let mut out = self.clone();
        for chunk in out.data.chunks_mut(self.cols) {
            for ((dst, &lo), &hi) in chunk.iter_mut().zip(low.iter()).zip(high.iter()) {
                *dst = dst.max(lo).min(hi);
            }
        }
        Ok(out)
    }

    /// Clamps every entry into `[low, high]`.
    pub fn clamp(&self, low: f32, high: f32) -> Tensor {
        self.map(|v| v.max(low).min(high))
    }

    /// Column sums.
    pub fn sum_axis0(&self) -> Vec<f32> {
        let mut out = vec![0.0f32; self.cols];
        for chunk in self.data.chunks(self.cols) {
            for (dst, &v) in out.iter_mut().zip(chunk.iter()) {
                *dst += v;
            }
        }
        out
    }

    /// Row sums as a column vector.
    pub fn sum_axis1(&self) -> Tensor {
        Tensor {
            rows: self.rows,
            cols: 1,
            data: self.data.chunks(self.cols).map(|c| c.iter().sum()).collect(),
        }
    }

    /// Broadcasts a column vector across `cols` columns.
    pub fn broadcast_cols(&self, cols: usize) -> PureResult<Tensor> {
        if self.cols != 1 {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: (self.rows, 1),
            });
        }
        Tensor::from_fn(self.rows, cols, |r, _| self.data[r])
    }

    pub fn sum(&self) -> f32 {
        self.data.iter().sum()
    }

    pub fn mean(&self) -> f32 {
        self.sum() / self.data.len() as f32
    }

    pub fn squared_l2_norm(&self) -> f32 {
        self.data.iter().map(|v| v * v).sum()
    }

    /// Euclidean norm of every row as a column vector.
    pub fn row_norms(&self) -> Tensor {
        Tensor {
            rows: self.rows,
            cols: 1,
            data: self
                .data
                .chunks(self.cols)
                .map(|c| c.iter().map(|v| v * v).sum::<f32>().sqrt())
                .collect(),
        }
    }

    /// Returns columns `[start, start + len)`.
    pub fn narrow_cols(&self, start: usize, len: usize) -> PureResult<Tensor> {
        if len == 0 || start + len > self.cols {
            return Err(TensorError::OutOfRange {
                label: "Tensor::narrow_cols",
                index: start + len,
                len: self.cols,
            });
        }
        let mut data = Vec::with_capacity(self.rows * len);
        for chunk in self.data.chunks(self.cols) {
            data.extend_from_slice(&chunk[start..start + len]);
        }
        Tensor::from_vec(self.rows, len, data)
    }

    /// Writes `block` into columns `[start, start + block.cols())`, adding to
    /// the existing values. Used to scatter gradients of column slices.
    pub fn add_into_cols(&mut self, start: usize, block: &Tensor) -> PureResult<()> {
        if block.rows != self.rows || start + block.cols > self.cols {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: block.shape(),
            });
        }
        for (dst, src) in self
            .data
            .chunks_mut(self.cols)
            .zip(block.data.chunks(block.cols))
        {
            for (d, &s) in dst[start..start + block.cols].iter_mut().zip(src.iter()) {
                *d += s;
            }
        }
        Ok(())
    }

    /// Returns a copy with columns `[start, start + len)` set to zero.
    pub fn zero_cols(&self, start: usize, len: usize) -> PureResult<Tensor> {
        if start + len > self.cols {
            return Err(TensorError::OutOfRange {
                label: "Tensor::zero_cols",
                index: start + len,
                len: self.cols,
            });
        }
        let mut out = self.clone();
        for chunk in out.data.chunks_mut(self.cols) {
            for v in &mut chunk[start..start + len] {
                *v = 0.0;
            }
        }
        Ok(out)
    }

    /// Concatenates tensors with matching row counts along the columns.
    pub fn cat_cols(parts: &[&Tensor]) -> PureResult<Tensor> {
        let Some(first) = parts.first() else {
            return Err(TensorError::EmptyInput("Tensor::cat_cols"));
        };
        let rows = first.rows;
        let mut cols = 0;
        for part in parts {
            if part.rows != rows {
                return Err(TensorError::ShapeMismatch {
                    left: first.shape(),
                    right: part.shape(),
                });
            }
            cols += part.cols;
        }
        let mut data = Vec::with_capacity(rows * cols);
        for r in 0..rows {
            for part in parts {
                data.extend_from_slice(&part.data[r * part.cols..(r + 1) * part.cols]);
            }
        }
        Tensor::from_vec(rows, cols, data)
    }

    /// Concatenates tensors with matching column counts along the rows.
    pub fn cat_rows(parts: &[&Tensor]) -> PureResult<Tensor> {
        let Some(first) = parts.first() else {
            return Err(TensorError::EmptyInput("Tensor::cat_rows"));
        };
        let cols = first.cols;
        let mut data = Vec::new();
        let mut rows = 0;
        for part in parts {
            if part.cols != cols {
                return Err(TensorError::ShapeMismatch {
                    left: first.shape(),
                    right: part.shape(),
                });
            }
            rows += part.rows;
            data.extend_from_slice(&part.data);
        }
        Tensor::from_vec(rows, cols, data)
    }

    /// Returns rows `[start, start + len)`.
    pub fn narrow_rows(&self, start: usize, len: usize) -> PureResult<Tensor> {
        if len == 0 || start + len > self.rows {
            return Err(TensorError::OutOfRange {
                label: "Tensor::narrow_rows",
                index: start + len,
                len: self.rows,
            });
        }
        Tensor::from_vec(
            len,
            self.cols,
            self.data[start * self.cols..(start + len) * self.cols].to_vec(),
        )
    }

    /// Gathers the listed rows in order.
    pub fn gather_rows(&self, indices: &[usize]) -> PureResult<Tensor> {
        let mut data = Vec::with_capacity(indices.len() * self.cols);
        for &idx in indices {
            data.extend_from_slice(self.row(idx)?);
        }
        Tensor::from_vec(indices.len(), self.cols, data)
    }

    /// Repeats every row `times` times consecutively.
    pub fn repeat_rows(&self, times: usize) -> PureResult<Tensor> {
        let mut data = Vec::with_capacity(self.data.len() * times);
        for chunk in self.data.chunks(self.cols) {
            for _ in 0..times {
                data.extend_from_slice(chunk);
            }
        }
        Tensor::from_vec(self.rows * times, self.cols, data)
    }

    /// Replaces NaN and infinite entries with `filler`.
    pub fn replace_non_finite(&self, filler: f32) -> Tensor {
        self.map(|v| if v.is_finite() { v } else { filler })
    }

    /// Fails with [`TensorError::NonFiniteValue`] if any entry is NaN or infinite.
    pub fn ensure_finite(&self, label: &'static str) -> PureResult<()> {
        match self.data.iter().find(|v| !v.is_finite()) {
            Some(&value) => Err(TensorError::NonFiniteValue { label, value }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn matmul_matches_manual_product() {
        let a = Tensor::from_vec(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let b = Tensor::from_vec(3, 2, vec![7.0, 8.0, 9.0, 10.0, 11.0, 12.0]).unwrap();
        let c = a.matmul(&b).unwrap();
        assert_eq!(c.shape(), (2, 2));
        assert_eq!(c.data(), &[58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn zero_sized_tensors_are_rejected() {
        assert!(matches!(
            Tensor::zeros(0, 3),
            Err(TensorError::InvalidDimensions { rows: 0, cols: 3 })
        ));
    }

    #[test]
    fn column_slicing_and_scatter_are_inverse() {
        let t = Tensor::from_vec(2, 4, (0..8).map(|v| v as f32).collect()).unwrap();
        let mid = t.narrow_cols(1, 2).unwrap();
        assert_eq!(mid.data(), &[1.0, 2.0, 5.0, 6.0]);
        let mut grad = Tensor::zeros(2, 4).unwrap();
        grad.add_into_cols(1, &mid).unwrap();
        assert_eq!(grad.data(), &[0.0, 1.0, 2.0, 0.0, 0.0, 5.0, 6.0, 0.0]);
        let joined = Tensor::cat_cols(&[&t.narrow_cols(0, 1).unwrap(), &t.narrow_cols(1, 3).unwrap()])
            .unwrap();
        assert_eq!(joined, t);
    }

    #[test]
    fn repeat_and_gather_rows() {
        let t = Tensor::from_rows(&[vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        let rep = t.repeat_rows(2).unwrap();
        assert_eq!(rep.data(), &[1.0, 2.0, 1.0, 2.0, 3.0, 4.0, 3.0, 4.0]);
        let picked = rep.gather_rows(&[3, 0]).unwrap();
        assert_eq!(picked.data(), &[3.0, 4.0, 1.0, 2.0]);
    }

    #[test]
    fn non_finite_values_are_reported() {
        let t = Tensor::from_vec(1, 2, vec![1.0, f32::NAN]).unwrap();
        assert!(t.ensure_finite("probe").is_err());
        assert_eq!(t.replace_non_finite(0.0).data(), &[1.0, 0.0]);
    }

    #[test]
    fn random_normal_is_reproducible() {
        let mut a = StdRng::seed_from_u64(5);
        let mut b = StdRng::seed_from_u64(5);
        let x = Tensor::random_normal(3, 3, 0.0, 1.0, &mut a).unwrap();
        let y = Tensor::random_normal(3, 3, 0.0, 1.0, &mut b).unwrap();
        assert_eq!(x, y);
    }
}
