// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! High-level neural module API built on top of SpiralTorch primitives.
//!
//! This crate offers a lightweight `nn.Module` style surface: layers with an
//! explicit backward pass, losses, an Adam tape per parameter, target-network
//! helpers and parameter archives.

pub mod io;
pub mod layers;
pub mod loss;
pub mod module;
pub mod optim;

pub use io::ModuleArchive;
pub use layers::{sigmoid, Linear, Relu, Scaler, Sequential, Sigmoid, Tanh};
pub use loss::{BinaryCrossEntropy, Loss, MeanSquaredError, SmoothL1};
pub use module::{hard_update, soft_update, Module, Parameter};
pub use optim::{AdamConfig, AdamTape};

pub use st_tensor::pure::{PureResult, Tensor, TensorError};
