// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use st_tensor::TensorError;
use thiserror::Error;

/// Failures raised by the hierarchical learner. None of them are recovered
/// locally: a training step that fails leaves the run to the caller.
#[derive(Debug, Error)]
pub enum HrlError {
    /// Wrapped tensor failure bubbling up from the core math routines.
    #[error(transparent)]
    Tensor(#[from] TensorError),
    /// Invalid or contradictory configuration, rejected at construction.
    #[error("invalid configuration for `{field}`: {reason}")]
    Config { field: &'static str, reason: String },
    /// A training step asked a store for a batch while it was empty.
    #[error("the {store} store is empty; cannot sample a batch")]
    EmptyBatch { store: &'static str },
    /// A required input (desired goal, subgoal, cost label...) was absent.
    #[error("missing required input: {0}")]
    MissingInput(&'static str),
    /// A loss or prediction turned into NaN or infinity.
    #[error("{label} became non-finite ({value})")]
    NonFinite { label: &'static str, value: f32 },
    /// Checkpoint could not be written or restored.
    #[error("checkpoint failure: {message}")]
    Checkpoint { message: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

impl HrlError {
    pub(crate) fn config(field: &'static str, reason: impl Into<String>) -> Self {
        HrlError::Config {
            field,
            reason: reason.into(),
        }
    }

    pub(crate) fn checkpoint(err: impl ToString) -> Self {
        HrlError::Checkpoint {
            message: err.to_string(),
        }
    }
}

/// Convenient result alias for the hierarchical learner.
pub type HrlResult<T> = Result<T, HrlError>;

/// Fails with [`HrlError::NonFinite`] when `value` is NaN or infinite.
pub(crate) fn ensure_finite(label: &'static str, value: f32) -> HrlResult<f32> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(HrlError::NonFinite { label, value })
    }
}
