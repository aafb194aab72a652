// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Process level plumbing shared by the SpiralTorch crates: seeded random
//! streams per component and the tracing subscriber bootstrap.

pub mod determinism;
pub mod tracing;

pub use determinism::DeterminismConfig;
pub use self::tracing::{init_tracing, InitError};
