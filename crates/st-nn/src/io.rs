// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Parameter archives. One archive bundles several named networks together
//! with loose scalar and vector state (optimiser-free), serialised as JSON
//! when the path ends in `.json` and as bincode otherwise.

use crate::module::Module;
use crate::{PureResult, Tensor, TensorError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoredTensor {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl StoredTensor {
    fn from_tensor(tensor: &Tensor) -> StoredTensor {
        StoredTensor {
            rows: tensor.shape().0,
            cols: tensor.shape().1,
            data: tensor.data().to_vec(),
        }
    }

    fn to_tensor(&self) -> PureResult<Tensor> {
        Tensor::from_vec(self.rows, self.cols, self.data.clone())
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct ModuleSnapshot {
    parameters: BTreeMap<String, StoredTensor>,
}

fn to_snapshot<M: Module + ?Sized>(module: &M) -> PureResult<ModuleSnapshot> {
    let state = module.state_dict()?;
    let mut parameters = BTreeMap::new();
    for (name, tensor) in state {
        parameters.insert(name, StoredTensor::from_tensor(&tensor));
    }
    Ok(ModuleSnapshot { parameters })
}

fn from_snapshot(snapshot: &ModuleSnapshot) -> PureResult<HashMap<String, Tensor>> {
    let mut state = HashMap::new();
    for (name, tensor) in &snapshot.parameters {
        state.insert(name.clone(), tensor.to_tensor()?);
    }
    Ok(state)
}

fn io_error(err: std::io::Error) -> TensorError {
    TensorError::IoError {
        message: err.to_string(),
    }
}

fn serde_error(err: impl ToString) -> TensorError {
    TensorError::SerializationError {
        message: err.to_string(),
    }
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

/// Named networks plus auxiliary numeric state of one trainable component.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ModuleArchive {
    networks: BTreeMap<String, ModuleSnapshot>,
    scalars: BTreeMap<String, f64>,
    vectors: BTreeMap<String, Vec<f64>>,
    saved_at: Option<DateTime<Utc>>,
}

impl ModuleArchive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Captures every parameter of `module` under `name`.
    pub fn insert_module<M: Module + ?Sized>(&mut self, name: &str, module: &M) -> PureResult<()> {
        self.networks.insert(name.to_string(), to_snapshot(module)?);
        Ok(())
    }

    /// Restores the network stored under `name` into `module`. Every
    /// parameter of the module must be present with a matching shape.
    pub fn restore_module<M: Module + ?Sized>(&self, name: &str, module: &mut M) -> PureResult<()> {
        let Some(snapshot) = self.networks.get(name) else {
            return Err(TensorError::MissingParameter {
                name: name.to_string(),
            });
        };
        module.load_state_dict(&from_snapshot(snapshot)?)
    }

    /// Fails exactly when [`ModuleArchive::restore_module`] would, without
    /// modifying `module`.
    pub fn check_module<M: Module + ?Sized>(&self, name: &str, module: &M) -> PureResult<()> {
        let Some(snapshot) = self.networks.get(name) else {
            return Err(TensorError::MissingParameter {
                name: name.to_string(),
            });
        };
        module.check_state_dict(&from_snapshot(snapshot)?)
    }

    pub fn insert_scalar(&mut self, name: &str, value: f64) {
        self.scalars.insert(name.to_string(), value);
    }

    pub fn scalar(&self, name: &str) -> PureResult<f64> {
        self.scalars
            .get(name)
            .copied()
            .ok_or_else(|| TensorError::MissingParameter {
                name: name.to_string(),
            })
    }

    pub fn insert_vector(&mut self, name: &str, values: Vec<f64>) {
        self.vectors.insert(name.to_string(), values);
    }

    pub fn vector(&self, name: &str) -> PureResult<&[f64]> {
        self.vectors
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| TensorError::MissingParameter {
                name: name.to_string(),
            })
    }

    /// Names of the stored networks in lexical order.
    pub fn network_names(&self) -> impl Iterator<Item = &str> {
        self.networks.keys().map(String::as_str)
    }

    pub fn saved_at(&self) -> Option<DateTime<Utc>> {
        self.saved_at
    }

    /// Writes the archive to `path`, stamping the save time.
    pub fn save<P: AsRef<Path>>(&mut self, path: P) -> PureResult<()> {
        let path = path.as_ref();
        self.saved_at = Some(Utc::now());
        let file = File::create(path).map_err(io_error)?;
        let writer = BufWriter::new(file);
        if is_json(path) {
            serde_json::to_writer_pretty(writer, &*self).map_err(serde_error)
        } else {
            bincode::serialize_into(writer, &*self).map_err(serde_error)
        }
    }

    /// Reads an archive previously written by [`ModuleArchive::save`].
    pub fn load<P: AsRef<Path>>(path: P) -> PureResult<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(io_error)?;
        let reader = BufReader::new(file);
        if is_json(path) {
            serde_json::from_reader(reader).map_err(serde_error)
        } else {
            bincode::deserialize_from(reader).map_err(serde_error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{Linear, Sequential};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn network(seed: u64) -> Sequential {
        let mut rng = StdRng::seed_from_u64(seed);
        Sequential::mlp("actor", &[3, 4, 2], &mut rng).unwrap()
    }

    #[test]
    fn json_and_bincode_archives_restore_parameters() {
        let dir = tempfile::tempdir().unwrap();
        for file in ["ctrl.json", "ctrl.bin"] {
            let source = network(1);
            let mut archive = ModuleArchive::new();
            archive.insert_module("actor", &source).unwrap();
            archive.insert_scalar("penalty", 0.25);
            archive.insert_vector("delay", vec![0.0, 0.5]);
            let path = dir.path().join(file);
            archive.save(&path).unwrap();

            let restored = ModuleArchive::load(&path).unwrap();
            assert!(restored.saved_at().is_some());
            let mut target = network(2);
            restored.restore_module("actor", &mut target).unwrap();
            assert_eq!(target.state_dict().unwrap(), source.state_dict().unwrap());
            assert_eq!(restored.scalar("penalty").unwrap(), 0.25);
            assert_eq!(restored.vector("delay").unwrap(), &[0.0, 0.5]);
        }
    }

    #[test]
    fn incompatible_networks_are_rejected() {
        let mut archive = ModuleArchive::new();
        archive
            .insert_module("critic", &Linear::new("fc", 2, 2).unwrap())
            .unwrap();
        let mut wrong_shape = Linear::new("fc", 3, 2).unwrap();
        assert!(archive.check_module("critic", &wrong_shape).is_err());
        assert!(archive
            .check_module("critic", &Linear::new("fc", 2, 2).unwrap())
            .is_ok());
        assert!(archive.restore_module("critic", &mut wrong_shape).is_err());
        assert!(archive.restore_module("missing", &mut wrong_shape).is_err());
        assert!(archive.scalar("missing").is_err());
    }
}
