//! Per-half model snapshots.
//!
//! Each half is written to its own safetensors file together with a copy of
//! the shared embedding:
//!
//! ```text
//! encoder_{tag}.safetensors   embedding.weight, encoder.*
//! decoder_{tag}.safetensors   embedding.weight, decoder.*
//! ```
//!
//! Files carry no hyperparameters. Loading lays tensors onto an already
//! built [`VarMap`] and checks every shape against it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use candle_nn::VarMap;

use super::EMBEDDING_WEIGHT;
use crate::{Error, Result};

/// Which half of the model a snapshot holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Half {
    Encoder,
    Decoder,
}

impl Half {
    pub fn name(&self) -> &'static str {
        match self {
            Half::Encoder => "encoder",
            Half::Decoder => "decoder",
        }
    }

    /// Whether `var_name` is stored in this half's file.
    fn stores(&self, var_name: &str) -> bool {
        var_name == EMBEDDING_WEIGHT
            || var_name
                .strip_prefix(self.name())
                .is_some_and(|rest| rest.starts_with('.'))
    }

    /// The embedding is restored from the encoder file only; the decoder's
    /// copy is shape-checked and otherwise ignored.
    fn restores_embedding(&self) -> bool {
        matches!(self, Half::Encoder)
    }
}

/// `{dir}/{half}_{tag}.safetensors`
pub fn snapshot_path(dir: &Path, half: Half, tag: &str) -> PathBuf {
    dir.join(format!("{}_{tag}.safetensors", half.name()))
}

fn lock(varmap: &VarMap) -> Result<std::sync::MutexGuard<'_, HashMap<String, candle_core::Var>>> {
    varmap
        .data()
        .lock()
        .map_err(|_| Error::Checkpoint("parameter store lock poisoned".into()))
}

/// Write one half of `varmap` to `path`, creating parent directories.
pub fn save_half(varmap: &VarMap, half: Half, path: &Path) -> Result<()> {
    let tensors: HashMap<String, Tensor> = lock(varmap)?
        .iter()
        .filter(|(name, _)| half.stores(name))
        .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
        .collect();

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    candle_core::safetensors::save(&tensors, path).map_err(|e| {
        Error::Checkpoint(format!("failed to write {}: {e}", path.display()))
    })?;
    tracing::debug!(path = %path.display(), tensors = tensors.len(), "saved {} snapshot", half.name());
    Ok(())
}

/// Load one half from `path` into the matching variables of `varmap`.
///
/// Fails with [`Error::Checkpoint`] when the file is missing or unreadable,
/// when a tensor is absent or has a different shape than the configured
/// model, or when the file holds tensors the model does not have.
pub fn load_half(varmap: &VarMap, half: Half, path: &Path, device: &Device) -> Result<()> {
    if !path.is_file() {
        return Err(Error::Checkpoint(format!(
            "{} snapshot {} not found",
            half.name(),
            path.display()
        )));
    }
    let mut stored = candle_core::safetensors::load(path, device)
        .map_err(|e| Error::Checkpoint(format!("failed to read {}: {e}", path.display())))?;

    let data = lock(varmap)?;
    for (name, var) in data.iter().filter(|(name, _)| half.stores(name)) {
        let tensor = stored.remove(name).ok_or_else(|| {
            Error::Checkpoint(format!("{} is missing tensor {name}", path.display()))
        })?;
        if tensor.dims() != var.dims() {
            return Err(Error::Checkpoint(format!(
                "{name} in {} has shape {:?}, the configured model expects {:?}",
                path.display(),
                tensor.dims(),
                var.dims()
            )));
        }
        if name == EMBEDDING_WEIGHT && !half.restores_embedding() {
            continue;
        }
        var.set(&tensor.to_dtype(var.dtype())?)?;
    }
    if let Some(extra) = stored.keys().next() {
        return Err(Error::Checkpoint(format!(
            "{} holds tensor {extra} that the configured model does not have",
            path.display()
        )));
    }
    Ok(())
}
