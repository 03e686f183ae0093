//! Checkpoint persistence for the ensemble
//!
//! A checkpoint directory holds one safetensors file per model plus a JSON
//! state file with the epoch and step counters. Weights are written and
//! restored through each model's [`VarMap`] handle, so loading updates the
//! live models in place.
//!
//! [`VarMap`]: candle_nn::VarMap

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::ReidModel;

/// Driver counters persisted next to the weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointState {
    /// Completed epochs
    pub epochs_done: usize,
    /// Steps taken across the whole run
    pub global_step: usize,
    /// Write timestamp
    pub saved_at: DateTime<Utc>,
}

fn model_path(dir: &Path, index: usize) -> PathBuf {
    dir.join(format!("model_{index}.safetensors"))
}

fn state_path(dir: &Path) -> PathBuf {
    dir.join("train_state.json")
}

/// Write every model's weights and the driver state into `dir`.
pub fn save_checkpoint(
    dir: &Path,
    models: &[Box<dyn ReidModel>],
    state: &CheckpointState,
) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    for (index, model) in models.iter().enumerate() {
        model.var_map().save(model_path(dir, index))?;
    }
    let json = serde_json::to_string_pretty(state)?;
    std::fs::write(state_path(dir), json)?;
    Ok(())
}

/// Restore every model's weights from `dir` and return the saved state.
///
/// The models must already be built with the same architecture that wrote
/// the checkpoint; a missing file or a shape mismatch fails the load.
pub fn load_checkpoint(dir: &Path, models: &[Box<dyn ReidModel>]) -> Result<CheckpointState> {
    for (index, model) in models.iter().enumerate() {
        let path = model_path(dir, index);
        if !path.exists() {
            return Err(Error::checkpoint(format!(
                "missing weights file {}",
                path.display()
            )));
        }
        let mut var_map = model.var_map();
        var_map
            .load(&path)
            .map_err(|e| Error::checkpoint(format!("failed to load {}: {e}", path.display())))?;
    }
    let content = std::fs::read_to_string(state_path(dir)).map_err(|e| {
        Error::checkpoint(format!("cannot read {}: {e}", state_path(dir).display()))
    })?;
    Ok(serde_json::from_str(&content)?)
}
