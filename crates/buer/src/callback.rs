//! Checkpoint observers.
//!
//! The trainer raises an explicit event at every checkpoint; observers
//! perform side effects such as writing weights. Each observer captures
//! whatever state it persists at construction time and must not assume
//! anything else about what the trainer writes.

use std::path::PathBuf;

use candle_nn::VarMap;
use tracing::info;
use vapula_core::Result;

use crate::lora::{LoraAdapter, ADAPTER_WEIGHTS_FILE};

/// File name for full-model checkpoint weights.
pub const MODEL_WEIGHTS_FILE: &str = "model.safetensors";

/// Receives checkpoint events from the trainer.
pub trait CheckpointObserver: Send + Sync {
    /// Called after the trainer decides to checkpoint at `step`.
    ///
    /// # Errors
    ///
    /// Returns an error when the observer's side effect fails.
    fn on_save(&self, step: u64) -> Result<()>;
}

/// Writes the adapter weights (and nothing else) into
/// `checkpoint-{step}/adapter_model.safetensors` under the output
/// directory.
pub struct AdapterCheckpoint {
    output_dir: PathBuf,
    adapter: LoraAdapter,
}

impl AdapterCheckpoint {
    /// Creates the observer for an output directory.
    #[must_use]
    pub fn new(output_dir: impl Into<PathBuf>, adapter: LoraAdapter) -> Self {
        Self {
            output_dir: output_dir.into(),
            adapter,
        }
    }
}

impl CheckpointObserver for AdapterCheckpoint {
    fn on_save(&self, step: u64) -> Result<()> {
        let path = self
            .output_dir
            .join(format!("checkpoint-{step}"))
            .join(ADAPTER_WEIGHTS_FILE);
        self.adapter.save(&path)?;
        info!(step, path = %path.display(), "Saved adapter checkpoint");
        Ok(())
    }
}

/// Writes all model weights into `checkpoint-{step}/model.safetensors`;
/// used when training without an adapter.
pub struct FullModelCheckpoint {
    output_dir: PathBuf,
    varmap: VarMap,
}

impl FullModelCheckpoint {
    /// Creates the observer over the model's variable map.
    #[must_use]
    pub fn new(output_dir: impl Into<PathBuf>, varmap: VarMap) -> Self {
        Self {
            output_dir: output_dir.into(),
            varmap,
        }
    }
}

impl CheckpointObserver for FullModelCheckpoint {
    fn on_save(&self, step: u64) -> Result<()> {
        let dir = self.output_dir.join(format!("checkpoint-{step}"));
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(MODEL_WEIGHTS_FILE);
        self.varmap.save(&path)?;
        info!(step, path = %path.display(), "Saved full model checkpoint");
        Ok(())
    }
}
