//! Base-model file resolution.
//!
//! Resolves a model spec (Hugging Face repo id or local directory) into the
//! local paths of `config.json`, `tokenizer.json` and the safetensors
//! weights, downloading through `hf-hub` when needed.

use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Var};
use candle_nn::VarMap;
use hf_hub::api::sync::{Api, ApiRepo};
use hf_hub::{Repo, RepoType};
use tracing::{debug, info};
use vapula_core::{Error, Result};

/// Where a base model comes from.
#[derive(Debug, Clone)]
pub enum ModelSource {
    /// A Hugging Face Hub repository.
    HuggingFace {
        /// Repository identifier, e.g. `meta-llama/Llama-2-7b-hf`.
        repo_id: String,
        /// Revision; `main` when absent.
        revision: Option<String>,
    },
    /// A local directory containing config, tokenizer and weights.
    LocalPath {
        /// Directory path.
        path: PathBuf,
    },
}

impl ModelSource {
    /// Interprets a model spec: an existing local directory, otherwise a
    /// Hub repository id.
    #[must_use]
    pub fn parse(spec: &str) -> Self {
        let path = Path::new(spec);
        if path.is_dir() {
            Self::LocalPath {
                path: path.to_path_buf(),
            }
        } else {
            Self::HuggingFace {
                repo_id: spec.to_string(),
                revision: None,
            }
        }
    }
}

/// Local paths of the files needed to load a model.
#[derive(Debug)]
pub struct ModelFiles {
    /// Path to `config.json`.
    pub config: PathBuf,
    /// Path to `tokenizer.json`, when present.
    pub tokenizer: Option<PathBuf>,
    /// Safetensors weight files, single or sharded.
    pub weights: Vec<PathBuf>,
}

/// Resolves model sources to local files.
pub struct ModelResolver {
    api: Api,
}

impl ModelResolver {
    /// Creates a resolver backed by the Hub API.
    ///
    /// # Errors
    ///
    /// Returns an error if the API cannot be initialized.
    pub fn new() -> Result<Self> {
        let api = Api::new()
            .map_err(|e| Error::model_load(format!("failed to initialize hub API: {e}")))?;
        Ok(Self { api })
    }

    /// Resolves a model source to local paths, downloading when needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ModelLoad`] when required files are missing.
    pub fn resolve(&self, source: &ModelSource) -> Result<ModelFiles> {
        match source {
            ModelSource::HuggingFace { repo_id, revision } => {
                self.resolve_hub(repo_id, revision.as_deref())
            }
            ModelSource::LocalPath { path } => resolve_local(path),
        }
    }

    fn resolve_hub(&self, repo_id: &str, revision: Option<&str>) -> Result<ModelFiles> {
        info!(repo_id, revision, "Resolving base model from the hub");

        let repo = self.api.repo(Repo::with_revision(
            repo_id.to_string(),
            RepoType::Model,
            revision.unwrap_or("main").to_string(),
        ));

        let config = repo
            .get("config.json")
            .map_err(|e| Error::model_load(format!("{repo_id}: config.json: {e}")))?;
        let tokenizer = repo.get("tokenizer.json").ok();
        let weights = self.resolve_hub_weights(&repo, repo_id)?;

        Ok(ModelFiles {
            config,
            tokenizer,
            weights,
        })
    }

    fn resolve_hub_weights(&self, repo: &ApiRepo, repo_id: &str) -> Result<Vec<PathBuf>> {
        if let Ok(path) = repo.get("model.safetensors") {
            debug!("Found single safetensors file");
            return Ok(vec![path]);
        }

        if let Ok(index_path) = repo.get("model.safetensors.index.json") {
            let shard_names = shard_names_from_index(&index_path)?;
            info!(num_shards = shard_names.len(), "Downloading model shards");
            let mut shards = Vec::with_capacity(shard_names.len());
            for name in &shard_names {
                let path = repo
                    .get(name)
                    .map_err(|e| Error::model_load(format!("shard {name}: {e}")))?;
                shards.push(path);
            }
            return Ok(shards);
        }

        Err(Error::model_load(format!(
            "no safetensors weights found in {repo_id}"
        )))
    }
}

fn resolve_local(path: &Path) -> Result<ModelFiles> {
    debug!(path = %path.display(), "Resolving local model");

    let config = path.join("config.json");
    if !config.exists() {
        return Err(Error::model_load(format!(
            "config.json not found in {}",
            path.display()
        )));
    }

    let weights = if path.join("model.safetensors").exists() {
        vec![path.join("model.safetensors")]
    } else if path.join("model.safetensors.index.json").exists() {
        let index = path.join("model.safetensors.index.json");
        shard_names_from_index(&index)?
            .into_iter()
            .map(|name| path.join(name))
            .collect()
    } else {
        return Err(Error::model_load(format!(
            "no safetensors weights found in {}",
            path.display()
        )));
    };

    Ok(ModelFiles {
        config,
        tokenizer: Some(path.join("tokenizer.json")).filter(|p| p.exists()),
        weights,
    })
}

/// Loads safetensors weights into a fresh [`VarMap`] whose variables are all
/// trainable. Used for full-parameter fine-tuning, where the base weights
/// themselves are optimized instead of an adapter.
///
/// # Errors
///
/// Returns an error when a weight file cannot be read or converted.
pub fn load_trainable_varmap(
    weights: &[PathBuf],
    dtype: DType,
    device: &Device,
) -> Result<VarMap> {
    let varmap = VarMap::new();
    {
        let mut data = varmap.data().lock().unwrap();
        for path in weights {
            let tensors = candle_core::safetensors::load(path, device)
                .map_err(|e| Error::model_load(format!("{}: {e}", path.display())))?;
            for (name, tensor) in tensors {
                let var = Var::from_tensor(&tensor.to_dtype(dtype)?)?;
                data.insert(name, var);
            }
        }
    }
    Ok(varmap)
}

/// Extracts the sorted, deduplicated shard file names from a weight index.
fn shard_names_from_index(index_path: &Path) -> Result<Vec<String>> {
    let raw = std::fs::read_to_string(index_path)
        .map_err(|e| Error::model_load(format!("failed to read weight index: {e}")))?;
    let index: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|e| Error::model_load(format!("failed to parse weight index: {e}")))?;

    let weight_map = index
        .get("weight_map")
        .and_then(|w| w.as_object())
        .ok_or_else(|| Error::model_load("weight index is missing weight_map"))?;

    let mut names: Vec<String> = weight_map
        .values()
        .filter_map(|v| v.as_str())
        .map(String::from)
        .collect();
    names.sort();
    names.dedup();
    Ok(names)
}
