//! Low-rank adapter attachment.
//!
//! Adapter A/B pairs live in a `candle_nn::VarMap` and are the only
//! trainable state; base weights are never registered there, which is what
//! freezes them. B is zero-initialized so attachment is a no-op until the
//! first optimizer step.

use std::path::Path;

use candle_core::{Module, Result as CandleResult, Tensor, Var};
use candle_nn::init::Init;
use candle_nn::{linear_no_bias, Linear, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use vapula_core::{Error, Result};

/// File name for persisted adapter weights.
pub const ADAPTER_WEIGHTS_FILE: &str = "adapter_model.safetensors";

/// Low-rank adapter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoraConfig {
    /// Adapter rank.
    pub r: usize,
    /// Scaling numerator; the applied scale is `alpha / r`.
    pub alpha: f64,
    /// Dropout probability on the adapter input during training.
    pub dropout: f32,
    /// Projection names that receive an adapter.
    pub target_modules: Vec<String>,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            r: 64,
            alpha: 64.0,
            dropout: 0.05,
            target_modules: vec![
                "gate_proj".to_string(),
                "down_proj".to_string(),
                "up_proj".to_string(),
                "q_proj".to_string(),
                "k_proj".to_string(),
                "v_proj".to_string(),
                "o_proj".to_string(),
            ],
        }
    }
}

impl LoraConfig {
    /// Returns `true` when the projection name is targeted.
    #[must_use]
    pub fn is_target(&self, module_name: &str) -> bool {
        self.target_modules.iter().any(|t| t == module_name)
    }

    /// The applied scale, `alpha / r`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn scaling(&self) -> f64 {
        self.alpha / self.r as f64
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for a zero rank or an empty target
    /// list.
    pub fn validate(&self) -> Result<()> {
        if self.r == 0 {
            return Err(Error::invalid_config("adapter rank must be > 0"));
        }
        if self.target_modules.is_empty() {
            return Err(Error::invalid_config(
                "at least one adapter target module is required",
            ));
        }
        Ok(())
    }
}

/// Expands short projection names into per-layer tensor paths, for logging
/// and inspection.
#[must_use]
pub fn expand_target_modules(num_hidden_layers: usize, targets: &[String]) -> Vec<String> {
    let mut paths = Vec::new();
    for layer in 0..num_hidden_layers {
        for target in targets {
            let parent = match target.as_str() {
                "gate_proj" | "up_proj" | "down_proj" => "mlp",
                _ => "self_attn",
            };
            paths.push(format!("model.layers.{layer}.{parent}.{target}"));
        }
    }
    paths
}

/// The trainable adapter state for one run.
///
/// Clones share the underlying variables, so a clone handed to an observer
/// sees every optimizer update.
#[derive(Clone)]
pub struct LoraAdapter {
    config: LoraConfig,
    varmap: VarMap,
}

impl LoraAdapter {
    /// Creates an empty adapter; weights are registered as the model is
    /// built through [`LoraAdapter::var_builder`].
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid configuration.
    pub fn new(config: LoraConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            varmap: VarMap::new(),
        })
    }

    /// The adapter configuration.
    #[must_use]
    pub fn config(&self) -> &LoraConfig {
        &self.config
    }

    /// A variable builder registering new weights in this adapter.
    #[must_use]
    pub fn var_builder(
        &self,
        dtype: candle_core::DType,
        device: &candle_core::Device,
    ) -> VarBuilder<'_> {
        VarBuilder::from_varmap(&self.varmap, dtype, device)
    }

    /// All trainable variables.
    #[must_use]
    pub fn trainable_vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    /// Total trainable parameter count.
    #[must_use]
    pub fn num_trainable_parameters(&self) -> usize {
        self.varmap
            .all_vars()
            .iter()
            .map(|v| v.as_tensor().elem_count())
            .sum()
    }

    /// Persists the adapter weights as safetensors.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be written.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.varmap.save(path)?;
        Ok(())
    }

    /// Loads previously saved adapter weights into the registered
    /// variables. The model must already be built so the variables exist.
    ///
    /// # Errors
    ///
    /// Returns an error when the file is missing or names do not match.
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.varmap.load(path.as_ref())?;
        Ok(())
    }
}

struct LoraWeights {
    a: Tensor,
    b: Tensor,
    scaling: f64,
    dropout: f32,
}

/// A linear layer with an optional low-rank adapter on top of frozen base
/// weights.
pub struct LoraLinear {
    base: Linear,
    lora: Option<LoraWeights>,
}

impl LoraLinear {
    /// Loads the base projection from `vb` and, when `adapter` is given,
    /// registers an A/B pair for it under the mirrored path.
    ///
    /// # Errors
    ///
    /// Returns an error when weights cannot be loaded or created.
    pub fn load(
        in_dim: usize,
        out_dim: usize,
        vb: VarBuilder,
        adapter: Option<(VarBuilder, &LoraConfig)>,
    ) -> CandleResult<Self> {
        let base = linear_no_bias(in_dim, out_dim, vb)?;
        let lora = adapter
            .map(|(adapter_vb, config)| -> CandleResult<LoraWeights> {
                let a = adapter_vb.get_with_hints(
                    (config.r, in_dim),
                    "lora_a",
                    Init::Randn {
                        mean: 0.0,
                        stdev: 0.02,
                    },
                )?;
                let b = adapter_vb.get_with_hints((out_dim, config.r), "lora_b", Init::Const(0.0))?;
                Ok(LoraWeights {
                    a,
                    b,
                    scaling: config.scaling(),
                    dropout: config.dropout,
                })
            })
            .transpose()?;
        Ok(Self { base, lora })
    }

    /// Returns `true` when an adapter is attached.
    #[must_use]
    pub fn has_adapter(&self) -> bool {
        self.lora.is_some()
    }

    /// Forward pass: the frozen base projection plus the scaled low-rank
    /// delta. Dropout only applies to the adapter path, and only in
    /// training mode.
    ///
    /// # Errors
    ///
    /// Returns an error when a tensor operation fails.
    pub fn forward(&self, x: &Tensor, train: bool) -> CandleResult<Tensor> {
        let base_out = self.base.forward(x)?;
        let Some(lora) = &self.lora else {
            return Ok(base_out);
        };

        let x = if train && lora.dropout > 0.0 {
            candle_nn::ops::dropout(x, lora.dropout)?
        } else {
            x.clone()
        };
        let delta = x
            .broadcast_matmul(&lora.a.t()?)?
            .broadcast_matmul(&lora.b.t()?)?;
        base_out.add(&(delta * lora.scaling)?)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};
    use candle_nn::{VarBuilder, VarMap};

    use super::*;

    fn base_vb<'a>(varmap: &'a VarMap, device: &'a Device) -> VarBuilder<'a> {
        VarBuilder::from_varmap(varmap, DType::F32, device)
    }

    #[test]
    fn default_config_targets_all_projections() {
        let config = LoraConfig::default();
        assert_eq!(config.r, 64);
        assert!((config.scaling() - 1.0).abs() < 1e-10);
        assert_eq!(config.target_modules.len(), 7);
        assert!(config.is_target("q_proj"));
        assert!(!config.is_target("lm_head"));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = LoraConfig { r: 0, ..LoraConfig::default() };
        assert!(config.validate().is_err());
        config.r = 8;
        config.target_modules.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn expand_targets_covers_every_layer() {
        let paths = expand_target_modules(2, &["q_proj".to_string(), "gate_proj".to_string()]);
        assert_eq!(paths.len(), 4);
        assert!(paths.contains(&"model.layers.0.self_attn.q_proj".to_string()));
        assert!(paths.contains(&"model.layers.1.mlp.gate_proj".to_string()));
    }

    #[test]
    fn attachment_is_noop_before_training() {
        let device = Device::Cpu;
        let base = VarMap::new();
        let config = LoraConfig { r: 4, ..LoraConfig::default() };
        let adapter = LoraAdapter::new(config.clone()).unwrap();

        let plain = LoraLinear::load(8, 8, base_vb(&base, &device).pp("proj"), None).unwrap();
        let adapted = LoraLinear::load(
            8,
            8,
            base_vb(&base, &device).pp("proj"),
            Some((adapter.var_builder(DType::F32, &device).pp("proj"), &config)),
        )
        .unwrap();

        let x = Tensor::randn(0f32, 1f32, (2, 3, 8), &device).unwrap();
        let base_out = plain.forward(&x, false).unwrap();
        let adapted_out = adapted.forward(&x, false).unwrap();
        let diff = base_out
            .sub(&adapted_out)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-6, "zero-init B must leave the base output unchanged");
    }

    #[test]
    fn adapter_registers_only_lora_weights() {
        let device = Device::Cpu;
        let base = VarMap::new();
        let config = LoraConfig { r: 4, ..LoraConfig::default() };
        let adapter = LoraAdapter::new(config.clone()).unwrap();
        let _layer = LoraLinear::load(
            16,
            8,
            base_vb(&base, &device).pp("proj"),
            Some((adapter.var_builder(DType::F32, &device).pp("proj"), &config)),
        )
        .unwrap();

        // A: r x in, B: out x r. The base weight is not counted.
        assert_eq!(adapter.num_trainable_parameters(), 4 * 16 + 8 * 4);
        assert_eq!(adapter.trainable_vars().len(), 2);
    }

    #[test]
    fn save_load_round_trips() {
        let device = Device::Cpu;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(ADAPTER_WEIGHTS_FILE);
        let config = LoraConfig { r: 2, ..LoraConfig::default() };

        // Shared base weights so forward outputs are comparable.
        let base = VarMap::new();

        let adapter_a = LoraAdapter::new(config.clone()).unwrap();
        let layer_a = LoraLinear::load(
            8,
            8,
            base_vb(&base, &device).pp("proj"),
            Some((adapter_a.var_builder(DType::F32, &device).pp("proj"), &config)),
        )
        .unwrap();
        // Zero-init B would make any two adapters agree trivially; give it
        // real values before saving.
        for var in adapter_a.trainable_vars() {
            if var.dims() == [8, 2] {
                let ones = Tensor::ones(var.shape(), DType::F32, &device).unwrap();
                var.set(&ones).unwrap();
            }
        }
        adapter_a.save(&path).unwrap();

        let mut adapter_b = LoraAdapter::new(config.clone()).unwrap();
        let layer_b = LoraLinear::load(
            8,
            8,
            base_vb(&base, &device).pp("proj"),
            Some((adapter_b.var_builder(DType::F32, &device).pp("proj"), &config)),
        )
        .unwrap();
        adapter_b.load(&path).unwrap();

        let x = Tensor::randn(0f32, 1f32, (1, 4, 8), &device).unwrap();
        let out_a = layer_a.forward(&x, false).unwrap();
        let out_b = layer_b.forward(&x, false).unwrap();
        let diff = out_a
            .sub(&out_b)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-6);
    }
}
