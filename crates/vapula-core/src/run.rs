//! Run context: distributed topology and numeric precision.
//!
//! The process environment is read exactly once at startup and resolved
//! into plain values; nothing downstream touches environment variables.

use candle_core::DType;

use crate::error::{Error, Result};

/// Numeric precision for loading the base model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Precision {
    /// 8-bit quantized weights (the default when no flag is given).
    #[default]
    EightBit,
    /// Half precision (f16) weights.
    Fp16,
    /// Brain-float (bf16) weights.
    Bf16,
    /// 4-bit quantized weights.
    FourBit,
}

impl Precision {
    /// Resolves the three mutually exclusive precision flags.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] when more than one flag is set.
    pub fn from_flags(fp16: bool, bf16: bool, four_bit: bool) -> Result<Self> {
        let requested = usize::from(fp16) + usize::from(bf16) + usize::from(four_bit);
        if requested > 1 {
            return Err(Error::invalid_config(
                "at most one of fp16, bf16 and 4-bit may be requested",
            ));
        }
        Ok(if fp16 {
            Self::Fp16
        } else if bf16 {
            Self::Bf16
        } else if four_bit {
            Self::FourBit
        } else {
            Self::EightBit
        })
    }

    /// The tensor dtype used for non-adapter weights at this precision.
    ///
    /// Quantized modes dequantize into half precision for the forward pass.
    #[must_use]
    pub fn dtype(self) -> DType {
        match self {
            Self::Fp16 | Self::EightBit | Self::FourBit => DType::F16,
            Self::Bf16 => DType::BF16,
        }
    }

    /// Returns `true` for the quantized (8-bit / 4-bit) modes.
    #[must_use]
    pub fn is_quantized(self) -> bool {
        matches!(self, Self::EightBit | Self::FourBit)
    }
}

/// Distributed topology for this process, resolved once from the launcher
/// environment (`WORLD_SIZE`, `LOCAL_RANK`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunContext {
    /// Total number of participating processes.
    pub world_size: usize,
    /// Rank of this process on its node.
    pub local_rank: usize,
}

impl RunContext {
    /// Reads the topology from the process environment.
    ///
    /// Missing or malformed variables mean a single-process run.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the topology through an arbitrary lookup function.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parse = |key: &str| lookup(key).and_then(|v| v.parse::<usize>().ok());
        Self {
            world_size: parse("WORLD_SIZE").unwrap_or(1).max(1),
            local_rank: parse("LOCAL_RANK").unwrap_or(0),
        }
    }

    /// Returns `true` when more than one process participates.
    #[must_use]
    pub fn is_distributed(&self) -> bool {
        self.world_size > 1
    }

    /// Returns `true` for the process that owns logging and checkpointing.
    #[must_use]
    pub fn is_main_process(&self) -> bool {
        self.local_rank == 0
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self {
            world_size: 1,
            local_rank: 0,
        }
    }
}
