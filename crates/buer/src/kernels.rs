//! Attention-kernel selection.
//!
//! The kernel is picked once at startup from fixed named strategies. A
//! requested but unavailable kernel is never fatal: it logs a warning and
//! the run proceeds on the standard kernel.

use tracing::warn;

/// Attention implementation strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttentionKernel {
    /// Plain scaled dot-product attention.
    #[default]
    Standard,
    /// Fused flash attention, when compiled in.
    Flash,
    /// Chunked memory-efficient attention.
    MemoryEfficient,
}

impl AttentionKernel {
    /// Selects the kernel from the two request flags.
    #[must_use]
    pub fn select(use_flash: bool, use_memory_efficient: bool) -> Self {
        if use_flash && use_memory_efficient {
            warn!("Both flash and memory-efficient attention requested; trying flash first");
        }
        if use_flash {
            if Self::flash_available() {
                return Self::Flash;
            }
            warn!("Flash attention not available in this build, falling back to standard");
            if !use_memory_efficient {
                return Self::Standard;
            }
        }
        if use_memory_efficient {
            return Self::MemoryEfficient;
        }
        Self::Standard
    }

    fn flash_available() -> bool {
        cfg!(feature = "flash-attn")
    }
}

impl std::fmt::Display for AttentionKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Standard => "standard",
            Self::Flash => "flash",
            Self::MemoryEfficient => "memory-efficient",
        };
        f.write_str(name)
    }
}
