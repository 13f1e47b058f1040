//! Batch-size arithmetic.
//!
//! Reconciles the three ways a run can specify its effective batch size:
//! an explicit global batch size, a per-device batch size, and a gradient
//! accumulation step count. Exactly one reconciliation happens, before any
//! model or dataset loading.

use crate::error::{Error, Result};

/// A fully reconciled batch plan.
///
/// Invariant: `global_batch_size == per_device * devices * accumulation_steps`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPlan {
    /// Examples per device per optimizer micro-step.
    pub per_device: usize,
    /// Number of participating devices.
    pub devices: usize,
    /// Micro-batches accumulated per optimizer step.
    pub accumulation_steps: usize,
    /// Effective examples per optimizer step across all devices.
    pub global_batch_size: usize,
}

/// Reconciles batch-size settings into a [`BatchPlan`].
///
/// Precedence: a non-zero `accumulation_steps` wins and the global batch
/// size is recomputed from it, overriding any requested value. Otherwise a
/// non-zero `global_batch_size` derives the accumulation steps by floor
/// division (never below 1). If neither is set the configuration is
/// rejected.
///
/// # Errors
///
/// Returns [`Error::InvalidConfig`] when `per_device` or `devices` is zero,
/// or when neither `global_batch_size` nor `accumulation_steps` is set.
pub fn calculate_batches(
    global_batch_size: usize,
    per_device: usize,
    accumulation_steps: usize,
    devices: usize,
) -> Result<BatchPlan> {
    if per_device == 0 {
        return Err(Error::invalid_config(
            "per-device batch size must be at least 1",
        ));
    }
    if devices == 0 {
        return Err(Error::invalid_config("device count must be at least 1"));
    }

    let (global, accumulation) = if accumulation_steps != 0 {
        (per_device * devices * accumulation_steps, accumulation_steps)
    } else if global_batch_size != 0 {
        let accumulation = (global_batch_size / per_device).max(1);
        (per_device * devices * accumulation, accumulation)
    } else {
        return Err(Error::invalid_config(
            "either global batch size or gradient accumulation steps must be set",
        ));
    };

    Ok(BatchPlan {
        per_device,
        devices,
        accumulation_steps: accumulation,
        global_batch_size: global,
    })
}
