//! # Vapula Core
//!
//! Core types for the Vapula fine-tuning toolkit.
//!
//! This crate provides the foundational pieces shared across all Vapula
//! components:
//! - Common error types
//! - Batch-size arithmetic
//! - Run context (distributed topology, precision)

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod batch;
pub mod error;
pub mod run;

pub use batch::{calculate_batches, BatchPlan};
pub use error::{Error, Result};
pub use run::{Precision, RunContext};
