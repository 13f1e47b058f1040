//! # Buer
//!
//! *"The President teaches philosophy and heals all distempers"*
//!
//! Buer is the adaptation and training crate of the Vapula fine-tuning
//! toolkit: low-rank adapter attachment, base-model file resolution,
//! attention-kernel selection, checkpoint observers and the training loop.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod callback;
pub mod kernels;
pub mod llama;
pub mod lora;
pub mod model;
pub mod trainer;

pub use callback::{AdapterCheckpoint, CheckpointObserver, FullModelCheckpoint, MODEL_WEIGHTS_FILE};
pub use kernels::AttentionKernel;
pub use llama::{AdaptedLlama, CausalLM, LlamaConfig};
pub use lora::{expand_target_modules, LoraAdapter, LoraConfig, LoraLinear, ADAPTER_WEIGHTS_FILE};
pub use model::{load_trainable_varmap, ModelFiles, ModelResolver, ModelSource};
pub use trainer::{
    resolve_resume, Resume, Trainer, TrainerState, TrainingArguments, TrainingSummary,
    TRAINER_STATE_FILE,
};
