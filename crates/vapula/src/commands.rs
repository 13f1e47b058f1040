//! CLI command implementations.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use color_eyre::eyre::{eyre, Result};
use tracing::{debug, info, warn};

use buer::{
    expand_target_modules, load_trainable_varmap, resolve_resume, AdaptedLlama, AdapterCheckpoint,
    AttentionKernel, FullModelCheckpoint, LlamaConfig, LoraAdapter, LoraConfig, ModelFiles,
    ModelResolver, ModelSource, Resume, Trainer, TrainingArguments, ADAPTER_WEIGHTS_FILE,
    MODEL_WEIGHTS_FILE,
};
use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use orobas::cache::DatasetCache;
use orobas::dataset::{Dataset, InMemoryDataset};
use orobas::prompter::Prompter;
use orobas::tokenize::TokenizeOptions;
use orobas::tokenizer::Tokenizer;
use phenex::TrackingConfig;
use vapula_core::{calculate_batches, Precision, RunContext};

use crate::config::Config;

/// Flags for the `train` subcommand.
#[derive(Args, Debug)]
pub struct TrainArgs {
    /// Base model (HuggingFace repo ID or local path)
    #[arg(long)]
    pub base_model: Option<String>,

    /// Training data file (JSON array or JSON lines)
    #[arg(long)]
    pub data_path: PathBuf,

    /// Held-out evaluation data file; when absent, validation is carved
    /// out of the training data
    #[arg(long)]
    pub eval_path: Option<PathBuf>,

    /// Output directory for checkpoints and the final weights
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Prompt template name, or path to a template JSON file
    #[arg(long, default_value = "alpaca_short")]
    pub prompt_template: String,

    /// Root directory for the tokenized-dataset cache
    #[arg(long)]
    pub tokenized_cache_dir: Option<PathBuf>,

    /// Number of training epochs
    #[arg(long, default_value_t = 3)]
    pub num_train_epochs: usize,

    /// Peak learning rate
    #[arg(long, default_value_t = 3e-4)]
    pub learning_rate: f64,

    /// Per-device micro-batch size
    #[arg(long, default_value_t = 4)]
    pub per_device_train_batch_size: usize,

    /// Gradient accumulation steps; when non-zero, overrides
    /// --global-batch-size
    #[arg(long, default_value_t = 24)]
    pub gradient_accumulation_steps: usize,

    /// Effective global batch size; used when accumulation steps are 0
    #[arg(long, default_value_t = 0)]
    pub global_batch_size: usize,

    /// Maximum tokenized sequence length
    #[arg(long, default_value_t = 2048)]
    pub cutoff_len: usize,

    /// Validation examples carved out of the training data when no
    /// evaluation file is given
    #[arg(long, default_value_t = 2000)]
    pub val_set_size: usize,

    /// Warmup fraction of total optimizer steps
    #[arg(long, default_value_t = 0.06)]
    pub warmup_ratio: f64,

    /// Log every N optimizer steps
    #[arg(long, default_value_t = 1)]
    pub logging_steps: u64,

    /// Checkpoint and evaluate every N optimizer steps
    #[arg(long, default_value_t = 10)]
    pub save_and_eval_steps: u64,

    /// Keep at most this many checkpoint directories
    #[arg(long, default_value_t = 20)]
    pub save_total_limit: usize,

    /// Shuffle seed
    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// Load base weights in f16
    #[arg(long)]
    pub train_fp16: bool,

    /// Load base weights in bf16
    #[arg(long)]
    pub train_bf16: bool,

    /// Load base weights 4-bit quantized
    #[arg(long)]
    pub train_4bit: bool,

    /// Use the fused flash-attention kernel when available
    #[arg(long)]
    pub use_flash_attn: bool,

    /// Use the chunked memory-efficient attention kernel
    #[arg(long)]
    pub use_memory_efficient_attn: bool,

    /// Order each epoch so batches hold similarly-sized sequences,
    /// reducing padding
    #[arg(long)]
    pub group_by_length: bool,

    /// Train all base parameters instead of attaching an adapter
    #[arg(long)]
    pub finetune: bool,

    /// Adapter rank
    #[arg(long, default_value_t = 64)]
    pub lora_r: usize,

    /// Adapter scaling numerator; the applied scale is alpha / r
    #[arg(long, default_value_t = 64.0)]
    pub lora_alpha: f64,

    /// Adapter dropout probability
    #[arg(long, default_value_t = 0.05)]
    pub lora_dropout: f32,

    /// Projection names the adapter attaches to
    #[arg(long, value_delimiter = ',', default_values_t = LoraConfig::default().target_modules)]
    pub lora_target_modules: Vec<String>,

    /// Include prompt tokens in the loss; when false, only the response
    /// is supervised
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub train_on_inputs: bool,

    /// Append an end-of-sequence token to each example
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub add_eos_token: bool,

    /// Experiment-tracking project; WANDB_PROJECT when unset
    #[arg(long)]
    pub wandb_project: Option<String>,

    /// Experiment-tracking run name; WANDB_RUN_NAME when unset
    #[arg(long)]
    pub wandb_run_name: Option<String>,

    /// Gradient/parameter watch mode; WANDB_WATCH when unset
    #[arg(long)]
    pub wandb_watch: Option<String>,

    /// Whether to upload model artifacts; WANDB_LOG_MODEL when unset
    #[arg(long)]
    pub wandb_log_model: Option<String>,

    /// Resume from a checkpoint directory (full trainer state or a
    /// standalone adapter snapshot)
    #[arg(long)]
    pub resume_from_checkpoint: Option<PathBuf>,
}

/// Launch a fine-tuning run.
pub fn train(args: TrainArgs, cfg: &Config) -> Result<()> {
    // Everything that can be validated from the arguments alone fails
    // before any model or dataset loading.
    let precision = Precision::from_flags(args.train_fp16, args.train_bf16, args.train_4bit)?;
    let run = RunContext::from_env();
    let plan = calculate_batches(
        args.global_batch_size,
        args.per_device_train_batch_size,
        args.gradient_accumulation_steps,
        run.world_size,
    )?;
    let base_model = args
        .base_model
        .clone()
        .or_else(|| cfg.default_base_model.clone())
        .ok_or_else(|| eyre!("Base model is required. Use --base-model <model>"))?;

    let tracking = TrackingConfig::resolve(
        args.wandb_project.clone(),
        args.wandb_run_name.clone(),
        args.wandb_watch.clone(),
        args.wandb_log_model.clone(),
    );
    let kernel = AttentionKernel::select(args.use_flash_attn, args.use_memory_efficient_attn);

    let output_dir = args
        .output_dir
        .clone()
        .unwrap_or_else(|| cfg.output_dir.clone());
    let cache_root = args
        .tokenized_cache_dir
        .clone()
        .unwrap_or_else(|| cfg.tokenized_cache_dir.clone());

    if run.is_main_process() {
        info!(
            base_model = %base_model,
            data_path = %args.data_path.display(),
            output_dir = %output_dir.display(),
            epochs = args.num_train_epochs,
            learning_rate = args.learning_rate,
            per_device_batch = plan.per_device,
            accumulation_steps = plan.accumulation_steps,
            global_batch_size = plan.global_batch_size,
            devices = plan.devices,
            cutoff_len = args.cutoff_len,
            val_set_size = args.val_set_size,
            precision = ?precision,
            kernel = %kernel,
            tracking = tracking.enabled(),
            "Run configuration"
        );
    }
    if run.is_distributed() {
        warn!(
            world_size = run.world_size,
            local_rank = run.local_rank,
            "Distributed launch detected; gradients are not synchronized across processes"
        );
    }

    // Resolve model files, tokenizer and template.
    let resolver = ModelResolver::new()?;
    let source = ModelSource::parse(&base_model);
    let files = resolver.resolve(&source)?;

    let tokenizer = match &files.tokenizer {
        Some(path) => Tokenizer::from_file(path)?,
        None => Tokenizer::from_pretrained(&base_model)?,
    };
    let prompter = Prompter::from_spec(&args.prompt_template)?;

    // Tokenize (or reload) the dataset splits.
    let cache = DatasetCache::new(&cache_root);
    let options = TokenizeOptions {
        cutoff_len: args.cutoff_len,
        add_eos_token: args.add_eos_token,
        train_on_inputs: args.train_on_inputs,
    };
    let splits = cache.prepare_splits(
        &tokenizer,
        &prompter,
        options,
        &args.data_path,
        args.eval_path.as_deref(),
        args.val_set_size,
    )?;
    info!(
        train = splits.train.len(),
        val = splits.val.len(),
        from_cache = splits.from_cache,
        "Dataset ready"
    );

    let train_data = InMemoryDataset::new(splits.train).into_shared();
    let eval_data: Option<Arc<dyn Dataset>> = if splits.val.is_empty() {
        None
    } else {
        Some(InMemoryDataset::new(splits.val).into_shared())
    };

    let device = Device::cuda_if_available(run.local_rank)?;
    let dtype = precision.dtype();
    if precision.is_quantized() {
        info!(precision = ?precision, "No quantized kernels in this build; loading dequantized weights in half precision");
    }

    let llama_config = LlamaConfig::from_file(&files.config)?;
    let resume = resolve_resume(args.resume_from_checkpoint.as_deref());

    let training_args = TrainingArguments {
        learning_rate: args.learning_rate,
        num_epochs: args.num_train_epochs,
        per_device_batch_size: plan.per_device,
        accumulation_steps: plan.accumulation_steps,
        warmup_ratio: args.warmup_ratio,
        logging_steps: args.logging_steps,
        save_steps: args.save_and_eval_steps,
        eval_steps: args.save_and_eval_steps,
        save_total_limit: args.save_total_limit,
        seed: args.seed,
        group_by_length: args.group_by_length,
        output_dir,
    };

    if args.finetune {
        train_full(
            &files,
            llama_config,
            training_args,
            train_data,
            eval_data,
            device,
            dtype,
            kernel,
            resume,
        )
    } else {
        train_adapter(
            &args,
            &files,
            llama_config,
            training_args,
            train_data,
            eval_data,
            device,
            dtype,
            kernel,
            resume,
        )
    }
}

/// The default mode: frozen base, trainable low-rank adapter.
#[allow(clippy::too_many_arguments)]
fn train_adapter(
    args: &TrainArgs,
    files: &ModelFiles,
    llama_config: LlamaConfig,
    training_args: TrainingArguments,
    train_data: Arc<dyn Dataset>,
    eval_data: Option<Arc<dyn Dataset>>,
    device: Device,
    dtype: DType,
    kernel: AttentionKernel,
    resume: Resume,
) -> Result<()> {
    let lora_config = LoraConfig {
        r: args.lora_r,
        alpha: args.lora_alpha,
        dropout: args.lora_dropout,
        target_modules: args.lora_target_modules.clone(),
    };
    let expanded = expand_target_modules(llama_config.num_hidden_layers, &lora_config.target_modules);
    debug!(projections = expanded.len(), "Adapter target projections");

    let mut adapter = LoraAdapter::new(lora_config)?;

    // Base weights are memory-mapped and never registered as variables;
    // the adapter pairs register themselves as the model is built.
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(&files.weights, dtype, &device)? };
    let model = AdaptedLlama::load(llama_config, vb, Some(&adapter), kernel)?;
    info!(
        parameters = adapter.num_trainable_parameters(),
        "Adapter attached"
    );

    match &resume {
        Resume::Full { weights, .. } | Resume::Adapter(weights) => adapter.load(weights)?,
        Resume::None => {}
    }

    let output_dir = training_args.output_dir.clone();
    let mut trainer = Trainer::new(&model, adapter.trainable_vars(), training_args, device)
        .with_observer(Box::new(AdapterCheckpoint::new(&output_dir, adapter.clone())));
    if let Resume::Full { state, .. } = resume {
        trainer = trainer.with_state(state);
    }

    let summary = trainer.train(train_data, eval_data)?;

    adapter.save(output_dir.join(ADAPTER_WEIGHTS_FILE))?;
    info!(
        steps = summary.global_step,
        loss = summary.final_loss,
        path = %output_dir.join(ADAPTER_WEIGHTS_FILE).display(),
        "Saved final adapter"
    );
    Ok(())
}

/// Full-parameter fine-tuning: every base weight is trainable and no
/// adapter is attached.
#[allow(clippy::too_many_arguments)]
fn train_full(
    files: &ModelFiles,
    llama_config: LlamaConfig,
    training_args: TrainingArguments,
    train_data: Arc<dyn Dataset>,
    eval_data: Option<Arc<dyn Dataset>>,
    device: Device,
    dtype: DType,
    kernel: AttentionKernel,
    resume: Resume,
) -> Result<()> {
    warn!("Full-parameter fine-tuning requested; every model weight is trainable");
    if !matches!(resume, Resume::None) {
        warn!("Resume checkpoints hold adapter weights; ignored for full fine-tuning");
    }

    let varmap = load_trainable_varmap(&files.weights, dtype, &device)?;
    let vb = VarBuilder::from_varmap(&varmap, dtype, &device);
    let model = AdaptedLlama::load(llama_config, vb, None, kernel)?;

    let output_dir = training_args.output_dir.clone();
    let mut trainer = Trainer::new(&model, varmap.all_vars(), training_args, device)
        .with_observer(Box::new(FullModelCheckpoint::new(&output_dir, varmap.clone())));

    let summary = trainer.train(train_data, eval_data)?;

    varmap.save(output_dir.join(MODEL_WEIGHTS_FILE))?;
    info!(
        steps = summary.global_step,
        loss = summary.final_loss,
        path = %output_dir.join(MODEL_WEIGHTS_FILE).display(),
        "Saved final model weights"
    );
    Ok(())
}

/// Display version and build info.
pub fn version() {
    println!("Vapula {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Components:");
    println!("  Orobas   - Data Pipeline");
    println!("  Buer     - Adaptation & Training");
    println!("  Phenex   - Telemetry");
    println!();
    println!("Daemoniorum, LLC - Building Tomorrow's Intelligence");
}
