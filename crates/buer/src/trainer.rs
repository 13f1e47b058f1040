//! Training loop over an adapted causal LM.
//!
//! The optimizer only sees the adapter's variables; the base model stays
//! frozen. Losses honor the ignore sentinel in the labels, checkpoints go
//! through [`CheckpointObserver`]s, and old checkpoint directories are
//! pruned down to a configured limit.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle_core::{DType, Device, Result as CandleResult, Tensor, Var, D};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use indicatif::{ProgressBar, ProgressStyle};
use orobas::dataset::Dataset;
use orobas::tokenize::{TokenizedExample, IGNORE_INDEX};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use vapula_core::{Error, Result};

use crate::callback::CheckpointObserver;
use crate::llama::CausalLM;
use crate::lora::ADAPTER_WEIGHTS_FILE;

/// File name for persisted trainer state.
pub const TRAINER_STATE_FILE: &str = "trainer_state.json";

/// Padding token id used when collating ragged batches.
const PAD_TOKEN_ID: u32 = 0;

/// Hyperparameters for one training run.
#[derive(Debug, Clone)]
pub struct TrainingArguments {
    /// Peak learning rate.
    pub learning_rate: f64,
    /// Number of passes over the training data.
    pub num_epochs: usize,
    /// Examples per micro-batch.
    pub per_device_batch_size: usize,
    /// Micro-batches accumulated per optimizer step.
    pub accumulation_steps: usize,
    /// Fraction of total steps spent in linear warmup.
    pub warmup_ratio: f64,
    /// Log every N optimizer steps; 0 disables.
    pub logging_steps: u64,
    /// Checkpoint every N optimizer steps; 0 disables.
    pub save_steps: u64,
    /// Evaluate every N optimizer steps when validation data is present;
    /// 0 disables.
    pub eval_steps: u64,
    /// Keep at most this many checkpoint directories; 0 keeps all.
    pub save_total_limit: usize,
    /// Shuffle seed for the per-epoch data order.
    pub seed: u64,
    /// Sort shuffled megabatches by sequence length so each batch holds
    /// similarly-sized examples, reducing padding.
    pub group_by_length: bool,
    /// Output directory for checkpoints and the final adapter.
    pub output_dir: PathBuf,
}

impl Default for TrainingArguments {
    fn default() -> Self {
        Self {
            learning_rate: 3e-4,
            num_epochs: 3,
            per_device_batch_size: 4,
            accumulation_steps: 24,
            warmup_ratio: 0.06,
            logging_steps: 1,
            save_steps: 10,
            eval_steps: 10,
            save_total_limit: 20,
            seed: 42,
            group_by_length: false,
            output_dir: PathBuf::from("./vapula-lora"),
        }
    }
}

/// Constant learning rate after a linear warmup.
pub struct LrScheduler {
    base_lr: f64,
    warmup_steps: u64,
}

impl LrScheduler {
    /// Creates a scheduler with the given warmup length.
    #[must_use]
    pub fn new(base_lr: f64, warmup_steps: u64) -> Self {
        Self {
            base_lr,
            warmup_steps,
        }
    }

    /// Learning rate for an optimizer step.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn get_lr(&self, step: u64) -> f64 {
        if step < self.warmup_steps {
            self.base_lr * (step as f64 / self.warmup_steps as f64)
        } else {
            self.base_lr
        }
    }
}

/// Batches tokenized examples, optionally in a seeded shuffled order.
pub struct DataLoader {
    dataset: Arc<dyn Dataset>,
    batch_size: usize,
    indices: Vec<usize>,
    cursor: usize,
}

impl DataLoader {
    /// Megabatch width for length grouping, in batches.
    const LENGTH_GROUP_FACTOR: usize = 50;

    /// Creates a loader; a seed shuffles the iteration order. With
    /// `group_by_length`, each shuffled megabatch is sorted longest-first
    /// so batches hold similarly-sized sequences.
    #[must_use]
    pub fn new(
        dataset: Arc<dyn Dataset>,
        batch_size: usize,
        shuffle_seed: Option<u64>,
        group_by_length: bool,
    ) -> Self {
        let mut indices: Vec<usize> = (0..dataset.len()).collect();
        if let Some(seed) = shuffle_seed {
            indices.shuffle(&mut StdRng::seed_from_u64(seed));
        }
        if group_by_length {
            let megabatch = (batch_size * Self::LENGTH_GROUP_FACTOR).max(1);
            for window in indices.chunks_mut(megabatch) {
                window.sort_by_key(|&idx| {
                    std::cmp::Reverse(dataset.get(idx).map_or(0, |e| e.len()))
                });
            }
        }
        Self {
            dataset,
            batch_size,
            indices,
            cursor: 0,
        }
    }

    /// Number of batches per pass.
    #[must_use]
    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }
}

impl Iterator for DataLoader {
    type Item = Vec<TokenizedExample>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.indices.len() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.indices.len());
        let batch: Vec<TokenizedExample> = self.indices[self.cursor..end]
            .iter()
            .filter_map(|&idx| self.dataset.get(idx))
            .collect();
        self.cursor = end;
        if batch.is_empty() {
            None
        } else {
            Some(batch)
        }
    }
}

/// Pads a ragged batch into `(input_ids, labels)` tensors. Padded id
/// positions use [`PAD_TOKEN_ID`]; padded label positions use the ignore
/// sentinel so they never contribute to the loss.
fn collate(batch: &[TokenizedExample], device: &Device) -> CandleResult<(Tensor, Tensor)> {
    let max_len = batch.iter().map(TokenizedExample::len).max().unwrap_or(0);
    let mut ids = Vec::with_capacity(batch.len() * max_len);
    let mut labels = Vec::with_capacity(batch.len() * max_len);
    for example in batch {
        ids.extend_from_slice(&example.input_ids);
        ids.extend(std::iter::repeat(PAD_TOKEN_ID).take(max_len - example.len()));
        labels.extend_from_slice(&example.labels);
        labels.extend(std::iter::repeat(IGNORE_INDEX).take(max_len - example.len()));
    }
    let input_ids = Tensor::from_vec(ids, (batch.len(), max_len), device)?;
    let labels = Tensor::from_vec(labels, (batch.len(), max_len), device)?;
    Ok((input_ids, labels))
}

/// Next-token cross-entropy over the positions whose label is not the
/// ignore sentinel. Logits are shifted left against the labels, as usual
/// for causal LM training.
fn masked_cross_entropy(logits: &Tensor, labels: &Tensor) -> CandleResult<Tensor> {
    let (_batch, seq_len, _vocab) = logits.dims3()?;
    if seq_len < 2 {
        candle_core::bail!("need at least two positions to compute a next-token loss");
    }

    let logits = logits
        .narrow(1, 0, seq_len - 1)?
        .to_dtype(DType::F32)?
        .flatten_to(1)?;
    let targets = labels.narrow(1, 1, seq_len - 1)?.flatten_all()?;

    let mask = targets.ne(IGNORE_INDEX)?;
    let mask_f = mask.to_dtype(DType::F32)?;
    // Sentinel entries become index 0; their contribution is zeroed below.
    let safe_targets = (&targets * &mask.to_dtype(DType::I64)?)?;

    let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
    let gathered = log_probs
        .gather(&safe_targets.unsqueeze(1)?, 1)?
        .squeeze(1)?;
    let nll = gathered.neg()?.mul(&mask_f)?.sum_all()?;

    let count = f64::from(mask_f.sum_all()?.to_scalar::<f32>()?);
    nll / count.max(1.0)
}

/// Persisted trainer position, enough to restore the LR schedule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainerState {
    /// Optimizer steps taken.
    pub global_step: u64,
    /// Epoch of the last step.
    pub epoch: usize,
    /// Learning rate of the last step.
    pub learning_rate: f64,
}

/// What a resume path turned out to contain.
#[derive(Debug)]
pub enum Resume {
    /// Nothing usable; train from scratch.
    None,
    /// Adapter weights only; trainer state starts fresh.
    Adapter(PathBuf),
    /// Adapter weights plus trainer state.
    Full {
        /// Restored trainer position.
        state: TrainerState,
        /// Adapter weights file.
        weights: PathBuf,
    },
}

/// Probes a resume directory in fixed order: full trainer state first,
/// then a standalone adapter snapshot. A missing checkpoint warns and
/// trains from scratch, never fails.
#[must_use]
pub fn resolve_resume(dir: Option<&Path>) -> Resume {
    let Some(dir) = dir else {
        return Resume::None;
    };
    let state_path = dir.join(TRAINER_STATE_FILE);
    let weights = dir.join(ADAPTER_WEIGHTS_FILE);

    if state_path.exists() && weights.exists() {
        match fs::read_to_string(&state_path)
            .map_err(Error::from)
            .and_then(|raw| serde_json::from_str::<TrainerState>(&raw).map_err(Error::from))
        {
            Ok(state) => {
                info!(step = state.global_step, path = %dir.display(), "Resuming trainer state");
                return Resume::Full { state, weights };
            }
            Err(e) => {
                warn!(error = %e, path = %state_path.display(), "Unreadable trainer state, using adapter weights only");
            }
        }
    }

    if weights.exists() {
        info!(path = %weights.display(), "Resuming from adapter weights only");
        return Resume::Adapter(weights);
    }

    warn!(path = %dir.display(), "Checkpoint not found, training from scratch");
    Resume::None
}

/// Result of a completed run.
#[derive(Debug, Clone, Copy)]
pub struct TrainingSummary {
    /// Total optimizer steps taken.
    pub global_step: u64,
    /// Mean training loss over the run.
    pub final_loss: f64,
}

/// The training loop.
///
/// The trainer optimizes whatever variables it is handed: the adapter's for
/// parameter-efficient runs, the full variable map otherwise. Weight
/// persistence at checkpoints belongs to the observers; the trainer itself
/// only writes its own state file.
pub struct Trainer<'m, M: CausalLM> {
    model: &'m M,
    vars: Vec<Var>,
    args: TrainingArguments,
    device: Device,
    observers: Vec<Box<dyn CheckpointObserver>>,
    state: TrainerState,
}

impl<'m, M: CausalLM> Trainer<'m, M> {
    /// Creates a trainer over a model and its trainable variables.
    #[must_use]
    pub fn new(
        model: &'m M,
        vars: Vec<Var>,
        args: TrainingArguments,
        device: Device,
    ) -> Self {
        Self {
            model,
            vars,
            args,
            device,
            observers: Vec::new(),
            state: TrainerState::default(),
        }
    }

    /// Registers a checkpoint observer.
    #[must_use]
    pub fn with_observer(mut self, observer: Box<dyn CheckpointObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Restores a previously persisted trainer position. Data order is not
    /// replayed; only the step counter and LR schedule continue.
    #[must_use]
    pub fn with_state(mut self, state: TrainerState) -> Self {
        self.state = state;
        self
    }

    /// The current trainer position.
    #[must_use]
    pub fn state(&self) -> &TrainerState {
        &self.state
    }

    /// Runs the full optimization loop.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty dataset, a detached adapter, or any
    /// failing tensor or I/O operation.
    #[allow(clippy::cast_precision_loss, clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    pub fn train(
        &mut self,
        train_data: Arc<dyn Dataset>,
        eval_data: Option<Arc<dyn Dataset>>,
    ) -> Result<TrainingSummary> {
        if train_data.is_empty() {
            return Err(Error::training("training dataset is empty"));
        }
        if self.vars.is_empty() {
            return Err(Error::training(
                "no trainable parameters; no adapter or model variables were registered",
            ));
        }

        let accum = self.args.accumulation_steps.max(1);
        let batch_size = self.args.per_device_batch_size.max(1);
        let batches_per_epoch = train_data.len().div_ceil(batch_size);
        let steps_per_epoch = batches_per_epoch.div_ceil(accum);
        let total_steps = (steps_per_epoch * self.args.num_epochs) as u64;
        let warmup_steps = (total_steps as f64 * self.args.warmup_ratio).round() as u64;
        let scheduler = LrScheduler::new(self.args.learning_rate, warmup_steps);

        let params = ParamsAdamW {
            lr: self.args.learning_rate,
            ..ParamsAdamW::default()
        };
        let mut optimizer = AdamW::new(self.vars.clone(), params)?;
        let parameters: usize = self.vars.iter().map(|v| v.as_tensor().elem_count()).sum();

        info!(
            total_steps,
            warmup_steps,
            examples = train_data.len(),
            parameters,
            "Starting training"
        );

        let progress = ProgressBar::new(total_steps);
        progress.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) loss: {msg}")
                .unwrap()
                .progress_chars("#>-"),
        );
        progress.set_position(self.state.global_step);

        let mut running_loss = 0.0f64;
        let mut loss_count = 0u64;
        let mut pending: Option<Tensor> = None;
        let mut micro_batches = 0usize;

        for epoch in 0..self.args.num_epochs {
            let loader = DataLoader::new(
                train_data.clone(),
                batch_size,
                Some(self.args.seed.wrapping_add(epoch as u64)),
                self.args.group_by_length,
            );

            for batch in loader {
                let (input_ids, labels) = collate(&batch, &self.device)?;
                let logits = self.model.forward(&input_ids, true)?;
                let loss = masked_cross_entropy(&logits, &labels)?;

                running_loss += f64::from(loss.to_scalar::<f32>()?);
                loss_count += 1;
                pending = Some(match pending.take() {
                    Some(sum) => (sum + loss)?,
                    None => loss,
                });
                micro_batches += 1;

                if micro_batches >= accum {
                    if let Some(sum) = pending.take() {
                        self.state.epoch = epoch;
                        self.apply_step(&mut optimizer, &scheduler, sum, micro_batches)?;
                        micro_batches = 0;
                        let avg_loss = running_loss / loss_count as f64;
                        self.post_step(&progress, avg_loss, eval_data.as_ref())?;
                    }
                }
            }

            // Leftover micro-batches at the epoch boundary still step.
            if let Some(sum) = pending.take() {
                self.state.epoch = epoch;
                self.apply_step(&mut optimizer, &scheduler, sum, micro_batches)?;
                micro_batches = 0;
                let avg_loss = running_loss / loss_count as f64;
                self.post_step(&progress, avg_loss, eval_data.as_ref())?;
            }

            info!(
                epoch = epoch + 1,
                loss = running_loss / loss_count.max(1) as f64,
                "Epoch completed"
            );
        }

        progress.finish_with_message("Complete");

        fs::create_dir_all(&self.args.output_dir)?;
        fs::write(
            self.args.output_dir.join(TRAINER_STATE_FILE),
            serde_json::to_string_pretty(&self.state)?,
        )?;

        let final_loss = running_loss / loss_count.max(1) as f64;
        info!(
            step = self.state.global_step,
            final_loss,
            output = %self.args.output_dir.display(),
            "Training complete"
        );

        Ok(TrainingSummary {
            global_step: self.state.global_step,
            final_loss,
        })
    }

    /// Applies one optimizer step over the accumulated micro-batch losses.
    #[allow(clippy::cast_precision_loss)]
    fn apply_step(
        &mut self,
        optimizer: &mut AdamW,
        scheduler: &LrScheduler,
        accumulated: Tensor,
        micro_batches: usize,
    ) -> Result<()> {
        let lr = scheduler.get_lr(self.state.global_step);
        optimizer.set_learning_rate(lr);
        let objective = (accumulated / micro_batches as f64)?;
        optimizer.backward_step(&objective)?;
        self.state.global_step += 1;
        self.state.learning_rate = lr;
        Ok(())
    }

    fn post_step(
        &mut self,
        progress: &ProgressBar,
        avg_loss: f64,
        eval_data: Option<&Arc<dyn Dataset>>,
    ) -> Result<()> {
        let step = self.state.global_step;
        progress.set_position(step);
        progress.set_message(format!("{avg_loss:.4}"));

        if self.args.logging_steps > 0 && step % self.args.logging_steps == 0 {
            info!(
                step,
                epoch = self.state.epoch,
                loss = avg_loss,
                lr = self.state.learning_rate,
                "Training step"
            );
        }
        if let Some(eval) = eval_data {
            if self.args.eval_steps > 0 && step % self.args.eval_steps == 0 {
                let eval_loss = self.evaluate(eval)?;
                info!(step, eval_loss, "Evaluation");
            }
        }
        if self.args.save_steps > 0 && step % self.args.save_steps == 0 {
            self.save_checkpoint()?;
        }
        Ok(())
    }

    /// Mean loss over the evaluation data, without dropout.
    ///
    /// # Errors
    ///
    /// Returns an error when a tensor operation fails.
    #[allow(clippy::cast_precision_loss)]
    pub fn evaluate(&self, data: &Arc<dyn Dataset>) -> Result<f64> {
        let mut total = 0.0f64;
        let mut batches = 0u64;
        let loader = DataLoader::new(
            data.clone(),
            self.args.per_device_batch_size.max(1),
            None,
            false,
        );
        for batch in loader {
            let (input_ids, labels) = collate(&batch, &self.device)?;
            let logits = self.model.forward(&input_ids, false)?;
            let loss = masked_cross_entropy(&logits, &labels)?;
            total += f64::from(loss.to_scalar::<f32>()?);
            batches += 1;
        }
        Ok(total / batches.max(1) as f64)
    }

    fn save_checkpoint(&self) -> Result<()> {
        let dir = self
            .args
            .output_dir
            .join(format!("checkpoint-{}", self.state.global_step));
        fs::create_dir_all(&dir)?;
        fs::write(
            dir.join(TRAINER_STATE_FILE),
            serde_json::to_string_pretty(&self.state)?,
        )?;
        for observer in &self.observers {
            observer.on_save(self.state.global_step)?;
        }
        self.prune_checkpoints()?;
        Ok(())
    }

    fn prune_checkpoints(&self) -> Result<()> {
        if self.args.save_total_limit == 0 {
            return Ok(());
        }
        let mut steps: Vec<u64> = Vec::new();
        for entry in fs::read_dir(&self.args.output_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(suffix) = name.strip_prefix("checkpoint-") {
                if let Ok(step) = suffix.parse::<u64>() {
                    if entry.path().is_dir() {
                        steps.push(step);
                    }
                }
            }
        }
        steps.sort_unstable();
        while steps.len() > self.args.save_total_limit {
            let oldest = steps.remove(0);
            let path = self.args.output_dir.join(format!("checkpoint-{oldest}"));
            info!(step = oldest, "Pruning old checkpoint");
            fs::remove_dir_all(&path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use candle_nn::{embedding, Embedding, Module, VarBuilder, VarMap};
    use orobas::dataset::InMemoryDataset;

    use super::*;
    use crate::callback::AdapterCheckpoint;
    use crate::lora::{LoraAdapter, LoraConfig, LoraLinear};

    #[test]
    fn scheduler_warms_up_then_holds() {
        let scheduler = LrScheduler::new(1e-4, 100);
        assert!(scheduler.get_lr(0).abs() < 1e-12);
        assert!((scheduler.get_lr(50) - 5e-5).abs() < 1e-12);
        assert!((scheduler.get_lr(100) - 1e-4).abs() < 1e-12);
        // Constant after warmup, no decay.
        assert!((scheduler.get_lr(10_000) - 1e-4).abs() < 1e-12);
    }

    #[test]
    fn scheduler_without_warmup_starts_at_base() {
        let scheduler = LrScheduler::new(1e-4, 0);
        assert!((scheduler.get_lr(0) - 1e-4).abs() < 1e-12);
    }

    fn sample(ids: &[u32]) -> TokenizedExample {
        TokenizedExample {
            input_ids: ids.to_vec(),
            attention_mask: vec![1; ids.len()],
            labels: ids.iter().map(|&id| i64::from(id)).collect(),
        }
    }

    #[test]
    fn loader_batches_and_preserves_order_unshuffled() {
        let data = Arc::new(InMemoryDataset::new(vec![
            sample(&[1]),
            sample(&[2]),
            sample(&[3]),
        ]));
        let loader = DataLoader::new(data, 2, None, false);
        assert_eq!(loader.num_batches(), 2);
        let batches: Vec<_> = loader.collect();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[1].len(), 1);
        assert_eq!(batches[0][0].input_ids, vec![1]);
    }

    #[test]
    fn loader_shuffle_is_seed_deterministic() {
        let data: Arc<dyn Dataset> = Arc::new(InMemoryDataset::new(
            (0..32).map(|n| sample(&[n])).collect(),
        ));
        let a: Vec<_> = DataLoader::new(data.clone(), 4, Some(7), false).collect();
        let b: Vec<_> = DataLoader::new(data.clone(), 4, Some(7), false).collect();
        let c: Vec<_> = DataLoader::new(data, 4, Some(8), false).collect();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn length_grouping_yields_longest_first_within_a_megabatch() {
        let data: Arc<dyn Dataset> = Arc::new(InMemoryDataset::new(
            (1usize..=9).map(|n| sample(&vec![7u32; n])).collect(),
        ));
        let loader = DataLoader::new(data, 2, Some(3), true);
        let lengths: Vec<usize> = loader.flatten().map(|e| e.len()).collect();

        // Nine examples fit a single megabatch, so the whole epoch comes
        // out sorted longest-first regardless of the shuffle seed.
        let mut sorted = lengths.clone();
        sorted.sort_unstable_by(|a, b| b.cmp(a));
        assert_eq!(lengths, sorted);
        assert_eq!(lengths.len(), 9);
    }

    #[test]
    fn collate_pads_ids_and_masks_labels() {
        let device = Device::Cpu;
        let batch = vec![sample(&[1, 2]), sample(&[3, 4, 5, 6])];
        let (ids, labels) = collate(&batch, &device).unwrap();
        assert_eq!(ids.dims(), &[2, 4]);
        let ids: Vec<Vec<u32>> = ids.to_vec2().unwrap();
        assert_eq!(ids[0], vec![1, 2, PAD_TOKEN_ID, PAD_TOKEN_ID]);
        let labels: Vec<Vec<i64>> = labels.to_vec2().unwrap();
        assert_eq!(labels[0], vec![1, 2, IGNORE_INDEX, IGNORE_INDEX]);
    }

    #[test]
    fn uniform_logits_give_log_vocab_loss() {
        let device = Device::Cpu;
        let logits = Tensor::zeros((1, 3, 4), DType::F32, &device).unwrap();
        let labels = Tensor::from_vec(vec![-100i64, 1, 2], (1, 3), &device).unwrap();
        let loss = masked_cross_entropy(&logits, &labels)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!((loss - 4f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn masked_positions_do_not_affect_loss() {
        let device = Device::Cpu;
        // Position 0 predicts the masked target; give it an extreme,
        // confidently wrong distribution.
        let values = vec![
            100.0f32, 0.0, 0.0, 0.0, // position 0 (target is -100)
            0.0, 0.0, 0.0, 0.0, // position 1 (target is 2)
            0.0, 0.0, 0.0, 0.0, // position 2 (unused)
        ];
        let logits = Tensor::from_vec(values, (1, 3, 4), &device).unwrap();
        let labels = Tensor::from_vec(vec![-100i64, -100, 2], (1, 3), &device).unwrap();
        let loss = masked_cross_entropy(&logits, &labels)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!((loss - 4f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn resume_resolution_order() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(resolve_resume(None), Resume::None));
        assert!(matches!(resolve_resume(Some(dir.path())), Resume::None));

        fs::write(dir.path().join(ADAPTER_WEIGHTS_FILE), b"stub").unwrap();
        assert!(matches!(
            resolve_resume(Some(dir.path())),
            Resume::Adapter(_)
        ));

        let state = TrainerState {
            global_step: 40,
            epoch: 1,
            learning_rate: 1e-4,
        };
        fs::write(
            dir.path().join(TRAINER_STATE_FILE),
            serde_json::to_string(&state).unwrap(),
        )
        .unwrap();
        match resolve_resume(Some(dir.path())) {
            Resume::Full { state, .. } => assert_eq!(state.global_step, 40),
            other => panic!("expected full resume, got {other:?}"),
        }

        // A corrupt state file degrades to an adapter-only resume.
        fs::write(dir.path().join(TRAINER_STATE_FILE), b"{not json").unwrap();
        assert!(matches!(
            resolve_resume(Some(dir.path())),
            Resume::Adapter(_)
        ));
    }

    /// A minimal causal LM: a frozen embedding and one adapted projection.
    struct TinyLM {
        embed: Embedding,
        head: LoraLinear,
    }

    impl TinyLM {
        fn new(
            vocab: usize,
            hidden: usize,
            adapter: &LoraAdapter,
            device: &Device,
        ) -> CandleResult<Self> {
            let base = VarMap::new();
            let vb = VarBuilder::from_varmap(&base, DType::F32, device);
            let embed = embedding(vocab, hidden, vb.pp("embed"))?;
            let head = LoraLinear::load(
                hidden,
                vocab,
                vb.pp("head"),
                Some((
                    adapter.var_builder(DType::F32, device).pp("head"),
                    adapter.config(),
                )),
            )?;
            Ok(Self { embed, head })
        }
    }

    impl CausalLM for TinyLM {
        fn forward(&self, input_ids: &Tensor, train: bool) -> CandleResult<Tensor> {
            let hidden = self.embed.forward(input_ids)?;
            self.head.forward(&hidden, train)
        }
    }

    #[test]
    fn full_run_checkpoints_and_prunes() {
        let dir = tempfile::tempdir().unwrap();
        let device = Device::Cpu;

        let config = LoraConfig {
            r: 2,
            dropout: 0.0,
            target_modules: vec!["head".to_string()],
            ..LoraConfig::default()
        };
        let adapter = LoraAdapter::new(config).unwrap();
        let model = TinyLM::new(8, 4, &adapter, &device).unwrap();

        let data: Arc<dyn Dataset> = Arc::new(InMemoryDataset::new(vec![
            TokenizedExample {
                input_ids: vec![1, 2, 3, 4],
                attention_mask: vec![1; 4],
                labels: vec![-100, 2, 3, 4],
            },
            sample(&[5, 6, 7, 2]),
            sample(&[3, 1, 4, 1]),
            sample(&[2, 7, 1, 6]),
        ]));

        let args = TrainingArguments {
            learning_rate: 1e-3,
            num_epochs: 2,
            per_device_batch_size: 2,
            accumulation_steps: 1,
            warmup_ratio: 0.0,
            logging_steps: 0,
            save_steps: 1,
            eval_steps: 0,
            save_total_limit: 2,
            seed: 42,
            group_by_length: false,
            output_dir: dir.path().to_path_buf(),
        };

        let mut trainer = Trainer::new(&model, adapter.trainable_vars(), args, device)
            .with_observer(Box::new(AdapterCheckpoint::new(dir.path(), adapter.clone())));
        let summary = trainer.train(data.clone(), Some(data)).unwrap();

        // 4 examples, batch 2, no accumulation, 2 epochs.
        assert_eq!(summary.global_step, 4);
        assert!(summary.final_loss.is_finite());

        // save_total_limit keeps only the two newest checkpoints.
        assert!(!dir.path().join("checkpoint-1").exists());
        assert!(!dir.path().join("checkpoint-2").exists());
        for step in [3u64, 4] {
            let checkpoint = dir.path().join(format!("checkpoint-{step}"));
            assert!(checkpoint.join(ADAPTER_WEIGHTS_FILE).exists());
            assert!(checkpoint.join(TRAINER_STATE_FILE).exists());
        }

        // The trainer writes its own state at the output root; the final
        // adapter save is the launcher's job.
        assert!(dir.path().join(TRAINER_STATE_FILE).exists());
        adapter.save(dir.path().join(ADAPTER_WEIGHTS_FILE)).unwrap();
        let resumed = resolve_resume(Some(dir.path()));
        assert!(matches!(resumed, Resume::Full { .. }));
    }
}
