//! Tokenized-dataset cache.
//!
//! Tokenized splits are persisted as JSONL under a cache root, at a path
//! derived from the dataset identifier. Presence of the train path is the
//! sole hit signal; there is no checksum or staleness check, so a changed
//! source file behind an existing cache entry is served stale until the
//! entry is deleted.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Component, Path, PathBuf};

use rand::seq::SliceRandom;
use tracing::info;
use vapula_core::{Error, Result};

use crate::dataset::{load_examples, split_train_val};
use crate::prompter::Prompter;
use crate::tokenize::{tokenize_prompt, TextEncoder, TokenizeOptions, TokenizedExample};

/// Tokenized train/validation splits, plus where they came from.
#[derive(Debug, Clone)]
pub struct TokenizedSplits {
    /// Training examples.
    pub train: Vec<TokenizedExample>,
    /// Validation examples, possibly empty.
    pub val: Vec<TokenizedExample>,
    /// `true` when the splits were served from the cache.
    pub from_cache: bool,
}

/// A tokenized-dataset cache rooted at a directory.
#[derive(Debug, Clone)]
pub struct DatasetCache {
    root: PathBuf,
}

impl DatasetCache {
    /// Creates a cache at the given root directory.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Cache path for the training split of a dataset: the dataset path
    /// with its extension stripped, rebased under the cache root.
    #[must_use]
    pub fn train_path(&self, data_path: &Path) -> PathBuf {
        let identifier = data_path.with_extension("");
        let relative: PathBuf = identifier
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .collect();
        self.root.join(relative)
    }

    /// Cache path for the validation split: the train path with a `_val`
    /// suffix.
    #[must_use]
    pub fn val_path(&self, data_path: &Path) -> PathBuf {
        let train = self.train_path(data_path);
        let name = train
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        train.with_file_name(format!("{name}_val"))
    }

    /// Writes tokenized examples as JSONL.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be written.
    pub fn save(&self, path: &Path, examples: &[TokenizedExample]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut writer = BufWriter::new(File::create(path)?);
        for example in examples {
            serde_json::to_writer(&mut writer, example)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Reads tokenized examples back from JSONL.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be read or a line fails to
    /// parse.
    pub fn load(&self, path: &Path) -> Result<Vec<TokenizedExample>> {
        let reader = BufReader::new(
            File::open(path).map_err(|e| Error::dataset(format!("{}: {e}", path.display())))?,
        );
        let mut examples = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            examples.push(serde_json::from_str(&line)?);
        }
        Ok(examples)
    }

    /// Produces the tokenized train/validation splits for a run.
    ///
    /// On a cache hit the splits are loaded as-is and the encoder is never
    /// called. On a miss the raw data is loaded, split (carving out
    /// `val_set_size` examples unless a second evaluation set is given),
    /// shuffled, tokenized and persisted.
    ///
    /// # Errors
    ///
    /// Propagates dataset, tokenization and I/O failures.
    pub fn prepare_splits<E: TextEncoder + ?Sized>(
        &self,
        encoder: &E,
        prompter: &Prompter,
        options: TokenizeOptions,
        data_path: &Path,
        eval_path: Option<&Path>,
        val_set_size: usize,
    ) -> Result<TokenizedSplits> {
        let train_path = self.train_path(data_path);
        let val_path = self.val_path(data_path);
        let wants_val = eval_path.is_some() || val_set_size > 0;

        if train_path.exists() {
            info!(path = %train_path.display(), "Loading tokenized dataset from cache");
            let train = self.load(&train_path)?;
            let val = if wants_val {
                self.load(&val_path)?
            } else {
                Vec::new()
            };
            return Ok(TokenizedSplits {
                train,
                val,
                from_cache: true,
            });
        }

        info!(path = %data_path.display(), "Tokenizing dataset");
        let examples = load_examples(data_path)?;
        let (mut train_raw, mut val_raw) = match eval_path {
            Some(eval_path) => (examples, load_examples(eval_path)?),
            None => {
                let splits = split_train_val(examples, val_set_size)?;
                (splits.train, splits.val)
            }
        };

        let mut rng = rand::thread_rng();
        train_raw.shuffle(&mut rng);
        val_raw.shuffle(&mut rng);

        let train = train_raw
            .iter()
            .map(|example| tokenize_prompt(encoder, prompter, example, options))
            .collect::<Result<Vec<_>>>()?;
        let val = val_raw
            .iter()
            .map(|example| tokenize_prompt(encoder, prompter, example, options))
            .collect::<Result<Vec<_>>>()?;

        self.save(&train_path, &train)?;
        if !val.is_empty() {
            self.save(&val_path, &val)?;
        }
        info!(
            train = train.len(),
            val = val.len(),
            cache = %train_path.display(),
            "Tokenized dataset persisted"
        );

        Ok(TokenizedSplits {
            train,
            val,
            from_cache: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::dataset::Example;

    /// Word-length encoder that counts its encode calls.
    struct CountingEncoder {
        calls: Cell<usize>,
    }

    impl CountingEncoder {
        fn new() -> Self {
            Self { calls: Cell::new(0) }
        }
    }

    impl TextEncoder for CountingEncoder {
        fn encode(&self, text: &str) -> vapula_core::Result<Vec<u32>> {
            self.calls.set(self.calls.get() + 1);
            #[allow(clippy::cast_possible_truncation)]
            Ok(text.split_whitespace().map(|w| w.len() as u32).collect())
        }

        fn eos_token_id(&self) -> Option<u32> {
            Some(99)
        }
    }

    fn write_dataset(dir: &Path, name: &str, count: usize) -> PathBuf {
        let examples: Vec<Example> = (0..count)
            .map(|n| Example {
                instruction: format!("task number {n}"),
                input: None,
                output: format!("answer {n}"),
            })
            .collect();
        let path = dir.join(name);
        fs::write(&path, serde_json::to_string(&examples).unwrap()).unwrap();
        path
    }

    #[test]
    fn cache_paths_strip_extension_and_suffix_val() {
        let cache = DatasetCache::new("/tmp/tokenized");
        let data = Path::new("data/alpaca.json");
        assert_eq!(
            cache.train_path(data),
            Path::new("/tmp/tokenized/data/alpaca")
        );
        assert_eq!(
            cache.val_path(data),
            Path::new("/tmp/tokenized/data/alpaca_val")
        );
    }

    #[test]
    fn miss_tokenizes_then_hit_skips_encoder() {
        let dir = tempfile::tempdir().unwrap();
        let data_path = write_dataset(dir.path(), "train.json", 20);
        let cache = DatasetCache::new(dir.path().join("tokenized"));
        let prompter = Prompter::from_spec("alpaca_short").unwrap();
        let options = TokenizeOptions::default();

        let encoder = CountingEncoder::new();
        let first = cache
            .prepare_splits(&encoder, &prompter, options, &data_path, None, 5)
            .unwrap();
        assert!(!first.from_cache);
        assert_eq!(first.train.len(), 15);
        assert_eq!(first.val.len(), 5);
        assert!(encoder.calls.get() > 0);

        let encoder = CountingEncoder::new();
        let second = cache
            .prepare_splits(&encoder, &prompter, options, &data_path, None, 5)
            .unwrap();
        assert!(second.from_cache);
        assert_eq!(encoder.calls.get(), 0);
        assert_eq!(second.train.len(), first.train.len());
        assert_eq!(second.val.len(), first.val.len());
    }

    #[test]
    fn second_eval_set_used_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let data_path = write_dataset(dir.path(), "train.json", 8);
        let eval_path = write_dataset(dir.path(), "eval.json", 3);
        let cache = DatasetCache::new(dir.path().join("tokenized"));
        let prompter = Prompter::from_spec("alpaca_short").unwrap();

        let encoder = CountingEncoder::new();
        let splits = cache
            .prepare_splits(
                &encoder,
                &prompter,
                TokenizeOptions::default(),
                &data_path,
                Some(&eval_path),
                2000,
            )
            .unwrap();
        assert_eq!(splits.train.len(), 8);
        assert_eq!(splits.val.len(), 3);
    }

    #[test]
    fn zero_val_size_means_no_validation_split() {
        let dir = tempfile::tempdir().unwrap();
        let data_path = write_dataset(dir.path(), "train.json", 6);
        let cache = DatasetCache::new(dir.path().join("tokenized"));
        let prompter = Prompter::from_spec("alpaca_short").unwrap();

        let encoder = CountingEncoder::new();
        let splits = cache
            .prepare_splits(
                &encoder,
                &prompter,
                TokenizeOptions::default(),
                &data_path,
                None,
                0,
            )
            .unwrap();
        assert_eq!(splits.train.len(), 6);
        assert!(splits.val.is_empty());
        assert!(!cache.val_path(&data_path).exists());

        // Hit path with no validation split wanted.
        let encoder = CountingEncoder::new();
        let again = cache
            .prepare_splits(
                &encoder,
                &prompter,
                TokenizeOptions::default(),
                &data_path,
                None,
                0,
            )
            .unwrap();
        assert!(again.from_cache);
        assert!(again.val.is_empty());
        assert_eq!(encoder.calls.get(), 0);
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DatasetCache::new(dir.path());
        let examples = vec![
            TokenizedExample {
                input_ids: vec![1, 2, 99],
                attention_mask: vec![1, 1, 1],
                labels: vec![-100, 2, 99],
            },
            TokenizedExample {
                input_ids: vec![4],
                attention_mask: vec![1],
                labels: vec![4],
            },
        ];
        let path = dir.path().join("split");
        cache.save(&path, &examples).unwrap();
        assert_eq!(cache.load(&path).unwrap(), examples);
    }
}
