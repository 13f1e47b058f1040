//! Instruction datasets: loading, splitting, random access.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use vapula_core::{Error, Result};

use crate::tokenize::TokenizedExample;

/// Shuffle seed for the train/validation carve-out. Fixed so the split is
/// reproducible across runs; the later pre-tokenization shuffles are not.
pub const SPLIT_SEED: u64 = 42;

/// One instruction-tuning record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Example {
    /// Task description.
    pub instruction: String,
    /// Optional additional context.
    #[serde(default)]
    pub input: Option<String>,
    /// Expected response.
    pub output: String,
}

/// Random access over tokenized training examples.
pub trait Dataset: Send + Sync {
    /// Number of examples.
    fn len(&self) -> usize;

    /// Returns `true` if the dataset has no examples.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the example at `index`, or `None` out of bounds.
    fn get(&self, index: usize) -> Option<TokenizedExample>;
}

/// A dataset materialized in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDataset {
    examples: Vec<TokenizedExample>,
}

impl InMemoryDataset {
    /// Creates a dataset from tokenized examples.
    #[must_use]
    pub fn new(examples: Vec<TokenizedExample>) -> Self {
        Self { examples }
    }

    /// Wraps the dataset for shared ownership.
    #[must_use]
    pub fn into_shared(self) -> Arc<dyn Dataset> {
        Arc::new(self)
    }
}

impl Dataset for InMemoryDataset {
    fn len(&self) -> usize {
        self.examples.len()
    }

    fn get(&self, index: usize) -> Option<TokenizedExample> {
        self.examples.get(index).cloned()
    }
}

/// Loads instruction examples from a JSON array file, or JSONL when the
/// path has a `.jsonl` extension.
///
/// # Errors
///
/// Returns [`Error::Dataset`] when the file cannot be read or any record
/// fails to parse. Malformed records are never skipped.
pub fn load_examples(path: impl AsRef<Path>) -> Result<Vec<Example>> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path)
        .map_err(|e| Error::dataset(format!("{}: {e}", path.display())))?;

    if path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
        raw.lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(n, line)| {
                serde_json::from_str(line).map_err(|e| {
                    Error::dataset(format!("{} line {}: {e}", path.display(), n + 1))
                })
            })
            .collect()
    } else {
        serde_json::from_str(&raw).map_err(|e| Error::dataset(format!("{}: {e}", path.display())))
    }
}

/// Raw train/validation split, before tokenization.
#[derive(Debug, Clone)]
pub struct RawSplits {
    /// Training examples.
    pub train: Vec<Example>,
    /// Validation examples, possibly empty.
    pub val: Vec<Example>,
}

/// Carves `val_set_size` examples out of the training data with the fixed
/// [`SPLIT_SEED`] shuffle. A zero size yields an empty validation split.
///
/// # Errors
///
/// Returns [`Error::Dataset`] when the requested validation size does not
/// leave any training data.
pub fn split_train_val(mut examples: Vec<Example>, val_set_size: usize) -> Result<RawSplits> {
    if val_set_size == 0 {
        return Ok(RawSplits {
            train: examples,
            val: Vec::new(),
        });
    }
    if val_set_size >= examples.len() {
        return Err(Error::dataset(format!(
            "validation set size {val_set_size} leaves no training data ({} examples)",
            examples.len()
        )));
    }

    let mut rng = StdRng::seed_from_u64(SPLIT_SEED);
    examples.shuffle(&mut rng);
    let train = examples.split_off(val_set_size);
    Ok(RawSplits {
        train,
        val: examples,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example(n: usize) -> Example {
        Example {
            instruction: format!("instruction {n}"),
            input: None,
            output: format!("output {n}"),
        }
    }

    fn examples(n: usize) -> Vec<Example> {
        (0..n).map(example).collect()
    }

    #[test]
    fn loads_json_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        fs::write(
            &path,
            r#"[{"instruction":"a","input":"b","output":"c"},
                {"instruction":"d","output":"e"}]"#,
        )
        .unwrap();
        let loaded = load_examples(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].input.as_deref(), Some("b"));
        assert_eq!(loaded[1].input, None);
    }

    #[test]
    fn loads_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.jsonl");
        fs::write(
            &path,
            "{\"instruction\":\"a\",\"output\":\"b\"}\n\n{\"instruction\":\"c\",\"output\":\"d\"}\n",
        )
        .unwrap();
        let loaded = load_examples(&path).unwrap();
        assert_eq!(loaded.len(), 2);
    }

    #[test]
    fn malformed_record_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.jsonl");
        fs::write(&path, "{\"instruction\":\"a\",\"output\":\"b\"}\n{not json}\n").unwrap();
        assert!(load_examples(&path).is_err());
    }

    #[test]
    fn split_is_deterministic() {
        let a = split_train_val(examples(100), 10).unwrap();
        let b = split_train_val(examples(100), 10).unwrap();
        assert_eq!(a.train, b.train);
        assert_eq!(a.val, b.val);
        assert_eq!(a.train.len(), 90);
        assert_eq!(a.val.len(), 10);
    }

    #[test]
    fn zero_val_size_keeps_everything() {
        let splits = split_train_val(examples(10), 0).unwrap();
        assert_eq!(splits.train.len(), 10);
        assert!(splits.val.is_empty());
    }

    #[test]
    fn oversized_val_is_rejected() {
        assert!(split_train_val(examples(10), 10).is_err());
    }

    #[test]
    fn in_memory_dataset_random_access() {
        let data = InMemoryDataset::new(vec![TokenizedExample {
            input_ids: vec![1, 2],
            attention_mask: vec![1, 1],
            labels: vec![1, 2],
        }]);
        assert_eq!(data.len(), 1);
        assert!(data.get(0).is_some());
        assert!(data.get(1).is_none());
    }
}
