//! # Orobas
//!
//! *"The Prince gives true answers of things past, present and to come"*
//!
//! Orobas is the data pipeline for the Vapula fine-tuning toolkit: prompt
//! templates, tokenization with loss masking, instruction-dataset loading
//! and splitting, and the tokenized-dataset cache.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod cache;
pub mod dataset;
pub mod prompter;
pub mod tokenize;
pub mod tokenizer;

pub use cache::{DatasetCache, TokenizedSplits};
pub use dataset::{load_examples, split_train_val, Dataset, Example, InMemoryDataset, RawSplits};
pub use prompter::{PromptTemplate, Prompter};
pub use tokenize::{
    tokenize, tokenize_prompt, TextEncoder, TokenizeOptions, TokenizedExample, IGNORE_INDEX,
};
pub use tokenizer::Tokenizer;
