//! Prompt tokenization with loss masking.
//!
//! Turns rendered prompts into fixed-budget token sequences with labels.
//! Labels mirror the input ids except where the loss is masked with
//! [`IGNORE_INDEX`].

use serde::{Deserialize, Serialize};
use vapula_core::Result;

use crate::dataset::Example;
use crate::prompter::Prompter;

/// Label value excluded from the loss.
pub const IGNORE_INDEX: i64 = -100;

/// Boundary to the tokenizer implementation.
///
/// The pipeline only needs raw encoding and the EOS id, so tests can stand
/// in a synthetic vocabulary and observe encode-call counts.
pub trait TextEncoder {
    /// Encodes text into token ids, without any appended special tokens.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// End-of-sequence token id, if the vocabulary defines one.
    fn eos_token_id(&self) -> Option<u32>;
}

/// One tokenized training example. All three vectors have equal length,
/// bounded by the configured cutoff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenizedExample {
    /// Token ids.
    pub input_ids: Vec<u32>,
    /// Attention mask, 1 for every real token.
    pub attention_mask: Vec<u8>,
    /// Loss labels: token ids, or [`IGNORE_INDEX`] where masked.
    pub labels: Vec<i64>,
}

impl TokenizedExample {
    /// Sequence length in tokens.
    #[must_use]
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    /// Returns `true` for an empty sequence.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }
}

/// Tokenization settings.
#[derive(Debug, Clone, Copy)]
pub struct TokenizeOptions {
    /// Maximum sequence length in tokens.
    pub cutoff_len: usize,
    /// Whether to append an EOS token when the sequence has room for one.
    pub add_eos_token: bool,
    /// Whether the prompt portion contributes to the loss.
    pub train_on_inputs: bool,
}

impl Default for TokenizeOptions {
    fn default() -> Self {
        Self {
            cutoff_len: 2048,
            add_eos_token: true,
            train_on_inputs: true,
        }
    }
}

/// Tokenizes raw text: truncate to the cutoff, append EOS when the last id
/// is not already EOS and the sequence is below the cutoff, mirror ids into
/// labels. Returns the example and whether an EOS was appended.
fn encode_text<E: TextEncoder + ?Sized>(
    encoder: &E,
    text: &str,
    options: TokenizeOptions,
) -> Result<(TokenizedExample, bool)> {
    let mut input_ids = encoder.encode(text)?;
    input_ids.truncate(options.cutoff_len);

    let mut eos_appended = false;
    if options.add_eos_token && input_ids.len() < options.cutoff_len {
        if let Some(eos) = encoder.eos_token_id() {
            if input_ids.last() != Some(&eos) {
                input_ids.push(eos);
                eos_appended = true;
            }
        }
    }

    let attention_mask = vec![1u8; input_ids.len()];
    let labels = input_ids.iter().map(|&id| i64::from(id)).collect();
    Ok((
        TokenizedExample {
            input_ids,
            attention_mask,
            labels,
        },
        eos_appended,
    ))
}

/// Tokenizes raw text with truncation, optional EOS append and mirrored
/// labels.
///
/// # Errors
///
/// Propagates encoder failures.
pub fn tokenize<E: TextEncoder + ?Sized>(
    encoder: &E,
    text: &str,
    options: TokenizeOptions,
) -> Result<TokenizedExample> {
    encode_text(encoder, text, options).map(|(example, _)| example)
}

/// Renders and tokenizes one instruction example.
///
/// With `train_on_inputs` disabled, the prompt is re-rendered without the
/// output, tokenized, and that many leading labels are overwritten with
/// [`IGNORE_INDEX`] (one fewer when the user prompt received an appended
/// EOS, so the response's first real token stays supervised).
///
/// A prompt whose instruction and input alone reach the cutoff masks every
/// label; that degenerate case is not detected here.
///
/// # Errors
///
/// Propagates encoder failures.
pub fn tokenize_prompt<E: TextEncoder + ?Sized>(
    encoder: &E,
    prompter: &Prompter,
    example: &Example,
    options: TokenizeOptions,
) -> Result<TokenizedExample> {
    let full_prompt = prompter.generate_prompt(
        &example.instruction,
        example.input.as_deref(),
        Some(&example.output),
    );
    let (mut tokenized, _) = encode_text(encoder, &full_prompt, options)?;

    if !options.train_on_inputs {
        let user_prompt =
            prompter.generate_prompt(&example.instruction, example.input.as_deref(), None);
        let (user_tokenized, eos_appended) = encode_text(encoder, &user_prompt, options)?;
        let mut masked_len = user_tokenized.len();
        if eos_appended {
            masked_len -= 1;
        }
        let masked_len = masked_len.min(tokenized.labels.len());
        for label in &mut tokenized.labels[..masked_len] {
            *label = IGNORE_INDEX;
        }
    }

    Ok(tokenized)
}
