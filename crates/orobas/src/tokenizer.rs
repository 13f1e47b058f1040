//! Tokenizer wrapper for text encoding.

use std::path::Path;

use vapula_core::{Error, Result};

use crate::tokenize::TextEncoder;

/// Wrapper around a `tokenizers` tokenizer, with the special-token ids the
/// tokenization pipeline needs.
pub struct Tokenizer {
    inner: tokenizers::Tokenizer,
    /// End of sequence token ID.
    pub eos_token_id: Option<u32>,
    /// Padding token ID.
    pub pad_token_id: Option<u32>,
}

impl Tokenizer {
    /// Loads a tokenizer from a `tokenizer.json` file.
    ///
    /// # Errors
    ///
    /// Returns an error if the tokenizer cannot be loaded.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_file(path)
            .map_err(|e| Error::tokenization(e.to_string()))?;
        Ok(Self::from_tokenizer(inner))
    }

    /// Fetches a tokenizer by pre-trained model name.
    ///
    /// # Errors
    ///
    /// Returns an error if the tokenizer cannot be fetched or parsed.
    pub fn from_pretrained(name: &str) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_pretrained(name, None)
            .map_err(|e| Error::tokenization(e.to_string()))?;
        Ok(Self::from_tokenizer(inner))
    }

    fn from_tokenizer(inner: tokenizers::Tokenizer) -> Self {
        let added = inner.get_added_vocabulary().get_vocab();
        let eos_token_id = added
            .get("</s>")
            .or_else(|| added.get("<|end_of_text|>"))
            .or_else(|| added.get("<|eot_id|>"))
            .copied();
        let pad_token_id = added
            .get("<pad>")
            .or_else(|| added.get("[PAD]"))
            .copied();

        Self {
            inner,
            eos_token_id,
            pad_token_id,
        }
    }

    /// Encodes text to token IDs.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, add_special_tokens)
            .map_err(|e| Error::tokenization(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Returns the vocabulary size.
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    /// Returns the token ID for a given token string.
    #[must_use]
    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.inner.token_to_id(token)
    }
}

impl TextEncoder for Tokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        // Leading special tokens (BOS) are wanted; the trailing EOS is the
        // pipeline's decision, so it is not requested here.
        Tokenizer::encode(self, text, true)
    }

    fn eos_token_id(&self) -> Option<u32> {
        self.eos_token_id
    }
}
