//! Error types for the Vapula ecosystem.

use thiserror::Error;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the Vapula ecosystem.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration provided.
    #[error("Invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the configuration error.
        message: String,
    },

    /// Model loading error.
    #[error("Failed to load model: {message}")]
    ModelLoad {
        /// Error message.
        message: String,
    },

    /// Tokenization error.
    #[error("Tokenization error: {message}")]
    Tokenization {
        /// Error message.
        message: String,
    },

    /// Dataset loading or parsing error.
    #[error("Dataset error: {message}")]
    Dataset {
        /// Error message.
        message: String,
    },

    /// Checkpoint persistence error.
    #[error("Checkpoint error: {message}")]
    Checkpoint {
        /// Error message.
        message: String,
    },

    /// Training loop error.
    #[error("Training error: {message}")]
    Training {
        /// Error message.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Tensor backend error.
    #[error("Tensor error: {0}")]
    Candle(#[from] candle_core::Error),
}

impl Error {
    /// Returns `true` if this error is a configuration error, which is
    /// always fatal before any model or dataset loading happens.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::InvalidConfig { .. })
    }

    /// Creates an invalid-configuration error with the given message.
    #[must_use]
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Creates a model load error.
    #[must_use]
    pub fn model_load(message: impl Into<String>) -> Self {
        Self::ModelLoad {
            message: message.into(),
        }
    }

    /// Creates a tokenization error.
    #[must_use]
    pub fn tokenization(message: impl Into<String>) -> Self {
        Self::Tokenization {
            message: message.into(),
        }
    }

    /// Creates a dataset error.
    #[must_use]
    pub fn dataset(message: impl Into<String>) -> Self {
        Self::Dataset {
            message: message.into(),
        }
    }

    /// Creates a checkpoint error.
    #[must_use]
    pub fn checkpoint(message: impl Into<String>) -> Self {
        Self::Checkpoint {
            message: message.into(),
        }
    }

    /// Creates a training error.
    #[must_use]
    pub fn training(message: impl Into<String>) -> Self {
        Self::Training {
            message: message.into(),
        }
    }
}
