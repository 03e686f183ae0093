//! Error types for the alignreid training system

use thiserror::Error;

/// Main error type for training operations
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Batch violates the sampling contract (e.g. an identity without a
    /// positive partner, or mismatched label/image counts)
    #[error("Malformed batch: {0}")]
    MalformedBatch(String),

    /// A loss term produced NaN or Inf; continuing would corrupt every
    /// subsequent optimizer step, so the run must abort
    #[error("Non-finite value in loss term `{term}`: {value}")]
    NonFinite {
        /// Name of the loss term that went non-finite
        term: &'static str,
        /// The offending scalar value
        value: f32,
    },

    /// Model error
    #[error("Model error: {0}")]
    Model(String),

    /// Checkpoint save/restore error
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Tensor operation error
    #[error("Tensor operation error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Other errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for training operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a malformed-batch error
    pub fn malformed_batch(msg: impl Into<String>) -> Self {
        Self::MalformedBatch(msg.into())
    }

    /// Create a non-finite loss error
    pub fn non_finite(term: &'static str, value: f32) -> Self {
        Self::NonFinite { term, value }
    }

    /// Create a model error
    pub fn model(msg: impl Into<String>) -> Self {
        Self::Model(msg.into())
    }

    /// Create a checkpoint error
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }
}
