//! Error types for the transformer core.

use thiserror::Error;

/// Errors raised while building or running the transformer.
#[derive(Debug, Error)]
pub enum TransformerError {
    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Activation name outside the supported set.
    #[error("Unknown activation '{name}', expected one of: {valid}")]
    UnknownActivation { name: String, valid: String },

    /// Neither an image nor a text stream was supplied.
    #[error("Invalid configuration: no image or text input to attend over")]
    MissingModality,

    /// A documented but unsupported combination of options.
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// No decoder registered for the requested pair.
    #[error("No decoder registered for task '{task}' / dataset '{dataset}'")]
    UnknownDecoder { task: String, dataset: String },

    /// Task index outside the embedding table.
    #[error("Task index {index} out of range, table holds {capacity} tasks")]
    TaskIndexOutOfRange { index: usize, capacity: usize },

    /// Task embedding injection is enabled but no task index was given.
    #[error("Invalid configuration: task embedding is enabled but no task index was given")]
    MissingTaskIndex,

    /// Tensor shapes do not line up.
    #[error("Shape error: {0}")]
    Shape(String),

    #[error("Layout error: {0}")]
    Layout(#[from] ndarray::ShapeError),

    #[error("Config parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransformerError {
    pub(crate) fn shape(msg: impl Into<String>) -> Self {
        TransformerError::Shape(msg.into())
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        TransformerError::InvalidConfig(msg.into())
    }
}

/// Result type for transformer operations.
pub type Result<T> = std::result::Result<T, TransformerError>;
