//! Error types for the fconv model.

use thiserror::Error;

/// Errors raised while configuring, loading, or running the model.
///
/// Library functions return `anyhow::Result`; callers that need to branch on
/// the failure kind can `downcast_ref::<FConvError>()`.
#[derive(Debug, Error)]
pub enum FConvError {
    /// The configuration is inconsistent.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A layer or attention expression could not be parsed.
    #[error("Failed to parse '{expr}' at offset {offset}: {reason}")]
    InvalidExpression {
        expr: String,
        offset: usize,
        reason: String,
    },

    /// An input tensor does not have the expected shape.
    #[error("Shape mismatch for {name}: expected {expected}, got {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: String,
        actual: Vec<usize>,
    },

    /// A token id is outside the embedding table.
    #[error("Token id {id} out of range for embedding table of {size} rows")]
    TokenOutOfRange { id: u32, size: usize },

    /// A position exceeds the learned positional table.
    #[error("Position {position} exceeds the maximum of {max} learned positions")]
    PositionOutOfRange { position: usize, max: usize },

    /// A required tensor is missing from the checkpoint.
    #[error("Tensor '{0}' not found in model weights")]
    MissingWeight(String),
}

impl FConvError {
    pub(crate) fn shape(name: impl Into<String>, expected: impl Into<String>, actual: &[usize]) -> Self {
        FConvError::ShapeMismatch {
            name: name.into(),
            expected: expected.into(),
            actual: actual.to_vec(),
        }
    }
}
