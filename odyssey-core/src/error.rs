//! Error types shared by the Odyssey crates.

use thiserror::Error;

/// Top-level error type for data loading and attribution.
#[derive(Debug, Error)]
pub enum OdysseyError {
    #[error("Shape mismatch in {context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        context: String,
        expected: String,
        actual: String,
    },

    #[error("Degraded gradient at step {step} (alpha = {alpha:.4}): {reason}")]
    DegradedGradient {
        step: usize,
        alpha: f64,
        reason: String,
    },

    #[error("Empty batch: {0}")]
    EmptyBatch(String),

    #[error("Missing label: {0}")]
    MissingLabel(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl OdysseyError {
    pub fn shape_mismatch(
        context: impl Into<String>,
        expected: impl std::fmt::Display,
        actual: impl std::fmt::Display,
    ) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    pub fn degraded_gradient(step: usize, alpha: f64, reason: impl Into<String>) -> Self {
        Self::DegradedGradient {
            step,
            alpha,
            reason: reason.into(),
        }
    }

    pub fn empty_batch(msg: impl Into<String>) -> Self {
        Self::EmptyBatch(msg.into())
    }

    pub fn missing_label(msg: impl Into<String>) -> Self {
        Self::MissingLabel(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn tokenizer(msg: impl Into<String>) -> Self {
        Self::Tokenizer(msg.into())
    }

    pub fn dataset(msg: impl Into<String>) -> Self {
        Self::Dataset(msg.into())
    }

    pub fn model(msg: impl Into<String>) -> Self {
        Self::Model(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }
}

/// Convenience alias used across the workspace.
pub type Result<T> = std::result::Result<T, OdysseyError>;
