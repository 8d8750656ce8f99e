//! # odyssey-ml: Attribution Reports for Clinical-Sequence Classifiers
//!
//! Explains the predictions of a finetuned sequence classifier by attributing
//! its class score to input tokens and embedding dimensions.
//!
//! ## Layers
//!
//! 1. **Model**: the [`ModelProvider`] capability over embedding tensors, with a
//!    reference embedding classifier that has closed-form gradients
//! 2. **Estimators**: integrated gradients against a fixed baseline and
//!    expected gradients over sampled baselines
//! 3. **Reports**: batch aggregation and token-level renderings, plus ROC
//!    comparison of saved predictions

pub mod eval;
pub mod interpretability;
pub mod model;

// Re-exports
pub use interpretability::{
    Attribution, AttributionReport, BaselineProvider, ExpectedGradients, IntegratedGradients,
    Interpreter, Rendering,
};
pub use model::{ClassScore, Embedding, EmbeddingClassifier, ModelProvider, ScoreGradient};
