//! Model layer: embedding tensors and the gradient capability, plus a reference classifier.

pub mod classifier;
pub mod provider;
pub mod tensor;

pub use classifier::EmbeddingClassifier;
pub use provider::{ClassScore, ModelProvider, ScoreGradient, softmax};
pub use tensor::Embedding;
