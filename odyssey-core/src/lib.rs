//! # Odyssey Core
//!
//! Core library for the Odyssey clinical-sequence toolkit.
//! Provides configuration, the error taxonomy, model hyper-parameter files,
//! encoded sequences, the concept tokenizer, and finetuning datasets.

pub mod config;
pub mod dataset;
pub mod error;
pub mod model_config;
pub mod sequence;
pub mod tokenizer;

// Re-export commonly used types at the crate root.
pub use config::{
    AttributionConfig, BaselineConfig, BaselineKind, OdysseyConfig, RiemannRule, ScoreTarget,
    config_exists, load_config,
};
pub use dataset::{Example, FinetuneDataset, FinetuneMultiDataset, MultiTaskIndex, PatientRecord};
pub use error::{OdysseyError, Result};
pub use model_config::{ArchitectureConfig, ModelConfig, ModelConfigFile};
pub use sequence::{Channels, EncodedSequence};
pub use tokenizer::ConceptTokenizer;
