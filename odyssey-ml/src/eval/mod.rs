//! Evaluation of classifier predictions.

pub mod roc;

pub use roc::{ModelComparison, ModelPredictions, RocCurve, RocPoint, compare_models};
