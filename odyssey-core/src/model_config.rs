//! Model hyper-parameter file (`model_config.yaml`).
//!
//! The file maps a model family name (`bigbird`, `mamba`, ...) to its
//! architecture settings and the pretraining/finetuning loop settings.

use crate::error::{OdysseyError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Architecture settings read by the embedding layer and classifier head.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchitectureConfig {
    #[serde(default = "default_embedding_size")]
    pub embedding_size: usize,
    #[serde(default = "default_num_labels")]
    pub num_labels: usize,
    #[serde(default = "default_max_seq_length")]
    pub max_seq_length: usize,
    #[serde(default = "default_type_vocab_size")]
    pub type_vocab_size: usize,
    #[serde(default = "default_max_num_visits")]
    pub max_num_visits: usize,
    #[serde(default)]
    pub num_layers: Option<usize>,
    #[serde(default)]
    pub num_heads: Option<usize>,
    #[serde(default)]
    pub dropout_prob: Option<f64>,
}

impl Default for ArchitectureConfig {
    fn default() -> Self {
        Self {
            embedding_size: default_embedding_size(),
            num_labels: default_num_labels(),
            max_seq_length: default_max_seq_length(),
            type_vocab_size: default_type_vocab_size(),
            max_num_visits: default_max_num_visits(),
            num_layers: None,
            num_heads: None,
            dropout_prob: None,
        }
    }
}

fn default_embedding_size() -> usize {
    768
}

fn default_num_labels() -> usize {
    2
}

fn default_max_seq_length() -> usize {
    2048
}

fn default_type_vocab_size() -> usize {
    9
}

fn default_max_num_visits() -> usize {
    512
}

/// Training or finetuning loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub max_epochs: Option<usize>,
    #[serde(default)]
    pub learning_rate: Option<f64>,
    #[serde(default)]
    pub warmup: Option<usize>,
    #[serde(default)]
    pub gradient_accumulation: Option<usize>,
}

fn default_batch_size() -> usize {
    32
}

/// One model family's full settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub model: ArchitectureConfig,
    #[serde(default)]
    pub train: Option<LoopConfig>,
    #[serde(default)]
    pub finetune: Option<LoopConfig>,
}

/// Parsed `model_config.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelConfigFile {
    families: BTreeMap<String, ModelConfig>,
}

impl ModelConfigFile {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Settings for a model family.
    pub fn get(&self, family: &str) -> Result<&ModelConfig> {
        self.families
            .get(family)
            .ok_or_else(|| OdysseyError::not_found(format!("model family '{family}'")))
    }

    pub fn families(&self) -> impl Iterator<Item = &str> {
        self.families.keys().map(String::as_str)
    }
}
