//! Reference embedding classifier.
//!
//! Sums per-channel embeddings (concept, type, visit segment, visit order,
//! plus sinusoidal age and time features), mean-pools the attended positions,
//! and applies a linear head. Small enough to differentiate in closed form,
//! which makes it a convenient stand-in for a finetuned checkpoint.

use super::provider::ModelProvider;
use super::tensor::Embedding;
use odyssey_core::error::{OdysseyError, Result};
use odyssey_core::model_config::ArchitectureConfig;
use odyssey_core::sequence::EncodedSequence;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A `rows x dim` lookup table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingTable {
    rows: usize,
    dim: usize,
    weights: Vec<f64>,
}

impl EmbeddingTable {
    fn zeros(rows: usize, dim: usize) -> Self {
        Self {
            rows,
            dim,
            weights: vec![0.0; rows * dim],
        }
    }

    fn random(rows: usize, dim: usize, scale: f64, rng: &mut StdRng) -> Self {
        let weights = (0..rows * dim).map(|_| rng.gen_range(-scale..scale)).collect();
        Self { rows, dim, weights }
    }

    fn lookup(&self, id: u32, channel: &str) -> Result<&[f64]> {
        let id = id as usize;
        if id >= self.rows {
            return Err(OdysseyError::model(format!(
                "{channel} id {id} out of range for table with {} rows",
                self.rows
            )));
        }
        Ok(&self.weights[id * self.dim..(id + 1) * self.dim])
    }

    fn validate(&self, name: &str, dim: usize) -> Result<()> {
        if self.dim != dim || self.weights.len() != self.rows * self.dim {
            return Err(OdysseyError::model(format!(
                "table '{name}' has inconsistent shape ({} rows, dim {}, {} weights)",
                self.rows,
                self.dim,
                self.weights.len()
            )));
        }
        Ok(())
    }

    pub fn row_mut(&mut self, id: usize) -> &mut [f64] {
        &mut self.weights[id * self.dim..(id + 1) * self.dim]
    }
}

/// Embedding-bag classifier over encoded patient sequences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingClassifier {
    dim: usize,
    num_labels: usize,
    concepts: EmbeddingTable,
    types: EmbeddingTable,
    visit_segments: EmbeddingTable,
    visit_orders: EmbeddingTable,
    /// Add sinusoidal age/time features to every position.
    #[serde(default)]
    time_features: bool,
    /// `num_labels x dim`, row-major.
    head_weights: Vec<f64>,
    head_bias: Vec<f64>,
}

/// Visit segments alternate between two ids after the padding id.
const NUM_VISIT_SEGMENTS: usize = 3;

impl EmbeddingClassifier {
    /// Zero-initialised classifier sized from the architecture config.
    pub fn new(arch: &ArchitectureConfig, vocab_size: usize) -> Self {
        let dim = arch.embedding_size;
        Self {
            dim,
            num_labels: arch.num_labels,
            concepts: EmbeddingTable::zeros(vocab_size, dim),
            types: EmbeddingTable::zeros(arch.type_vocab_size, dim),
            visit_segments: EmbeddingTable::zeros(NUM_VISIT_SEGMENTS, dim),
            visit_orders: EmbeddingTable::zeros(arch.max_num_visits, dim),
            time_features: false,
            head_weights: vec![0.0; arch.num_labels * dim],
            head_bias: vec![0.0; arch.num_labels],
        }
    }

    /// Classifier with uniform random weights in `[-0.02, 0.02)`, reproducible from `seed`.
    pub fn random(arch: &ArchitectureConfig, vocab_size: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let dim = arch.embedding_size;
        let scale = 0.02;
        let head_weights = (0..arch.num_labels * dim)
            .map(|_| rng.gen_range(-scale..scale))
            .collect();
        Self {
            dim,
            num_labels: arch.num_labels,
            concepts: EmbeddingTable::random(vocab_size, dim, scale, &mut rng),
            types: EmbeddingTable::random(arch.type_vocab_size, dim, scale, &mut rng),
            visit_segments: EmbeddingTable::random(NUM_VISIT_SEGMENTS, dim, scale, &mut rng),
            visit_orders: EmbeddingTable::random(arch.max_num_visits, dim, scale, &mut rng),
            time_features: false,
            head_weights,
            head_bias: vec![0.0; arch.num_labels],
        }
    }

    pub fn with_time_features(mut self, enabled: bool) -> Self {
        self.time_features = enabled;
        self
    }

    /// Load a JSON checkpoint.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let model = Self::from_json(&content)?;
        tracing::info!(
            path = %path.display(),
            dim = model.dim,
            vocab = model.concepts.rows,
            labels = model.num_labels,
            "Loaded classifier checkpoint"
        );
        Ok(model)
    }

    /// Parse and validate checkpoint JSON.
    pub fn from_json(content: &str) -> Result<Self> {
        let model: Self = serde_json::from_str(content)?;
        model.validate()?;
        Ok(model)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        self.concepts.validate("concepts", self.dim)?;
        self.types.validate("types", self.dim)?;
        self.visit_segments.validate("visit_segments", self.dim)?;
        self.visit_orders.validate("visit_orders", self.dim)?;
        if self.head_weights.len() != self.num_labels * self.dim
            || self.head_bias.len() != self.num_labels
        {
            return Err(OdysseyError::model(format!(
                "classifier head does not match {} labels x dim {}",
                self.num_labels, self.dim
            )));
        }
        Ok(())
    }

    pub fn vocab_size(&self) -> usize {
        self.concepts.rows
    }

    pub fn concept_row_mut(&mut self, id: usize) -> &mut [f64] {
        self.concepts.row_mut(id)
    }

    pub fn head_row_mut(&mut self, class: usize) -> &mut [f64] {
        &mut self.head_weights[class * self.dim..(class + 1) * self.dim]
    }

    pub fn set_bias(&mut self, class: usize, bias: f64) {
        self.head_bias[class] = bias;
    }

    fn head_row(&self, class: usize) -> &[f64] {
        &self.head_weights[class * self.dim..(class + 1) * self.dim]
    }

    fn check_mask(&self, embedding: &Embedding, attention_mask: &[u8]) -> Result<()> {
        if embedding.dim() != self.dim {
            return Err(OdysseyError::shape_mismatch(
                "classifier input dim",
                self.dim,
                embedding.dim(),
            ));
        }
        if attention_mask.len() != embedding.seq_len() {
            return Err(OdysseyError::shape_mismatch(
                "attention mask",
                embedding.seq_len(),
                attention_mask.len(),
            ));
        }
        Ok(())
    }
}

/// Transformer-style sinusoidal encoding of a scalar, added in place.
fn add_sinusoid(row: &mut [f64], value: f64) {
    let dim = row.len();
    for (k, slot) in row.iter_mut().enumerate() {
        let freq = 1.0 / 10_000f64.powf((2 * (k / 2)) as f64 / dim as f64);
        *slot += if k % 2 == 0 {
            (value * freq).sin()
        } else {
            (value * freq).cos()
        };
    }
}

impl ModelProvider for EmbeddingClassifier {
    fn num_labels(&self) -> usize {
        self.num_labels
    }

    fn embedding_dim(&self) -> usize {
        self.dim
    }

    fn embed(&self, sequence: &EncodedSequence) -> Result<Embedding> {
        let channels = sequence.channels();
        let mut embedding = Embedding::zeros(sequence.len(), self.dim);
        for (i, &concept) in sequence.concept_ids().iter().enumerate() {
            let row = embedding.row_mut(i);
            let parts = [
                self.concepts.lookup(concept, "concept")?,
                self.types.lookup(channels.type_ids[i], "type")?,
                self.visit_segments
                    .lookup(channels.visit_segments[i], "visit segment")?,
                self.visit_orders.lookup(channels.visit_orders[i], "visit order")?,
            ];
            for part in parts {
                for (slot, w) in row.iter_mut().zip(part) {
                    *slot += w;
                }
            }
            if self.time_features {
                add_sinusoid(row, f64::from(channels.ages[i]));
                add_sinusoid(row, f64::from(channels.time_stamps[i]));
            }
        }
        Ok(embedding)
    }

    fn logits(&self, embedding: &Embedding, attention_mask: &[u8]) -> Result<Vec<f64>> {
        self.check_mask(embedding, attention_mask)?;
        let valid = attention_mask.iter().filter(|&&m| m != 0).count();

        let mut pooled = vec![0.0; self.dim];
        if valid > 0 {
            for (i, &m) in attention_mask.iter().enumerate() {
                if m == 0 {
                    continue;
                }
                for (p, v) in pooled.iter_mut().zip(embedding.row(i)) {
                    *p += v;
                }
            }
            for p in &mut pooled {
                *p /= valid as f64;
            }
        }

        Ok((0..self.num_labels)
            .map(|c| {
                self.head_row(c)
                    .iter()
                    .zip(&pooled)
                    .map(|(w, p)| w * p)
                    .sum::<f64>()
                    + self.head_bias[c]
            })
            .collect())
    }

    fn logit_gradient(
        &self,
        embedding: &Embedding,
        attention_mask: &[u8],
        class: usize,
    ) -> Result<Embedding> {
        self.check_mask(embedding, attention_mask)?;
        if class >= self.num_labels {
            return Err(OdysseyError::invalid_input(format!(
                "class {class} out of range for {} labels",
                self.num_labels
            )));
        }
        let valid = attention_mask.iter().filter(|&&m| m != 0).count();
        let mut grad = Embedding::zeros(embedding.seq_len(), self.dim);
        if valid == 0 {
            return Ok(grad);
        }
        let w = self.head_row(class);
        let inv = 1.0 / valid as f64;
        for (i, &m) in attention_mask.iter().enumerate() {
            if m == 0 {
                continue;
            }
            for (g, wk) in grad.row_mut(i).iter_mut().zip(w) {
                *g = wk * inv;
            }
        }
        Ok(grad)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use odyssey_core::sequence::Channels;

    fn arch(dim: usize) -> ArchitectureConfig {
        ArchitectureConfig {
            embedding_size: dim,
            num_labels: 2,
            max_seq_length: 8,
            type_vocab_size: 4,
            max_num_visits: 8,
            ..Default::default()
        }
    }

    fn sequence(ids: Vec<u32>, mask: Vec<u8>) -> EncodedSequence {
        let len = ids.len();
        EncodedSequence::new(
            ids,
            mask,
            Channels {
                type_ids: vec![1; len],
                ages: vec![65; len],
                time_stamps: vec![0; len],
                visit_orders: vec![0; len],
                visit_segments: vec![1; len],
            },
        )
        .unwrap()
    }

    #[test]
    fn test_embed_sums_channels() {
        let mut model = EmbeddingClassifier::new(&arch(2), 10);
        model.concept_row_mut(7).copy_from_slice(&[1.0, 2.0]);
        model.types.row_mut(1).copy_from_slice(&[0.5, 0.5]);
        let emb = model.embed(&sequence(vec![7, 0], vec![1, 0])).unwrap();
        assert_eq!(emb.row(0), &[1.5, 2.5]);
        assert_eq!(emb.row(1), &[0.5, 0.5]);
    }

    #[test]
    fn test_out_of_range_concept() {
        let model = EmbeddingClassifier::new(&arch(2), 10);
        let err = model.embed(&sequence(vec![42], vec![1])).unwrap_err();
        assert!(matches!(err, OdysseyError::Model(_)));
    }

    #[test]
    fn test_logits_ignore_padding() {
        let mut model = EmbeddingClassifier::new(&arch(2), 10);
        model.head_row_mut(1).copy_from_slice(&[1.0, 0.0]);
        model.set_bias(1, 0.25);
        let emb = Embedding::from_rows(vec![vec![2.0, 0.0], vec![100.0, 0.0]]).unwrap();
        let logits = model.logits(&emb, &[1, 0]).unwrap();
        assert_eq!(logits, vec![0.0, 2.25]);
    }

    #[test]
    fn test_gradient_is_head_over_valid_count() {
        let mut model = EmbeddingClassifier::new(&arch(2), 10);
        model.head_row_mut(1).copy_from_slice(&[1.0, -2.0]);
        let emb = Embedding::zeros(3, 2);
        let grad = model.logit_gradient(&emb, &[1, 1, 0], 1).unwrap();
        assert_eq!(grad.row(0), &[0.5, -1.0]);
        assert_eq!(grad.row(2), &[0.0, 0.0]);
    }

    #[test]
    fn test_mask_length_mismatch() {
        let model = EmbeddingClassifier::new(&arch(2), 10);
        let emb = Embedding::zeros(3, 2);
        assert!(matches!(
            model.logits(&emb, &[1, 1]),
            Err(OdysseyError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_checkpoint_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        let model = EmbeddingClassifier::random(&arch(4), 12, 5).with_time_features(true);
        model.save(&path).unwrap();
        let loaded = EmbeddingClassifier::load(&path).unwrap();
        assert_eq!(loaded.vocab_size(), 12);
        assert!(loaded.time_features);

        let seq = sequence(vec![7, 8, 0], vec![1, 1, 0]);
        let a = model.predict_proba(&seq).unwrap();
        let b = loaded.predict_proba(&seq).unwrap();
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-12);
        }
    }

    #[test]
    fn test_random_is_reproducible() {
        let a = EmbeddingClassifier::random(&arch(4), 12, 5);
        let b = EmbeddingClassifier::random(&arch(4), 12, 5);
        let c = EmbeddingClassifier::random(&arch(4), 12, 6);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
