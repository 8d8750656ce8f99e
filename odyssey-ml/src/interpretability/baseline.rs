//! Baselines: the "no information" inputs attribution is measured against.

use crate::model::{Embedding, ModelProvider};
use odyssey_core::config::{BaselineConfig, BaselineKind};
use odyssey_core::error::{OdysseyError, Result};
use odyssey_core::sequence::EncodedSequence;
use odyssey_core::tokenizer::ConceptTokenizer;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// A reference input for one attribution.
#[derive(Debug, Clone, PartialEq)]
pub enum Baseline {
    /// A sequence embedded by the model like any input.
    Sequence(EncodedSequence),
    /// The all-zero point in embedding space.
    ZeroEmbedding,
}

impl Baseline {
    /// Embedding-space point for this baseline, shaped like `input`.
    pub fn embed<M: ModelProvider + ?Sized>(
        &self,
        model: &M,
        input: &Embedding,
    ) -> Result<Embedding> {
        match self {
            Baseline::Sequence(seq) => {
                let embedding = model.embed(seq)?;
                input.ensure_same_shape(&embedding, "baseline embedding")?;
                Ok(embedding)
            }
            Baseline::ZeroEmbedding => Ok(Embedding::zeros(input.seq_len(), input.dim())),
        }
    }
}

/// One expected-gradients draw: a reference sequence and its interpolation fraction.
#[derive(Debug, Clone, PartialEq)]
pub struct SampledBaseline {
    pub sequence: EncodedSequence,
    pub alpha: f64,
}

/// Builds fixed and sampled baselines from an explicit configuration.
#[derive(Debug, Clone)]
pub struct BaselineProvider {
    config: BaselineConfig,
    pad_id: u32,
    mask_id: u32,
    first_concept_id: u32,
    rng: StdRng,
}

impl BaselineProvider {
    pub fn new(config: BaselineConfig, tokenizer: &ConceptTokenizer) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            pad_id: tokenizer.pad_token_id(),
            mask_id: tokenizer.mask_token_id(),
            first_concept_id: tokenizer.first_token_index(),
            rng,
        }
    }

    pub fn config(&self) -> &BaselineConfig {
        &self.config
    }

    /// Deterministic baseline for `sequence`.
    ///
    /// `padding` and `mask` replace every concept id with `[PAD]`/`[MASK]`
    /// while special tokens, auxiliary channels and the attention mask stay put.
    pub fn fixed(&self, sequence: &EncodedSequence) -> Result<Baseline> {
        let replacement = match self.config.kind {
            BaselineKind::Zero => return Ok(Baseline::ZeroEmbedding),
            BaselineKind::Padding => self.pad_id,
            BaselineKind::Mask => self.mask_id,
        };
        let ids = sequence
            .concept_ids()
            .iter()
            .map(|&id| {
                if id >= self.first_concept_id {
                    replacement
                } else {
                    id
                }
            })
            .collect();
        Ok(Baseline::Sequence(sequence.with_concept_ids(ids)?))
    }

    /// Draw `k` reference sequences uniformly (with replacement) from `pool`,
    /// each paired with an interpolation fraction drawn from `U(0, 1)`.
    ///
    /// Labels play no part in the draw.
    pub fn sample(&mut self, pool: &[EncodedSequence], k: usize) -> Result<Vec<SampledBaseline>> {
        if k == 0 {
            return Err(OdysseyError::invalid_input(
                "expected gradients needs at least one baseline",
            ));
        }
        if pool.is_empty() {
            return Err(OdysseyError::empty_batch("baseline reference pool is empty"));
        }
        Ok((0..k)
            .map(|_| {
                let idx = self.rng.gen_range(0..pool.len());
                SampledBaseline {
                    sequence: pool[idx].clone(),
                    alpha: self.rng.r#gen::<f64>(),
                }
            })
            .collect())
    }
}
