//! Attribution runs over a batch of examples.
//!
//! [`Interpreter`] ties a model, a tokenizer and a batch of labelled examples
//! to the estimators, the aggregator and the renderer. Every operation is a
//! pure function of those inputs and the configuration; a failure on any
//! example fails the whole operation.

use super::aggregate::{
    AttributionReport, AttributionSummary, ReportKind, TokenAttribution,
    TokenIdentityAggregator, group_by_label, token_scores,
};
use super::baseline::BaselineProvider;
use super::expected::ExpectedGradients;
use super::integrated::{Attribution, IntegratedGradients};
use super::render::{RenderInput, Rendering};
use crate::model::{ClassScore, Embedding, ModelProvider};
use odyssey_core::config::AttributionConfig;
use odyssey_core::dataset::Example;
use odyssey_core::error::{OdysseyError, Result};
use odyssey_core::sequence::EncodedSequence;
use odyssey_core::tokenizer::ConceptTokenizer;

/// Batch attribution front end.
pub struct Interpreter<'a, M: ModelProvider + ?Sized> {
    model: &'a M,
    tokenizer: &'a ConceptTokenizer,
    examples: Vec<Example>,
    reference_pool: Vec<EncodedSequence>,
    config: AttributionConfig,
    integrated: IntegratedGradients,
}

impl<'a, M: ModelProvider + ?Sized> Interpreter<'a, M> {
    pub fn new(
        model: &'a M,
        tokenizer: &'a ConceptTokenizer,
        examples: Vec<Example>,
        config: AttributionConfig,
    ) -> Result<Self> {
        let integrated = IntegratedGradients::from_config(&config)?;
        Ok(Self {
            model,
            tokenizer,
            examples,
            reference_pool: Vec::new(),
            config,
            integrated,
        })
    }

    /// Sequences expected-gradient baselines are drawn from.
    /// Without one, the examples themselves are the pool.
    pub fn with_reference_pool(mut self, pool: Vec<EncodedSequence>) -> Self {
        self.reference_pool = pool;
        self
    }

    pub fn examples(&self) -> &[Example] {
        &self.examples
    }

    pub fn config(&self) -> &AttributionConfig {
        &self.config
    }

    fn ensure_examples(&self) -> Result<()> {
        if self.examples.is_empty() {
            return Err(OdysseyError::empty_batch("no examples to attribute"));
        }
        Ok(())
    }

    fn class_score<'s>(&'s self, sequence: &'s EncodedSequence) -> Result<ClassScore<'s, M>> {
        ClassScore::new(
            self.model,
            sequence.attention_mask(),
            self.config.target_class,
            self.config.score_target,
            self.config.clip_epsilon,
        )
    }

    /// Integrated gradients for one example against its fixed baseline.
    pub fn integrated_gradients(&self, example: &Example) -> Result<Attribution> {
        let provider = BaselineProvider::new(self.config.baseline.clone(), self.tokenizer);
        self.integrated_with(&provider, example)
    }

    fn integrated_with(
        &self,
        provider: &BaselineProvider,
        example: &Example,
    ) -> Result<Attribution> {
        let input = self.model.embed(&example.sequence)?;
        let baseline = provider.fixed(&example.sequence)?.embed(self.model, &input)?;
        let f = self.class_score(&example.sequence)?;
        self.integrated.attribute(&f, &input, &baseline)
    }

    fn integrated_batch(&self, examples: &[Example]) -> Result<Vec<Attribution>> {
        let provider = BaselineProvider::new(self.config.baseline.clone(), self.tokenizer);
        examples
            .iter()
            .map(|example| {
                tracing::debug!(patient = %example.patient_id, "Attributing example");
                self.integrated_with(&provider, example)
            })
            .collect()
    }

    /// Expected gradients for a slice of examples, drawing `num_baselines` per example.
    fn expected_batch(
        &self,
        examples: &[Example],
        num_baselines: usize,
    ) -> Result<Vec<Attribution>> {
        let pool: Vec<EncodedSequence> = if self.reference_pool.is_empty() {
            self.examples.iter().map(|e| e.sequence.clone()).collect()
        } else {
            self.reference_pool.clone()
        };
        let mut provider = BaselineProvider::new(self.config.baseline.clone(), self.tokenizer);
        let estimator = ExpectedGradients::new();

        let mut attributions = Vec::with_capacity(examples.len());
        for example in examples {
            let input = self.model.embed(&example.sequence)?;
            let draws = provider
                .sample(&pool, num_baselines)?
                .into_iter()
                .map(|draw| -> Result<(Embedding, f64)> {
                    Ok((self.model.embed(&draw.sequence)?, draw.alpha))
                })
                .collect::<Result<Vec<(Embedding, f64)>>>()?;
            let f = self.class_score(&example.sequence)?;
            attributions.push(estimator.attribute(&f, &input, &draws)?);
        }
        Ok(attributions)
    }

    fn mean_abs_delta(attributions: &[Attribution]) -> f64 {
        attributions
            .iter()
            .map(|a| a.convergence_delta.abs())
            .sum::<f64>()
            / attributions.len() as f64
    }

    /// Mean and spread of per-position token scores across the batch, plus
    /// the mean score of every concept that appears in it.
    pub fn average_tokens_attr(&self) -> Result<AttributionReport> {
        self.token_report(false)
    }

    /// Token report with per-label mean token scores. Every example needs a label.
    pub fn average_tokens_attr_by_label(&self) -> Result<AttributionReport> {
        self.token_report(true)
    }

    fn token_report(&self, by_label: bool) -> Result<AttributionReport> {
        self.ensure_examples()?;
        if by_label {
            if let Some(missing) = self.examples.iter().find(|e| e.label.is_none()) {
                return Err(OdysseyError::missing_label(format!(
                    "patient '{}' has no '{}' label",
                    missing.patient_id, missing.task
                )));
            }
        }
        let _span =
            tracing::info_span!("average_tokens_attr", examples = self.examples.len()).entered();
        let attributions = self.integrated_batch(&self.examples)?;

        let mut identity = TokenIdentityAggregator::new();
        let mut labelled = Vec::with_capacity(attributions.len());
        for (example, attribution) in self.examples.iter().zip(&attributions) {
            let scores = token_scores(&attribution.values, self.config.normalize_tokens);
            identity.add(&example.sequence, &scores)?;
            labelled.push((example.label, scores));
        }
        let vectors: Vec<&[f64]> = labelled.iter().map(|(_, s)| s.as_slice()).collect();
        let summary = AttributionSummary::from_batch(&vectors)?;

        let by_token = identity
            .finish()
            .into_iter()
            .map(|(id, stat)| TokenAttribution {
                id,
                token: self.tokenizer.decode(id).to_string(),
                mean: stat.mean,
                count: stat.count,
            })
            .collect();
        let by_label = if by_label {
            group_by_label(&labelled)?
                .into_iter()
                .map(|(label, summary)| (label, summary.mean().to_vec()))
                .collect()
        } else {
            Default::default()
        };

        tracing::info!(
            examples = summary.count(),
            positions = summary.len(),
            "Token attribution report ready"
        );
        Ok(AttributionReport {
            kind: ReportKind::Tokens,
            shape: (summary.len(), 1),
            count: summary.count(),
            mean: summary.mean().to_vec(),
            std_dev: summary.std_dev(),
            mean_abs_convergence_delta: Self::mean_abs_delta(&attributions),
            normalized: self.config.normalize_tokens,
            by_token,
            by_label,
        })
    }

    /// Mean and spread of the full `(position, dim)` attribution across the batch.
    pub fn average_embeddings_attr(&self) -> Result<AttributionReport> {
        self.ensure_examples()?;
        let _span = tracing::info_span!(
            "average_embeddings_attr",
            examples = self.examples.len()
        )
        .entered();
        let attributions = self.integrated_batch(&self.examples)?;
        let shape = attributions[0].values.shape();
        let vectors: Vec<&[f64]> = attributions.iter().map(|a| a.values.as_slice()).collect();
        let summary = AttributionSummary::from_batch(&vectors)?;

        tracing::info!(
            examples = summary.count(),
            seq_len = shape.0,
            dim = shape.1,
            "Embedding attribution report ready"
        );
        Ok(AttributionReport {
            kind: ReportKind::Embeddings,
            shape,
            count: summary.count(),
            mean: summary.mean().to_vec(),
            std_dev: summary.std_dev(),
            mean_abs_convergence_delta: Self::mean_abs_delta(&attributions),
            normalized: false,
            by_token: Vec::new(),
            by_label: Default::default(),
        })
    }

    /// Render integrated-gradient token scores for the first `max_rows` examples.
    pub fn visualize_integrated_gradients(
        &self,
        max_rows: usize,
        task_name: &str,
    ) -> Result<Rendering> {
        self.ensure_examples()?;
        let rows = &self.examples[..self.examples.len().min(max_rows)];
        let _span =
            tracing::info_span!("visualize_integrated_gradients", rows = rows.len()).entered();
        let attributions = self.integrated_batch(rows)?;
        let inputs = self.render_inputs(rows, &attributions)?;
        Ok(Rendering::build(task_name, "integrated gradients", inputs, max_rows)?
            .with_normalized_scores(self.config.normalize_tokens))
    }

    /// Render expected-gradient token scores for the first `max_rows` examples,
    /// averaging `num_baselines` sampled baselines per example.
    pub fn visualize_expected_gradients(
        &self,
        max_rows: usize,
        num_baselines: usize,
        task_name: &str,
    ) -> Result<Rendering> {
        self.ensure_examples()?;
        let rows = &self.examples[..self.examples.len().min(max_rows)];
        let _span = tracing::info_span!(
            "visualize_expected_gradients",
            rows = rows.len(),
            num_baselines
        )
        .entered();
        let attributions = self.expected_batch(rows, num_baselines)?;
        let inputs = self.render_inputs(rows, &attributions)?;
        Ok(Rendering::build(task_name, "expected gradients", inputs, max_rows)?
            .with_normalized_scores(self.config.normalize_tokens))
    }

    /// Attended positions only, decoded for display.
    fn render_inputs(
        &self,
        examples: &[Example],
        attributions: &[Attribution],
    ) -> Result<Vec<RenderInput>> {
        examples
            .iter()
            .zip(attributions)
            .map(|(example, attribution)| {
                let scores = token_scores(&attribution.values, self.config.normalize_tokens);
                let (tokens, scores): (Vec<String>, Vec<f64>) = example
                    .sequence
                    .concept_ids()
                    .iter()
                    .zip(example.sequence.attention_mask())
                    .zip(scores)
                    .filter(|((_, mask), _)| **mask != 0)
                    .map(|((&id, _), score)| (self.tokenizer.decode(id).to_string(), score))
                    .unzip();
                let probs = self.model.predict_proba(&example.sequence)?;
                Ok(RenderInput {
                    patient_id: example.patient_id.clone(),
                    tokens,
                    scores,
                    predicted_score: probs[self.config.target_class],
                    true_label: example.label,
                    convergence_delta: attribution.convergence_delta,
                })
            })
            .collect()
    }
}
