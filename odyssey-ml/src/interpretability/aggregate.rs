//! Batch aggregation of attribution vectors.

use crate::model::Embedding;
use odyssey_core::error::{OdysseyError, Result};
use odyssey_core::sequence::EncodedSequence;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Position-wise running mean and variance over a batch of equal-length vectors.
///
/// Summaries of disjoint sub-batches combine with [`AttributionSummary::merge`]
/// into the summary of the whole batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributionSummary {
    count: usize,
    mean: Vec<f64>,
    /// Sum of squared deviations from the mean.
    m2: Vec<f64>,
}

impl AttributionSummary {
    pub fn from_batch<T: AsRef<[f64]>>(batch: &[T]) -> Result<Self> {
        let first = batch
            .first()
            .ok_or_else(|| OdysseyError::empty_batch("no attribution vectors to aggregate"))?;
        let len = first.as_ref().len();
        let mut summary = Self {
            count: 0,
            mean: vec![0.0; len],
            m2: vec![0.0; len],
        };
        for (i, vector) in batch.iter().enumerate() {
            let vector = vector.as_ref();
            if vector.len() != len {
                return Err(OdysseyError::shape_mismatch(
                    format!("attribution vector {i}"),
                    len,
                    vector.len(),
                ));
            }
            summary.push(vector);
        }
        Ok(summary)
    }

    // Welford update.
    fn push(&mut self, vector: &[f64]) {
        self.count += 1;
        let n = self.count as f64;
        for ((mean, m2), &x) in self.mean.iter_mut().zip(&mut self.m2).zip(vector) {
            let d = x - *mean;
            *mean += d / n;
            *m2 += d * (x - *mean);
        }
    }

    /// Summary of the union of both batches (Chan et al. pairwise update).
    pub fn merge(&self, other: &AttributionSummary) -> Result<AttributionSummary> {
        if self.mean.len() != other.mean.len() {
            return Err(OdysseyError::shape_mismatch(
                "summary merge",
                self.mean.len(),
                other.mean.len(),
            ));
        }
        let (na, nb) = (self.count as f64, other.count as f64);
        let n = na + nb;
        let mut mean = Vec::with_capacity(self.mean.len());
        let mut m2 = Vec::with_capacity(self.mean.len());
        for i in 0..self.mean.len() {
            let d = other.mean[i] - self.mean[i];
            mean.push((na * self.mean[i] + nb * other.mean[i]) / n);
            m2.push(self.m2[i] + other.m2[i] + d * d * na * nb / n);
        }
        Ok(AttributionSummary {
            count: self.count + other.count,
            mean,
            m2,
        })
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn len(&self) -> usize {
        self.mean.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mean.is_empty()
    }

    pub fn mean(&self) -> &[f64] {
        &self.mean
    }

    /// Population variance per position.
    pub fn variance(&self) -> Vec<f64> {
        let n = self.count as f64;
        self.m2.iter().map(|m| m / n).collect()
    }

    pub fn std_dev(&self) -> Vec<f64> {
        self.variance().into_iter().map(f64::sqrt).collect()
    }
}

/// Reduce an embedding attribution to one score per position by summing over
/// the embedding dimension, optionally scaling the result to unit L2 norm.
pub fn token_scores(values: &Embedding, normalize: bool) -> Vec<f64> {
    let mut scores = values.row_sums();
    if normalize {
        let norm = scores.iter().map(|s| s * s).sum::<f64>().sqrt();
        if norm > 0.0 {
            for s in &mut scores {
                *s /= norm;
            }
        }
    }
    scores
}

/// Mean attribution of one concept id across a batch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenStat {
    pub mean: f64,
    pub count: usize,
}

/// Groups token-level scores by concept id, skipping padded positions.
#[derive(Debug, Clone, Default)]
pub struct TokenIdentityAggregator {
    totals: BTreeMap<u32, (f64, usize)>,
}

impl TokenIdentityAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, sequence: &EncodedSequence, scores: &[f64]) -> Result<()> {
        if scores.len() != sequence.len() {
            return Err(OdysseyError::shape_mismatch(
                "token scores",
                sequence.len(),
                scores.len(),
            ));
        }
        for ((&id, &mask), &score) in sequence
            .concept_ids()
            .iter()
            .zip(sequence.attention_mask())
            .zip(scores)
        {
            if mask == 0 {
                continue;
            }
            let entry = self.totals.entry(id).or_insert((0.0, 0));
            entry.0 += score;
            entry.1 += 1;
        }
        Ok(())
    }

    pub fn merge(&mut self, other: &TokenIdentityAggregator) {
        for (&id, &(sum, count)) in &other.totals {
            let entry = self.totals.entry(id).or_insert((0.0, 0));
            entry.0 += sum;
            entry.1 += count;
        }
    }

    pub fn finish(&self) -> BTreeMap<u32, TokenStat> {
        self.totals
            .iter()
            .map(|(&id, &(sum, count))| {
                (
                    id,
                    TokenStat {
                        mean: sum / count as f64,
                        count,
                    },
                )
            })
            .collect()
    }
}

/// Position-wise summaries per class label. Every item must carry a label.
pub fn group_by_label(
    items: &[(Option<i64>, Vec<f64>)],
) -> Result<BTreeMap<i64, AttributionSummary>> {
    if items.is_empty() {
        return Err(OdysseyError::empty_batch("no attributions to group by label"));
    }
    let mut groups: BTreeMap<i64, Vec<&[f64]>> = BTreeMap::new();
    for (i, (label, vector)) in items.iter().enumerate() {
        let label = label.ok_or_else(|| {
            OdysseyError::missing_label(format!("example {i} has no label to group by"))
        })?;
        groups.entry(label).or_default().push(vector);
    }
    groups
        .into_iter()
        .map(|(label, vectors)| {
            Ok::<_, OdysseyError>((label, AttributionSummary::from_batch(&vectors)?))
        })
        .collect()
}

/// Granularity of an [`AttributionReport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    Tokens,
    Embeddings,
}

/// Mean attribution of one vocabulary entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenAttribution {
    pub id: u32,
    pub token: String,
    pub mean: f64,
    pub count: usize,
}

/// Batch-level attribution summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributionReport {
    pub kind: ReportKind,
    /// `(seq_len, dim)`; `dim` is 1 for token reports.
    pub shape: (usize, usize),
    pub count: usize,
    pub mean: Vec<f64>,
    pub std_dev: Vec<f64>,
    /// Mean `|convergence_delta|` across the batch.
    pub mean_abs_convergence_delta: f64,
    /// Token scores were L2-normalised per example before averaging.
    #[serde(default)]
    pub normalized: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub by_token: Vec<TokenAttribution>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub by_label: BTreeMap<i64, Vec<f64>>,
}

impl AttributionReport {
    /// Tokens with the largest absolute mean attribution.
    pub fn top_tokens(&self, n: usize) -> Vec<&TokenAttribution> {
        let mut tokens: Vec<_> = self.by_token.iter().collect();
        tokens.sort_by(|a, b| {
            b.mean
                .abs()
                .partial_cmp(&a.mean.abs())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        tokens.into_iter().take(n).collect()
    }

    /// Mean attribution at one `(position, dim)` cell.
    pub fn at(&self, position: usize, dim: usize) -> Option<f64> {
        if position >= self.shape.0 || dim >= self.shape.1 {
            return None;
        }
        self.mean.get(position * self.shape.1 + dim).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn close(a: &[f64], b: &[f64]) -> bool {
        a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() < 1e-10)
    }

    #[test]
    fn test_mean_and_std() {
        let batch = vec![vec![1.0, 10.0], vec![3.0, 10.0]];
        let s = AttributionSummary::from_batch(&batch).unwrap();
        assert_eq!(s.count(), 2);
        assert!(close(s.mean(), &[2.0, 10.0]));
        assert!(close(&s.std_dev(), &[1.0, 0.0]));
    }

    #[test]
    fn test_empty_and_ragged() {
        let empty: Vec<Vec<f64>> = Vec::new();
        assert!(matches!(
            AttributionSummary::from_batch(&empty),
            Err(OdysseyError::EmptyBatch(_))
        ));
        let ragged = vec![vec![1.0], vec![1.0, 2.0]];
        assert!(matches!(
            AttributionSummary::from_batch(&ragged),
            Err(OdysseyError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_merge_equals_concatenation() {
        let a = vec![vec![1.0, -2.0], vec![4.0, 0.5], vec![0.0, 3.0]];
        let b = vec![vec![10.0, 1.0], vec![-3.0, 2.5]];
        let whole: Vec<_> = a.iter().chain(&b).cloned().collect();

        let merged = AttributionSummary::from_batch(&a)
            .unwrap()
            .merge(&AttributionSummary::from_batch(&b).unwrap())
            .unwrap();
        let direct = AttributionSummary::from_batch(&whole).unwrap();

        assert_eq!(merged.count(), direct.count());
        assert!(close(merged.mean(), direct.mean()));
        assert!(close(&merged.variance(), &direct.variance()));
    }

    #[test]
    fn test_token_scores_normalized() {
        let e = Embedding::from_rows(vec![vec![1.0, 2.0], vec![4.0, 0.0], vec![0.0, 0.0]]).unwrap();
        assert_eq!(token_scores(&e, false), vec![3.0, 4.0, 0.0]);
        assert!(close(&token_scores(&e, true), &[0.6, 0.8, 0.0]));
        let zero = Embedding::zeros(2, 2);
        assert_eq!(token_scores(&zero, true), vec![0.0, 0.0]);
    }

    #[test]
    fn test_token_identity_skips_padding() {
        let seq = EncodedSequence::new(
            vec![7, 8, 7, 0],
            vec![1, 1, 1, 0],
            odyssey_core::sequence::Channels {
                type_ids: vec![0; 4],
                ages: vec![0; 4],
                time_stamps: vec![0; 4],
                visit_orders: vec![0; 4],
                visit_segments: vec![0; 4],
            },
        )
        .unwrap();
        let mut agg = TokenIdentityAggregator::new();
        agg.add(&seq, &[1.0, 2.0, 3.0, 100.0]).unwrap();
        let stats = agg.finish();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[&7], TokenStat { mean: 2.0, count: 2 });
        assert_eq!(stats[&8], TokenStat { mean: 2.0, count: 1 });
        assert!(agg.add(&seq, &[1.0]).is_err());
    }

    #[test]
    fn test_group_by_label() {
        let items = vec![
            (Some(1), vec![1.0, 1.0]),
            (Some(0), vec![0.0, 2.0]),
            (Some(1), vec![3.0, 1.0]),
        ];
        let groups = group_by_label(&items).unwrap();
        assert_eq!(groups[&1].count(), 2);
        assert!(close(groups[&1].mean(), &[2.0, 1.0]));

        let missing = vec![(Some(1), vec![1.0]), (None, vec![2.0])];
        assert!(matches!(
            group_by_label(&missing),
            Err(OdysseyError::MissingLabel(_))
        ));
    }

    #[test]
    fn test_top_tokens_orders_by_magnitude() {
        let report = AttributionReport {
            kind: ReportKind::Tokens,
            shape: (2, 1),
            count: 1,
            mean: vec![0.0, 0.0],
            std_dev: vec![0.0, 0.0],
            mean_abs_convergence_delta: 0.0,
            normalized: false,
            by_token: vec![
                TokenAttribution {
                    id: 7,
                    token: "A".into(),
                    mean: 0.1,
                    count: 1,
                },
                TokenAttribution {
                    id: 8,
                    token: "B".into(),
                    mean: -0.9,
                    count: 1,
                },
            ],
            by_label: BTreeMap::new(),
        };
        let top = report.top_tokens(1);
        assert_eq!(top[0].token, "B");
        assert_eq!(report.at(1, 0), Some(0.0));
        assert_eq!(report.at(2, 0), None);
    }
}
