//! Model capability traits.
//!
//! Attribution only needs two things from a model: a scalar score at a point
//! in embedding space and the gradient of that score. [`ScoreGradient`] is
//! that narrow capability; [`ModelProvider`] is what a sequence classifier
//! exposes, and [`ClassScore`] adapts one to the other for a chosen class.

use super::tensor::Embedding;
use odyssey_core::config::ScoreTarget;
use odyssey_core::error::{OdysseyError, Result};
use odyssey_core::sequence::EncodedSequence;

/// A differentiable scalar function over embedding space.
pub trait ScoreGradient {
    fn score(&self, point: &Embedding) -> Result<f64>;

    fn gradient(&self, point: &Embedding) -> Result<Embedding>;

    /// Whether the score is saturated at `point` (gradient numerically vanishing).
    fn saturated(&self, _point: &Embedding) -> Result<bool> {
        Ok(false)
    }
}

/// A sequence classifier that can be differentiated w.r.t. its input embedding.
pub trait ModelProvider {
    fn num_labels(&self) -> usize;

    fn embedding_dim(&self) -> usize;

    /// Input embedding (the layer attribution is measured at).
    fn embed(&self, sequence: &EncodedSequence) -> Result<Embedding>;

    fn logits(&self, embedding: &Embedding, attention_mask: &[u8]) -> Result<Vec<f64>>;

    /// Gradient of logit `class` w.r.t. the input embedding.
    fn logit_gradient(
        &self,
        embedding: &Embedding,
        attention_mask: &[u8],
        class: usize,
    ) -> Result<Embedding>;

    /// Class probabilities for a sequence.
    fn predict_proba(&self, sequence: &EncodedSequence) -> Result<Vec<f64>> {
        let embedding = self.embed(sequence)?;
        let logits = self.logits(&embedding, sequence.attention_mask())?;
        Ok(softmax(&logits))
    }
}

/// Numerically stable softmax.
pub fn softmax(logits: &[f64]) -> Vec<f64> {
    let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = logits.iter().map(|z| (z - max).exp()).collect();
    let total: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / total).collect()
}

/// Score of one class of a [`ModelProvider`], as a [`ScoreGradient`].
pub struct ClassScore<'a, M: ModelProvider + ?Sized> {
    model: &'a M,
    attention_mask: &'a [u8],
    class: usize,
    target: ScoreTarget,
    clip_epsilon: f64,
}

impl<'a, M: ModelProvider + ?Sized> ClassScore<'a, M> {
    pub fn new(
        model: &'a M,
        attention_mask: &'a [u8],
        class: usize,
        target: ScoreTarget,
        clip_epsilon: f64,
    ) -> Result<Self> {
        if class >= model.num_labels() {
            return Err(OdysseyError::invalid_input(format!(
                "target class {class} out of range for {} labels",
                model.num_labels()
            )));
        }
        if !(0.0..0.5).contains(&clip_epsilon) {
            return Err(OdysseyError::invalid_input(format!(
                "clip epsilon must be in [0, 0.5), got {clip_epsilon}"
            )));
        }
        Ok(Self {
            model,
            attention_mask,
            class,
            target,
            clip_epsilon,
        })
    }

    fn probability(&self, point: &Embedding) -> Result<f64> {
        let logits = self.model.logits(point, self.attention_mask)?;
        Ok(softmax(&logits)[self.class])
    }
}

impl<M: ModelProvider + ?Sized> ScoreGradient for ClassScore<'_, M> {
    fn score(&self, point: &Embedding) -> Result<f64> {
        match self.target {
            ScoreTarget::Logit => {
                let logits = self.model.logits(point, self.attention_mask)?;
                Ok(logits[self.class])
            }
            ScoreTarget::Probability => {
                let p = self.probability(point)?;
                Ok(p.clamp(self.clip_epsilon, 1.0 - self.clip_epsilon))
            }
        }
    }

    fn gradient(&self, point: &Embedding) -> Result<Embedding> {
        match self.target {
            ScoreTarget::Logit => self
                .model
                .logit_gradient(point, self.attention_mask, self.class),
            ScoreTarget::Probability => {
                // dp_c/de = p_c * (dz_c/de - sum_j p_j dz_j/de)
                let logits = self.model.logits(point, self.attention_mask)?;
                let probs = softmax(&logits);
                let p_c = probs[self.class];

                let mut grad = self
                    .model
                    .logit_gradient(point, self.attention_mask, self.class)?;
                for (j, &p_j) in probs.iter().enumerate() {
                    let g_j = self.model.logit_gradient(point, self.attention_mask, j)?;
                    grad.add_scaled(&g_j, -p_j)?;
                }
                grad.scale(p_c);
                Ok(grad)
            }
        }
    }

    fn saturated(&self, point: &Embedding) -> Result<bool> {
        match self.target {
            ScoreTarget::Logit => Ok(false),
            ScoreTarget::Probability => {
                let p = self.probability(point)?;
                Ok(p < self.clip_epsilon || p > 1.0 - self.clip_epsilon)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two-class model whose logits are `[0, w . sum(rows)]`.
    struct TwoClassLinear {
        w: Vec<f64>,
    }

    impl ModelProvider for TwoClassLinear {
        fn num_labels(&self) -> usize {
            2
        }

        fn embedding_dim(&self) -> usize {
            self.w.len()
        }

        fn embed(&self, sequence: &EncodedSequence) -> Result<Embedding> {
            Ok(Embedding::zeros(sequence.len(), self.w.len()))
        }

        fn logits(&self, embedding: &Embedding, _mask: &[u8]) -> Result<Vec<f64>> {
            let z: f64 = (0..embedding.seq_len())
                .map(|i| {
                    embedding
                        .row(i)
                        .iter()
                        .zip(&self.w)
                        .map(|(x, w)| x * w)
                        .sum::<f64>()
                })
                .sum();
            Ok(vec![0.0, z])
        }

        fn logit_gradient(
            &self,
            embedding: &Embedding,
            _mask: &[u8],
            class: usize,
        ) -> Result<Embedding> {
            let mut grad = Embedding::zeros(embedding.seq_len(), embedding.dim());
            if class == 1 {
                for i in 0..embedding.seq_len() {
                    grad.row_mut(i).copy_from_slice(&self.w);
                }
            }
            Ok(grad)
        }
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let p = softmax(&[1000.0, 1000.0, 999.0]);
        assert!((p.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!((p[0] - p[1]).abs() < 1e-12);
    }

    #[test]
    fn test_class_out_of_range() {
        let model = TwoClassLinear { w: vec![1.0] };
        let mask = [1u8];
        assert!(ClassScore::new(&model, &mask, 2, ScoreTarget::Logit, 1e-6).is_err());
    }

    #[test]
    fn test_probability_gradient_matches_finite_difference() {
        let model = TwoClassLinear { w: vec![0.5, -1.0] };
        let mask = [1u8, 1];
        let f = ClassScore::new(&model, &mask, 1, ScoreTarget::Probability, 0.0).unwrap();
        let x = Embedding::from_vec(2, 2, vec![0.2, 0.1, -0.3, 0.4]).unwrap();
        let grad = f.gradient(&x).unwrap();

        let h = 1e-6;
        for k in 0..4 {
            let mut plus = x.clone().into_vec();
            let mut minus = plus.clone();
            plus[k] += h;
            minus[k] -= h;
            let fp = f.score(&Embedding::from_vec(2, 2, plus).unwrap()).unwrap();
            let fm = f.score(&Embedding::from_vec(2, 2, minus).unwrap()).unwrap();
            let numeric = (fp - fm) / (2.0 * h);
            assert!((numeric - grad.as_slice()[k]).abs() < 1e-6);
        }
    }

    #[test]
    fn test_probability_saturation_detected() {
        let model = TwoClassLinear { w: vec![100.0] };
        let mask = [1u8];
        let f = ClassScore::new(&model, &mask, 1, ScoreTarget::Probability, 1e-6).unwrap();
        let x = Embedding::from_vec(1, 1, vec![1.0]).unwrap();
        assert!(f.saturated(&x).unwrap());
        assert_eq!(f.score(&x).unwrap(), 1.0 - 1e-6);

        let logit = ClassScore::new(&model, &mask, 1, ScoreTarget::Logit, 1e-6).unwrap();
        assert!(!logit.saturated(&x).unwrap());
        assert_eq!(logit.score(&x).unwrap(), 100.0);
    }
}
