//! Integrated gradients along the straight path from a baseline to the input.
//!
//! `a = (x - x0) * sum_k w_k * grad f(x0 + alpha_k (x - x0))`, where the
//! `(alpha_k, w_k)` pairs come from the configured Riemann rule. With the
//! default right rule this is `(1/N) * sum_{k=1..N} grad f(x0 + (k/N)(x - x0))`.

use crate::model::{Embedding, ScoreGradient};
use odyssey_core::config::{AttributionConfig, RiemannRule};
use odyssey_core::error::{OdysseyError, Result};
use serde::{Deserialize, Serialize};

/// Attribution of one input against one baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribution {
    /// Same shape as the input embedding.
    pub values: Embedding,
    /// `f(x)`.
    pub input_score: f64,
    /// `f(x0)`.
    pub baseline_score: f64,
    /// `sum(values) - (f(x) - f(x0))`; shrinks as the step count grows.
    pub convergence_delta: f64,
    /// Path points where the score was saturated.
    pub saturated_steps: usize,
}

impl Attribution {
    pub fn total(&self) -> f64 {
        self.values.sum()
    }

    /// One score per position: the sum over the embedding dimension.
    pub fn token_totals(&self) -> Vec<f64> {
        self.values.row_sums()
    }
}

/// Path-integrated gradient estimator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntegratedGradients {
    n_steps: usize,
    rule: RiemannRule,
}

impl IntegratedGradients {
    pub fn new(n_steps: usize, rule: RiemannRule) -> Result<Self> {
        if n_steps == 0 {
            return Err(OdysseyError::invalid_input(
                "integrated gradients needs at least one step",
            ));
        }
        Ok(Self { n_steps, rule })
    }

    pub fn from_config(config: &AttributionConfig) -> Result<Self> {
        Self::new(config.n_steps, config.rule)
    }

    pub fn n_steps(&self) -> usize {
        self.n_steps
    }

    pub fn rule(&self) -> RiemannRule {
        self.rule
    }

    /// Interpolation fractions and their quadrature weights (weights sum to 1).
    pub fn path_points(&self) -> Vec<(f64, f64)> {
        let n = self.n_steps as f64;
        match self.rule {
            RiemannRule::Left => (0..self.n_steps).map(|k| (k as f64 / n, 1.0 / n)).collect(),
            RiemannRule::Right => (1..=self.n_steps)
                .map(|k| (k as f64 / n, 1.0 / n))
                .collect(),
            RiemannRule::Middle => (0..self.n_steps)
                .map(|k| ((k as f64 + 0.5) / n, 1.0 / n))
                .collect(),
            RiemannRule::Trapezoid => (0..=self.n_steps)
                .map(|k| {
                    let w = if k == 0 || k == self.n_steps {
                        0.5 / n
                    } else {
                        1.0 / n
                    };
                    (k as f64 / n, w)
                })
                .collect(),
        }
    }

    /// Attribute `f(input) - f(baseline)` to the input coordinates.
    ///
    /// Fails with `ShapeMismatch` before calling `f` when the shapes differ and
    /// with `DegradedGradient` when any score or gradient is non-finite.
    pub fn attribute<F: ScoreGradient + ?Sized>(
        &self,
        f: &F,
        input: &Embedding,
        baseline: &Embedding,
    ) -> Result<Attribution> {
        input.ensure_same_shape(baseline, "integrated gradients baseline")?;
        let delta = input.sub(baseline)?;

        let mut avg_grad = Embedding::zeros(input.seq_len(), input.dim());
        let mut saturated_steps = 0;
        for (step, (alpha, weight)) in self.path_points().into_iter().enumerate() {
            let point = Embedding::interpolate(baseline, &delta, alpha)?;
            let grad = f.gradient(&point)?;
            grad.ensure_same_shape(&point, "model gradient")?;
            if !grad.is_finite() {
                return Err(OdysseyError::degraded_gradient(
                    step,
                    alpha,
                    "gradient contains non-finite values",
                ));
            }
            if f.saturated(&point)? {
                saturated_steps += 1;
            }
            avg_grad.add_scaled(&grad, weight)?;
        }

        let values = delta.hadamard(&avg_grad)?;
        let input_score = finite_score(f, input, self.n_steps, 1.0)?;
        let baseline_score = finite_score(f, baseline, 0, 0.0)?;
        let convergence_delta = values.sum() - (input_score - baseline_score);

        if saturated_steps > 0 {
            tracing::warn!(
                saturated_steps,
                n_steps = self.n_steps,
                "Score saturated along the integration path; attributions may be understated"
            );
        }
        tracing::debug!(
            n_steps = self.n_steps,
            input_score,
            baseline_score,
            convergence_delta,
            "Integrated gradients computed"
        );

        Ok(Attribution {
            values,
            input_score,
            baseline_score,
            convergence_delta,
            saturated_steps,
        })
    }
}

pub(crate) fn finite_score<F: ScoreGradient + ?Sized>(
    f: &F,
    point: &Embedding,
    step: usize,
    alpha: f64,
) -> Result<f64> {
    let score = f.score(point)?;
    if !score.is_finite() {
        return Err(OdysseyError::degraded_gradient(
            step,
            alpha,
            format!("score is {score}"),
        ));
    }
    Ok(score)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    /// `f(x) = w . x`
    struct Linear {
        w: Vec<f64>,
        calls: Cell<usize>,
    }

    impl Linear {
        fn new(w: Vec<f64>) -> Self {
            Self {
                w,
                calls: Cell::new(0),
            }
        }
    }

    impl ScoreGradient for Linear {
        fn score(&self, point: &Embedding) -> Result<f64> {
            Ok(point.as_slice().iter().zip(&self.w).map(|(x, w)| x * w).sum())
        }

        fn gradient(&self, point: &Embedding) -> Result<Embedding> {
            self.calls.set(self.calls.get() + 1);
            Embedding::from_vec(point.seq_len(), point.dim(), self.w.clone())
        }
    }

    /// `f(x) = sum c_i x_i^2 + sum x_i^3`
    struct Polynomial {
        c: Vec<f64>,
    }

    impl ScoreGradient for Polynomial {
        fn score(&self, point: &Embedding) -> Result<f64> {
            Ok(point
                .as_slice()
                .iter()
                .zip(&self.c)
                .map(|(x, c)| c * x * x + x * x * x)
                .sum())
        }

        fn gradient(&self, point: &Embedding) -> Result<Embedding> {
            let data = point
                .as_slice()
                .iter()
                .zip(&self.c)
                .map(|(x, c)| 2.0 * c * x + 3.0 * x * x)
                .collect();
            Embedding::from_vec(point.seq_len(), point.dim(), data)
        }
    }

    struct NanGradient;

    impl ScoreGradient for NanGradient {
        fn score(&self, _point: &Embedding) -> Result<f64> {
            Ok(0.0)
        }

        fn gradient(&self, point: &Embedding) -> Result<Embedding> {
            let mut g = Embedding::zeros(point.seq_len(), point.dim());
            g.row_mut(0)[0] = f64::NAN;
            Ok(g)
        }
    }

    fn emb(data: &[f64]) -> Embedding {
        Embedding::from_vec(2, data.len() / 2, data.to_vec()).unwrap()
    }

    #[test]
    fn test_exact_for_linear_function() {
        let w = vec![0.5, -1.0, 2.0, 3.0];
        let f = Linear::new(w.clone());
        let x = emb(&[1.0, 2.0, -3.0, 0.5]);
        let x0 = Embedding::zeros(2, 2);
        let ig = IntegratedGradients::new(50, RiemannRule::Right).unwrap();
        let attr = ig.attribute(&f, &x, &x0).unwrap();

        for ((a, w), x) in attr.values.as_slice().iter().zip(&w).zip(x.as_slice()) {
            assert!((a - w * x).abs() < 1e-12);
        }
        assert!(attr.convergence_delta.abs() < 1e-12);
        assert_eq!(f.calls.get(), 50);
    }

    #[test]
    fn test_completeness_improves_with_steps() {
        let f = Polynomial {
            c: vec![1.0, -2.0, 0.5, 3.0],
        };
        let x = emb(&[1.0, 0.5, -1.5, 2.0]);
        let x0 = emb(&[0.1, 0.0, 0.2, -0.3]);

        let coarse = IntegratedGradients::new(10, RiemannRule::Right)
            .unwrap()
            .attribute(&f, &x, &x0)
            .unwrap();
        let fine = IntegratedGradients::new(100, RiemannRule::Right)
            .unwrap()
            .attribute(&f, &x, &x0)
            .unwrap();

        assert!(fine.convergence_delta.abs() <= coarse.convergence_delta.abs());
        assert!(fine.convergence_delta.abs() < 0.5);
        let expected = f.score(&x).unwrap() - f.score(&x0).unwrap();
        assert!((fine.total() - expected).abs() < 0.5);
    }

    #[test]
    fn test_middle_and_trapezoid_converge_faster() {
        let f = Polynomial {
            c: vec![1.0, -2.0, 0.5, 3.0],
        };
        let x = emb(&[1.0, 0.5, -1.5, 2.0]);
        let x0 = Embedding::zeros(2, 2);
        let right = IntegratedGradients::new(20, RiemannRule::Right)
            .unwrap()
            .attribute(&f, &x, &x0)
            .unwrap();
        for rule in [RiemannRule::Middle, RiemannRule::Trapezoid] {
            let attr = IntegratedGradients::new(20, rule)
                .unwrap()
                .attribute(&f, &x, &x0)
                .unwrap();
            assert!(attr.convergence_delta.abs() < right.convergence_delta.abs());
        }
    }

    #[test]
    fn test_path_point_weights_sum_to_one() {
        for rule in [
            RiemannRule::Left,
            RiemannRule::Right,
            RiemannRule::Middle,
            RiemannRule::Trapezoid,
        ] {
            let ig = IntegratedGradients::new(7, rule).unwrap();
            let total: f64 = ig.path_points().iter().map(|(_, w)| w).sum();
            assert!((total - 1.0).abs() < 1e-12, "{rule:?}");
        }
        let right = IntegratedGradients::new(4, RiemannRule::Right).unwrap();
        assert_eq!(right.path_points().last().unwrap().0, 1.0);
    }

    #[test]
    fn test_zero_when_input_equals_baseline() {
        let f = Polynomial {
            c: vec![1.0, 1.0, 1.0, 1.0],
        };
        let x = emb(&[1.0, 2.0, 3.0, 4.0]);
        let attr = IntegratedGradients::new(16, RiemannRule::Right)
            .unwrap()
            .attribute(&f, &x, &x)
            .unwrap();
        assert!(attr.values.as_slice().iter().all(|&v| v == 0.0));
        assert_eq!(attr.convergence_delta, 0.0);
    }

    #[test]
    fn test_shape_mismatch_before_any_gradient() {
        let f = Linear::new(vec![1.0; 6]);
        let x = Embedding::zeros(2, 3);
        let x0 = Embedding::zeros(3, 2);
        let err = IntegratedGradients::new(5, RiemannRule::Right)
            .unwrap()
            .attribute(&f, &x, &x0)
            .unwrap_err();
        assert!(matches!(err, OdysseyError::ShapeMismatch { .. }));
        assert_eq!(f.calls.get(), 0);
    }

    #[test]
    fn test_zero_steps_rejected() {
        assert!(matches!(
            IntegratedGradients::new(0, RiemannRule::Right),
            Err(OdysseyError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_nan_gradient_is_degraded() {
        let x = Embedding::zeros(2, 2);
        let err = IntegratedGradients::new(3, RiemannRule::Right)
            .unwrap()
            .attribute(&NanGradient, &x, &x)
            .unwrap_err();
        assert!(matches!(err, OdysseyError::DegradedGradient { step: 0, .. }));
    }

    #[test]
    fn test_repeated_runs_identical() {
        let f = Polynomial {
            c: vec![0.3, 0.1, -0.7, 2.0],
        };
        let x = emb(&[1.0, -1.0, 0.5, 0.25]);
        let x0 = Embedding::zeros(2, 2);
        let ig = IntegratedGradients::new(33, RiemannRule::Right).unwrap();
        let a = ig.attribute(&f, &x, &x0).unwrap();
        let b = ig.attribute(&f, &x, &x0).unwrap();
        assert_eq!(a, b);
    }
}
