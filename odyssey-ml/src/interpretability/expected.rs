//! Expected gradients: integrated gradients averaged over a baseline distribution.
//!
//! Each draw contributes a single-point estimate
//! `(x - b_k) * grad f(b_k + alpha_k (x - b_k))`; the result is the mean over
//! the `K` draws. Baselines and fractions come from
//! [`BaselineProvider::sample`](super::baseline::BaselineProvider::sample).

use super::integrated::{Attribution, finite_score};
use crate::model::{Embedding, ScoreGradient};
use odyssey_core::error::{OdysseyError, Result};

/// Stochastic estimator over `(baseline, alpha)` draws.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpectedGradients;

impl ExpectedGradients {
    pub fn new() -> Self {
        Self
    }

    pub fn attribute<F: ScoreGradient + ?Sized>(
        &self,
        f: &F,
        input: &Embedding,
        draws: &[(Embedding, f64)],
    ) -> Result<Attribution> {
        if draws.is_empty() {
            return Err(OdysseyError::invalid_input(
                "expected gradients needs at least one baseline",
            ));
        }
        for (baseline, alpha) in draws {
            input.ensure_same_shape(baseline, "expected gradients baseline")?;
            if !(0.0..=1.0).contains(alpha) {
                return Err(OdysseyError::invalid_input(format!(
                    "interpolation fraction {alpha} outside [0, 1]"
                )));
            }
        }

        let k = draws.len() as f64;
        let mut values = Embedding::zeros(input.seq_len(), input.dim());
        let mut baseline_score = 0.0;
        let mut saturated_steps = 0;
        for (step, (baseline, alpha)) in draws.iter().enumerate() {
            let delta = input.sub(baseline)?;
            let point = Embedding::interpolate(baseline, &delta, *alpha)?;
            let grad = f.gradient(&point)?;
            grad.ensure_same_shape(&point, "model gradient")?;
            if !grad.is_finite() {
                return Err(OdysseyError::degraded_gradient(
                    step,
                    *alpha,
                    "gradient contains non-finite values",
                ));
            }
            if f.saturated(&point)? {
                saturated_steps += 1;
            }
            values.add_scaled(&delta.hadamard(&grad)?, 1.0 / k)?;
            baseline_score += finite_score(f, baseline, step, 0.0)? / k;
        }

        let input_score = finite_score(f, input, draws.len(), 1.0)?;
        let convergence_delta = values.sum() - (input_score - baseline_score);
        if saturated_steps > 0 {
            tracing::warn!(
                saturated_steps,
                draws = draws.len(),
                "Score saturated at sampled points; attributions may be understated"
            );
        }
        tracing::debug!(
            draws = draws.len(),
            input_score,
            baseline_score,
            convergence_delta,
            "Expected gradients computed"
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
