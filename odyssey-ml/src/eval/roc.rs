//! Receiver operating characteristic curves and model comparison by AUC.

use odyssey_core::error::{OdysseyError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One operating point: predicting positive for every score `>= threshold`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RocPoint {
    pub threshold: f64,
    pub fpr: f64,
    pub tpr: f64,
}

/// ROC curve over binary labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RocCurve {
    pub points: Vec<RocPoint>,
    pub positives: usize,
    pub negatives: usize,
}

impl RocCurve {
    /// Build the curve with one point per distinct score, highest first.
    ///
    /// Tied scores move the curve diagonally in a single step. The curve
    /// starts at `(0, 0)` with an infinite threshold and ends at `(1, 1)`.
    pub fn compute(labels: &[i64], scores: &[f64]) -> Result<Self> {
        if labels.len() != scores.len() {
            return Err(OdysseyError::shape_mismatch(
                "roc scores",
                labels.len(),
                scores.len(),
            ));
        }
        if labels.is_empty() {
            return Err(OdysseyError::empty_batch("no predictions to score"));
        }
        if let Some(bad) = labels.iter().find(|&&l| l != 0 && l != 1) {
            return Err(OdysseyError::invalid_input(format!(
                "roc labels must be 0 or 1, got {bad}"
            )));
        }
        if scores.iter().any(|s| !s.is_finite()) {
            return Err(OdysseyError::invalid_input("roc scores must be finite"));
        }

        let positives = labels.iter().filter(|&&l| l == 1).count();
        let negatives = labels.len() - positives;
        if positives == 0 || negatives == 0 {
            return Err(OdysseyError::invalid_input(
                "roc needs both positive and negative labels",
            ));
        }

        let mut order: Vec<usize> = (0..scores.len()).collect();
        order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

        let mut points = vec![RocPoint {
            threshold: f64::INFINITY,
            fpr: 0.0,
            tpr: 0.0,
        }];
        let (mut tp, mut fp) = (0usize, 0usize);
        let mut i = 0;
        while i < order.len() {
            let threshold = scores[order[i]];
            while i < order.len() && scores[order[i]] == threshold {
                if labels[order[i]] == 1 {
                    tp += 1;
                } else {
                    fp += 1;
                }
                i += 1;
            }
            points.push(RocPoint {
                threshold,
                fpr: fp as f64 / negatives as f64,
                tpr: tp as f64 / positives as f64,
            });
        }

        Ok(Self {
            points,
            positives,
            negatives,
        })
    }

    /// Area under the curve by the trapezoid rule.
    pub fn auc(&self) -> f64 {
        self.points
            .windows(2)
            .map(|w| (w[1].fpr - w[0].fpr) * (w[1].tpr + w[0].tpr) / 2.0)
            .sum()
    }

    /// `threshold,fpr,tpr` rows with a header line.
    pub fn to_csv(&self) -> String {
        let mut out = String::from("threshold,fpr,tpr\n");
        for p in &self.points {
            out.push_str(&format!("{},{},{}\n", p.threshold, p.fpr, p.tpr));
        }
        out
    }
}

/// Scores one model produced for a labelled evaluation set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPredictions {
    pub name: String,
    pub labels: Vec<i64>,
    pub scores: Vec<f64>,
}

impl ModelPredictions {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn roc(&self) -> Result<RocCurve> {
        RocCurve::compute(&self.labels, &self.scores)
    }
}

/// AUC summary for one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelComparison {
    pub name: String,
    pub auc: f64,
    pub positives: usize,
    pub negatives: usize,
    pub curve: RocCurve,
}

/// Score every model and sort by AUC, best first. Equal AUCs keep input order.
pub fn compare_models(models: &[ModelPredictions]) -> Result<Vec<ModelComparison>> {
    if models.is_empty() {
        return Err(OdysseyError::empty_batch("no models to compare"));
    }
    let mut results = models
        .iter()
        .map(|m| -> Result<ModelComparison> {
            let curve = m.roc()?;
            tracing::debug!(model = %m.name, auc = curve.auc(), "ROC computed");
            Ok(ModelComparison {
                name: m.name.clone(),
                auc: curve.auc(),
                positives: curve.positives,
                negatives: curve.negatives,
                curve,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    results.sort_by(|a, b| b.auc.total_cmp(&a.auc));
    Ok(results)
}
