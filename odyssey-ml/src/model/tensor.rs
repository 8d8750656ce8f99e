//! Dense row-major `(seq_len, dim)` matrix used for embeddings and their gradients.

use odyssey_core::error::{OdysseyError, Result};
use serde::{Deserialize, Serialize};

/// Embedding-space point: one `dim`-wide row per sequence position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    seq_len: usize,
    dim: usize,
    data: Vec<f64>,
}

impl Embedding {
    pub fn zeros(seq_len: usize, dim: usize) -> Self {
        Self {
            seq_len,
            dim,
            data: vec![0.0; seq_len * dim],
        }
    }

    pub fn from_vec(seq_len: usize, dim: usize, data: Vec<f64>) -> Result<Self> {
        if data.len() != seq_len * dim {
            return Err(OdysseyError::shape_mismatch(
                "embedding data",
                seq_len * dim,
                data.len(),
            ));
        }
        Ok(Self { seq_len, dim, data })
    }

    pub fn from_rows(rows: Vec<Vec<f64>>) -> Result<Self> {
        let seq_len = rows.len();
        let dim = rows.first().map(Vec::len).unwrap_or(0);
        let mut data = Vec::with_capacity(seq_len * dim);
        for (i, row) in rows.into_iter().enumerate() {
            if row.len() != dim {
                return Err(OdysseyError::shape_mismatch(
                    format!("embedding row {i}"),
                    dim,
                    row.len(),
                ));
            }
            data.extend(row);
        }
        Ok(Self { seq_len, dim, data })
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.seq_len, self.dim)
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<f64> {
        self.data
    }

    pub fn row(&self, i: usize) -> &[f64] {
        &self.data[i * self.dim..(i + 1) * self.dim]
    }

    pub fn row_mut(&mut self, i: usize) -> &mut [f64] {
        &mut self.data[i * self.dim..(i + 1) * self.dim]
    }

    /// Fail with `ShapeMismatch` unless `other` has the same shape.
    pub fn ensure_same_shape(&self, other: &Embedding, context: &str) -> Result<()> {
        if self.shape() != other.shape() {
            return Err(OdysseyError::shape_mismatch(
                context,
                format!("{}x{}", self.seq_len, self.dim),
                format!("{}x{}", other.seq_len, other.dim),
            ));
        }
        Ok(())
    }

    /// `self - other`, shapes must agree.
    pub fn sub(&self, other: &Embedding) -> Result<Embedding> {
        self.ensure_same_shape(other, "embedding subtraction")?;
        let data = self
            .data
            .iter()
            .zip(&other.data)
            .map(|(a, b)| a - b)
            .collect();
        Ok(Self {
            seq_len: self.seq_len,
            dim: self.dim,
            data,
        })
    }

    /// Point on the straight line `start + alpha * delta`.
    pub fn interpolate(start: &Embedding, delta: &Embedding, alpha: f64) -> Result<Embedding> {
        start.ensure_same_shape(delta, "path interpolation")?;
        let data = start
            .data
            .iter()
            .zip(&delta.data)
            .map(|(s, d)| s + alpha * d)
            .collect();
        Ok(Self {
            seq_len: start.seq_len,
            dim: start.dim,
            data,
        })
    }

    /// `self += scale * other`.
    pub fn add_scaled(&mut self, other: &Embedding, scale: f64) -> Result<()> {
        self.ensure_same_shape(other, "gradient accumulation")?;
        for (a, b) in self.data.iter_mut().zip(&other.data) {
            *a += scale * b;
        }
        Ok(())
    }

    /// Element-wise product.
    pub fn hadamard(&self, other: &Embedding) -> Result<Embedding> {
        self.ensure_same_shape(other, "element-wise product")?;
        let data = self
            .data
            .iter()
            .zip(&other.data)
            .map(|(a, b)| a * b)
            .collect();
        Ok(Self {
            seq_len: self.seq_len,
            dim: self.dim,
            data,
        })
    }

    pub fn scale(&mut self, factor: f64) {
        for v in &mut self.data {
            *v *= factor;
        }
    }

    pub fn sum(&self) -> f64 {
        self.data.iter().sum()
    }

    /// Sum over the embedding dimension, one value per position.
    pub fn row_sums(&self) -> Vec<f64> {
        (0..self.seq_len).map(|i| self.row(i).iter().sum()).collect()
    }

    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }
}
