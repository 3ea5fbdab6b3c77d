//! Dense 1-D parameter vectors

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};

/// Model parameters represented as a flat real vector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseVector {
    weights: Vec<f64>,
}

impl DenseVector {
    /// Wrap a weight vector
    pub fn new(weights: Vec<f64>) -> Self {
        DenseVector { weights }
    }

    /// Number of weights
    pub fn dimension(&self) -> usize {
        self.weights.len()
    }

    /// Borrow the weights
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Replace the weights, keeping the dimension fixed
    pub fn set_weights(&mut self, weights: Vec<f64>) -> Result<()> {
        if weights.len() != self.weights.len() {
            return Err(SyncError::TypeContract(format!(
                "dense vector has dimension {}, assignment has {}",
                self.weights.len(),
                weights.len()
            )));
        }
        self.weights = weights;
        Ok(())
    }

    pub(crate) fn add(&mut self, other: &DenseVector) -> Result<()> {
        if other.weights.len() != self.weights.len() {
            return Err(SyncError::TypeContract(format!(
                "dense vector addition dimension mismatch: {} vs {}",
                self.weights.len(),
                other.weights.len()
            )));
        }
        for (w, o) in self.weights.iter_mut().zip(&other.weights) {
            *w += o;
        }
        Ok(())
    }

    pub(crate) fn scalar_multiply(&mut self, scalar: f64) {
        for w in &mut self.weights {
            *w *= scalar;
        }
    }

    pub(crate) fn distance(&self, other: &DenseVector) -> Result<f64> {
        if other.weights.len() != self.weights.len() {
            return Err(SyncError::TypeContract(format!(
                "dense vector distance dimension mismatch: {} vs {}",
                self.weights.len(),
                other.weights.len()
            )));
        }
        let sum: f64 = self
            .weights
            .iter()
            .zip(&other.weights)
            .map(|(a, b)| (a - b) * (a - b))
            .sum();
        Ok(sum.sqrt())
    }
}
