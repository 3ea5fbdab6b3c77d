//! Named multi-dimensional parameter tensors
//!
//! The layered analog of [`DenseVector`](super::DenseVector): an ordered map
//! from layer name to a shaped real array, as produced by neural-network
//! learners. The synchronizer never looks inside; only the algebra does.

use crate::error::{Result, SyncError};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// One shaped array of reals, stored row-major
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f64>,
}

impl Tensor {
    /// Create a tensor, validating that the shape covers the data
    pub fn new(shape: Vec<usize>, data: Vec<f64>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(SyncError::TypeContract(format!(
                "tensor shape {:?} covers {} elements, data has {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Tensor { shape, data })
    }

    /// Tensor shape
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Flat row-major view of the data
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    fn len(&self) -> usize {
        self.data.len()
    }
}

/// Insertion-ordered map from layer key to tensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedTensorMap {
    entries: IndexMap<String, Tensor>,
}

impl NamedTensorMap {
    /// Build a map from `(key, tensor)` pairs, preserving order
    pub fn new(entries: impl IntoIterator<Item = (String, Tensor)>) -> Self {
        NamedTensorMap {
            entries: entries.into_iter().collect(),
        }
    }

    /// Number of scalar weights over all tensors
    pub fn dimension(&self) -> usize {
        self.entries.values().map(Tensor::len).sum()
    }

    /// Look up a tensor by layer key
    pub fn get(&self, key: &str) -> Option<&Tensor> {
        self.entries.get(key)
    }

    /// Iterate entries in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Tensor)> {
        self.entries.iter()
    }

    fn check_same_layout(&self, other: &NamedTensorMap) -> Result<()> {
        if self.entries.len() != other.entries.len() {
            return Err(SyncError::TypeContract(format!(
                "tensor maps have different layer counts: {} vs {}",
                self.entries.len(),
                other.entries.len()
            )));
        }
        for ((ka, ta), (kb, tb)) in self.entries.iter().zip(other.entries.iter()) {
            if ka != kb || ta.shape != tb.shape {
                return Err(SyncError::TypeContract(format!(
                    "tensor map layer mismatch: {ka:?}{:?} vs {kb:?}{:?}",
                    ta.shape, tb.shape
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn add(&mut self, other: &NamedTensorMap) -> Result<()> {
        self.check_same_layout(other)?;
        for (tensor, other_tensor) in self.entries.values_mut().zip(other.entries.values()) {
            for (w, o) in tensor.data.iter_mut().zip(&other_tensor.data) {
                *w += o;
            }
        }
        Ok(())
    }

    pub(crate) fn scalar_multiply(&mut self, scalar: f64) {
        for tensor in self.entries.values_mut() {
            for w in &mut tensor.data {
                *w *= scalar;
            }
        }
    }

    pub(crate) fn distance(&self, other: &NamedTensorMap) -> Result<f64> {
        self.check_same_layout(other)?;
        let mut sum = 0.0;
        for (tensor, other_tensor) in self.entries.values().zip(other.entries.values()) {
            for (a, b) in tensor.data.iter().zip(&other_tensor.data) {
                sum += (a - b) * (a - b);
            }
        }
        Ok(sum.sqrt())
    }

    pub(crate) fn to_vector(&self) -> Vec<f64> {
        let mut flat = Vec::with_capacity(self.dimension());
        for tensor in self.entries.values() {
            flat.extend_from_slice(&tensor.data);
        }
        flat
    }

    pub(crate) fn assign_from_vector(&mut self, flat: &[f64]) -> Result<()> {
        if flat.len() != self.dimension() {
            return Err(SyncError::TypeContract(format!(
                "tensor map holds {} weights, flat view has {}",
                self.dimension(),
                flat.len()
            )));
        }
        let mut offset = 0;
        for tensor in self.entries.values_mut() {
            let next = offset + tensor.data.len();
            tensor.data.copy_from_slice(&flat[offset..next]);
            offset = next;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> NamedTensorMap {
        NamedTensorMap::new(vec![
            (
                "dense".to_string(),
                Tensor::new(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap(),
            ),
            ("bias".to_string(), Tensor::new(vec![2], vec![0.5, 0.5]).unwrap()),
        ])
    }

    #[test]
    fn test_shape_must_cover_data() {
        assert!(Tensor::new(vec![2, 3], vec![0.0; 5]).is_err());
    }

    #[test]
    fn test_flat_view_preserves_order() {
        let map = sample();
        assert_eq!(map.to_vector(), vec![1.0, 2.0, 3.0, 4.0, 0.5, 0.5]);
    }

    #[test]
    fn test_assign_from_vector_keeps_shapes() {
        let mut map = sample();
        let flat: Vec<f64> = (0..6).map(|i| i as f64).collect();
        map.assign_from_vector(&flat).unwrap();
        assert_eq!(map.get("dense").unwrap().shape(), &[2, 2]);
        assert_eq!(map.get("bias").unwrap().data(), &[4.0, 5.0]);
    }

    #[test]
    fn test_layout_mismatch_is_error() {
        let mut a = sample();
        let b = NamedTensorMap::new(vec![(
            "dense".to_string(),
            Tensor::new(vec![4], vec![0.0; 4]).unwrap(),
        )]);
        assert!(a.add(&b).is_err());
        assert!(a.distance(&b).is_err());
    }
}
