//! Parameter value algebra
//!
//! `Parameters` is the closed union of model parameter representations the
//! control plane moves around. The synchronizer and aggregators only use the
//! algebra exposed here; the concrete layout stays opaque to them.
//! Cross-variant operations are a type-contract error, never a silent
//! fall-through.

mod dense;
mod tensor_map;

pub use dense::DenseVector;
pub use tensor_map::{NamedTensorMap, Tensor};

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};

/// Model parameters exchanged between workers and the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Parameters {
    /// Flat real vector
    Dense(DenseVector),
    /// Ordered map of named, shaped tensors
    TensorMap(NamedTensorMap),
}

impl Parameters {
    /// Dense parameters from a weight vector
    pub fn dense(weights: Vec<f64>) -> Self {
        Parameters::Dense(DenseVector::new(weights))
    }

    /// Tensor-map parameters from `(key, tensor)` pairs
    pub fn tensor_map(entries: impl IntoIterator<Item = (String, Tensor)>) -> Self {
        Parameters::TensorMap(NamedTensorMap::new(entries))
    }

    /// Total number of scalar weights
    pub fn dimension(&self) -> usize {
        match self {
            Parameters::Dense(v) => v.dimension(),
            Parameters::TensorMap(m) => m.dimension(),
        }
    }

    /// In-place element-wise sum. Both sides must have the same variant and shape.
    pub fn add(&mut self, other: &Parameters) -> Result<()> {
        match (self, other) {
            (Parameters::Dense(a), Parameters::Dense(b)) => a.add(b),
            (Parameters::TensorMap(a), Parameters::TensorMap(b)) => a.add(b),
            (a, b) => Err(variant_mismatch("add", a, b)),
        }
    }

    /// In-place multiplication by a scalar
    pub fn scalar_multiply(&mut self, scalar: f64) {
        match self {
            Parameters::Dense(v) => v.scalar_multiply(scalar),
            Parameters::TensorMap(m) => m.scalar_multiply(scalar),
        }
    }

    /// Euclidean distance over the flat vector view
    pub fn distance(&self, other: &Parameters) -> Result<f64> {
        match (self, other) {
            (Parameters::Dense(a), Parameters::Dense(b)) => a.distance(b),
            (Parameters::TensorMap(a), Parameters::TensorMap(b)) => a.distance(b),
            (a, b) => Err(variant_mismatch("distance", a, b)),
        }
    }

    /// Flat vector view of all weights
    pub fn to_vector(&self) -> Vec<f64> {
        match self {
            Parameters::Dense(v) => v.weights().to_vec(),
            Parameters::TensorMap(m) => m.to_vector(),
        }
    }

    /// Overwrite the weights from a flat vector, preserving the shape
    pub fn assign_from_vector(&mut self, flat: &[f64]) -> Result<()> {
        match self {
            Parameters::Dense(v) => v.set_weights(flat.to_vec()),
            Parameters::TensorMap(m) => m.assign_from_vector(flat),
        }
    }

    fn variant_name(&self) -> &'static str {
        match self {
            Parameters::Dense(_) => "Dense",
            Parameters::TensorMap(_) => "TensorMap",
        }
    }
}

fn variant_mismatch(op: &str, a: &Parameters, b: &Parameters) -> SyncError {
    SyncError::TypeContract(format!(
        "{op} across parameter variants: {} vs {}",
        a.variant_name(),
        b.variant_name()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_cross_variant_add_is_type_error() {
        let mut dense = Parameters::dense(vec![1.0]);
        let map = Parameters::tensor_map(vec![(
            "w".to_string(),
            Tensor::new(vec![1], vec![1.0]).unwrap(),
        )]);
        assert!(matches!(
            dense.add(&map),
            Err(SyncError::TypeContract(_))
        ));
        assert!(matches!(
            dense.distance(&map),
            Err(SyncError::TypeContract(_))
        ));
    }

    #[test]
    fn test_copy_is_independent() {
        let original = Parameters::dense(vec![1.0, 1.0]);
        let third = Parameters::dense(vec![0.0, 0.0]);
        let before = original.distance(&third).unwrap();

        let mut copy = original.clone();
        copy.scalar_multiply(10.0);

        assert_eq!(original.distance(&third).unwrap(), before);
    }

    #[test]
    fn test_flat_roundtrip_tensor_map() {
        let p = Parameters::tensor_map(vec![
            (
                "conv".to_string(),
                Tensor::new(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap(),
            ),
            ("bias".to_string(), Tensor::new(vec![3], vec![0.1, 0.2, 0.3]).unwrap()),
        ]);
        let mut q = p.clone();
        q.scalar_multiply(0.0);
        q.assign_from_vector(&p.to_vector()).unwrap();
        assert_eq!(p, q);
    }

    proptest! {
        #[test]
        fn prop_flat_roundtrip_dense(weights in proptest::collection::vec(-1e6f64..1e6, 1..64)) {
            let p = Parameters::dense(weights);
            let mut q = p.clone();
            q.assign_from_vector(&p.to_vector()).unwrap();
            prop_assert_eq!(p, q);
        }

        #[test]
        fn prop_distance_to_self_is_zero(weights in proptest::collection::vec(-1e3f64..1e3, 1..32)) {
            let p = Parameters::dense(weights);
            prop_assert!(p.distance(&p).unwrap().abs() < 1e-12);
        }
    }
}
