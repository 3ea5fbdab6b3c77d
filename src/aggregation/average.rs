//! Arithmetic mean aggregation

use crate::error::{Result, SyncError};
use crate::params::Parameters;

/// Component-wise arithmetic mean of n parameter sets
#[derive(Debug, Clone, Copy, Default)]
pub struct Average;

impl Average {
    /// Aggregate by summing all inputs and rescaling by `1/n`
    pub fn aggregate(&self, params: &[Parameters]) -> Result<Parameters> {
        let (first, rest) = params
            .split_first()
            .ok_or_else(|| SyncError::Configuration("average of zero models".to_string()))?;
        let mut aggregated = first.clone();
        for param in rest {
            aggregated.add(param)?;
        }
        aggregated.scalar_multiply(1.0 / params.len() as f64);
        Ok(aggregated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_of_two() {
        let agg = Average;
        let result = agg
            .aggregate(&[
                Parameters::dense(vec![1.0, 3.0]),
                Parameters::dense(vec![3.0, 5.0]),
            ])
            .unwrap();
        assert_eq!(result, Parameters::dense(vec![2.0, 4.0]));
    }

    #[test]
    fn test_mean_is_idempotent_on_identical_inputs() {
        let agg = Average;
        let p = Parameters::dense(vec![0.25, -1.5, 7.0]);
        let result = agg.aggregate(&[p.clone(), p.clone(), p.clone(), p.clone()]).unwrap();
        assert!(result.distance(&p).unwrap() < 1e-12);
    }

    #[test]
    fn test_empty_input_is_error() {
        assert!(Average.aggregate(&[]).is_err());
    }
}
