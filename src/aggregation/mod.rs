//! Aggregation operators
//!
//! An aggregator folds the parameter sets collected in a balancing round into
//! one model. Variants are closed at the core boundary; the synchronizer
//! picks targets, the aggregator only does the math.

mod average;
mod geometric_median;

pub use average::Average;
pub use geometric_median::GeometricMedian;

use crate::error::Result;
use crate::params::Parameters;

/// Aggregation operator selected for an experiment
#[derive(Debug, Clone)]
pub enum Aggregator {
    /// Component-wise arithmetic mean
    Average(Average),
    /// Weiszfeld geometric median over the flat vector view
    GeometricMedian(GeometricMedian),
}

impl Aggregator {
    /// Arithmetic mean aggregator
    pub fn average() -> Self {
        Aggregator::Average(Average)
    }

    /// Geometric median aggregator with default tolerance
    pub fn geometric_median() -> Self {
        Aggregator::GeometricMedian(GeometricMedian::default())
    }

    /// Fold the given parameter sets into one aggregated model
    pub fn aggregate(&self, params: &[Parameters]) -> Result<Parameters> {
        match self {
            Aggregator::Average(a) => a.aggregate(params),
            Aggregator::GeometricMedian(g) => g.aggregate(params),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_through_enum() {
        let inputs = [Parameters::dense(vec![2.0]), Parameters::dense(vec![4.0])];
        let mean = Aggregator::average().aggregate(&inputs).unwrap();
        assert_eq!(mean, Parameters::dense(vec![3.0]));

        let median = Aggregator::geometric_median().aggregate(&inputs).unwrap();
        assert!(median.distance(&Parameters::dense(vec![3.0])).unwrap() < 1e-4);
    }
}
