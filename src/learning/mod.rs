//! Learner contract and the reference learner
//!
//! The control plane treats the model as opaque: it pushes batches in, takes
//! parameters out, and never looks further. Concrete models live behind the
//! [`Learner`] trait; [`LinearLearner`] is the built-in reference model used
//! by the simulator and the test suite.

mod logger;

pub use logger::LearningLogger;

use crate::error::{Result, SyncError};
use crate::params::Parameters;
use crate::types::Example;

/// Metrics of one training step
#[derive(Debug, Clone, PartialEq)]
pub struct TrainStep {
    /// Loss suffered on the batch
    pub loss: f64,
    /// Model outputs for the batch, in batch order
    pub predictions: Vec<f64>,
}

/// A trainable model
pub trait Learner: Send {
    /// Replace the model parameters; the shape must match
    fn set_parameters(&mut self, params: Parameters) -> Result<()>;

    /// A fresh copy of the current parameters
    fn parameters(&self) -> Parameters;

    /// Train on one batch
    fn train(&mut self, batch: &[Example]) -> Result<TrainStep>;
}

/// Least-mean-squares linear model trained by SGD
#[derive(Debug, Clone)]
pub struct LinearLearner {
    weights: Vec<f64>,
    learning_rate: f64,
}

impl LinearLearner {
    /// Zero-initialized model over `dimension` features
    pub fn new(dimension: usize, learning_rate: f64) -> Self {
        LinearLearner {
            weights: vec![0.0; dimension],
            learning_rate,
        }
    }

    fn predict(&self, features: &[f64]) -> f64 {
        self.weights
            .iter()
            .zip(features)
            .map(|(w, x)| w * x)
            .sum()
    }
}

impl Learner for LinearLearner {
    fn set_parameters(&mut self, params: Parameters) -> Result<()> {
        let flat = params.to_vector();
        if flat.len() != self.weights.len() {
            return Err(SyncError::TypeContract(format!(
                "linear learner has {} weights, received {}",
                self.weights.len(),
                flat.len()
            )));
        }
        self.weights = flat;
        Ok(())
    }

    fn parameters(&self) -> Parameters {
        Parameters::dense(self.weights.clone())
    }

    fn train(&mut self, batch: &[Example]) -> Result<TrainStep> {
        if batch.is_empty() {
            return Err(SyncError::Configuration(
                "training batch must not be empty".to_string(),
            ));
        }
        let mut loss = 0.0;
        let mut predictions = Vec::with_capacity(batch.len());
        for example in batch {
            if example.features.len() != self.weights.len() {
                return Err(SyncError::TypeContract(format!(
                    "example has {} features, model has {} weights",
                    example.features.len(),
                    self.weights.len()
                )));
            }
            let predicted = self.predict(&example.features);
            let residual = predicted - example.label;
            loss += residual * residual;
            predictions.push(predicted);
            for (w, x) in self.weights.iter_mut().zip(&example.features) {
                *w -= self.learning_rate * residual * x;
            }
        }
        Ok(TrainStep {
            loss: loss / batch.len() as f64,
            predictions,
        })
    }
}
