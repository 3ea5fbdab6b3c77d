//! Initialization handlers
//!
//! Policy for the parameters a newly-registered worker receives. `Identity`
//! leaves models untouched. `UseFirst` hands every later node the first
//! model seen, so all learners start from the exact same point. `Noisy`
//! does the same but perturbs the handed-out copy, so learners start spread
//! around a common center.
//!
//! Besides the model to hand out, the handler yields the reference point the
//! coordinator seeds its synchronizer with when none exists yet.

use crate::error::Result;
use crate::params::Parameters;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Policy applied to the parameters of a registering node
#[derive(Debug)]
pub enum InitHandler {
    /// Hand back the node's own parameters
    Identity {
        /// First model seen, kept as the reference seed
        saved_ref: Option<Parameters>,
    },
    /// Hand every node the first model seen
    UseFirst {
        /// First model seen
        cached: Option<Parameters>,
    },
    /// Hand every node the first model seen plus uniform noise
    Noisy {
        /// First model seen
        cached: Option<Parameters>,
        /// Half-width of the uniform noise added per weight
        noise_range: f64,
        rng: StdRng,
    },
}

impl InitHandler {
    /// Identity policy
    pub fn identity() -> Self {
        InitHandler::Identity { saved_ref: None }
    }

    /// Use-first policy
    pub fn use_first() -> Self {
        InitHandler::UseFirst { cached: None }
    }

    /// Noisy policy with the given noise half-width
    pub fn noisy(noise_range: f64) -> Self {
        InitHandler::Noisy {
            cached: None,
            noise_range,
            rng: StdRng::from_entropy(),
        }
    }

    /// Noisy policy with a deterministic noise source
    pub fn noisy_seeded(noise_range: f64, seed: u64) -> Self {
        InitHandler::Noisy {
            cached: None,
            noise_range,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Apply the policy to a registering node's parameters.
    ///
    /// Returns the parameters to hand out and the reference point to seed
    /// the coordinator with while it has none.
    pub fn apply(&mut self, params: &Parameters) -> Result<(Parameters, Parameters)> {
        match self {
            InitHandler::Identity { saved_ref } => {
                let reference = saved_ref.get_or_insert_with(|| params.clone());
                Ok((params.clone(), reference.clone()))
            }
            InitHandler::UseFirst { cached } => {
                let first = cached.get_or_insert_with(|| params.clone());
                Ok((first.clone(), first.clone()))
            }
            InitHandler::Noisy {
                cached,
                noise_range,
                rng,
            } => {
                let first = cached.get_or_insert_with(|| params.clone()).clone();
                let mut noisy = first.clone();
                let range = *noise_range;
                let perturbed: Vec<f64> = noisy
                    .to_vector()
                    .into_iter()
                    .map(|w| w + rng.gen_range(-range..=range))
                    .collect();
                noisy.assign_from_vector(&perturbed)?;
                Ok((noisy, first))
            }
        }
    }
}
