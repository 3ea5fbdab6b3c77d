//! Stopping criteria
//!
//! Pure predicates over `(seen examples, wall clock)` evaluated by the
//! worker after each training step. Meeting a criterion is not an error: the
//! worker deregisters and leaves its main loop.

use std::time::{Duration, Instant};

/// When a worker stops training
#[derive(Debug, Clone, Copy)]
pub enum StoppingCriterion {
    /// Stop after a number of consumed examples
    MaxExamples {
        /// Example budget
        max: u64,
    },
    /// Stop after a wall-clock duration
    Timeout {
        /// Start of the run
        started_at: Instant,
        /// Training budget
        duration: Duration,
    },
}

impl StoppingCriterion {
    /// Stop after `max` examples
    pub fn max_examples(max: u64) -> Self {
        StoppingCriterion::MaxExamples { max }
    }

    /// Stop `duration` after now
    pub fn timeout(duration: Duration) -> Self {
        StoppingCriterion::Timeout {
            started_at: Instant::now(),
            duration,
        }
    }

    /// Evaluate the predicate
    pub fn is_met(&self, seen_examples: u64, now: Instant) -> bool {
        match self {
            StoppingCriterion::MaxExamples { max } => seen_examples >= *max,
            StoppingCriterion::Timeout {
                started_at,
                duration,
            } => now.duration_since(*started_at) >= *duration,
        }
    }
}
