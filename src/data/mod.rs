//! Data provisioning
//!
//! A data source yields labeled examples; the feed task pushes them through
//! a bounded channel into the worker's main loop. A slow consumer blocks the
//! feed task, never the worker loop itself.

use crate::error::Result;
use crate::types::Example;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Depth of the feed channel between the data task and the worker loop
const FEED_CAPACITY: usize = 64;

/// A source of labeled training examples
pub trait DataSource: Send {
    /// Open any backing resources
    fn prepare(&mut self) -> Result<()> {
        Ok(())
    }

    /// Yield the next example; `None` means the source is exhausted
    fn next_example(&mut self) -> Result<Option<Example>>;
}

/// Pacing of the feed task
#[derive(Debug, Clone, Copy, Default)]
pub enum FeedPacing {
    /// Push examples as fast as the worker drains them
    #[default]
    Flatout,
    /// Sleep between examples, emulating a live stream
    Interval(Duration),
}

/// Spawn the feed task for a source, returning the worker-side channel
pub fn spawn_feed<S>(
    mut source: S,
    pacing: FeedPacing,
) -> (mpsc::Receiver<Example>, JoinHandle<Result<()>>)
where
    S: DataSource + 'static,
{
    let (tx, rx) = mpsc::channel(FEED_CAPACITY);
    let handle = tokio::spawn(async move {
        source.prepare()?;
        loop {
            let Some(example) = source.next_example()? else {
                debug!("data source exhausted");
                return Ok(());
            };
            if let FeedPacing::Interval(gap) = pacing {
                tokio::time::sleep(gap).await;
            }
            if tx.send(example).await.is_err() {
                // the worker is gone; nothing left to feed
                return Ok(());
            }
        }
    });
    (rx, handle)
}

/// Source over a pre-loaded vector of examples
#[derive(Debug, Clone, Default)]
pub struct InMemorySource {
    examples: VecDeque<Example>,
}

impl InMemorySource {
    /// Wrap a list of examples
    pub fn new(examples: impl IntoIterator<Item = Example>) -> Self {
        InMemorySource {
            examples: examples.into_iter().collect(),
        }
    }
}

impl DataSource for InMemorySource {
    fn next_example(&mut self) -> Result<Option<Example>> {
        Ok(self.examples.pop_front())
    }
}

/// Synthetic stream drawn from a noisy linear model
///
/// Features are sampled uniformly from `[-1, 1]`, the label is the inner
/// product with the generating weights plus Gaussian-free uniform noise.
#[derive(Debug)]
pub struct SyntheticLinearSource {
    weights: Vec<f64>,
    noise: f64,
    limit: Option<u64>,
    emitted: u64,
    rng: StdRng,
}

impl SyntheticLinearSource {
    /// Create a stream generating at most `limit` examples
    pub fn new(weights: Vec<f64>, noise: f64, limit: Option<u64>, seed: u64) -> Self {
        SyntheticLinearSource {
            weights,
            noise,
            limit,
            emitted: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl DataSource for SyntheticLinearSource {
    fn next_example(&mut self) -> Result<Option<Example>> {
        if let Some(limit) = self.limit {
            if self.emitted >= limit {
                return Ok(None);
            }
        }
        self.emitted += 1;
        let features: Vec<f64> = (0..self.weights.len())
            .map(|_| self.rng.gen_range(-1.0..=1.0))
            .collect();
        let clean: f64 = features
            .iter()
            .zip(&self.weights)
            .map(|(x, w)| x * w)
            .sum();
        let label = clean + self.rng.gen_range(-self.noise..=self.noise);
        Ok(Some(Example::new(features, label)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_feed_drains_in_memory_source() {
        let examples: Vec<Example> = (0..5)
            .map(|i| Example::new(vec![i as f64], i as f64))
            .collect();
        let (mut rx, handle) = spawn_feed(InMemorySource::new(examples.clone()), FeedPacing::Flatout);

        let mut received = Vec::new();
        while let Some(example) = rx.recv().await {
            received.push(example);
        }
        assert_eq!(received, examples);
        handle.await.unwrap().unwrap();
    }

    #[test]
    fn test_synthetic_source_honors_limit() {
        let mut source = SyntheticLinearSource::new(vec![1.0, -1.0], 0.0, Some(3), 1);
        let mut count = 0;
        while source.next_example().unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 3);
    }

    #[test]
    fn test_synthetic_labels_follow_the_model() {
        let mut source = SyntheticLinearSource::new(vec![2.0, 0.5], 0.0, Some(10), 9);
        while let Some(example) = source.next_example().unwrap() {
            let expected = 2.0 * example.features[0] + 0.5 * example.features[1];
            assert!((example.label - expected).abs() < 1e-12);
        }
    }
}
