//! Geometric median aggregation
//!
//! Weiszfeld iteration with the Vardi–Zhang correction for iterates that land
//! on an input point, computed over the flat vector view of the inputs. More
//! robust to outlier models than the arithmetic mean.

use crate::error::{Result, SyncError};
use crate::params::Parameters;

const DEFAULT_EPS: f64 = 1e-5;
const DEFAULT_MAX_ITER: usize = 10_000;

/// Geometric median of n parameter sets
#[derive(Debug, Clone, Copy)]
pub struct GeometricMedian {
    eps: f64,
    max_iter: usize,
}

impl Default for GeometricMedian {
    fn default() -> Self {
        GeometricMedian {
            eps: DEFAULT_EPS,
            max_iter: DEFAULT_MAX_ITER,
        }
    }
}

impl GeometricMedian {
    /// Override the convergence threshold and the iteration ceiling
    pub fn with_tolerance(eps: f64, max_iter: usize) -> Self {
        GeometricMedian { eps, max_iter }
    }

    /// Aggregate by computing the geometric median of the stacked flat vectors
    pub fn aggregate(&self, params: &[Parameters]) -> Result<Parameters> {
        let first = params
            .first()
            .ok_or_else(|| SyncError::Configuration("geometric median of zero models".to_string()))?;
        let dim = first.dimension();
        let mut rows = Vec::with_capacity(params.len());
        for param in params {
            if param.dimension() != dim {
                return Err(SyncError::TypeContract(format!(
                    "geometric median input dimension mismatch: {} vs {}",
                    dim,
                    param.dimension()
                )));
            }
            rows.push(param.to_vector());
        }
        let median = self.weiszfeld(&rows);
        // copying the first input keeps the shape information intact
        let mut aggregated = first.clone();
        aggregated.assign_from_vector(&median)?;
        Ok(aggregated)
    }

    fn weiszfeld(&self, rows: &[Vec<f64>]) -> Vec<f64> {
        let dim = rows[0].len();
        let mut y = column_mean(rows, dim);

        for _ in 0..self.max_iter {
            let dists: Vec<f64> = rows.iter().map(|row| euclidean(row, &y)).collect();
            let zeros = dists.iter().filter(|d| **d == 0.0).count();
            if zeros == rows.len() {
                return y;
            }
            let dinv_sum: f64 = dists.iter().filter(|d| **d != 0.0).map(|d| 1.0 / d).sum();

            // weighted centroid over the rows the iterate is not sitting on
            let mut t = vec![0.0; dim];
            for (row, d) in rows.iter().zip(&dists) {
                if *d != 0.0 {
                    let w = (1.0 / d) / dinv_sum;
                    for (ti, ri) in t.iter_mut().zip(row) {
                        *ti += w * ri;
                    }
                }
            }

            let next = if zeros == 0 {
                t
            } else {
                let r: f64 = t
                    .iter()
                    .zip(&y)
                    .map(|(ti, yi)| {
                        let v = (ti - yi) * dinv_sum;
                        v * v
                    })
                    .sum::<f64>()
                    .sqrt();
                let eta = if r == 0.0 { 0.0 } else { zeros as f64 / r };
                let wt = (1.0 - eta).max(0.0);
                let wy = eta.min(1.0);
                t.iter().zip(&y).map(|(ti, yi)| wt * ti + wy * yi).collect()
            };

            if euclidean(&y, &next) < self.eps {
                return next;
            }
            y = next;
        }
        y
    }
}

fn column_mean(rows: &[Vec<f64>], dim: usize) -> Vec<f64> {
    let mut mean = vec![0.0; dim];
    for row in rows {
        for (m, v) in mean.iter_mut().zip(row) {
            *m += v;
        }
    }
    for m in &mut mean {
        *m /= rows.len() as f64;
    }
    mean
}

fn euclidean(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}
