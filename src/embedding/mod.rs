//! # Embedding Optimization
//!
//! Momentum gradient descent on the Kullback-Leibler divergence between the
//! calibrated high-dimensional affinities and a Student-t neighbor
//! distribution over the low-dimensional coordinates. The schedule is fixed:
//! early exaggeration for the first 100 iterations, momentum switching from
//! 0.5 to 0.8 at iteration 20, per-coordinate adaptive gains, and a constant
//! iteration count with no early stopping.

use anyhow::bail;
use log::debug;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use rayon::prelude::*;

use crate::affinity::{calibrate_affinities, CalibratedAffinities};
use crate::utils::{squared_euclidean_distances, validate_points, PROB_FLOOR};

const INITIAL_MOMENTUM: f64 = 0.5;
const FINAL_MOMENTUM: f64 = 0.8;
const MOMENTUM_SWITCH_ITER: usize = 20;
const MIN_GAIN: f64 = 0.01;
const EXAGGERATION: f64 = 4.0;
const EXAGGERATION_END_ITER: usize = 100;

/// Converged embedding together with the distributions it was optimized
/// against, ready to be handed to the sensitivity engine.
pub struct EmbeddingResult {
    /// n x output_dims coordinates, column means removed.
    pub y: Array2<f64>,
    /// High-dimensional affinities after the exaggeration was undone.
    pub p: Array2<f64>,
    /// Low-dimensional Student-t affinities of the final coordinates.
    pub q: Array2<f64>,
    /// Bandwidths from calibration, passed through unchanged.
    pub sigma: Array1<f64>,
}

pub struct TsneBuilder {
    perplexity: f64,
    tolerance: f64,
    max_iter: usize,
    output_dims: usize,
    learning_rate: f64,
    seed: Option<u64>,
    initial_embedding: Option<Array2<f64>>,
}

impl TsneBuilder {
    pub fn new() -> Self {
        TsneBuilder {
            perplexity: 30.0,
            tolerance: 1e-5,
            max_iter: 400,
            output_dims: 2,
            learning_rate: 500.0,
            seed: None,
            initial_embedding: None,
        }
    }

    pub fn perplexity(mut self, perplexity: f64) -> Self {
        self.perplexity = perplexity;
        self
    }

    pub fn tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    pub fn output_dims(mut self, output_dims: usize) -> Self {
        self.output_dims = output_dims;
        self
    }

    pub fn learning_rate(mut self, learning_rate: f64) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn initial_embedding(mut self, y: Array2<f64>) -> Self {
        self.initial_embedding = Some(y);
        self
    }

    pub fn build(self) -> Tsne {
        Tsne {
            perplexity: self.perplexity,
            tolerance: self.tolerance,
            max_iter: self.max_iter,
            output_dims: self.output_dims,
            learning_rate: self.learning_rate,
            seed: self.seed,
            initial_embedding: self.initial_embedding,
        }
    }
}

impl Default for TsneBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Tsne {
    perplexity: f64,
    tolerance: f64,
    max_iter: usize,
    output_dims: usize,
    learning_rate: f64,
    seed: Option<u64>,
    initial_embedding: Option<Array2<f64>>,
}

impl Tsne {
    /// Calibrates affinities for `x` and optimizes the embedding in one call.
    pub fn embed(&self, x: ArrayView2<f64>) -> anyhow::Result<EmbeddingResult> {
        let CalibratedAffinities { p, sigma } =
            calibrate_affinities(x, self.perplexity, self.tolerance)?;
        self.optimize(p.view(), sigma.view())
    }

    /// Optimizes an embedding for pre-calibrated affinities.
    pub fn optimize(
        &self,
        p: ArrayView2<f64>,
        sigma: ArrayView1<f64>,
    ) -> anyhow::Result<EmbeddingResult> {
        let (rows, cols) = p.dim();
        if rows != cols {
            bail!("affinity matrix must be square, got {} x {}", rows, cols);
        }
        if rows < 2 {
            bail!("affinity matrix must cover at least two points");
        }
        if sigma.len() != rows {
            bail!(
                "bandwidth vector length ({}) does not match number of points ({})",
                sigma.len(),
                rows
            );
        }
        if self.max_iter == 0 {
            bail!("max_iter must be at least 1");
        }
        if self.output_dims == 0 {
            bail!("output_dims must be at least 1");
        }

        let n = rows;
        let dims = self.output_dims;

        let mut y = match &self.initial_embedding {
            Some(init) => {
                if init.dim() != (n, dims) {
                    bail!(
                        "initial embedding has shape {:?}, expected ({}, {})",
                        init.dim(),
                        n,
                        dims
                    );
                }
                validate_points(init.view(), "initial embedding")?;
                init.clone()
            }
            None => {
                let mut rng = match self.seed {
                    Some(seed) => ChaCha8Rng::seed_from_u64(seed),
                    None => ChaCha8Rng::from_os_rng(),
                };
                Array2::from_shape_simple_fn((n, dims), || StandardNormal.sample(&mut rng))
            }
        };

        // Working copy with early exaggeration applied.
        let mut p = p.to_owned() * EXAGGERATION;
        p.mapv_inplace(|v| v.max(PROB_FLOOR));

        let mut velocity = Array2::<f64>::zeros((n, dims));
        let mut gains = Array2::<f64>::ones((n, dims));

        for iter in 0..self.max_iter {
            let (kernel, q) = low_dim_affinities(y.view());

            let gradient = kl_gradient(p.view(), q.view(), kernel.view(), y.view());

            let momentum = if iter < MOMENTUM_SWITCH_ITER {
                INITIAL_MOMENTUM
            } else {
                FINAL_MOMENTUM
            };

            for ((g, &grad), &vel) in gains.iter_mut().zip(gradient.iter()).zip(velocity.iter()) {
                if (grad > 0.0) != (vel > 0.0) {
                    *g += 0.2;
                } else {
                    *g *= 0.8;
                }
                if *g < MIN_GAIN {
                    *g = MIN_GAIN;
                }
            }

            velocity
                .iter_mut()
                .zip(gains.iter())
                .zip(gradient.iter())
                .for_each(|((vel, &g), &grad)| {
                    *vel = momentum * *vel - self.learning_rate * g * grad;
                });
            y += &velocity;

            // Remove translational drift.
            let mean = y
                .mean_axis(Axis(0))
                .expect("embedding has at least one row");
            y -= &mean;

            if (iter + 1) % 100 == 0 && log::log_enabled!(log::Level::Debug) {
                let cost: f64 = p
                    .iter()
                    .zip(q.iter())
                    .map(|(&pv, &qv)| pv * (pv / qv).ln())
                    .sum();
                debug!("iteration {}: KL divergence {:.6}", iter + 1, cost);
            }

            // Stop exaggerating once the clusters have separated.
            if iter == EXAGGERATION_END_ITER {
                p /= EXAGGERATION;
            }
        }

        let (_, q) = low_dim_affinities(y.view());

        Ok(EmbeddingResult {
            y,
            p,
            q,
            sigma: sigma.to_owned(),
        })
    }
}

// Student-t affinities of the current coordinates: the unnormalized kernel
// 1 / (1 + ||y_i - y_j||^2) with a zero diagonal, and the matrix-normalized
// distribution floored at 1e-12.
pub(crate) fn low_dim_affinities(y: ArrayView2<f64>) -> (Array2<f64>, Array2<f64>) {
    let n = y.nrows();
    let mut kernel = squared_euclidean_distances(y).mapv(|v| 1.0 / (1.0 + v));
    for i in 0..n {
        kernel[[i, i]] = 0.0;
    }
    let total = kernel.sum();
    let q = kernel.mapv(|v| (v / total).max(PROB_FLOOR));
    (kernel, q)
}

// KL gradient per embedded point, up to the constant factor of the analytic
// derivative, which is folded into the learning rate. Rows are independent.
fn kl_gradient(
    p: ArrayView2<f64>,
    q: ArrayView2<f64>,
    kernel: ArrayView2<f64>,
    y: ArrayView2<f64>,
) -> Array2<f64> {
    let n = y.nrows();
    let dims = y.ncols();

    let rows: Vec<Array1<f64>> = (0..n)
        .into_par_iter()
        .map(|i| {
            let mut row = Array1::zeros(dims);
            for j in 0..n {
                let weight = (p[[i, j]] - q[[i, j]]) * kernel[[i, j]];
                for k in 0..dims {
                    row[k] += weight * (y[[i, k]] - y[[j, k]]);
                }
            }
            row
        })
        .collect();

    let mut gradient = Array2::zeros((n, dims));
    for (i, row) in rows.into_iter().enumerate() {
        gradient.row_mut(i).assign(&row);
    }
    gradient
}

/// Optimizes an embedding for a pre-calibrated affinity matrix.
///
/// Free-function form of [`Tsne::optimize`] for callers that ran
/// [`calibrate_affinities`] themselves. The bandwidths are passed through to
/// the result untouched so the sensitivity engine can consume them later.
pub fn optimize_embedding(
    p: ArrayView2<f64>,
    sigma: ArrayView1<f64>,
    max_iter: usize,
    output_dims: usize,
    initial_embedding: Option<Array2<f64>>,
) -> anyhow::Result<EmbeddingResult> {
    let mut builder = TsneBuilder::new()
        .max_iter(max_iter)
        .output_dims(output_dims);
    if let Some(init) = initial_embedding {
        builder = builder.initial_embedding(init);
    }
    builder.build().optimize(p, sigma)
}
