//! # Affinity Calibration
//!
//! Builds the high-dimensional neighbor distribution used by the embedding
//! optimizer. Each point gets its own Gaussian kernel bandwidth, found by a
//! binary search so that the entropy of the point's conditional neighbor
//! distribution matches `ln(perplexity)`. The per-point searches are
//! independent and run in parallel.

use anyhow::bail;
use log::debug;
use ndarray::{Array1, Array2, ArrayView2};
use rayon::prelude::*;

use crate::utils::{squared_euclidean_distances, validate_points, PROB_FLOOR};

/// Trial budget for the per-point bandwidth search. Exhausting it is not an
/// error; the last estimate is kept (soft convergence).
const MAX_TRIES: usize = 50;

/// Output of [`calibrate_affinities`]: the symmetrized joint affinity matrix
/// and the per-point kernel bandwidths.
pub struct CalibratedAffinities {
    /// n x n symmetric joint probabilities, summing to 1, floored at 1e-12.
    pub p: Array2<f64>,
    /// Per-point bandwidth sigma_i = sqrt(1 / beta_i), strictly positive.
    pub sigma: Array1<f64>,
}

// Entropy and normalized neighbor probabilities of one point at precision
// beta = 1 / (2 sigma^2). The self-distance is excluded by the caller.
fn gaussian_row(distances: &[f64], beta: f64) -> (f64, Vec<f64>) {
    let mut weights: Vec<f64> = distances.iter().map(|&d| (-d * beta).exp()).collect();
    let sum: f64 = weights.iter().sum::<f64>().max(f64::EPSILON);
    let weighted_distance: f64 = distances
        .iter()
        .zip(weights.iter())
        .map(|(&d, &w)| d * w)
        .sum();
    let entropy = sum.ln() + beta * weighted_distance / sum;
    for w in weights.iter_mut() {
        *w /= sum;
    }
    (entropy, weights)
}

// Binary search for the precision whose entropy matches log_perplexity.
// Doubles or halves beta while a bracket side is unbounded, bisects once
// both are. A NaN entropy difference keeps the search going.
fn search_precision(distances: &[f64], log_perplexity: f64, tolerance: f64) -> (f64, Vec<f64>) {
    let mut beta = 1.0;
    let mut beta_min = f64::NEG_INFINITY;
    let mut beta_max = f64::INFINITY;

    let (entropy, mut probs) = gaussian_row(distances, beta);
    let mut diff = entropy - log_perplexity;
    let mut tries = 0;

    while (diff.is_nan() || diff.abs() > tolerance) && tries < MAX_TRIES {
        if diff > 0.0 {
            // Entropy too high: tighten the kernel.
            beta_min = beta;
            beta = if beta_max.is_infinite() {
                beta * 2.0
            } else {
                (beta + beta_max) / 2.0
            };
        } else {
            beta_max = beta;
            beta = if beta_min.is_infinite() {
                beta / 2.0
            } else {
                (beta + beta_min) / 2.0
            };
        }

        let (entropy, updated) = gaussian_row(distances, beta);
        probs = updated;
        diff = entropy - log_perplexity;
        tries += 1;
    }

    (beta, probs)
}

/// Row-conditional affinities p_{j|i} (zero self-entry, rows sum to 1) and
/// the per-point bandwidths. [`calibrate_affinities`] is the public entry.
pub(crate) fn conditional_affinities(
    x: ArrayView2<f64>,
    perplexity: f64,
    tolerance: f64,
) -> anyhow::Result<(Array2<f64>, Array1<f64>)> {
    validate_points(x, "point matrix")?;
    if !(perplexity > 0.0) {
        bail!("perplexity must be positive, got {}", perplexity);
    }
    if !(tolerance > 0.0) {
        bail!("tolerance must be positive, got {}", tolerance);
    }

    let n = x.nrows();
    let distances = squared_euclidean_distances(x);
    let log_perplexity = perplexity.ln();

    let rows: Vec<(Vec<f64>, f64)> = (0..n)
        .into_par_iter()
        .map(|i| {
            let others: Vec<f64> = (0..n).filter(|&j| j != i).map(|j| distances[[i, j]]).collect();
            let (beta, probs) = search_precision(&others, log_perplexity, tolerance);
            (probs, (1.0 / beta).sqrt())
        })
        .collect();

    let mut p = Array2::zeros((n, n));
    let mut sigma = Array1::zeros(n);
    for (i, (probs, bandwidth)) in rows.into_iter().enumerate() {
        sigma[i] = bandwidth;
        let mut k = 0;
        for j in 0..n {
            if j != i {
                p[[i, j]] = probs[k];
                k += 1;
            }
        }
    }

    debug!(
        "calibrated {} points, mean bandwidth sigma = {:.6}",
        n,
        sigma.mean().unwrap_or(0.0)
    );

    Ok((p, sigma))
}

/// Calibrates the joint high-dimensional affinities for `x` at the given
/// target perplexity.
///
/// The conditional rows are symmetrized (`P + P^T`), normalized so the whole
/// matrix sums to 1, and floored at 1e-12 so downstream logarithms stay
/// finite. The diagonal carries no self-affinity beyond that floor.
pub fn calibrate_affinities(
    x: ArrayView2<f64>,
    perplexity: f64,
    tolerance: f64,
) -> anyhow::Result<CalibratedAffinities> {
    let (conditional, sigma) = conditional_affinities(x, perplexity, tolerance)?;

    let mut p = &conditional + &conditional.t();
    let total = p.sum();
    p.mapv_inplace(|v| (v / total).max(PROB_FLOOR));

    Ok(CalibratedAffinities { p, sigma })
}
