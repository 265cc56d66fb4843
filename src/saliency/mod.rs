//! # Sensitivity Engine
//!
//! Analytic per-feature saliency for a converged embedding. At the optimum
//! the KL gradient with respect to each embedded point is (approximately)
//! zero; treating that stationarity condition as an implicit equation and
//! applying the implicit function theorem gives the Jacobian of a point's
//! embedded coordinates with respect to its own input features:
//!
//! ```text
//! dY_i/dX_i = -(d2C/dY_i^2)^-1 * (d2C/dY_i dX_i)
//! ```
//!
//! No re-optimization is needed. Each point's two second-derivative blocks
//! are assembled from explicit per-point intermediates so the algebra stays
//! testable in isolation, and points are processed in parallel.
//!
//! A singular per-point Hessian has no defined Jacobian; that point's block
//! is returned as NaN and flagged in the log rather than guarded with an
//! epsilon-regularized inverse.

use anyhow::bail;
use log::warn;
use nalgebra::Matrix2;
use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;

use crate::utils::{squared_euclidean_distances, validate_points};

// Global Student-t normalizer: the kernel sum over all ordered pairs,
// self-pairs excluded.
pub(crate) fn student_t_normalizer(y: ArrayView2<f64>) -> f64 {
    let n = y.nrows();
    let distances = squared_euclidean_distances(y);
    let mut total = 0.0;
    for k in 0..n {
        for l in 0..n {
            if k != l {
                total += 1.0 / (1.0 + distances[[k, l]]);
            }
        }
    }
    total
}

// Per-point normalizers of the reverse conditional kernel, entry j summing
// exp(-||x_l - x_j||^2 / (2 sigma_j^2)) over l with the self-term removed.
fn conditional_normalizers(x: ArrayView2<f64>, sigma: ArrayView1<f64>) -> Array1<f64> {
    let n = x.nrows();
    let distances = squared_euclidean_distances(x);
    Array1::from_shape_fn(n, |j| {
        let denom = 2.0 * sigma[j] * sigma[j];
        let total: f64 = (0..n).map(|l| (-distances[[l, j]] / denom).exp()).sum();
        total - 1.0
    })
}

// 2x2 Hessian of the KL cost with respect to the embedded position of point
// i. s_q is the precomputed global normalizer.
pub(crate) fn point_hessian(
    i: usize,
    y: ArrayView2<f64>,
    p: ArrayView2<f64>,
    q: ArrayView2<f64>,
    s_q: f64,
) -> Matrix2<f64> {
    let n = y.nrows();
    let s_q_sq = s_q * s_q;

    // d/dy_i of the global normalizer: -4 * sum_j d_ij / e_ij^2.
    let mut s_q_d = [0.0; 2];
    for j in 0..n {
        let d0 = y[[i, 0]] - y[[j, 0]];
        let d1 = y[[i, 1]] - y[[j, 1]];
        let e = 1.0 + d0 * d0 + d1 * d1;
        s_q_d[0] += d0 / (e * e);
        s_q_d[1] += d1 / (e * e);
    }
    s_q_d[0] *= -4.0;
    s_q_d[1] *= -4.0;

    let mut term1 = Matrix2::zeros();
    let mut term2 = Matrix2::zeros();
    let mut residual_trace = 0.0;

    for j in 0..n {
        let d = [y[[i, 0]] - y[[j, 0]], y[[i, 1]] - y[[j, 1]]];
        let e = 1.0 + d[0] * d[0] + d[1] * d[1];
        let e_inv = 1.0 / e;
        let residual = p[[i, j]] - q[[i, j]];

        // d/dy_i of the residual, through the kernel and the normalizer.
        let residual_d = [
            (2.0 * d[0] * e_inv * e_inv * s_q + s_q_d[0] * e_inv) / s_q_sq,
            (2.0 * d[1] * e_inv * e_inv * s_q + s_q_d[1] * e_inv) / s_q_sq,
        ];

        for r in 0..2 {
            for c in 0..2 {
                term1[(r, c)] += residual_d[r] * e_inv * d[c];
                term2[(r, c)] += 2.0 * d[r] * residual * e_inv * e_inv * d[c];
            }
        }
        if j != i {
            residual_trace += residual * e_inv;
        }
    }

    4.0 * (term1 - term2 + Matrix2::identity() * residual_trace)
}

// d x 2 mixed second derivative of the KL cost with respect to point i's
// features and its embedded position. The forward direction of the
// high-dimensional kernel uses sigma_i, the reverse direction sigma_j;
// s_pj holds the precomputed reverse normalizers.
pub(crate) fn point_mixed_derivative(
    i: usize,
    x: ArrayView2<f64>,
    y: ArrayView2<f64>,
    sigma: ArrayView1<f64>,
    s_pj: ArrayView1<f64>,
) -> Array2<f64> {
    let n = x.nrows();
    let d = x.ncols();
    let sigma_i_sq = sigma[i] * sigma[i];

    // Squared distances from point i in the original space.
    let mut dist_sq = vec![0.0; n];
    for j in 0..n {
        let mut acc = 0.0;
        for k in 0..d {
            let diff = x[[i, k]] - x[[j, k]];
            acc += diff * diff;
        }
        dist_sq[j] = acc;
    }

    // Forward kernel (bandwidth of point i) and its normalizer, self-term
    // excluded.
    let exp_fwd: Vec<f64> = dist_sq
        .iter()
        .map(|&v| (-v / (2.0 * sigma_i_sq)).exp())
        .collect();
    let s_pi: f64 = exp_fwd
        .iter()
        .enumerate()
        .filter(|&(j, _)| j != i)
        .map(|(_, &w)| w)
        .sum();
    let s_pi_sq = s_pi * s_pi;

    // d/dx_i of the forward normalizer.
    let mut s_pi_d = vec![0.0; d];
    for j in 0..n {
        let w = exp_fwd[j] / sigma_i_sq;
        for k in 0..d {
            s_pi_d[k] -= (x[[i, k]] - x[[j, k]]) * w;
        }
    }

    let mut mixed = Array2::zeros((d, 2));
    let inv_2n = 1.0 / (2.0 * n as f64);

    for j in 0..n {
        let sigma_j_sq = sigma[j] * sigma[j];
        let exp_rev = (-dist_sq[j] / (2.0 * sigma_j_sq)).exp();
        let s_rev = s_pj[j];
        let s_rev_sq = s_rev * s_rev;

        let dy = [y[[i, 0]] - y[[j, 0]], y[[i, 1]] - y[[j, 1]]];
        let e_inv = 1.0 / (1.0 + dy[0] * dy[0] + dy[1] * dy[1]);

        for k in 0..d {
            let x_ij = x[[i, k]] - x[[j, k]];

            // Derivative of the forward conditional p_{j|i} w.r.t. x_i.
            let fwd_d =
                (-s_pi * x_ij / sigma_i_sq * exp_fwd[j] - exp_fwd[j] * s_pi_d[k]) / s_pi_sq;

            // Derivative of the reverse conditional p_{i|j} w.r.t. x_i; only
            // the l = i term of its normalizer depends on x_i.
            let s_rev_d = exp_rev * (-x_ij) / sigma_j_sq;
            let rev_d = (s_rev * exp_rev * (-x_ij) / sigma_j_sq - exp_rev * s_rev_d) / s_rev_sq;

            let v_d = inv_2n * (fwd_d + rev_d);
            mixed[[k, 0]] += v_d * dy[0] * e_inv;
            mixed[[k, 1]] += v_d * dy[1] * e_inv;
        }
    }

    mixed * 4.0
}

/// Computes the n x d x 2 sensitivity tensor for a converged embedding.
///
/// Entry `[i, k, c]` is the first-order shift of embedding coordinate `c` of
/// point `i` under a perturbation of its feature `k`. Points with a singular
/// Hessian yield NaN blocks (logged, never a panic); callers should treat
/// those rows as degenerate.
pub fn compute_sensitivities(
    x: ArrayView2<f64>,
    y: ArrayView2<f64>,
    p: ArrayView2<f64>,
    q: ArrayView2<f64>,
    sigma: ArrayView1<f64>,
) -> anyhow::Result<Array3<f64>> {
    validate_points(x, "point matrix")?;
    validate_points(y, "embedding")?;

    let n = x.nrows();
    let d = x.ncols();
    if y.nrows() != n {
        bail!(
            "embedding has {} rows but the point matrix has {}",
            y.nrows(),
            n
        );
    }
    if y.ncols() != 2 {
        bail!(
            "sensitivity analysis expects a 2-dimensional embedding, got {} columns",
            y.ncols()
        );
    }
    if p.dim() != (n, n) {
        bail!("affinity matrix P has shape {:?}, expected ({}, {})", p.dim(), n, n);
    }
    if q.dim() != (n, n) {
        bail!("affinity matrix Q has shape {:?}, expected ({}, {})", q.dim(), n, n);
    }
    if sigma.len() != n {
        bail!(
            "bandwidth vector length ({}) does not match number of points ({})",
            sigma.len(),
            n
        );
    }
    if sigma.iter().any(|&s| !(s > 0.0) || !s.is_finite()) {
        bail!("bandwidths must be strictly positive and finite");
    }

    let s_q = student_t_normalizer(y);
    let s_pj = conditional_normalizers(x, sigma);

    let jacobians: Vec<Array2<f64>> = (0..n)
        .into_par_iter()
        .map(|i| {
            let hessian = point_hessian(i, y, p, q, s_q);
            let mixed = point_mixed_derivative(i, x, y, sigma, s_pj.view());
            match hessian.try_inverse() {
                Some(inverse) => {
                    // G_i = -(H^-1) * M^T, stored feature-major as d x 2.
                    let mut block = Array2::zeros((d, 2));
                    for k in 0..d {
                        for c in 0..2 {
                            block[[k, c]] = -(inverse[(c, 0)] * mixed[[k, 0]]
                                + inverse[(c, 1)] * mixed[[k, 1]]);
                        }
                    }
                    block
                }
                None => {
                    warn!("singular Hessian for point {}; sensitivity undefined", i);
                    Array2::from_elem((d, 2), f64::NAN)
                }
            }
        })
        .collect();

    let mut tensor = Array3::zeros((n, d, 2));
    for (i, block) in jacobians.into_iter().enumerate() {
        tensor.index_axis_mut(Axis(0), i).assign(&block);
    }
    Ok(tensor)
}

/// Global per-feature importance: for each point, the column norms of its
/// Jacobian normalized to sum to 1, averaged over all points. NaN blocks from
/// degenerate points propagate into the average.
pub fn feature_importance(gradients: &Array3<f64>) -> Array1<f64> {
    let (n, d, dims) = gradients.dim();
    let mut total = Array1::<f64>::zeros(d);
    for i in 0..n {
        let mut norms = Array1::<f64>::zeros(d);
        for k in 0..d {
            let mut acc = 0.0;
            for c in 0..dims {
                acc += gradients[[i, k, c]] * gradients[[i, k, c]];
            }
            norms[k] = acc.sqrt();
        }
        let sum = norms.sum();
        total += &(norms / sum);
    }
    total / n as f64
}

/// Unnormalized per-feature magnitudes for a single point: the Euclidean norm
/// of each feature's displacement vector.
pub fn point_feature_magnitudes(
    gradients: &Array3<f64>,
    point: usize,
) -> anyhow::Result<Array1<f64>> {
    let (n, d, dims) = gradients.dim();
    if point >= n {
        bail!("point index {} out of range for {} points", point, n);
    }
    Ok(Array1::from_shape_fn(d, |k| {
        (0..dims)
            .map(|c| gradients[[point, k, c]] * gradients[[point, k, c]])
            .sum::<f64>()
            .sqrt()
    }))
}

/// The n x 2 field of embedded displacement vectors for one feature, one row
/// per point. Feeds quiver-style overlays downstream.
pub fn scaled_gradient_field(
    gradients: &Array3<f64>,
    feature: usize,
) -> anyhow::Result<Array2<f64>> {
    let (n, d, dims) = gradients.dim();
    if feature >= d {
        bail!("feature index {} out of range for {} features", feature, d);
    }
    Ok(Array2::from_shape_fn((n, dims), |(i, c)| {
        gradients[[i, feature, c]]
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::TsneBuilder;
    use approx::assert_relative_eq;
    use ndarray::{array, Array2};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use rand_distr::{Distribution, StandardNormal};

    fn fixture() -> (Array2<f64>, Array2<f64>, Array1<f64>) {
        let x = array![
            [0.2, 1.3, -0.5],
            [1.0, -0.7, 0.8],
            [-1.2, 0.4, 0.3],
            [0.6, 0.9, -1.1],
            [-0.3, -0.8, 0.7]
        ];
        let y = array![
            [0.3, -1.2],
            [1.1, 0.4],
            [-0.8, 0.9],
            [0.5, 0.7],
            [-1.0, -0.6]
        ];
        let sigma = array![0.9, 1.2, 0.8, 1.1, 1.0];
        (x, y, sigma)
    }

    /// Unfloored Student-t distribution of an embedding, zero diagonal.
    fn raw_q(y: &Array2<f64>) -> Array2<f64> {
        let n = y.nrows();
        let mut kernel = squared_euclidean_distances(y.view()).mapv(|v| 1.0 / (1.0 + v));
        for i in 0..n {
            kernel[[i, i]] = 0.0;
        }
        let total = kernel.sum();
        kernel / total
    }

    /// Symmetrized affinities built from fixed bandwidths (no calibration),
    /// normalized by 2n as in the derivative algebra.
    fn sym_affinities(x: &Array2<f64>, sigma: &Array1<f64>) -> Array2<f64> {
        let n = x.nrows();
        let distances = squared_euclidean_distances(x.view());
        let mut cond = Array2::zeros((n, n));
        for i in 0..n {
            let denom = 2.0 * sigma[i] * sigma[i];
            let mut sum = 0.0;
            for j in 0..n {
                if j != i {
                    cond[[i, j]] = (-distances[[i, j]] / denom).exp();
                    sum += cond[[i, j]];
                }
            }
            for j in 0..n {
                cond[[i, j]] /= sum;
            }
        }
        let sym = &cond + &cond.t();
        sym / (2.0 * n as f64)
    }

    /// KL gradient for point i at the given state, Q recomputed from y.
    fn gradient_at(i: usize, y: &Array2<f64>, p: &Array2<f64>) -> [f64; 2] {
        let n = y.nrows();
        let mut kernel = squared_euclidean_distances(y.view()).mapv(|v| 1.0 / (1.0 + v));
        for k in 0..n {
            kernel[[k, k]] = 0.0;
        }
        let total = kernel.sum();
        let mut grad = [0.0; 2];
        for j in 0..n {
            let weight = (p[[i, j]] - kernel[[i, j]] / total) * kernel[[i, j]];
            grad[0] += weight * (y[[i, 0]] - y[[j, 0]]);
            grad[1] += weight * (y[[i, 1]] - y[[j, 1]]);
        }
        [4.0 * grad[0], 4.0 * grad[1]]
    }

    #[test]
    fn test_hessian_matches_finite_differences() {
        let (x, y, sigma) = fixture();
        let p = sym_affinities(&x, &sigma);
        let q = raw_q(&y);
        let s_q = student_t_normalizer(y.view());
        let h = 1e-5;

        for i in [0, 3] {
            let hessian = point_hessian(i, y.view(), p.view(), q.view(), s_q);
            for r in 0..2 {
                let mut plus = y.clone();
                plus[[i, r]] += h;
                let mut minus = y.clone();
                minus[[i, r]] -= h;
                let g_plus = gradient_at(i, &plus, &p);
                let g_minus = gradient_at(i, &minus, &p);
                for c in 0..2 {
                    let numeric = (g_plus[c] - g_minus[c]) / (2.0 * h);
                    assert_relative_eq!(
                        hessian[(r, c)],
                        numeric,
                        epsilon = 1e-7,
                        max_relative = 1e-3
                    );
                }
            }
        }
    }

    #[test]
    fn test_mixed_derivative_matches_finite_differences() {
        let (x, y, sigma) = fixture();
        let s_pj = conditional_normalizers(x.view(), sigma.view());
        let h = 1e-5;

        for i in [0, 2] {
            let mixed = point_mixed_derivative(i, x.view(), y.view(), sigma.view(), s_pj.view());
            for k in 0..x.ncols() {
                let mut plus = x.clone();
                plus[[i, k]] += h;
                let mut minus = x.clone();
                minus[[i, k]] -= h;
                let g_plus = gradient_at(i, &y, &sym_affinities(&plus, &sigma));
                let g_minus = gradient_at(i, &y, &sym_affinities(&minus, &sigma));
                for c in 0..2 {
                    let numeric = (g_plus[c] - g_minus[c]) / (2.0 * h);
                    assert_relative_eq!(
                        mixed[[k, c]],
                        numeric,
                        epsilon = 1e-7,
                        max_relative = 1e-3
                    );
                }
            }
        }
    }

    #[test]
    fn test_sensitivity_tensor_shape_and_idempotence() {
        let mut rng = ChaCha8Rng::seed_from_u64(17);
        let x = Array2::from_shape_simple_fn((30, 3), || StandardNormal.sample(&mut rng));
        let result = TsneBuilder::new()
            .perplexity(8.0)
            .max_iter(150)
            .seed(4)
            .build()
            .embed(x.view())
            .unwrap();

        let first = compute_sensitivities(
            x.view(),
            result.y.view(),
            result.p.view(),
            result.q.view(),
            result.sigma.view(),
        )
        .unwrap();
        assert_eq!(first.dim(), (30, 3, 2));
        assert!(first.iter().all(|v| v.is_finite()));

        let second = compute_sensitivities(
            x.view(),
            result.y.view(),
            result.p.view(),
            result.q.view(),
            result.sigma.view(),
        )
        .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_predictive_feature_outranks_noise() {
        // Feature 0 decides cluster membership, feature 1 is pure noise, and
        // both sit on comparable overall scales as standardized data would.
        // The predictive feature concentrates its variance in the cluster
        // offset, so every cross-cluster pair pulls its affinity derivative
        // in the same direction, while the noise feature only collects
        // incoherent terms. The perplexity keeps cross-cluster pairs inside
        // each point's calibrated neighborhood.
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let mut x = Array2::zeros((80, 2));
        for i in 0..80 {
            let center = if i < 40 { -1.0 } else { 1.0 };
            let jitter: f64 = StandardNormal.sample(&mut rng);
            x[[i, 0]] = center + 0.3 * jitter;
            let noise: f64 = StandardNormal.sample(&mut rng);
            x[[i, 1]] = noise;
        }

        let result = TsneBuilder::new()
            .perplexity(30.0)
            .max_iter(400)
            .seed(2)
            .build()
            .embed(x.view())
            .unwrap();
        let gradients = compute_sensitivities(
            x.view(),
            result.y.view(),
            result.p.view(),
            result.q.view(),
            result.sigma.view(),
        )
        .unwrap();

        let importance = feature_importance(&gradients);
        assert_eq!(importance.len(), 2);
        assert!(
            importance[0] > importance[1],
            "predictive feature scored {} against noise {}",
            importance[0],
            importance[1]
        );
    }

    #[test]
    fn test_singular_hessian_yields_nan_block() {
        // Two coincident embedded points with matched residuals produce a
        // zero Hessian; the Jacobian is undefined but must not panic.
        let x = array![[0.0, 1.0], [1.0, 0.0]];
        let y = array![[0.0, 0.0], [0.0, 0.0]];
        let p = array![[1e-12, 0.5], [0.5, 1e-12]];
        let (_, q) = crate::embedding::low_dim_affinities(y.view());
        let sigma = array![1.0, 1.0];

        let gradients =
            compute_sensitivities(x.view(), y.view(), p.view(), q.view(), sigma.view()).unwrap();
        assert_eq!(gradients.dim(), (2, 2, 2));
        assert!(gradients.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn test_rejects_mismatched_shapes() {
        let (x, y, sigma) = fixture();
        let p = sym_affinities(&x, &sigma);
        let q = raw_q(&y);

        let wide_y = Array2::<f64>::zeros((5, 3));
        assert!(compute_sensitivities(
            x.view(),
            wide_y.view(),
            p.view(),
            q.view(),
            sigma.view()
        )
        .is_err());

        let short_y = Array2::<f64>::zeros((4, 2));
        assert!(compute_sensitivities(
            x.view(),
            short_y.view(),
            p.view(),
            q.view(),
            sigma.view()
        )
        .is_err());

        let bad_p = Array2::<f64>::zeros((4, 4));
        assert!(compute_sensitivities(
            x.view(),
            y.view(),
            bad_p.view(),
            q.view(),
            sigma.view()
        )
        .is_err());

        let bad_sigma = array![1.0, 1.0, -1.0, 1.0, 1.0];
        assert!(compute_sensitivities(
            x.view(),
            y.view(),
            p.view(),
            q.view(),
            bad_sigma.view()
        )
        .is_err());
    }

    #[test]
    fn test_importance_helpers() {
        let mut gradients = Array3::<f64>::zeros((2, 3, 2));
        gradients[[0, 0, 0]] = 3.0;
        gradients[[0, 0, 1]] = 4.0; // norm 5
        gradients[[0, 1, 0]] = 5.0; // norm 5
        gradients[[1, 2, 1]] = 2.0; // norm 2, only feature with signal

        let per_point = point_feature_magnitudes(&gradients, 0).unwrap();
        assert_relative_eq!(per_point[0], 5.0);
        assert_relative_eq!(per_point[1], 5.0);
        assert_relative_eq!(per_point[2], 0.0);
        assert!(point_feature_magnitudes(&gradients, 2).is_err());

        let importance = feature_importance(&gradients);
        // Point 0 splits evenly between features 0 and 1; point 1 puts all
        // weight on feature 2.
        assert_relative_eq!(importance[0], 0.25, epsilon = 1e-12);
        assert_relative_eq!(importance[1], 0.25, epsilon = 1e-12);
        assert_relative_eq!(importance[2], 0.5, epsilon = 1e-12);

        let field = scaled_gradient_field(&gradients, 2).unwrap();
        assert_eq!(field.dim(), (2, 2));
        assert_relative_eq!(field[[1, 1]], 2.0);
        assert!(scaled_gradient_field(&gradients, 3).is_err());
    }
}
