use anyhow::bail;
use ndarray::{Array1, Array2, ArrayView2};

/// Floor applied to every probability entry before it is fed into a
/// logarithm or division.
pub(crate) const PROB_FLOOR: f64 = 1e-12;

/// Checks that a point matrix is usable as input: at least two rows, at
/// least one column, every entry finite.
pub(crate) fn validate_points(x: ArrayView2<f64>, name: &str) -> anyhow::Result<()> {
    let (n, d) = x.dim();
    if n < 2 {
        bail!("{} must contain at least two points, got {}", name, n);
    }
    if d == 0 {
        bail!("{} must have at least one feature column", name);
    }
    if x.iter().any(|v| !v.is_finite()) {
        bail!("{} contains non-finite values", name);
    }
    Ok(())
}

/// Full n x n matrix of squared Euclidean distances with a zero diagonal,
/// via the Gram-matrix expansion ||a - b||^2 = ||a||^2 + ||b||^2 - 2 a.b.
pub(crate) fn squared_euclidean_distances(x: ArrayView2<f64>) -> Array2<f64> {
    let n = x.nrows();
    let row_norms: Array1<f64> = x.rows().into_iter().map(|r| r.dot(&r)).collect();
    let gram = x.dot(&x.t());

    let mut distances = Array2::zeros((n, n));
    for i in 0..n {
        for j in 0..n {
            if i != j {
                // Clamp tiny negative values produced by cancellation.
                distances[[i, j]] = (row_norms[i] + row_norms[j] - 2.0 * gram[[i, j]]).max(0.0);
            }
        }
    }
    distances
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_squared_distances() {
        let x = array![[0.0, 0.0], [3.0, 4.0], [0.0, 1.0]];
        let d = squared_euclidean_distances(x.view());

        assert_relative_eq!(d[[0, 1]], 25.0);
        assert_relative_eq!(d[[1, 0]], 25.0);
        assert_relative_eq!(d[[0, 2]], 1.0);
        assert_relative_eq!(d[[1, 2]], 18.0);
        for i in 0..3 {
            assert_eq!(d[[i, i]], 0.0);
        }
    }

    #[test]
    fn test_validate_points_errors() {
        let one_row = Array2::<f64>::zeros((1, 3));
        assert!(validate_points(one_row.view(), "x").is_err());

        let no_cols = Array2::<f64>::zeros((4, 0));
        assert!(validate_points(no_cols.view(), "x").is_err());

        let mut with_nan = Array2::<f64>::zeros((3, 2));
        with_nan[[1, 1]] = f64::NAN;
        assert!(validate_points(with_nan.view(), "x").is_err());

        let ok = array![[1.0, 2.0], [3.0, 4.0]];
        assert!(validate_points(ok.view(), "x").is_ok());
    }
}
