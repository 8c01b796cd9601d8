//! Gaussian sufficient statistics and their conjugate-product arithmetic.

use crate::faer_ndarray::{symmetric_inverse, FaerLinalgError};
use ndarray::{Array1, Array2};

/// One taxon's Gaussian belief in natural/moment form: mean vector, precision
/// matrix, and a scalar precision multiplier.
///
/// Produced by the tree-likelihood delegate once per evaluation pass and by
/// the factor model's data kernels; read-only to everything downstream.
#[derive(Debug, Clone)]
pub struct NormalSufficientStatistics {
    pub mean: Array1<f64>,
    pub precision: Array2<f64>,
    pub scalar: f64,
}

impl NormalSufficientStatistics {
    pub fn new(mean: Array1<f64>, precision: Array2<f64>, scalar: f64) -> Self {
        assert_eq!(
            mean.len(),
            precision.nrows(),
            "mean and precision dimensions disagree"
        );
        assert_eq!(
            precision.nrows(),
            precision.ncols(),
            "precision matrix must be square"
        );
        Self {
            mean,
            precision,
            scalar,
        }
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    /// Effective precision with the scalar multiplier folded in.
    pub fn effective_precision(&self) -> Array2<f64> {
        &self.precision * self.scalar
    }
}

/// Product of two Gaussians in moment form.
#[derive(Debug, Clone)]
pub struct CombinedStatistics {
    pub mean: Array1<f64>,
    pub precision: Array2<f64>,
    pub variance: Array2<f64>,
}

impl CombinedStatistics {
    /// Non-central second moment `E[x xᵀ] = V + m mᵀ`.
    pub fn second_moment(&self) -> Array2<f64> {
        let k = self.mean.len();
        let mut m2 = self.variance.clone();
        for i in 0..k {
            for j in 0..k {
                m2[[i, j]] += self.mean[i] * self.mean[j];
            }
        }
        m2
    }
}

/// Precision-weighted product of two Gaussians.
///
/// Exact conjugate arithmetic, not an approximation: the joint precision is
/// the sum of the effective precisions, and the joint mean is the
/// precision-weighted average of the two means. The joint variance comes from
/// a numerically safe inversion (LLT with LDLT fallback).
pub fn weighted_combine(
    a: &NormalSufficientStatistics,
    b: &NormalSufficientStatistics,
) -> Result<CombinedStatistics, FaerLinalgError> {
    assert_eq!(
        a.dim(),
        b.dim(),
        "cannot combine Gaussians of different dimension"
    );

    let pa = a.effective_precision();
    let pb = b.effective_precision();
    let precision = &pa + &pb;
    let variance = symmetric_inverse(&precision)?;

    let weighted = pa.dot(&a.mean) + pb.dot(&b.mean);
    let mean = variance.dot(&weighted);

    Ok(CombinedStatistics {
        mean,
        precision,
        variance,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn combine_matches_scalar_formula() {
        // Two univariate Gaussians: the joint is the classic inverse-variance
        // weighted average.
        let a = NormalSufficientStatistics::new(array![1.0], array![[2.0]], 1.0);
        let b = NormalSufficientStatistics::new(array![3.0], array![[4.0]], 0.5);
        let joint = weighted_combine(&a, &b).unwrap();
        // Effective precisions 2 and 2.
        assert_abs_diff_eq!(joint.precision[[0, 0]], 4.0, epsilon = 1e-12);
        assert_abs_diff_eq!(joint.variance[[0, 0]], 0.25, epsilon = 1e-12);
        assert_abs_diff_eq!(joint.mean[0], (2.0 * 1.0 + 2.0 * 3.0) / 4.0, epsilon = 1e-12);
    }

    #[test]
    fn second_moment_shifts_by_outer_product() {
        let joint = CombinedStatistics {
            mean: array![1.0, -2.0],
            precision: array![[1.0, 0.0], [0.0, 1.0]],
            variance: array![[0.5, 0.1], [0.1, 0.5]],
        };
        let m2 = joint.second_moment();
        assert_abs_diff_eq!(m2[[0, 0]], 0.5 + 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(m2[[0, 1]], 0.1 - 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(m2[[1, 1]], 0.5 + 4.0, epsilon = 1e-12);
    }
}
