//! Latent factor model over continuous traits.
//!
//! Each taxon observes `dim_trait` traits generated from `dim_factor` latent
//! factors through a loadings matrix, with independent per-trait residual
//! precision. The factors themselves carry the tree prior; this module owns
//! the data side only: per-taxon data kernels (the Gaussian in factor space
//! induced by one taxon's observed traits) and the dense marginal likelihood
//! with the factors integrated out.

use crate::faer_ndarray::{symmetric_inverse, FaerCholesky, FaerLinalgError};
use crate::model::GradientError;
use crate::param::Parameter;
use crate::statistics::NormalSufficientStatistics;
use faer::Side;
use ndarray::{Array1, Array2};
use std::f64::consts::PI;
use std::sync::Arc;

/// Factor-analysis likelihood with analytically integrated factors.
///
/// Parameter layout: `loadings` is `dim_factor * dim_trait` row-major by
/// factor, `precision` holds the `dim_trait` diagonal residual precisions,
/// `data` is taxon-major with `dim_trait` values per taxon. The missing mask
/// runs parallel to `data`; a flagged entry contributes nothing to kernels,
/// likelihood, or gradients.
pub struct IntegratedFactorModel {
    loadings: Arc<Parameter>,
    precision: Arc<Parameter>,
    data: Arc<Parameter>,
    missing: Vec<bool>,
    dim_factor: usize,
    dim_trait: usize,
    taxon_count: usize,
    compute_remainder: bool,
}

impl IntegratedFactorModel {
    pub fn new(
        loadings: Arc<Parameter>,
        precision: Arc<Parameter>,
        data: Arc<Parameter>,
        missing: Vec<bool>,
        dim_factor: usize,
        dim_trait: usize,
        taxon_count: usize,
        compute_remainder: bool,
    ) -> Result<Self, GradientError> {
        if loadings.dimension() != dim_factor * dim_trait {
            return Err(GradientError::Dimension {
                context: "loadings parameter",
                expected: dim_factor * dim_trait,
                actual: loadings.dimension(),
            });
        }
        if precision.dimension() != dim_trait {
            return Err(GradientError::Dimension {
                context: "residual precision parameter",
                expected: dim_trait,
                actual: precision.dimension(),
            });
        }
        if data.dimension() != taxon_count * dim_trait {
            return Err(GradientError::Dimension {
                context: "trait data parameter",
                expected: taxon_count * dim_trait,
                actual: data.dimension(),
            });
        }
        if missing.len() != taxon_count * dim_trait {
            return Err(GradientError::Dimension {
                context: "missing-data mask",
                expected: taxon_count * dim_trait,
                actual: missing.len(),
            });
        }
        Ok(Self {
            loadings,
            precision,
            data,
            missing,
            dim_factor,
            dim_trait,
            taxon_count,
            compute_remainder,
        })
    }

    pub fn dim_factor(&self) -> usize {
        self.dim_factor
    }

    pub fn dim_trait(&self) -> usize {
        self.dim_trait
    }

    pub fn taxon_count(&self) -> usize {
        self.taxon_count
    }

    pub fn compute_remainder(&self) -> bool {
        self.compute_remainder
    }

    pub fn loadings_parameter(&self) -> &Arc<Parameter> {
        &self.loadings
    }

    pub fn precision_parameter(&self) -> &Arc<Parameter> {
        &self.precision
    }

    pub fn data_parameter(&self) -> &Arc<Parameter> {
        &self.data
    }

    pub fn is_missing(&self, taxon: usize, trait_index: usize) -> bool {
        self.missing[taxon * self.dim_trait + trait_index]
    }

    /// `dim_factor x dim_trait` loadings snapshot.
    pub fn loadings_matrix(&self) -> Array2<f64> {
        Array2::from_shape_vec((self.dim_factor, self.dim_trait), self.loadings.values())
            .expect("dimension validated at construction")
    }

    pub fn precision_values(&self) -> Array1<f64> {
        self.precision.as_array()
    }

    /// `taxa x dim_trait` data snapshot.
    pub fn data_matrix(&self) -> Array2<f64> {
        Array2::from_shape_vec((self.taxon_count, self.dim_trait), self.data.values())
            .expect("dimension validated at construction")
    }

    /// Data kernel for one taxon: the Gaussian over that taxon's factor
    /// vector induced by its observed traits, in mean/precision form.
    ///
    /// Precision `Q = L Λ_obs Lᵀ`, shift `b = L Λ_obs y`, mean `Q⁻¹ b`. With
    /// few observed traits `Q` can be rank-deficient; the mean is then taken
    /// from a lightly ridged solve, which leaves the downstream product
    /// `Q·mean ≈ b` intact.
    pub fn tip_kernel(&self, taxon: usize) -> Result<NormalSufficientStatistics, GradientError> {
        let k = self.dim_factor;
        let p = self.dim_trait;
        let loadings = self.loadings_matrix();
        let lambda = self.precision_values();
        let data = self.data_matrix();

        let mut q = Array2::<f64>::zeros((k, k));
        let mut b = Array1::<f64>::zeros(k);
        let mut observed = 0usize;
        for t in 0..p {
            if self.is_missing(taxon, t) {
                continue;
            }
            observed += 1;
            let weight = lambda[t];
            let y = data[[taxon, t]];
            for a in 0..k {
                let la = loadings[[a, t]];
                b[a] += weight * y * la;
                for c in 0..k {
                    q[[a, c]] += weight * la * loadings[[c, t]];
                }
            }
        }

        if observed == 0 {
            // Fully missing taxon: flat kernel, the tree prior stands alone.
            return Ok(NormalSufficientStatistics::new(
                Array1::zeros(k),
                Array2::zeros((k, k)),
                1.0,
            ));
        }

        let mean = match symmetric_inverse(&q) {
            Ok(inverse) => inverse.dot(&b),
            Err(FaerLinalgError::Cholesky(_)) | Err(FaerLinalgError::Ldlt(_)) => {
                let ridge = 1e-8
                    * q.diag()
                        .iter()
                        .copied()
                        .fold(0.0f64, f64::max)
                        .max(1.0);
                log::warn!(
                    "rank-deficient data kernel for taxon {taxon}; ridging with {ridge:.3e}"
                );
                let mut q_ridge = q.clone();
                for a in 0..k {
                    q_ridge[[a, a]] += ridge;
                }
                symmetric_inverse(&q_ridge)?.dot(&b)
            }
            Err(e) => return Err(e.into()),
        };

        Ok(NormalSufficientStatistics::new(mean, q, 1.0))
    }

    /// Dense marginal log-likelihood of the observed traits with the factors
    /// integrated out under the tree prior `V_tree`.
    ///
    /// Over observed entries `(i, t)` the marginal covariance is
    /// `C[(i,t),(j,s)] = V_tree[i,j] (LᵀL)[t,s] + δ_ij δ_ts / λ_t`, evaluated
    /// by Cholesky. Intended for small problems (reference computations,
    /// remainder refresh, finite-difference checks), not tree-scale
    /// inference.
    pub fn marginal_log_likelihood(
        &self,
        tree_variance: &Array2<f64>,
    ) -> Result<f64, GradientError> {
        let p = self.dim_trait;
        let loadings = self.loadings_matrix();
        let lambda = self.precision_values();
        let data = self.data_matrix();

        let gram = loadings.t().dot(&loadings);

        let mut observed = Vec::new();
        for i in 0..self.taxon_count {
            for t in 0..p {
                if !self.is_missing(i, t) {
                    observed.push((i, t));
                }
            }
        }
        let m = observed.len();
        if m == 0 {
            return Ok(0.0);
        }

        let mut cov = Array2::<f64>::zeros((m, m));
        let mut y = Array1::<f64>::zeros(m);
        for (a, &(i, t)) in observed.iter().enumerate() {
            y[a] = data[[i, t]];
            for (c, &(j, s)) in observed.iter().enumerate() {
                let mut value = tree_variance[[i, j]] * gram[[t, s]];
                if a == c {
                    value += 1.0 / lambda[t];
                }
                cov[[a, c]] = value;
            }
        }

        let factor = cov.cholesky(Side::Lower)?;
        let quad = y.dot(&factor.solve_vec(&y));
        Ok(-0.5 * (m as f64 * (2.0 * PI).ln() + factor.log_determinant() + quad))
    }
}
