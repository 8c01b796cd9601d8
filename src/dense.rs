//! Dense reference implementations of the tree-side collaborators.
//!
//! These materialize the joint Gaussian that the production tree traversal
//! only ever works with implicitly. They are O((taxa*dim)³) and exist for
//! the cubic reference product, the conjugate tip gradient, debug
//! cross-checks, and tests; anything tree-scale should sit behind the same
//! traits with a real traversal engine.

use crate::factor::IntegratedFactorModel;
use crate::faer_ndarray::symmetric_inverse;
use crate::model::{GradientError, TipFullConditionalProvider};
use crate::param::Parameter;
use crate::statistics::NormalSufficientStatistics;
use ndarray::{s, Array1, Array2};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

pub(crate) fn kronecker(a: &Array2<f64>, b: &Array2<f64>) -> Array2<f64> {
    let (ar, ac) = a.dim();
    let (br, bc) = b.dim();
    let mut out = Array2::<f64>::zeros((ar * br, ac * bc));
    for i in 0..ar {
        for j in 0..ac {
            let aij = a[[i, j]];
            if aij == 0.0 {
                continue;
            }
            for r in 0..br {
                for c in 0..bc {
                    out[[i * br + r, j * bc + c]] = aij * b[[r, c]];
                }
            }
        }
    }
    out
}

/// Conjugate Brownian tree-trait model in fully dense form.
///
/// The tree enters as a taxa-level shared-path variance matrix; with a
/// trait-level diffusion precision `Λ` the joint tree-trait precision is
/// `V_tree⁻¹ ⊗ Λ`. Branch-length edits are modeled by replacing or
/// perturbing the variance matrix, which bumps the model version so caches
/// built against the old structure drop themselves.
pub struct DenseTreeModel {
    tree_variance: RwLock<Array2<f64>>,
    trait_precision: Array2<f64>,
    data: Arc<Parameter>,
    prior_mean: Array1<f64>,
    version: AtomicU64,
}

impl DenseTreeModel {
    pub fn new(
        tree_variance: Array2<f64>,
        trait_precision: Array2<f64>,
        data: Arc<Parameter>,
        prior_mean: Array1<f64>,
    ) -> Result<Self, GradientError> {
        let n = tree_variance.nrows();
        let d = trait_precision.nrows();
        if tree_variance.ncols() != n {
            return Err(GradientError::Dimension {
                context: "tree variance matrix",
                expected: n,
                actual: tree_variance.ncols(),
            });
        }
        if trait_precision.ncols() != d {
            return Err(GradientError::Dimension {
                context: "trait precision matrix",
                expected: d,
                actual: trait_precision.ncols(),
            });
        }
        if data.dimension() != n * d {
            return Err(GradientError::Dimension {
                context: "tree-trait data parameter",
                expected: n * d,
                actual: data.dimension(),
            });
        }
        if prior_mean.len() != n * d {
            return Err(GradientError::Dimension {
                context: "tree-trait prior mean",
                expected: n * d,
                actual: prior_mean.len(),
            });
        }
        Ok(Self {
            tree_variance: RwLock::new(tree_variance),
            trait_precision,
            data,
            prior_mean,
            version: AtomicU64::new(0),
        })
    }

    pub fn tree_variance_matrix(&self) -> Array2<f64> {
        self.tree_variance.read().unwrap().clone()
    }

    /// Replace the taxa-level variance, as a stand-in for a tree edit.
    pub fn set_tree_variance(&self, tree_variance: Array2<f64>) {
        *self.tree_variance.write().unwrap() = tree_variance;
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    /// Symmetric additive perturbation of one variance entry (both `(i,j)`
    /// and `(j,i)`), as a stand-in for a branch-length change.
    pub fn perturb_tree_variance(&self, i: usize, j: usize, delta: f64) {
        let mut guard = self.tree_variance.write().unwrap();
        guard[[i, j]] += delta;
        if i != j {
            guard[[j, i]] += delta;
        }
        drop(guard);
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    fn joint_precision(&self) -> Result<Array2<f64>, GradientError> {
        let tree_precision = symmetric_inverse(&self.tree_variance_matrix())?;
        Ok(kronecker(&tree_precision, &self.trait_precision))
    }

    fn conditionals_from(
        &self,
        phi: &Array2<f64>,
        taxa: &[usize],
    ) -> Result<Vec<NormalSufficientStatistics>, GradientError> {
        let d = self.trait_precision.nrows();
        let x = self.data.as_array();
        let centered = &x - &self.prior_mean;

        taxa.iter()
            .map(|&i| {
                let block = phi
                    .slice(s![i * d..(i + 1) * d, i * d..(i + 1) * d])
                    .to_owned();
                // P_ii m_i = P_ii μ_i − Σ_{j≠i} Φ_ij (x_j − μ_j)
                let mut shift = Array1::<f64>::zeros(d);
                for j in 0..self.taxon_count() {
                    if j == i {
                        continue;
                    }
                    let coupling = phi.slice(s![i * d..(i + 1) * d, j * d..(j + 1) * d]);
                    shift += &coupling.dot(&centered.slice(s![j * d..(j + 1) * d]));
                }
                let block_variance = symmetric_inverse(&block)?;
                let mean = self
                    .prior_mean
                    .slice(s![i * d..(i + 1) * d])
                    .to_owned()
                    - block_variance.dot(&shift);
                Ok(NormalSufficientStatistics::new(mean, block, 1.0))
            })
            .collect()
    }
}

impl TipFullConditionalProvider for DenseTreeModel {
    fn taxon_count(&self) -> usize {
        self.tree_variance.read().unwrap().nrows()
    }

    fn trait_dim(&self) -> usize {
        self.trait_precision.nrows()
    }

    fn tip_full_conditional(
        &self,
        taxon: usize,
    ) -> Result<NormalSufficientStatistics, GradientError> {
        let phi = self.joint_precision()?;
        let mut stats = self.conditionals_from(&phi, &[taxon])?;
        Ok(stats.remove(0))
    }

    fn all_tip_full_conditionals(&self) -> Result<Vec<NormalSufficientStatistics>, GradientError> {
        let phi = self.joint_precision()?;
        let taxa: Vec<usize> = (0..self.taxon_count()).collect();
        self.conditionals_from(&phi, &taxa)
    }

    fn data_parameter(&self) -> &Arc<Parameter> {
        &self.data
    }

    fn model_version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    fn tree_trait_precision(&self) -> Option<Array2<f64>> {
        match self.joint_precision() {
            Ok(phi) => Some(phi),
            Err(e) => {
                log::warn!("dense tree-trait precision unavailable: {e}");
                None
            }
        }
    }

    fn tree_trait_variance(&self) -> Option<Array2<f64>> {
        match symmetric_inverse(&self.trait_precision) {
            Ok(trait_variance) => Some(kronecker(&self.tree_variance_matrix(), &trait_variance)),
            Err(e) => {
                log::warn!("dense tree-trait variance unavailable: {e}");
                None
            }
        }
    }

    fn tree_variance(&self) -> Option<Array2<f64>> {
        Some(self.tree_variance_matrix())
    }

    fn trait_variance(&self) -> Option<Array2<f64>> {
        symmetric_inverse(&self.trait_precision).ok()
    }

    fn prior_mean(&self) -> Array1<f64> {
        self.prior_mean.clone()
    }
}

/// Dense pre-order belief over latent factors: for each tip, the Gaussian on
/// that tip's factor vector conditioned on every *other* taxon's observed
/// traits under the integrated factor model.
///
/// Combining this with the same taxon's data kernel yields the full
/// posterior the loadings gradient integrates against.
pub struct DenseFactorTreeModel {
    factor_model: Arc<IntegratedFactorModel>,
    tree_variance: RwLock<Array2<f64>>,
    version: AtomicU64,
}

impl DenseFactorTreeModel {
    pub fn new(
        factor_model: Arc<IntegratedFactorModel>,
        tree_variance: Array2<f64>,
    ) -> Result<Self, GradientError> {
        let n = factor_model.taxon_count();
        if tree_variance.nrows() != n || tree_variance.ncols() != n {
            return Err(GradientError::Dimension {
                context: "factor tree variance matrix",
                expected: n,
                actual: tree_variance.nrows(),
            });
        }
        Ok(Self {
            factor_model,
            tree_variance: RwLock::new(tree_variance),
            version: AtomicU64::new(0),
        })
    }

    pub fn tree_variance_matrix(&self) -> Array2<f64> {
        self.tree_variance.read().unwrap().clone()
    }

    pub fn set_tree_variance(&self, tree_variance: Array2<f64>) {
        *self.tree_variance.write().unwrap() = tree_variance;
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    fn conditional_excluding(
        &self,
        taxon: usize,
    ) -> Result<NormalSufficientStatistics, GradientError> {
        let n = self.factor_model.taxon_count();
        let k = self.factor_model.dim_factor();

        let tree_precision = symmetric_inverse(&self.tree_variance_matrix())?;
        let eye = Array2::<f64>::eye(k);
        let mut joint = kronecker(&tree_precision, &eye);
        let mut shift = Array1::<f64>::zeros(n * k);

        for j in 0..n {
            if j == taxon {
                continue;
            }
            let kernel = self.factor_model.tip_kernel(j)?;
            let weighted_mean = kernel.precision.dot(&kernel.mean);
            for a in 0..k {
                shift[j * k + a] += weighted_mean[a];
                for c in 0..k {
                    joint[[j * k + a, j * k + c]] += kernel.precision[[a, c]];
                }
            }
        }

        let variance = symmetric_inverse(&joint)?;
        let mean = variance.dot(&shift);

        let block_variance = variance
            .slice(s![taxon * k..(taxon + 1) * k, taxon * k..(taxon + 1) * k])
            .to_owned();
        let block_precision = symmetric_inverse(&block_variance)?;
        let block_mean = mean.slice(s![taxon * k..(taxon + 1) * k]).to_owned();

        Ok(NormalSufficientStatistics::new(
            block_mean,
            block_precision,
            1.0,
        ))
    }
}

impl TipFullConditionalProvider for DenseFactorTreeModel {
    fn taxon_count(&self) -> usize {
        self.factor_model.taxon_count()
    }

    fn trait_dim(&self) -> usize {
        self.factor_model.dim_factor()
    }

    fn tip_full_conditional(
        &self,
        taxon: usize,
    ) -> Result<NormalSufficientStatistics, GradientError> {
        self.conditional_excluding(taxon)
    }

    fn data_parameter(&self) -> &Arc<Parameter> {
        self.factor_model.data_parameter()
    }

    fn model_version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    fn tree_variance(&self) -> Option<Array2<f64>> {
        Some(self.tree_variance_matrix())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn kronecker_matches_hand_expansion() {
        let a = array![[1.0, 2.0], [0.0, -1.0]];
        let b = array![[3.0, 0.5], [1.0, 2.0]];
        let k = kronecker(&a, &b);
        assert_eq!(k.dim(), (4, 4));
        assert_abs_diff_eq!(k[[0, 0]], 3.0, epsilon = 1e-15);
        assert_abs_diff_eq!(k[[0, 2]], 6.0, epsilon = 1e-15);
        assert_abs_diff_eq!(k[[3, 3]], -2.0, epsilon = 1e-15);
        assert_abs_diff_eq!(k[[2, 0]], 0.0, epsilon = 1e-15);
    }

    #[test]
    fn tip_conditional_satisfies_block_identity() {
        // P_ii (x_i − m_i) must reproduce block i of Φ (x − μ).
        let tree = array![[1.0, 0.3], [0.3, 1.4]];
        let lambda = array![[2.0, 0.4], [0.4, 1.0]];
        let data = Parameter::new("data", vec![0.5, -0.2, 1.0, 0.7]);
        let model =
            DenseTreeModel::new(tree, lambda, Arc::clone(&data), Array1::zeros(4)).unwrap();

        let phi = model.tree_trait_precision().unwrap();
        let x = data.as_array();
        let full = phi.dot(&x);

        for taxon in 0..2 {
            let stat = model.tip_full_conditional(taxon).unwrap();
            let delta = x.slice(s![taxon * 2..(taxon + 1) * 2]).to_owned() - &stat.mean;
            let block = stat.precision.dot(&delta);
            for r in 0..2 {
                assert_abs_diff_eq!(block[r], full[taxon * 2 + r], epsilon = 1e-10);
            }
        }
    }
}
