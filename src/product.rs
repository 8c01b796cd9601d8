//! Matrix-vector products against the implicit tree-trait precision matrix.
//!
//! The precision matrix `Φ` of the tree-trait distribution is
//! `(taxa*dim) x (taxa*dim)` and never materialized on the fast path.
//! Instead, `Φ·v` falls out of per-tip conditional statistics: with the probe
//! `v` bound as the data parameter, each tip's full-conditional mean `m_i`
//! satisfies `P_ii (v_i − m_i) = (Φ (v − μ))_i`, so one batched statistics
//! fetch plus a block-local multiply per taxon yields the whole product.

use crate::faer_ndarray::FaerLinalgError;
use crate::model::TipFullConditionalProvider;
use crate::param::Parameter;
use crate::task_pool::TaxonTaskPool;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProductError {
    #[error("product requested for a parameter other than the bound data parameter `{expected}`")]
    ParameterMismatch { expected: String },
    #[error("dimension mismatch in {context}: expected {expected}, got {actual}")]
    Dimension {
        context: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("delegate does not expose the dense tree-trait matrices")]
    DenseUnavailable,
    #[error("delegate failure: {0}")]
    Delegate(#[from] crate::model::GradientError),
    #[error("linear algebra failure: {0}")]
    Linalg(#[from] FaerLinalgError),
}

/// Traversal strategy for the implicit product.
///
/// `Cubic` multiplies against the fully materialized precision matrix and
/// exists to correctness-check `Linear`, which touches each taxon once using
/// a single batched fetch of the tip conditional statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProductStrategy {
    Cubic,
    Linear,
}

/// Runtime diagnostics switches, injected at construction so tests can
/// toggle them without rebuilding. Both force the serial path.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ProviderOptions {
    pub debug: bool,
    pub timing: bool,
}

/// Power-iteration controls for the spectral-radius step-size heuristics.
///
/// The defaults reproduce the original tuning constants; they are heuristic
/// bounds for step-size selection, not correctness-relevant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PowerIterationSettings {
    pub max_iterations: usize,
    pub tolerance: f64,
    pub initial_guess: f64,
}

impl Default for PowerIterationSettings {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            tolerance: 1e-2,
            initial_guess: 10.0,
        }
    }
}

/// Largest-eigenvalue estimate by power iteration, converged when the
/// Rayleigh-quotient residual norm drops below `tolerance` relative to the
/// current estimate.
pub fn estimate_largest_eigenvalue(
    matrix: &Array2<f64>,
    settings: &PowerIterationSettings,
) -> f64 {
    let n = matrix.nrows();
    if n == 0 {
        return 0.0;
    }

    let mut x = Array1::<f64>::from_elem(n, 1.0 / (n as f64).sqrt());
    let mut eigenvalue = settings.initial_guess;

    for _ in 0..settings.max_iterations {
        let y = matrix.dot(&x);
        let estimate = x.dot(&y);
        let residual = (&y - &(&x * estimate)).mapv(f64::abs).sum();
        eigenvalue = estimate;
        let norm = y.dot(&y).sqrt();
        if norm == 0.0 {
            return 0.0;
        }
        x = y / norm;
        if residual <= settings.tolerance * estimate.abs().max(1.0) {
            break;
        }
    }
    eigenvalue
}

/// Computes `Φ·v` against the never-materialized tree-trait precision.
pub struct TreePrecisionTraitProductProvider {
    delegate: Arc<dyn TipFullConditionalProvider>,
    data: Arc<Parameter>,
    strategy: ProductStrategy,
    task_pool: Arc<TaxonTaskPool>,
    options: ProviderOptions,
    power: PowerIterationSettings,
}

impl TreePrecisionTraitProductProvider {
    pub fn new(
        delegate: Arc<dyn TipFullConditionalProvider>,
        strategy: ProductStrategy,
        task_pool: Arc<TaxonTaskPool>,
        options: ProviderOptions,
        power: PowerIterationSettings,
    ) -> Result<Self, ProductError> {
        let data = Arc::clone(delegate.data_parameter());
        let expected = delegate.taxon_count() * delegate.trait_dim();
        if data.dimension() != expected {
            return Err(ProductError::Dimension {
                context: "bound data parameter",
                expected,
                actual: data.dimension(),
            });
        }
        if task_pool.taxon_count() != delegate.taxon_count() {
            return Err(ProductError::Dimension {
                context: "task pool taxon count",
                expected: delegate.taxon_count(),
                actual: task_pool.taxon_count(),
            });
        }
        Ok(Self {
            delegate,
            data,
            strategy,
            task_pool,
            options,
            power,
        })
    }

    pub fn data_parameter(&self) -> &Arc<Parameter> {
        &self.data
    }

    pub fn strategy(&self) -> ProductStrategy {
        self.strategy
    }

    pub fn trait_dim(&self) -> usize {
        self.delegate.trait_dim()
    }

    pub fn taxon_count(&self) -> usize {
        self.delegate.taxon_count()
    }

    /// Version of the delegate model; column caches key on this.
    pub fn model_version(&self) -> u64 {
        self.delegate.model_version()
    }

    /// `Φ·vector`, where `vector` must be the provider's own bound data
    /// parameter. The identity check is deliberate: the linear path reads the
    /// probe values through the delegate's tree traversal, so a value-equal
    /// but distinct parameter would silently compute against stale state.
    pub fn product(&self, vector: &Arc<Parameter>) -> Result<Array1<f64>, ProductError> {
        if !Arc::ptr_eq(vector, &self.data) {
            return Err(ProductError::ParameterMismatch {
                expected: self.data.label().to_string(),
            });
        }

        let started = self.options.timing.then(Instant::now);

        let result = match self.strategy {
            ProductStrategy::Cubic => self.product_dense()?,
            ProductStrategy::Linear => {
                let fast = self.product_linear()?;
                if self.options.debug {
                    let reference = self.product_dense()?;
                    let max_diff = (&fast - &reference)
                        .mapv(f64::abs)
                        .fold(0.0f64, |a, &b| a.max(b));
                    log::debug!(
                        "linear product {:?} vs dense reference {:?} (max abs diff {:.3e})",
                        fast,
                        reference,
                        max_diff
                    );
                }
                fast
            }
        };

        if let Some(started) = started {
            log::debug!(
                "{:?} product over {} taxa took {:.3?}",
                self.strategy,
                self.taxon_count(),
                started.elapsed()
            );
        }
        Ok(result)
    }

    fn product_dense(&self) -> Result<Array1<f64>, ProductError> {
        let phi = self
            .delegate
            .tree_trait_precision()
            .ok_or(ProductError::DenseUnavailable)?;
        let x = self.data.as_array() - self.delegate.prior_mean();
        Ok(phi.dot(&x))
    }

    fn product_linear(&self) -> Result<Array1<f64>, ProductError> {
        let dim = self.trait_dim();
        let n = self.taxon_count();
        let statistics = self.delegate.all_tip_full_conditionals()?;
        if statistics.len() != n {
            return Err(ProductError::Dimension {
                context: "batched tip statistics",
                expected: n,
                actual: statistics.len(),
            });
        }
        let probe = self.data.as_array();

        let serial = self.task_pool.num_tasks() == 1 || self.options.debug || self.options.timing;
        let mut result = Array1::<f64>::zeros(n * dim);

        if serial {
            for taxon in 0..n {
                block_product(&statistics, &probe, taxon, dim, &mut result);
            }
        } else {
            // Each task covers a disjoint taxon range, hence a disjoint slice
            // of the output; partial blocks are copied back in task order.
            let partials = self.task_pool.map_tasks(|idx| {
                let mut partial = Array1::<f64>::zeros(idx.len() * dim);
                for (local, taxon) in (idx.start..idx.stop).enumerate() {
                    block_product_into(&statistics, &probe, taxon, dim, &mut partial, local * dim);
                }
                (idx.start * dim, partial)
            });
            for (offset, partial) in partials {
                result
                    .slice_mut(ndarray::s![offset..offset + partial.len()])
                    .assign(&partial);
            }
        }
        Ok(result)
    }

    /// Diagonal of the dense tree-trait variance, as a mass-matrix
    /// preconditioner; `None` when the delegate cannot materialize it.
    pub fn mass_vector(&self) -> Option<Array1<f64>> {
        let variance = self.delegate.tree_trait_variance()?;
        Some(variance.diag().to_owned())
    }

    /// Rough travel-time heuristic: spectral radius of the taxa-level tree
    /// variance scaled by the largest trait variance.
    pub fn time_scale(&self) -> Result<f64, ProductError> {
        let tree = self
            .delegate
            .tree_variance()
            .ok_or(ProductError::DenseUnavailable)?;
        let trait_var = self
            .delegate
            .trait_variance()
            .ok_or(ProductError::DenseUnavailable)?;
        let tree_eigen = estimate_largest_eigenvalue(&tree, &self.power);
        let max_trait = trait_var
            .diag()
            .iter()
            .copied()
            .fold(0.0f64, f64::max);
        Ok((tree_eigen * max_trait).abs().sqrt())
    }

    /// Travel-time heuristic from the spectral radius of the full tree-trait
    /// variance.
    pub fn time_scale_eigen(&self) -> Result<f64, ProductError> {
        let variance = self
            .delegate
            .tree_trait_variance()
            .ok_or(ProductError::DenseUnavailable)?;
        let eigen = estimate_largest_eigenvalue(&variance, &self.power);
        Ok(eigen.abs().sqrt())
    }

    pub fn report(&self) -> String {
        let fast = self.product(&self.data);
        match (fast, self.delegate.tree_trait_precision()) {
            (Ok(fast), Some(phi)) => {
                let x = self.data.as_array() - self.delegate.prior_mean();
                let dense = phi.dot(&x);
                format!(
                    "strategy {:?}\nfast   {:?}\ndense  {:?}\n",
                    self.strategy, fast, dense
                )
            }
            (Ok(fast), None) => format!("strategy {:?}\nfast {:?}\n(no dense reference)\n", self.strategy, fast),
            (Err(e), _) => format!("product failed: {e}\n"),
        }
    }
}

fn block_product(
    statistics: &[crate::statistics::NormalSufficientStatistics],
    probe: &Array1<f64>,
    taxon: usize,
    dim: usize,
    result: &mut Array1<f64>,
) {
    block_product_into(statistics, probe, taxon, dim, result, taxon * dim);
}

fn block_product_into(
    statistics: &[crate::statistics::NormalSufficientStatistics],
    probe: &Array1<f64>,
    taxon: usize,
    dim: usize,
    out: &mut Array1<f64>,
    offset: usize,
) {
    let stat = &statistics[taxon];
    let delta =
        probe.slice(ndarray::s![taxon * dim..(taxon + 1) * dim]).to_owned() - &stat.mean;
    let block = stat.precision.dot(&delta) * stat.scalar;
    out.slice_mut(ndarray::s![offset..offset + dim]).assign(&block);
}
