//! Gradients of the factor-integrated marginal likelihood.
//!
//! For each taxon the data kernel (factor-space Gaussian induced by that
//! taxon's observed traits) is combined with the tree's full-conditional
//! belief about the same taxon's factors; the product is the posterior the
//! per-taxon gradient contribution integrates against. Contributions are
//! independent across taxa, so they reduce over the taxon task pool, each
//! worker filling its own gradient row and the rows summed in fixed task
//! order afterwards.
//!
//! The reparameterized variants (`Scale…`, `Normalized…`,
//! `MultiplicativeScale…`) are closed-form chain rules over the raw
//! per-(factor, trait) gradient; they delegate the heavy computation to a
//! shared base gradient rather than recomputing anything.

use crate::factor::IntegratedFactorModel;
use crate::faer_ndarray::KahanSum;
use crate::model::{GradientError, GradientProvider, TipFullConditionalProvider};
use crate::param::Parameter;
use crate::product::ProviderOptions;
use crate::statistics::{weighted_combine, NormalSufficientStatistics};
use crate::task_pool::TaxonTaskPool;
use ndarray::{Array1, Array2};
use std::sync::Arc;
use std::time::Instant;

/// Gradient of the marginal log-likelihood with respect to the loadings.
pub struct IntegratedLoadingsGradient {
    factor_model: Arc<IntegratedFactorModel>,
    tree: Arc<dyn TipFullConditionalProvider>,
    task_pool: Arc<TaxonTaskPool>,
    options: ProviderOptions,
}

impl IntegratedLoadingsGradient {
    pub fn new(
        factor_model: Arc<IntegratedFactorModel>,
        tree: Arc<dyn TipFullConditionalProvider>,
        task_pool: Arc<TaxonTaskPool>,
        options: ProviderOptions,
    ) -> Result<Self, GradientError> {
        if tree.trait_dim() != factor_model.dim_factor() {
            return Err(GradientError::Dimension {
                context: "tree trait dimension vs factor count",
                expected: factor_model.dim_factor(),
                actual: tree.trait_dim(),
            });
        }
        if tree.taxon_count() != factor_model.taxon_count() {
            return Err(GradientError::Dimension {
                context: "tree taxon count",
                expected: factor_model.taxon_count(),
                actual: tree.taxon_count(),
            });
        }
        if task_pool.taxon_count() != factor_model.taxon_count() {
            return Err(GradientError::Dimension {
                context: "task pool taxon count",
                expected: factor_model.taxon_count(),
                actual: task_pool.taxon_count(),
            });
        }
        Ok(Self {
            factor_model,
            tree,
            task_pool,
            options,
        })
    }

    pub fn factor_model(&self) -> &Arc<IntegratedFactorModel> {
        &self.factor_model
    }

    fn compute(&self, with_precision: bool) -> Result<GradientAccumulator, GradientError> {
        if self.factor_model.compute_remainder() {
            // The remainder terms the tree trait depends on must be fresh
            // before any statistics are read; force one full evaluation
            // first. Ordering matters here, this is not an optimization.
            if let Some(tree_variance) = self.tree.tree_variance() {
                let log_likelihood = self.factor_model.marginal_log_likelihood(&tree_variance)?;
                log::debug!("refreshed marginal log-likelihood: {log_likelihood:.6}");
            }
        }

        let started = self.options.timing.then(Instant::now);

        // One batched fetch across all taxa, on the calling thread, before
        // any forking. Workers only read from here on.
        let statistics = self.tree.all_tip_full_conditionals()?;
        let loadings = self.factor_model.loadings_matrix();
        let lambda = self.factor_model.precision_values();
        let data = self.factor_model.data_matrix();

        let serial =
            self.task_pool.num_tasks() == 1 || self.options.debug || self.options.timing;

        let rows: Vec<Result<GradientAccumulator, GradientError>> = if serial {
            vec![self.accumulate_range(
                0,
                self.factor_model.taxon_count(),
                &statistics,
                &loadings,
                &lambda,
                &data,
                with_precision,
            )]
        } else {
            self.task_pool.map_tasks(|idx| {
                self.accumulate_range(
                    idx.start,
                    idx.stop,
                    &statistics,
                    &loadings,
                    &lambda,
                    &data,
                    with_precision,
                )
            })
        };

        // Fixed-order, compensated reduction: per-thread partials combine in
        // task order, so a given thread count always reproduces itself.
        let dim = loadings.len();
        let p = self.factor_model.dim_trait();
        let mut loadings_sums = vec![KahanSum::default(); dim];
        let mut precision_sums = vec![KahanSum::default(); if with_precision { p } else { 0 }];
        for row in rows {
            let row = row?;
            for (sum, value) in loadings_sums.iter_mut().zip(row.loadings.iter()) {
                sum.add(*value);
            }
            if with_precision {
                for (sum, value) in precision_sums.iter_mut().zip(row.precision.iter()) {
                    sum.add(*value);
                }
            }
        }

        if let Some(started) = started {
            log::debug!(
                "loadings gradient over {} taxa took {:.3?}",
                self.factor_model.taxon_count(),
                started.elapsed()
            );
        }

        Ok(GradientAccumulator {
            loadings: Array1::from_iter(loadings_sums.into_iter().map(KahanSum::sum)),
            precision: Array1::from_iter(precision_sums.into_iter().map(KahanSum::sum)),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn accumulate_range(
        &self,
        start: usize,
        stop: usize,
        statistics: &[NormalSufficientStatistics],
        loadings: &Array2<f64>,
        lambda: &Array1<f64>,
        data: &Array2<f64>,
        with_precision: bool,
    ) -> Result<GradientAccumulator, GradientError> {
        let k = self.factor_model.dim_factor();
        let p = self.factor_model.dim_trait();
        let mut grad = Array1::<f64>::zeros(k * p);
        let mut precision_grad = Array1::<f64>::zeros(if with_precision { p } else { 0 });

        for taxon in start..stop {
            let kernel = self.factor_model.tip_kernel(taxon)?;
            let combined = weighted_combine(&kernel, &statistics[taxon])?;
            let second_moment = combined.second_moment();
            let m2l = second_moment.dot(loadings);

            for a in 0..k {
                for t in 0..p {
                    if self.factor_model.is_missing(taxon, t) {
                        continue;
                    }
                    grad[a * p + t] +=
                        (combined.mean[a] * data[[taxon, t]] - m2l[[a, t]]) * lambda[t];
                }
            }

            if with_precision {
                for t in 0..p {
                    if self.factor_model.is_missing(taxon, t) {
                        continue;
                    }
                    let y = data[[taxon, t]];
                    let mut projected_mean = 0.0;
                    let mut projected_second = 0.0;
                    for a in 0..k {
                        projected_mean += loadings[[a, t]] * combined.mean[a];
                        projected_second += loadings[[a, t]] * m2l[[a, t]];
                    }
                    let residual_second = y * y - 2.0 * y * projected_mean + projected_second;
                    precision_grad[t] += 0.5 * (1.0 / lambda[t] - residual_second);
                }
            }
        }

        Ok(GradientAccumulator {
            loadings: grad,
            precision: precision_grad,
        })
    }
}

struct GradientAccumulator {
    loadings: Array1<f64>,
    precision: Array1<f64>,
}

impl GradientProvider for IntegratedLoadingsGradient {
    fn parameter(&self) -> &Arc<Parameter> {
        self.factor_model.loadings_parameter()
    }

    fn gradient_log_density(&self) -> Result<Array1<f64>, GradientError> {
        Ok(self.compute(false)?.loadings)
    }
}

/// Gradient with respect to the per-factor scale of a
/// `loadings = scale ∘ base` decomposition (`loadings[a,t] =
/// scale[a] * base[a,t]`).
pub struct ScaleIntegratedLoadingsGradient {
    base: Arc<IntegratedLoadingsGradient>,
    scale: Arc<Parameter>,
    matrix: Arc<Parameter>,
}

impl ScaleIntegratedLoadingsGradient {
    pub fn new(
        base: Arc<IntegratedLoadingsGradient>,
        scale: Arc<Parameter>,
        matrix: Arc<Parameter>,
    ) -> Result<Self, GradientError> {
        let k = base.factor_model().dim_factor();
        let p = base.factor_model().dim_trait();
        if scale.dimension() != k {
            return Err(GradientError::Dimension {
                context: "scale parameter",
                expected: k,
                actual: scale.dimension(),
            });
        }
        if matrix.dimension() != k * p {
            return Err(GradientError::Dimension {
                context: "base loadings matrix parameter",
                expected: k * p,
                actual: matrix.dimension(),
            });
        }
        Ok(Self {
            base,
            scale,
            matrix,
        })
    }
}

impl GradientProvider for ScaleIntegratedLoadingsGradient {
    fn parameter(&self) -> &Arc<Parameter> {
        &self.scale
    }

    fn gradient_log_density(&self) -> Result<Array1<f64>, GradientError> {
        let raw = self.base.gradient_log_density()?;
        let matrix = self.matrix.values();
        let k = self.scale.dimension();
        let p = self.base.factor_model().dim_trait();

        let mut out = Array1::<f64>::zeros(k);
        for a in 0..k {
            let mut sum = 0.0;
            for t in 0..p {
                sum += raw[a * p + t] * matrix[a * p + t];
            }
            out[a] = sum;
        }
        Ok(out)
    }
}

/// Gradient with respect to the normalized base matrix of the same
/// decomposition: each factor row of the raw gradient scaled by that
/// factor's scale.
pub struct NormalizedIntegratedLoadingsGradient {
    base: Arc<IntegratedLoadingsGradient>,
    scale: Arc<Parameter>,
    matrix: Arc<Parameter>,
}

impl NormalizedIntegratedLoadingsGradient {
    pub fn new(
        base: Arc<IntegratedLoadingsGradient>,
        scale: Arc<Parameter>,
        matrix: Arc<Parameter>,
    ) -> Result<Self, GradientError> {
        let k = base.factor_model().dim_factor();
        let p = base.factor_model().dim_trait();
        if scale.dimension() != k {
            return Err(GradientError::Dimension {
                context: "scale parameter",
                expected: k,
                actual: scale.dimension(),
            });
        }
        if matrix.dimension() != k * p {
            return Err(GradientError::Dimension {
                context: "normalized loadings matrix parameter",
                expected: k * p,
                actual: matrix.dimension(),
            });
        }
        Ok(Self {
            base,
            scale,
            matrix,
        })
    }
}

impl GradientProvider for NormalizedIntegratedLoadingsGradient {
    fn parameter(&self) -> &Arc<Parameter> {
        &self.matrix
    }

    fn gradient_log_density(&self) -> Result<Array1<f64>, GradientError> {
        let raw = self.base.gradient_log_density()?;
        let scale = self.scale.values();
        let p = self.base.factor_model().dim_trait();

        let mut out = raw;
        for a in 0..scale.len() {
            for t in 0..p {
                out[a * p + t] *= scale[a];
            }
        }
        Ok(out)
    }
}

/// Further chains the scale gradient through a multiplier
/// reparameterization `scale[j] = Π_{i≤j} multiplier[i]`:
/// `∂/∂multiplier[i] = Σ_{j≥i} (∂/∂scale[j]) scale[j] / multiplier[i]`.
pub struct MultiplicativeScaleLoadingsGradient {
    scale_gradient: Arc<ScaleIntegratedLoadingsGradient>,
    scale: Arc<Parameter>,
    multiplier: Arc<Parameter>,
}

impl MultiplicativeScaleLoadingsGradient {
    pub fn new(
        scale_gradient: Arc<ScaleIntegratedLoadingsGradient>,
        scale: Arc<Parameter>,
        multiplier: Arc<Parameter>,
    ) -> Result<Self, GradientError> {
        if multiplier.dimension() != scale.dimension() {
            return Err(GradientError::Dimension {
                context: "multiplier parameter",
                expected: scale.dimension(),
                actual: multiplier.dimension(),
            });
        }
        Ok(Self {
            scale_gradient,
            scale,
            multiplier,
        })
    }
}

impl GradientProvider for MultiplicativeScaleLoadingsGradient {
    fn parameter(&self) -> &Arc<Parameter> {
        &self.multiplier
    }

    fn gradient_log_density(&self) -> Result<Array1<f64>, GradientError> {
        let scaled = self.scale_gradient.gradient_log_density()?;
        let scale = self.scale.values();
        let multiplier = self.multiplier.values();
        let k = scale.len();

        let mut out = Array1::<f64>::zeros(k);
        for i in 0..k {
            let mut sum = 0.0;
            for j in i..k {
                sum += scaled[j] * scale[j];
            }
            out[i] = sum / multiplier[i];
        }
        Ok(out)
    }
}

/// Joint gradient with respect to loadings and per-trait residual precision,
/// laid out as the loadings gradient followed by the `dim_trait` precision
/// entries.
pub struct IntegratedLoadingsAndPrecisionGradient {
    base: Arc<IntegratedLoadingsGradient>,
    compound: Arc<Parameter>,
}

impl IntegratedLoadingsAndPrecisionGradient {
    pub fn new(
        base: Arc<IntegratedLoadingsGradient>,
        compound: Arc<Parameter>,
    ) -> Result<Self, GradientError> {
        let k = base.factor_model().dim_factor();
        let p = base.factor_model().dim_trait();
        if compound.dimension() != k * p + p {
            return Err(GradientError::Dimension {
                context: "compound loadings+precision parameter",
                expected: k * p + p,
                actual: compound.dimension(),
            });
        }
        Ok(Self { base, compound })
    }
}

impl GradientProvider for IntegratedLoadingsAndPrecisionGradient {
    fn parameter(&self) -> &Arc<Parameter> {
        &self.compound
    }

    fn gradient_log_density(&self) -> Result<Array1<f64>, GradientError> {
        let result = self.base.compute(true)?;
        let mut out = Array1::<f64>::zeros(result.loadings.len() + result.precision.len());
        out.slice_mut(ndarray::s![..result.loadings.len()])
            .assign(&result.loadings);
        out.slice_mut(ndarray::s![result.loadings.len()..])
            .assign(&result.precision);
        Ok(out)
    }
}
