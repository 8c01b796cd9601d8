//! Chain-rule adapters over upstream gradient providers.
//!
//! Nothing here recomputes a likelihood: each adapter reinterprets an
//! upstream gradient vector through a fixed closed-form Jacobian, O(dim) per
//! call.

use crate::model::{GradientError, GradientProvider};
use crate::param::Parameter;
use ndarray::Array1;
use std::sync::Arc;

/// Which factor of a `parameter = scale ⊗ matrix` decomposition the adapted
/// gradient is taken with respect to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaledMatrixComponent {
    Scale,
    Matrix,
}

/// Reinterprets an upstream gradient over a full `rows x cols` matrix
/// parameter as a gradient over either factor of its
/// `entry[r,c] = scale[r] * matrix[r,c]` decomposition.
pub struct ScaledMatrixChainGradient {
    upstream: Arc<dyn GradientProvider>,
    component: ScaledMatrixComponent,
    scale: Arc<Parameter>,
    matrix: Arc<Parameter>,
    rows: usize,
    cols: usize,
}

impl ScaledMatrixChainGradient {
    pub fn new(
        upstream: Arc<dyn GradientProvider>,
        component: ScaledMatrixComponent,
        scale: Arc<Parameter>,
        matrix: Arc<Parameter>,
        rows: usize,
        cols: usize,
    ) -> Result<Self, GradientError> {
        if scale.dimension() != rows {
            return Err(GradientError::Dimension {
                context: "scale parameter",
                expected: rows,
                actual: scale.dimension(),
            });
        }
        if matrix.dimension() != rows * cols {
            return Err(GradientError::Dimension {
                context: "matrix parameter",
                expected: rows * cols,
                actual: matrix.dimension(),
            });
        }
        if upstream.dimension() != rows * cols {
            return Err(GradientError::Dimension {
                context: "upstream gradient",
                expected: rows * cols,
                actual: upstream.dimension(),
            });
        }
        Ok(Self {
            upstream,
            component,
            scale,
            matrix,
            rows,
            cols,
        })
    }
}

impl GradientProvider for ScaledMatrixChainGradient {
    fn parameter(&self) -> &Arc<Parameter> {
        match self.component {
            ScaledMatrixComponent::Scale => &self.scale,
            ScaledMatrixComponent::Matrix => &self.matrix,
        }
    }

    fn gradient_log_density(&self) -> Result<Array1<f64>, GradientError> {
        let raw = self.upstream.gradient_log_density()?;
        match self.component {
            ScaledMatrixComponent::Scale => {
                let matrix = self.matrix.values();
                let mut out = Array1::<f64>::zeros(self.rows);
                for r in 0..self.rows {
                    let mut sum = 0.0;
                    for c in 0..self.cols {
                        sum += raw[r * self.cols + c] * matrix[r * self.cols + c];
                    }
                    out[r] = sum;
                }
                Ok(out)
            }
            ScaledMatrixComponent::Matrix => {
                let scale = self.scale.values();
                let mut out = raw;
                for r in 0..self.rows {
                    for c in 0..self.cols {
                        out[r * self.cols + c] *= scale[r];
                    }
                }
                Ok(out)
            }
        }
    }
}

/// Per-taxon remap of one tree partition's tip gradient into the shared
/// fixed-effects space: taxon `t` lands on effect `effect_index[t]` with the
/// given sign.
#[derive(Debug, Clone)]
pub struct TaxonEffectMapping {
    pub effect_index: Vec<usize>,
    pub sign: Vec<f64>,
}

impl TaxonEffectMapping {
    pub fn taxon_count(&self) -> usize {
        self.effect_index.len()
    }
}

/// Scatter-reduce of per-taxon tip gradients across tree partitions into one
/// fixed-effects parameter gradient.
///
/// Each partition supplies a tip gradient of `taxa * dim` entries; every
/// taxon's `dim` block accumulates, sign-flipped per the mapping, into the
/// `dim` block of its shared effect. Effects are fewer than taxa, so several
/// taxa typically fold into one effect.
pub struct TaxonEffectGradient {
    partitions: Vec<(Arc<dyn GradientProvider>, TaxonEffectMapping)>,
    effects: Arc<Parameter>,
    dim: usize,
}

impl TaxonEffectGradient {
    pub fn new(
        partitions: Vec<(Arc<dyn GradientProvider>, TaxonEffectMapping)>,
        effects: Arc<Parameter>,
        dim: usize,
    ) -> Result<Self, GradientError> {
        let effect_count = effects.dimension() / dim;
        if effects.dimension() != effect_count * dim {
            return Err(GradientError::Dimension {
                context: "effects parameter not a multiple of trait dimension",
                expected: effect_count * dim,
                actual: effects.dimension(),
            });
        }
        for (provider, mapping) in &partitions {
            if mapping.sign.len() != mapping.taxon_count() {
                return Err(GradientError::Dimension {
                    context: "taxon effect sign vector",
                    expected: mapping.taxon_count(),
                    actual: mapping.sign.len(),
                });
            }
            if provider.dimension() != mapping.taxon_count() * dim {
                return Err(GradientError::Dimension {
                    context: "partition tip gradient",
                    expected: mapping.taxon_count() * dim,
                    actual: provider.dimension(),
                });
            }
            if let Some(&max_index) = mapping.effect_index.iter().max() {
                if max_index >= effect_count {
                    return Err(GradientError::Dimension {
                        context: "taxon effect index out of range",
                        expected: effect_count,
                        actual: max_index,
                    });
                }
            }
        }
        Ok(Self {
            partitions,
            effects,
            dim,
        })
    }
}

impl GradientProvider for TaxonEffectGradient {
    fn parameter(&self) -> &Arc<Parameter> {
        &self.effects
    }

    fn gradient_log_density(&self) -> Result<Array1<f64>, GradientError> {
        let mut out = Array1::<f64>::zeros(self.effects.dimension());
        for (provider, mapping) in &self.partitions {
            let tip_gradient = provider.gradient_log_density()?;
            for taxon in 0..mapping.taxon_count() {
                let effect = mapping.effect_index[taxon];
                let sign = mapping.sign[taxon];
                for t in 0..self.dim {
                    out[effect * self.dim + t] += sign * tip_gradient[taxon * self.dim + t];
                }
            }
        }
        Ok(out)
    }
}
