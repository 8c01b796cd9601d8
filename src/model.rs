//! External-collaborator seams.
//!
//! The full phylogenetic machinery (tree data structures, traversal engine,
//! model dependency graph) is out of scope; the providers in this crate see
//! it only through the traits below. A dense reference implementation lives
//! in [`crate::dense`].

use crate::faer_ndarray::FaerLinalgError;
use crate::param::Parameter;
use crate::statistics::NormalSufficientStatistics;
use ndarray::{Array1, Array2};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GradientError {
    #[error("linear algebra failure in gradient computation: {0}")]
    Linalg(#[from] FaerLinalgError),
    #[error("dimension mismatch in {context}: expected {expected}, got {actual}")]
    Dimension {
        context: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("delegate does not expose the dense matrices this computation needs")]
    DenseUnavailable,
}

/// Per-tip "full conditional density" surface of a tree-data likelihood.
///
/// Implementations expose, for each external node, the Gaussian belief about
/// the latent trait value at that tip conditioned on every other tip's data,
/// under the current values of the bound data parameter. The statistics are
/// recomputed from the live parameter values on every call; callers that
/// need them for all taxa should use the batched accessor, which
/// implementations can serve from a single traversal.
pub trait TipFullConditionalProvider: Send + Sync {
    fn taxon_count(&self) -> usize;

    /// Dimension of the latent trait at each tip.
    fn trait_dim(&self) -> usize;

    /// Statistics for one tip, conditioned on all other tips.
    fn tip_full_conditional(&self, taxon: usize) -> Result<NormalSufficientStatistics, GradientError>;

    /// Statistics for every tip, in taxon order. Equivalent to calling
    /// [`Self::tip_full_conditional`] per taxon, but fetched in one pass.
    fn all_tip_full_conditionals(&self) -> Result<Vec<NormalSufficientStatistics>, GradientError> {
        (0..self.taxon_count())
            .map(|taxon| self.tip_full_conditional(taxon))
            .collect()
    }

    /// The data parameter the conditional statistics are computed from.
    fn data_parameter(&self) -> &Arc<Parameter>;

    /// Monotone counter bumped on any structural change (tree edit,
    /// diffusion change). Caches keyed on this version must be cleared when
    /// it moves.
    fn model_version(&self) -> u64;

    /// Dense `(taxa*dim) x (taxa*dim)` tree-trait precision, if this
    /// delegate can materialize it. Used by the cubic reference product and
    /// the conjugate tip gradient.
    fn tree_trait_precision(&self) -> Option<Array2<f64>> {
        None
    }

    /// Dense `(taxa*dim) x (taxa*dim)` tree-trait variance.
    fn tree_trait_variance(&self) -> Option<Array2<f64>> {
        None
    }

    /// Taxa-level tree variance (shared-path matrix), `taxa x taxa`.
    fn tree_variance(&self) -> Option<Array2<f64>> {
        None
    }

    /// Trait-level diffusion variance, `dim x dim`.
    fn trait_variance(&self) -> Option<Array2<f64>> {
        None
    }

    /// Prior mean of the tree-trait distribution, length `taxa*dim`.
    fn prior_mean(&self) -> Array1<f64> {
        Array1::zeros(self.taxon_count() * self.trait_dim())
    }
}

/// Source of the trait-level diffusion precision block used by the Kronecker
/// column provider.
pub trait DiffusionPrecisionProvider: Send + Sync {
    fn dim(&self) -> usize;
    fn precision_matrix(&self) -> Array2<f64>;
    /// Version of the underlying precision parameter.
    fn version(&self) -> u64;
}

/// Diffusion model backed by a flat `dim*dim` precision parameter
/// (row-major).
pub struct DiffusionModel {
    precision: Arc<Parameter>,
    dim: usize,
}

impl DiffusionModel {
    pub fn new(precision: Arc<Parameter>, dim: usize) -> Result<Self, GradientError> {
        if precision.dimension() != dim * dim {
            return Err(GradientError::Dimension {
                context: "diffusion precision parameter",
                expected: dim * dim,
                actual: precision.dimension(),
            });
        }
        Ok(Self { precision, dim })
    }

    pub fn precision_parameter(&self) -> &Arc<Parameter> {
        &self.precision
    }
}

impl DiffusionPrecisionProvider for DiffusionModel {
    fn dim(&self) -> usize {
        self.dim
    }

    fn precision_matrix(&self) -> Array2<f64> {
        let values = self.precision.values();
        Array2::from_shape_vec((self.dim, self.dim), values)
            .expect("dimension validated at construction")
    }

    fn version(&self) -> u64 {
        self.precision.version()
    }
}

/// A provider of the gradient of a log density with respect to one bound
/// parameter. This is the surface the HMC transition kernel drives.
pub trait GradientProvider: Send + Sync {
    /// The parameter the gradient is taken with respect to.
    fn parameter(&self) -> &Arc<Parameter>;

    fn dimension(&self) -> usize {
        self.parameter().dimension()
    }

    fn gradient_log_density(&self) -> Result<Array1<f64>, GradientError>;

    /// Human-readable diagnostic dump. Not a stable machine interface.
    fn report(&self) -> String {
        match self.gradient_log_density() {
            Ok(gradient) => format!(
                "gradient wrt `{}` ({} entries): {:?}",
                self.parameter().label(),
                gradient.len(),
                gradient
            ),
            Err(e) => format!(
                "gradient wrt `{}` failed: {e}",
                self.parameter().label()
            ),
        }
    }
}
