//! Tree-structured precision products and factor-loadings gradients for
//! Hamiltonian Monte Carlo over continuous traits on a phylogenetic tree.
//!
//! The precision matrix of the tree-trait distribution is implicit: products
//! against it come from per-tip Gaussian conditional statistics instead of a
//! materialized matrix, columns are extracted by elementary-vector probes
//! with memoized caching, and the factor-model loadings gradient reduces
//! per-taxon contributions over a balanced taxon task pool. Dense reference
//! implementations of every fast path are kept alongside for
//! correctness-checking.

pub mod chain;
pub mod column;
pub mod conjugate;
pub mod dense;
pub mod factor;
pub mod faer_ndarray;
pub mod loadings;
pub mod model;
pub mod param;
pub mod product;
pub mod statistics;
pub mod task_pool;

pub use chain::{
    ScaledMatrixChainGradient, ScaledMatrixComponent, TaxonEffectGradient, TaxonEffectMapping,
};
pub use column::{TreeKroneckerPrecisionColumnProvider, TreePrecisionColumnProvider};
pub use conjugate::FullyConjugateTreeTipsPotentialDerivative;
pub use dense::{DenseFactorTreeModel, DenseTreeModel};
pub use factor::IntegratedFactorModel;
pub use loadings::{
    IntegratedLoadingsAndPrecisionGradient, IntegratedLoadingsGradient,
    MultiplicativeScaleLoadingsGradient, NormalizedIntegratedLoadingsGradient,
    ScaleIntegratedLoadingsGradient,
};
pub use model::{
    DiffusionModel, DiffusionPrecisionProvider, GradientError, GradientProvider,
    TipFullConditionalProvider,
};
pub use param::{Parameter, ProbeGuard};
pub use product::{
    estimate_largest_eigenvalue, PowerIterationSettings, ProductError, ProductStrategy,
    ProviderOptions, TreePrecisionTraitProductProvider,
};
pub use statistics::{weighted_combine, CombinedStatistics, NormalSufficientStatistics};
pub use task_pool::{TaskPoolError, TaxonTaskIndices, TaxonTaskPool};
