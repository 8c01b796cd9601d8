//! Column extraction from the implicit precision matrix.
//!
//! A column is obtained by probing the product provider with an elementary
//! basis vector: the bound data parameter is overwritten with `e_index` under
//! an RAII guard, pushed through `Φ·v`, and restored. Columns are memoized
//! per provider instance; a structural change to the tree model (detected
//! through its version counter) clears the whole cache, since column
//! identity does not map simply onto tree edits.
//!
//! Caches are plain maps with no internal locking. Both providers take
//! `&mut self`, so concurrent column requests against one provider are ruled
//! out at compile time; the product provider underneath may still be
//! internally parallel.

use crate::model::DiffusionPrecisionProvider;
use crate::param::ProbeGuard;
use crate::product::{ProductError, TreePrecisionTraitProductProvider};
use ndarray::Array1;
use std::collections::HashMap;
use std::sync::Arc;

/// Memoizing column accessor over one product provider.
pub struct TreePrecisionColumnProvider {
    provider: Arc<TreePrecisionTraitProductProvider>,
    cache: HashMap<usize, Array1<f64>>,
    seen_model_version: u64,
}

impl TreePrecisionColumnProvider {
    pub fn new(provider: Arc<TreePrecisionTraitProductProvider>) -> Self {
        let seen_model_version = provider.model_version();
        Self {
            provider,
            cache: HashMap::new(),
            seen_model_version,
        }
    }

    pub fn provider(&self) -> &Arc<TreePrecisionTraitProductProvider> {
        &self.provider
    }

    pub fn dimension(&self) -> usize {
        self.provider.data_parameter().dimension()
    }

    /// Column `index` of the implicit precision matrix.
    pub fn column(&mut self, index: usize) -> Result<Array1<f64>, ProductError> {
        let version = self.provider.model_version();
        if version != self.seen_model_version {
            self.invalidate();
            self.seen_model_version = version;
        }

        if let Some(column) = self.cache.get(&index) {
            return Ok(column.clone());
        }

        let data = Arc::clone(self.provider.data_parameter());
        let column = {
            let _probe = ProbeGuard::basis(&data, index);
            self.provider.product(&data)?
        };

        self.cache.insert(index, column.clone());
        Ok(column)
    }

    /// Drop every memoized column.
    pub fn invalidate(&mut self) {
        self.cache.clear();
    }

    pub fn cached_columns(&self) -> usize {
        self.cache.len()
    }
}

/// Kronecker-structured column accessor.
///
/// The tree-trait precision of a conjugate diffusion model factors as
/// `K_tree ⊗ Λ`, so column `index = tree_index * dim + precision_index` is
/// the taxa-level tree column stretched by one column of the trait-level
/// diffusion precision. The expensive tree traversal is paid once per
/// `tree_index` (cached in the inner taxa-level provider) instead of once per
/// trait dimension.
///
/// The two caches invalidate independently: a tree edit clears the tree-level
/// cache (through the inner provider's version check) without touching the
/// assembled Kronecker columns of an unchanged precision, and a diffusion
/// precision edit clears the Kronecker cache while the tree columns stay
/// valid.
pub struct TreeKroneckerPrecisionColumnProvider {
    tree_columns: TreePrecisionColumnProvider,
    diffusion: Arc<dyn DiffusionPrecisionProvider>,
    cache: HashMap<usize, Array1<f64>>,
    seen_precision_version: u64,
    seen_tree_version: u64,
}

impl TreeKroneckerPrecisionColumnProvider {
    /// `tree_columns` must wrap a taxa-level product provider (trait
    /// dimension 1).
    pub fn new(
        tree_columns: TreePrecisionColumnProvider,
        diffusion: Arc<dyn DiffusionPrecisionProvider>,
    ) -> Result<Self, ProductError> {
        let tree_dim = tree_columns.provider().trait_dim();
        if tree_dim != 1 {
            return Err(ProductError::Dimension {
                context: "taxa-level tree column provider trait dimension",
                expected: 1,
                actual: tree_dim,
            });
        }
        let seen_precision_version = diffusion.version();
        let seen_tree_version = tree_columns.provider().model_version();
        Ok(Self {
            tree_columns,
            diffusion,
            cache: HashMap::new(),
            seen_precision_version,
            seen_tree_version,
        })
    }

    pub fn dimension(&self) -> usize {
        self.tree_columns.dimension() * self.diffusion.dim()
    }

    /// Column `index` of `K_tree ⊗ Λ`.
    pub fn column(&mut self, index: usize) -> Result<Array1<f64>, ProductError> {
        let precision_version = self.diffusion.version();
        if precision_version != self.seen_precision_version {
            self.cache.clear();
            self.seen_precision_version = precision_version;
        }
        let tree_version = self.tree_columns.provider().model_version();
        if tree_version != self.seen_tree_version {
            // Assembled columns embed tree columns; they go stale together.
            self.cache.clear();
            self.seen_tree_version = tree_version;
        }

        if let Some(column) = self.cache.get(&index) {
            return Ok(column.clone());
        }

        let dim = self.diffusion.dim();
        let tree_index = index / dim;
        let precision_index = index % dim;

        let tree_column = self.tree_columns.column(tree_index)?;
        let lambda = self.diffusion.precision_matrix();

        let taxa = tree_column.len();
        let mut column = Array1::<f64>::zeros(taxa * dim);
        for j in 0..taxa {
            for s in 0..dim {
                column[j * dim + s] = tree_column[j] * lambda[[s, precision_index]];
            }
        }

        self.cache.insert(index, column.clone());
        Ok(column)
    }

    /// Drop the assembled Kronecker columns. The tree-level cache is managed
    /// by the inner provider.
    pub fn invalidate(&mut self) {
        self.cache.clear();
    }

    pub fn cached_columns(&self) -> usize {
        self.cache.len()
    }
}
