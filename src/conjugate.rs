//! Fully dense reference gradient with respect to tip trait values.
//!
//! Ground truth for the implicit-product machinery: with the tree-trait
//! precision `Φ` materialized, the gradient of the log density with respect
//! to the tip values is simply `−Φ (x − μ)`. Quadratic in taxa and traits,
//! so debugging and test scale only.

use crate::model::{GradientError, GradientProvider, TipFullConditionalProvider};
use crate::param::Parameter;
use ndarray::Array1;
use std::sync::Arc;

pub struct FullyConjugateTreeTipsPotentialDerivative {
    delegate: Arc<dyn TipFullConditionalProvider>,
    data: Arc<Parameter>,
}

impl FullyConjugateTreeTipsPotentialDerivative {
    pub fn new(delegate: Arc<dyn TipFullConditionalProvider>) -> Result<Self, GradientError> {
        let data = Arc::clone(delegate.data_parameter());
        let expected = delegate.taxon_count() * delegate.trait_dim();
        if data.dimension() != expected {
            return Err(GradientError::Dimension {
                context: "bound tip data parameter",
                expected,
                actual: data.dimension(),
            });
        }
        Ok(Self { delegate, data })
    }
}

impl GradientProvider for FullyConjugateTreeTipsPotentialDerivative {
    fn parameter(&self) -> &Arc<Parameter> {
        &self.data
    }

    fn gradient_log_density(&self) -> Result<Array1<f64>, GradientError> {
        let phi = self
            .delegate
            .tree_trait_precision()
            .ok_or(GradientError::DenseUnavailable)?;
        let centered = self.data.as_array() - self.delegate.prior_mean();
        Ok(-phi.dot(&centered))
    }
}
