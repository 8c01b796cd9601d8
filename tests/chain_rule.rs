use approx::{assert_abs_diff_eq, assert_relative_eq};
use ndarray::{Array1, Array2};
use phylograd::{
    DenseFactorTreeModel, GradientError, GradientProvider, IntegratedFactorModel,
    IntegratedLoadingsGradient, MultiplicativeScaleLoadingsGradient,
    NormalizedIntegratedLoadingsGradient, Parameter, ProviderOptions,
    ScaleIntegratedLoadingsGradient, ScaledMatrixChainGradient, ScaledMatrixComponent,
    TaxonEffectGradient, TaxonEffectMapping, TaxonTaskPool,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::sync::Arc;

const TAXA: usize = 5;
const FACTORS: usize = 2;
const TRAITS: usize = 3;
const FD_STEP: f64 = 1e-5;

struct Fixture {
    factor_model: Arc<IntegratedFactorModel>,
    tree_variance: Array2<f64>,
    loadings: Arc<Parameter>,
    scale: Arc<Parameter>,
    base_matrix: Arc<Parameter>,
    multiplier: Arc<Parameter>,
    base: Arc<IntegratedLoadingsGradient>,
}

fn random_spd(rng: &mut StdRng, n: usize) -> Array2<f64> {
    let mut b = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in 0..n {
            b[[i, j]] = rng.sample(StandardNormal);
        }
    }
    let mut spd = b.dot(&b.t()) / n as f64;
    for i in 0..n {
        spd[[i, i]] += 1.0;
    }
    spd
}

fn compose_loadings(scale: &[f64], base_matrix: &[f64]) -> Vec<f64> {
    let mut out = vec![0.0; FACTORS * TRAITS];
    for a in 0..FACTORS {
        for t in 0..TRAITS {
            out[a * TRAITS + t] = scale[a] * base_matrix[a * TRAITS + t];
        }
    }
    out
}

fn cumulative_product(multiplier: &[f64]) -> Vec<f64> {
    let mut out = vec![0.0; multiplier.len()];
    let mut product = 1.0;
    for (i, &m) in multiplier.iter().enumerate() {
        product *= m;
        out[i] = product;
    }
    out
}

fn fixture(seed: u64) -> Fixture {
    let mut rng = StdRng::seed_from_u64(seed);

    let multiplier_values: Vec<f64> = (0..FACTORS).map(|_| rng.gen_range(0.4..1.6)).collect();
    let scale_values = cumulative_product(&multiplier_values);
    let base_values: Vec<f64> = (0..FACTORS * TRAITS)
        .map(|_| rng.sample::<f64, _>(StandardNormal) * 0.7)
        .collect();
    let precision_values: Vec<f64> = (0..TRAITS).map(|_| rng.gen_range(0.5..2.5)).collect();
    let data_values: Vec<f64> = (0..TAXA * TRAITS).map(|_| rng.sample(StandardNormal)).collect();

    let loadings = Parameter::new("loadings", compose_loadings(&scale_values, &base_values));
    let scale = Parameter::new("scale", scale_values);
    let base_matrix = Parameter::new("base loadings", base_values);
    let multiplier = Parameter::new("multiplier", multiplier_values);
    let precision = Parameter::new("residual precision", precision_values);
    let data = Parameter::new("trait data", data_values);

    let factor_model = Arc::new(
        IntegratedFactorModel::new(
            Arc::clone(&loadings),
            precision,
            data,
            vec![false; TAXA * TRAITS],
            FACTORS,
            TRAITS,
            TAXA,
            false,
        )
        .unwrap(),
    );

    let tree_variance = random_spd(&mut rng, TAXA);
    let tree = Arc::new(
        DenseFactorTreeModel::new(Arc::clone(&factor_model), tree_variance.clone()).unwrap(),
    );
    let pool = Arc::new(TaxonTaskPool::new(TAXA, 0).unwrap());
    let base = Arc::new(
        IntegratedLoadingsGradient::new(
            Arc::clone(&factor_model),
            tree,
            pool,
            ProviderOptions::default(),
        )
        .unwrap(),
    );

    Fixture {
        factor_model,
        tree_variance,
        loadings,
        scale,
        base_matrix,
        multiplier,
        base,
    }
}

/// Central difference of the marginal likelihood with respect to `target`,
/// recomposing the loadings parameter after every perturbation.
fn finite_difference_through_loadings(
    fix: &Fixture,
    target: &Arc<Parameter>,
    recompose: impl Fn(&Fixture),
) -> Array1<f64> {
    let mut out = Array1::<f64>::zeros(target.dimension());
    for i in 0..target.dimension() {
        let saved = target.value(i);

        target.set_value(i, saved + FD_STEP);
        recompose(fix);
        let upper = fix
            .factor_model
            .marginal_log_likelihood(&fix.tree_variance)
            .unwrap();

        target.set_value(i, saved - FD_STEP);
        recompose(fix);
        let lower = fix
            .factor_model
            .marginal_log_likelihood(&fix.tree_variance)
            .unwrap();

        target.set_value(i, saved);
        recompose(fix);
        out[i] = (upper - lower) / (2.0 * FD_STEP);
    }
    out
}

fn recompose_from_scale(fix: &Fixture) {
    fix.loadings
        .set_values(&compose_loadings(&fix.scale.values(), &fix.base_matrix.values()));
}

fn recompose_from_multiplier(fix: &Fixture) {
    let scale = cumulative_product(&fix.multiplier.values());
    fix.scale.set_values(&scale);
    fix.loadings
        .set_values(&compose_loadings(&scale, &fix.base_matrix.values()));
}

#[test]
fn scale_gradient_matches_finite_difference() {
    let fix = fixture(71);
    let provider = ScaleIntegratedLoadingsGradient::new(
        Arc::clone(&fix.base),
        Arc::clone(&fix.scale),
        Arc::clone(&fix.base_matrix),
    )
    .unwrap();

    let analytic = provider.gradient_log_density().unwrap();
    let numeric = finite_difference_through_loadings(&fix, &fix.scale, recompose_from_scale);
    for i in 0..analytic.len() {
        assert_relative_eq!(analytic[i], numeric[i], max_relative = 1e-3, epsilon = 1e-6);
    }
}

#[test]
fn normalized_gradient_matches_finite_difference() {
    let fix = fixture(73);
    let provider = NormalizedIntegratedLoadingsGradient::new(
        Arc::clone(&fix.base),
        Arc::clone(&fix.scale),
        Arc::clone(&fix.base_matrix),
    )
    .unwrap();

    let analytic = provider.gradient_log_density().unwrap();
    let numeric =
        finite_difference_through_loadings(&fix, &fix.base_matrix, recompose_from_scale);
    for i in 0..analytic.len() {
        assert_relative_eq!(analytic[i], numeric[i], max_relative = 1e-3, epsilon = 1e-6);
    }
}

#[test]
fn multiplicative_scale_gradient_matches_finite_difference() {
    let fix = fixture(79);
    let scale_gradient = Arc::new(
        ScaleIntegratedLoadingsGradient::new(
            Arc::clone(&fix.base),
            Arc::clone(&fix.scale),
            Arc::clone(&fix.base_matrix),
        )
        .unwrap(),
    );
    let provider = MultiplicativeScaleLoadingsGradient::new(
        scale_gradient,
        Arc::clone(&fix.scale),
        Arc::clone(&fix.multiplier),
    )
    .unwrap();

    let analytic = provider.gradient_log_density().unwrap();
    let numeric =
        finite_difference_through_loadings(&fix, &fix.multiplier, recompose_from_multiplier);
    for i in 0..analytic.len() {
        assert_relative_eq!(analytic[i], numeric[i], max_relative = 1e-3, epsilon = 1e-6);
    }
}

#[test]
fn scaled_matrix_adapter_agrees_with_dedicated_variants() {
    let fix = fixture(83);

    let scale_adapter = ScaledMatrixChainGradient::new(
        Arc::clone(&fix.base) as Arc<dyn GradientProvider>,
        ScaledMatrixComponent::Scale,
        Arc::clone(&fix.scale),
        Arc::clone(&fix.base_matrix),
        FACTORS,
        TRAITS,
    )
    .unwrap();
    let scale_variant = ScaleIntegratedLoadingsGradient::new(
        Arc::clone(&fix.base),
        Arc::clone(&fix.scale),
        Arc::clone(&fix.base_matrix),
    )
    .unwrap();
    let a = scale_adapter.gradient_log_density().unwrap();
    let b = scale_variant.gradient_log_density().unwrap();
    for i in 0..a.len() {
        assert_abs_diff_eq!(a[i], b[i], epsilon = 1e-12);
    }

    let matrix_adapter = ScaledMatrixChainGradient::new(
        Arc::clone(&fix.base) as Arc<dyn GradientProvider>,
        ScaledMatrixComponent::Matrix,
        Arc::clone(&fix.scale),
        Arc::clone(&fix.base_matrix),
        FACTORS,
        TRAITS,
    )
    .unwrap();
    let normalized_variant = NormalizedIntegratedLoadingsGradient::new(
        Arc::clone(&fix.base),
        Arc::clone(&fix.scale),
        Arc::clone(&fix.base_matrix),
    )
    .unwrap();
    let c = matrix_adapter.gradient_log_density().unwrap();
    let d = normalized_variant.gradient_log_density().unwrap();
    for i in 0..c.len() {
        assert_abs_diff_eq!(c[i], d[i], epsilon = 1e-12);
    }
}

/// Fixed-output provider standing in for one partition's tip gradient.
struct StaticGradient {
    parameter: Arc<Parameter>,
    gradient: Array1<f64>,
}

impl GradientProvider for StaticGradient {
    fn parameter(&self) -> &Arc<Parameter> {
        &self.parameter
    }

    fn gradient_log_density(&self) -> Result<Array1<f64>, GradientError> {
        Ok(self.gradient.clone())
    }
}

#[test]
fn taxon_effects_scatter_reduce_across_partitions() {
    let dim = 2;
    let effects = Parameter::new("fixed effects", vec![0.0; 2 * dim]);

    // Partition 1: three taxa, taxa 0 and 2 share effect 0.
    let partition_one = Arc::new(StaticGradient {
        parameter: Parameter::new("tips one", vec![0.0; 3 * dim]),
        gradient: Array1::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]),
    }) as Arc<dyn GradientProvider>;
    let mapping_one = TaxonEffectMapping {
        effect_index: vec![0, 1, 0],
        sign: vec![1.0, -1.0, 1.0],
    };

    // Partition 2: one taxon feeding effect 1 with a sign flip.
    let partition_two = Arc::new(StaticGradient {
        parameter: Parameter::new("tips two", vec![0.0; dim]),
        gradient: Array1::from_vec(vec![10.0, 20.0]),
    }) as Arc<dyn GradientProvider>;
    let mapping_two = TaxonEffectMapping {
        effect_index: vec![1],
        sign: vec![-1.0],
    };

    let provider = TaxonEffectGradient::new(
        vec![(partition_one, mapping_one), (partition_two, mapping_two)],
        effects,
        dim,
    )
    .unwrap();

    let gradient = provider.gradient_log_density().unwrap();
    // Effect 0: taxon 0 plus taxon 2 of partition one.
    assert_abs_diff_eq!(gradient[0], 1.0 + 5.0, epsilon = 1e-12);
    assert_abs_diff_eq!(gradient[1], 2.0 + 6.0, epsilon = 1e-12);
    // Effect 1: negated taxon 1 of partition one and negated partition two.
    assert_abs_diff_eq!(gradient[2], -3.0 - 10.0, epsilon = 1e-12);
    assert_abs_diff_eq!(gradient[3], -4.0 - 20.0, epsilon = 1e-12);
}
