use approx::{assert_abs_diff_eq, assert_relative_eq};
use ndarray::{Array1, Array2};
use phylograd::{
    DenseTreeModel, FullyConjugateTreeTipsPotentialDerivative, GradientProvider, Parameter,
    PowerIterationSettings, ProductError, ProductStrategy, ProviderOptions, TaxonTaskPool,
    TipFullConditionalProvider, TreePrecisionTraitProductProvider,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::sync::Arc;

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

fn build_model(seed: u64, taxa: usize, dim: usize) -> (Arc<DenseTreeModel>, Arc<Parameter>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let tree = random_spd(&mut rng, taxa);
    let trait_precision = random_spd(&mut rng, dim);
    let values: Vec<f64> = (0..taxa * dim).map(|_| rng.sample(StandardNormal)).collect();
    let data = Parameter::new("tip traits", values);
    let model = Arc::new(
        DenseTreeModel::new(tree, trait_precision, Arc::clone(&data), Array1::zeros(taxa * dim))
            .unwrap(),
    );
    (model, data)
}

fn provider(
    model: &Arc<DenseTreeModel>,
    strategy: ProductStrategy,
    threads: i32,
) -> TreePrecisionTraitProductProvider {
    let pool = Arc::new(TaxonTaskPool::new(6, threads).unwrap());
    TreePrecisionTraitProductProvider::new(
        Arc::clone(model) as Arc<dyn TipFullConditionalProvider>,
        strategy,
        pool,
        ProviderOptions::default(),
        PowerIterationSettings::default(),
    )
    .unwrap()
}

#[test]
fn linear_product_matches_cubic_reference() {
    let (model, data) = build_model(7, 6, 3);
    let linear = provider(&model, ProductStrategy::Linear, 0);
    let cubic = provider(&model, ProductStrategy::Cubic, 0);

    let fast = linear.product(&data).unwrap();
    let reference = cubic.product(&data).unwrap();
    for i in 0..fast.len() {
        assert_relative_eq!(fast[i], reference[i], max_relative = 1e-8, epsilon = 1e-10);
    }
}

#[test]
fn linear_product_matches_cubic_with_nonzero_prior_mean() {
    let taxa = 5;
    let dim = 2;
    let mut rng = StdRng::seed_from_u64(31);
    let tree = random_spd(&mut rng, taxa);
    let trait_precision = random_spd(&mut rng, dim);
    let values: Vec<f64> = (0..taxa * dim).map(|_| rng.sample(StandardNormal)).collect();
    let prior_mean: Array1<f64> =
        Array1::from_iter((0..taxa * dim).map(|_| rng.sample::<f64, _>(StandardNormal) + 0.5));
    let data = Parameter::new("tip traits", values);
    let model = Arc::new(
        DenseTreeModel::new(
            tree,
            trait_precision,
            Arc::clone(&data),
            prior_mean.clone(),
        )
        .unwrap(),
    );

    let pool = Arc::new(TaxonTaskPool::new(taxa, 0).unwrap());
    let linear = TreePrecisionTraitProductProvider::new(
        Arc::clone(&model) as Arc<dyn TipFullConditionalProvider>,
        ProductStrategy::Linear,
        Arc::clone(&pool),
        ProviderOptions::default(),
        PowerIterationSettings::default(),
    )
    .unwrap();
    let cubic = TreePrecisionTraitProductProvider::new(
        Arc::clone(&model) as Arc<dyn TipFullConditionalProvider>,
        ProductStrategy::Cubic,
        pool,
        ProviderOptions::default(),
        PowerIterationSettings::default(),
    )
    .unwrap();

    // Centering must flow through the tip conditionals, not just the dense
    // path: Φ(x − μ) with μ ≠ 0.
    let fast = linear.product(&data).unwrap();
    let reference = cubic.product(&data).unwrap();
    for i in 0..fast.len() {
        assert_relative_eq!(fast[i], reference[i], max_relative = 1e-8, epsilon = 1e-10);
    }
}

#[test]
fn parallel_product_matches_serial_for_all_thread_counts() {
    let (model, data) = build_model(11, 6, 3);
    let serial = provider(&model, ProductStrategy::Linear, 0).product(&data).unwrap();
    for threads in [1, 2, 4] {
        let parallel = provider(&model, ProductStrategy::Linear, threads)
            .product(&data)
            .unwrap();
        for i in 0..serial.len() {
            assert_abs_diff_eq!(parallel[i], serial[i], epsilon = 1e-10);
        }
    }
}

#[test]
fn product_rejects_foreign_parameter() {
    let (model, data) = build_model(13, 6, 3);
    let linear = provider(&model, ProductStrategy::Linear, 0);

    // Same values, different parameter object: the contract is identity, not
    // equality.
    let imposter = Parameter::new("tip traits", data.values());
    match linear.product(&imposter) {
        Err(ProductError::ParameterMismatch { .. }) => {}
        other => panic!("expected parameter mismatch, got {other:?}"),
    }
}

#[test]
fn debug_mode_cross_checks_without_changing_result() {
    let (model, data) = build_model(17, 6, 3);
    let pool = Arc::new(TaxonTaskPool::new(6, 2).unwrap());
    let debug_provider = TreePrecisionTraitProductProvider::new(
        Arc::clone(&model) as Arc<dyn TipFullConditionalProvider>,
        ProductStrategy::Linear,
        pool,
        ProviderOptions {
            debug: true,
            timing: false,
        },
        PowerIterationSettings::default(),
    )
    .unwrap();

    let plain = provider(&model, ProductStrategy::Linear, 0).product(&data).unwrap();
    let debugged = debug_provider.product(&data).unwrap();
    for i in 0..plain.len() {
        assert_abs_diff_eq!(debugged[i], plain[i], epsilon = 1e-12);
    }
}

#[test]
fn mass_vector_is_tree_trait_variance_diagonal() {
    let (model, _data) = build_model(19, 6, 3);
    let linear = provider(&model, ProductStrategy::Linear, 0);
    let mass = linear.mass_vector().unwrap();
    let variance = model.tree_trait_variance().unwrap();
    for i in 0..mass.len() {
        assert_abs_diff_eq!(mass[i], variance[[i, i]], epsilon = 1e-12);
    }
}

#[test]
fn time_scale_heuristics_bound_the_spectrum() {
    let (model, _data) = build_model(23, 6, 3);
    let linear = provider(&model, ProductStrategy::Linear, 0);

    let eigen_scale = linear.time_scale_eigen().unwrap();
    assert!(eigen_scale > 0.0);

    // The spectral radius dominates every diagonal entry of the variance.
    let variance = model.tree_trait_variance().unwrap();
    let max_diag = variance.diag().iter().copied().fold(0.0f64, f64::max);
    assert!(eigen_scale * eigen_scale >= max_diag * 0.95);

    assert!(linear.time_scale().unwrap() > 0.0);
}

#[test]
fn conjugate_tip_gradient_is_negated_product() {
    let (model, data) = build_model(29, 6, 3);
    let linear = provider(&model, ProductStrategy::Linear, 0);
    let conjugate =
        FullyConjugateTreeTipsPotentialDerivative::new(Arc::clone(&model) as Arc<dyn TipFullConditionalProvider>).unwrap();

    let product = linear.product(&data).unwrap();
    let gradient = conjugate.gradient_log_density().unwrap();
    for i in 0..product.len() {
        assert_abs_diff_eq!(gradient[i], -product[i], epsilon = 1e-8);
    }
}
