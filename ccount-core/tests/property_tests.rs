//! Property-based tests using proptest.
//!
//! These tests check invariants that must hold for all valid inputs
//! rather than specific numerical values:
//!   - covariance estimates stay symmetric and positive semi-definite
//!   - simulated data have the declared shapes and are valid counts
//!   - family gradients agree with finite differences
//!   - spline bases sum to one, inside and outside the knots
//!   - grouping partitions the rows

use proptest::prelude::*;

use ccount_core::design::{BSpline, KnotsType, SplineSpec};
use ccount_core::glmm::fit::estimate_covariance;
use ccount_core::model::groups::Groups;
use ccount_core::util::math::relative_error;
use ccount_core::{CorrelatedModel, FamilyKind, Grid, ModelInput, ModelOptions, ParamUpdate, Simulation};
use ccount_linalg::decomposition::check_psd;
use ccount_linalg::DenseMatrix;

const FAMILIES: [FamilyKind; 4] = [
    FamilyKind::Poisson,
    FamilyKind::ZeroInflatedPoisson,
    FamilyKind::HurdlePoisson,
    FamilyKind::NegativeBinomial,
];

/// Natural-scale parameters valid for `kind`.
fn theta_for(kind: FamilyKind, a: f64, b: f64) -> Vec<f64> {
    match kind {
        FamilyKind::Poisson => vec![0.2 + 5.0 * a],
        FamilyKind::ZeroInflatedPoisson | FamilyKind::HurdlePoisson => {
            vec![0.05 + 0.9 * a, 0.2 + 5.0 * b]
        }
        FamilyKind::NegativeBinomial => vec![0.2 + 5.0 * a, 0.1 + 2.0 * b],
    }
}

// ---------------------------------------------------------------------------
// 1. Covariance estimates are symmetric PSD
// ---------------------------------------------------------------------------
proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    #[test]
    fn prop_covariance_estimate_is_psd(
        g in 1usize..40,
        n in 1usize..5,
        seed in 0u64..1000,
    ) {
        use rand::SeedableRng;
        use rand::Rng;
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(seed);

        let u = vec![DenseMatrix::from_fn(g, n, |_, _| rng.gen::<f64>() * 4.0 - 2.0)];
        let d = estimate_covariance(&u).unwrap();

        prop_assert_eq!(d[0].nrows(), n);
        prop_assert!(d[0].is_symmetric(1e-12));
        prop_assert!(check_psd(&d[0], 1e-8).is_ok());
        for j in 0..n {
            let expected: f64 = (0..g).map(|i| u[0].get(i, j).powi(2)).sum::<f64>() / g as f64;
            prop_assert!((d[0].get(j, j) - expected).abs() < 1e-8 * expected.max(1.0));
        }
    }
}

// ---------------------------------------------------------------------------
// 2. Simulated data have the declared shapes
// ---------------------------------------------------------------------------
proptest! {
    #![proptest_config(ProptestConfig::with_cases(30))]

    #[test]
    fn prop_simulation_shapes(
        family in 0usize..4,
        m in 5usize..60,
        n in 1usize..4,
        group_size in 1usize..6,
        seed in 0u64..1000,
    ) {
        use rand::SeedableRng;
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(seed);
        let kind = FAMILIES[family];
        let l = kind.build().n_params();

        let group_id: Vec<i64> = (0..m).map(|i| (i / group_size) as i64).collect();
        let n_groups = (m + group_size - 1) / group_size;
        let sim = Simulation::new(
            kind,
            Grid::from_fn(l, n, |_, _| DenseMatrix::full(m, 1, 1.0)),
            Grid::from_fn(l, n, |k, _| vec![if k == 0 { -0.5 } else { 0.3 }]),
            (0..l).map(|_| DenseMatrix::identity(n).scale(0.2)).collect(),
        )
        .with_groups(group_id);
        let data = sim.simulate(&mut rng).unwrap();

        prop_assert_eq!(data.y.nrows(), m);
        prop_assert_eq!(data.y.ncols(), n);
        prop_assert_eq!(data.u.len(), l);
        prop_assert_eq!(data.params.len(), l);
        prop_assert_eq!(data.group_ids.len(), n_groups);
        for uk in &data.u {
            prop_assert_eq!(uk.nrows(), n_groups);
            prop_assert_eq!(uk.ncols(), n);
        }
        prop_assert!(data.y.to_col_major().iter().all(|&v| v >= 0.0 && v.fract() == 0.0));
    }
}

// ---------------------------------------------------------------------------
// 3. Family gradients agree with finite differences
// ---------------------------------------------------------------------------
proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_family_gradient_matches_finite_difference(
        family in 0usize..4,
        y in 0u32..15,
        a in 0.0f64..1.0,
        b in 0.0f64..1.0,
    ) {
        let kind = FAMILIES[family];
        let fam = kind.build();
        let y = y as f64;
        let theta = theta_for(kind, a, b);

        let nll = fam.neg_log_likelihood(y, &theta);
        prop_assert!(nll.is_finite());
        prop_assert!(nll >= -1e-12);

        let mut grad = vec![0.0; theta.len()];
        fam.gradient(y, &theta, &mut grad);
        for k in 0..theta.len() {
            let h = 1e-6 * theta[k];
            let mut up = theta.clone();
            let mut down = theta.clone();
            up[k] += h;
            down[k] -= h;
            let fd = (fam.neg_log_likelihood(y, &up) - fam.neg_log_likelihood(y, &down)) / (2.0 * h);
            prop_assert!(
                (fd - grad[k]).abs() < 1e-4 * grad[k].abs().max(1.0),
                "{} param {}: analytic {} numeric {}", fam.name(), k, grad[k], fd
            );
        }
    }
}

// ---------------------------------------------------------------------------
// 4. The model objective is finite for any finite parameters
// ---------------------------------------------------------------------------
proptest! {
    #![proptest_config(ProptestConfig::with_cases(30))]

    #[test]
    fn prop_objective_finite(
        family in 0usize..4,
        m in 4usize..30,
        seed in 0u64..1000,
    ) {
        use rand::SeedableRng;
        use rand::Rng;
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(seed);
        let kind = FAMILIES[family];
        let l = kind.build().n_params();

        let y = DenseMatrix::from_fn(m, 2, |_, _| rng.gen_range(0u32..8) as f64);
        let covariate = DenseMatrix::from_fn(m, 1, |_, _| rng.gen::<f64>());
        let group_id: Vec<i64> = (0..m).map(|_| rng.gen_range(0i64..4)).collect();
        let input = ModelInput::new(y, Grid::from_fn(l, 2, |_, _| Some(covariate.clone())))
            .with_groups(group_id);
        let options = ModelOptions { add_intercepts: true, normalize_x: true };
        let mut model = CorrelatedModel::new(kind.build(), input, options).unwrap();

        let beta = Grid::from_fn(l, 2, |_, _| vec![rng.gen::<f64>() * 2.0 - 1.0, rng.gen::<f64>() * 2.0 - 1.0]);
        let g = model.n_groups();
        let u: Vec<DenseMatrix> = (0..l)
            .map(|_| DenseMatrix::from_fn(g, 2, |_, _| rng.gen::<f64>() - 0.5))
            .collect();
        model.update_params(ParamUpdate { beta: Some(beta), u: Some(u), ..Default::default() }).unwrap();

        prop_assert!(model.neg_log_likelihood().unwrap().is_finite());
        let params = model.params();
        prop_assert_eq!(params.len(), l);
        prop_assert!(params.iter().all(|p| p.is_finite()));
    }
}

// ---------------------------------------------------------------------------
// 5. Spline bases are a partition of unity
// ---------------------------------------------------------------------------
proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    #[test]
    fn prop_spline_partition_of_unity(
        knots_num in 3usize..8,
        degree in 1usize..4,
        frequency in proptest::bool::ANY,
        l_linear in proptest::bool::ANY,
        r_linear in proptest::bool::ANY,
        seed in 0u64..1000,
    ) {
        use rand::SeedableRng;
        use rand::Rng;
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(seed);

        let values: Vec<f64> = (0..80).map(|_| rng.gen::<f64>() * 10.0).collect();
        let knots_type = if frequency { KnotsType::Frequency } else { KnotsType::Domain };
        let spec = SplineSpec::new(values, knots_num)
            .with_degree(degree)
            .with_knots_type(knots_type)
            .with_linear_tails(l_linear, r_linear);
        let spline = match BSpline::fit(&spec) {
            Ok(s) => s,
            // too few knots left after the linear tails
            Err(_) => return Ok(()),
        };

        for i in 0..=40 {
            let x = -2.0 + 14.0 * i as f64 / 40.0;
            let basis = spline.eval(x);
            prop_assert_eq!(basis.len(), spline.n_basis());
            let total: f64 = basis.iter().sum();
            prop_assert!((total - 1.0).abs() < 1e-8, "sum at {} is {}", x, total);
        }
    }
}

// ---------------------------------------------------------------------------
// 6. Grouping partitions the rows
// ---------------------------------------------------------------------------
proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    #[test]
    fn prop_groups_partition_rows(ids in proptest::collection::vec(-5i64..5, 1..50)) {
        let groups = Groups::new(&ids);

        let sizes = groups.sizes();
        prop_assert_eq!(sizes.iter().sum::<usize>(), ids.len());
        prop_assert!(groups.ids().windows(2).all(|w| w[0] < w[1]));

        let mut seen = vec![false; ids.len()];
        for g in 0..groups.len() {
            for pos in groups.rows(g) {
                let row = groups.order()[pos];
                prop_assert_eq!(ids[row], groups.ids()[g]);
                prop_assert!(!seen[row]);
                seen[row] = true;
            }
            prop_assert_eq!(groups.position(groups.ids()[g]), Some(g));
        }
        prop_assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn prop_relative_error_zero_on_equal(values in proptest::collection::vec(-10.0f64..10.0, 1..20)) {
        prop_assert!(relative_error(&values, &values).abs() < 1e-15);
        let shifted: Vec<f64> = values.iter().map(|v| v + 1.0).collect();
        prop_assert!(relative_error(&values, &shifted) > 0.0);
    }
}
