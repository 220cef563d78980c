//! Simulate correlated counts, fit them and report the estimates.
//!
//! ccount demo --family hurdle-poisson --n-obs 100 --n-outcomes 2 --replicates 10

use anyhow::{bail, Result};
use clap::Args;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::info;

use ccount_core::{
    CorrelatedModel, FamilyKind, FitConfig, Grid, LinkKind, ModelInput, ModelOptions, ParamUpdate,
    Simulation,
};
use ccount_linalg::DenseMatrix;

#[derive(Args)]
pub struct DemoArgs {
    /// Count family: poisson, zip, hurdle-poisson or negbin
    #[arg(long, default_value = "hurdle-poisson")]
    family: String,

    /// Number of observations
    #[arg(long, default_value = "100")]
    n_obs: usize,

    /// Number of outcomes
    #[arg(long, default_value = "2")]
    n_outcomes: usize,

    /// Observations per group (1 gives one random effect per observation)
    #[arg(long, default_value = "1")]
    group_size: usize,

    /// True probability for logit-linked parameters
    #[arg(long, default_value = "0.5")]
    p: f64,

    /// True coefficient of the mean parameter
    #[arg(long, default_value = "0.1")]
    beta: f64,

    /// True negative binomial dispersion
    #[arg(long, default_value = "0.5")]
    dispersion: f64,

    /// Correlation between the outcomes' mean random effects
    #[arg(long, default_value = "0.1")]
    correlation: f64,

    /// Fit all blocks from default starting values instead of holding U and D at the truth
    #[arg(long, default_value = "false")]
    full_fit: bool,

    /// Maximum outer iterations
    #[arg(long, default_value = "1")]
    max_iters: usize,

    /// Stop when the mean relative change falls below this value
    #[arg(long)]
    rel_tol: Option<f64>,

    /// Number of simulated data sets
    #[arg(long, default_value = "1")]
    replicates: usize,

    /// Random seed
    #[arg(long, default_value = "12345")]
    seed: u64,

    /// Print the model summary of the last replicate
    #[arg(long, default_value = "false")]
    summary: bool,
}

/// Variance of the random effects on parameters without a correlated effect.
const NEGLIGIBLE_VARIANCE: f64 = 1e-10;

pub fn run(args: DemoArgs) -> Result<()> {
    let Some(kind) = FamilyKind::from_name(&args.family) else {
        bail!("Unknown family: {}", args.family);
    };
    if args.n_obs == 0 || args.n_outcomes == 0 || args.group_size == 0 {
        bail!("n-obs, n-outcomes and group-size must be positive");
    }
    if !(args.p > 0.0 && args.p < 1.0) {
        bail!("p must lie in (0, 1), got {}", args.p);
    }
    if args.dispersion <= 0.0 {
        bail!("dispersion must be positive, got {}", args.dispersion);
    }

    let family = kind.build();
    let names = family.parameter_names();
    let links = family.links();
    let (m, n, l) = (args.n_obs, args.n_outcomes, family.n_params());

    let truth: Vec<f64> = (0..l)
        .map(|k| match (names[k], links[k]) {
            (_, LinkKind::Logit) => (args.p / (1.0 - args.p)).ln(),
            ("dispersion", _) => args.dispersion.ln(),
            _ => args.beta,
        })
        .collect();
    let mean_param = names.iter().position(|&name| name == "mean").unwrap_or(0);
    let d_true: Vec<DenseMatrix> = (0..l)
        .map(|k| {
            if k == mean_param {
                DenseMatrix::from_fn(n, n, |a, b| if a == b { 1.0 } else { args.correlation })
            } else {
                DenseMatrix::identity(n).scale(NEGLIGIBLE_VARIANCE)
            }
        })
        .collect();
    let group_id: Vec<i64> = (0..m).map(|i| (i / args.group_size) as i64).collect();

    info!("=== ccount demo: {} ===", family.name());
    info!(
        "m={}, n={}, group size={}, replicates={}",
        m, n, args.group_size, args.replicates
    );

    let simulation = Simulation::new(
        kind,
        Grid::from_fn(l, n, |_, _| DenseMatrix::full(m, 1, 1.0)),
        Grid::from_fn(l, n, |k, _| vec![truth[k]]),
        d_true.clone(),
    )
    .with_groups(group_id.clone());

    let config = FitConfig {
        max_iters: args.max_iters,
        optimize_u: args.full_fit,
        compute_d: args.full_fit,
        rel_tol: args.rel_tol,
        ..Default::default()
    };

    let mut rng = ChaCha8Rng::seed_from_u64(args.seed);
    let mut errors = vec![0.0; l];
    let mut last = None;
    for rep in 0..args.replicates {
        let data = simulation.simulate(&mut rng)?;
        let input = ModelInput::new(data.y, Grid::from_fn(l, n, |_, _| None)).with_groups(group_id.clone());
        let options = ModelOptions {
            add_intercepts: true,
            normalize_x: true,
        };
        let mut model = CorrelatedModel::new(kind.build(), input, options)?;

        if !args.full_fit {
            // only the mean parameter carries random effects
            let u = (0..l)
                .map(|k| {
                    if k == mean_param {
                        data.u[k].clone()
                    } else {
                        DenseMatrix::zeros(model.n_groups(), n)
                    }
                })
                .collect();
            model.update_params(ParamUpdate {
                u: Some(u),
                d: Some(d_true.clone()),
                ..Default::default()
            })?;
        }

        let report = model.optimize_params(&config)?;
        info!(
            "replicate {}: {} iterations, objective {:.6e}",
            rep + 1,
            report.iterations,
            report.objective
        );

        println!("Replicate {}", rep + 1);
        for k in 0..l {
            let estimated: Vec<f64> = (0..n).map(|j| model.beta().get(k, j)[0]).collect();
            println!("  {:<10} estimated {}", names[k], format_values(&estimated));
            println!("  {:<10} true      {}", "", format_values(&vec![truth[k]; n]));
            errors[k] += estimated.iter().map(|b| b - truth[k]).sum::<f64>() / n as f64;
        }
        if args.full_fit {
            println!("  estimated {} random-effect covariance:", names[mean_param]);
            print!("{}", model.d()[mean_param]);
        }
        last = Some(model);
    }

    println!();
    for k in 0..l {
        println!(
            "Overall {} error for {} is {:.6}",
            names[k],
            family.name(),
            errors[k] / args.replicates.max(1) as f64
        );
    }

    if args.summary {
        if let Some(model) = last {
            println!();
            print!("{}", model.summary());
        }
    }
    Ok(())
}

fn format_values(values: &[f64]) -> String {
    let parts: Vec<String> = values.iter().map(|v| format!("{:.6}", v)).collect();
    format!("[{}]", parts.join(", "))
}
