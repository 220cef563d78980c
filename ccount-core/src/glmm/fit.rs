//! Alternating optimisation of fixed effects, random effects and their covariance.
//!
//! Each outer iteration runs, in order:
//!   1. beta-step: L-BFGS over all fixed effects with U and D held fixed;
//!   2. U-step: the objective separates by group, so every group's `l * n`
//!      random effects are minimised on their own, in parallel;
//!   3. D-step: D_k = U_k' U_k / G, projected onto the PSD cone.
//!
//! Convergence is judged on the mean relative change of the enabled blocks.

use anyhow::Result;
use argmin::core::{CostFunction, Gradient};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use ccount_linalg::decomposition::{project_psd, LinalgError};
use ccount_linalg::{DenseMatrix, LbfgsSolver};

use super::objective::{pseudo_inverses, Objective};
use crate::model::correlated::CorrelatedModel;
use crate::model::error::ModelError;
use crate::util::grid::Grid;
use crate::util::math::relative_error;

/// Configuration for the alternating optimiser.
#[derive(Debug, Clone)]
pub struct FitConfig {
    /// Maximum outer iterations.
    pub max_iters: usize,
    /// Run the beta-step every iteration.
    pub optimize_beta: bool,
    /// Run the U-step every iteration.
    pub optimize_u: bool,
    /// Re-estimate D every iteration.
    pub compute_d: bool,
    /// Stop once the mean relative change is at most this value.
    pub rel_tol: Option<f64>,
    /// L-BFGS iteration limit of the beta-step.
    pub max_beta_iters: usize,
    /// L-BFGS iteration limit of each group's U-step.
    pub max_u_iters: usize,
    /// Gradient-norm tolerance of the inner L-BFGS runs.
    pub lbfgs_tol: f64,
    /// Number of L-BFGS correction pairs.
    pub lbfgs_history: usize,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            max_iters: 10,
            optimize_beta: true,
            optimize_u: true,
            compute_d: true,
            rel_tol: None,
            max_beta_iters: 1000,
            max_u_iters: 1000,
            lbfgs_tol: 1e-8,
            lbfgs_history: 10,
        }
    }
}

/// Per-iteration diagnostics.
#[derive(Debug, Clone)]
pub struct IterationRecord {
    pub iteration: usize,
    pub beta_change: Option<f64>,
    pub u_change: Option<f64>,
    pub d_change: Option<f64>,
    /// Mean of the enabled blocks' relative changes.
    pub total_change: f64,
    /// Objective after the iteration.
    pub objective: f64,
}

/// Result of `optimize`.
#[derive(Debug, Clone)]
pub struct FitReport {
    /// Outer iterations run.
    pub iterations: usize,
    /// Whether `rel_tol` was reached. Always false without a tolerance.
    pub converged: bool,
    /// Final objective value.
    pub objective: f64,
    pub history: Vec<IterationRecord>,
}

/// Run the alternating optimiser on `model`, updating it in place.
pub fn optimize(model: &mut CorrelatedModel, config: &FitConfig) -> Result<FitReport> {
    let n_blocks = [config.optimize_beta, config.optimize_u, config.compute_d]
        .iter()
        .filter(|&&b| b)
        .count();
    if n_blocks == 0 {
        return Err(ModelError::NothingToOptimize.into());
    }

    info!(
        "Optimizing parameters: m={}, n={}, l={}, groups={}",
        model.n_obs(),
        model.n_outcomes(),
        model.n_params(),
        model.n_groups()
    );

    let mut history = Vec::with_capacity(config.max_iters);
    let mut converged = false;

    for iter in 0..config.max_iters {
        info!("On iteration {}", iter + 1);
        let d_pinv = pseudo_inverses(model.d())?;
        let mut record = IterationRecord {
            iteration: iter + 1,
            beta_change: None,
            u_change: None,
            d_change: None,
            total_change: 0.0,
            objective: f64::NAN,
        };

        if config.optimize_beta {
            let old = model.beta().flatten();
            let beta = beta_step(&model.objective(), model.beta(), model.u(), &d_pinv, config)?;
            let change = relative_error(&old, &beta.flatten());
            model.set_state(Some(beta), None, None);
            debug!("beta relative change {:.3e}", change);
            record.beta_change = Some(change);
        }

        if config.optimize_u {
            let old = flatten_mats(model.u());
            let u = u_step(&model.objective(), model.beta(), model.u(), &d_pinv, config);
            let change = relative_error(&old, &flatten_mats(&u));
            model.set_state(None, Some(u), None);
            debug!("U relative change {:.3e}", change);
            record.u_change = Some(change);
        }

        if config.compute_d {
            let old: Vec<f64> = model.d().iter().flat_map(|d| d.upper_triangle()).collect();
            let d = estimate_covariance(model.u())?;
            let new: Vec<f64> = d.iter().flat_map(|d| d.upper_triangle()).collect();
            let change = relative_error(&old, &new);
            model.set_state(None, None, Some(d));
            debug!("D relative change {:.3e}", change);
            record.d_change = Some(change);
        }

        let total = [record.beta_change, record.u_change, record.d_change]
            .iter()
            .flatten()
            .sum::<f64>()
            / n_blocks as f64;
        record.total_change = total;
        record.objective = model.neg_log_likelihood()?;
        debug!("total relative change {:.3e}", total);
        history.push(record.clone());

        if let Some(tol) = config.rel_tol {
            if total <= tol {
                info!(
                    "Optimization converged with tolerance {} after {} iterations",
                    tol,
                    iter + 1
                );
                converged = true;
                break;
            }
        }
        info!("objective function value {:.6e}", record.objective);
    }

    let objective = model.neg_log_likelihood()?;
    Ok(FitReport {
        iterations: history.len(),
        converged,
        objective,
        history,
    })
}

/// Joint objective as a function of the flattened fixed effects.
struct BetaProblem<'a> {
    objective: Objective<'a>,
    template: &'a Grid<Vec<f64>>,
    u: &'a [DenseMatrix],
    d_pinv: &'a [DenseMatrix],
}

impl BetaProblem<'_> {
    fn unflatten(&self, x: &[f64]) -> Grid<Vec<f64>> {
        let mut beta = self.template.clone();
        beta.unflatten_from(x);
        beta
    }
}

impl CostFunction for BetaProblem<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, x: &Self::Param) -> Result<f64, argmin::core::Error> {
        Ok(self.objective.value(&self.unflatten(x), self.u, self.d_pinv))
    }
}

impl Gradient for BetaProblem<'_> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, x: &Self::Param) -> Result<Vec<f64>, argmin::core::Error> {
        let beta = self.unflatten(x);
        let mut grad = beta.clone();
        self.objective
            .beta_value_grad(&beta, self.u, self.d_pinv, &mut grad);
        Ok(grad.flatten())
    }
}

/// One group's contribution as a function of its random effects.
struct GroupProblem<'a> {
    objective: Objective<'a>,
    g: usize,
    fixed: &'a [DenseMatrix],
    d_pinv: &'a [DenseMatrix],
}

impl CostFunction for GroupProblem<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, x: &Self::Param) -> Result<f64, argmin::core::Error> {
        let mut grad = vec![0.0; x.len()];
        Ok(self
            .objective
            .group_value_grad(self.g, self.fixed, x, self.d_pinv, &mut grad))
    }
}

impl Gradient for GroupProblem<'_> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, x: &Self::Param) -> Result<Vec<f64>, argmin::core::Error> {
        let mut grad = vec![0.0; x.len()];
        self.objective
            .group_value_grad(self.g, self.fixed, x, self.d_pinv, &mut grad);
        Ok(grad)
    }
}

fn lbfgs(config: &FitConfig, max_iter: usize) -> LbfgsSolver {
    LbfgsSolver::new(config.lbfgs_tol, max_iter as u64, config.lbfgs_history)
}

/// Minimise over all fixed effects with U and D held fixed.
pub fn beta_step(
    objective: &Objective<'_>,
    beta: &Grid<Vec<f64>>,
    u: &[DenseMatrix],
    d_pinv: &[DenseMatrix],
    config: &FitConfig,
) -> Result<Grid<Vec<f64>>> {
    let problem = BetaProblem {
        objective: *objective,
        template: beta,
        u,
        d_pinv,
    };
    let result = lbfgs(config, config.max_beta_iters).minimize(problem, &beta.flatten())?;
    if !result.converged {
        warn!(
            "beta-step did not converge after {} iterations: {}",
            result.iterations, result.message
        );
    }
    debug!(
        "beta-step: {} iterations, objective {:.6e}",
        result.iterations, result.value
    );
    let mut out = beta.clone();
    out.unflatten_from(&result.x);
    Ok(out)
}

/// Minimise each group's random effects independently.
///
/// A group whose solve fails keeps its current effects.
pub fn u_step(
    objective: &Objective<'_>,
    beta: &Grid<Vec<f64>>,
    u: &[DenseMatrix],
    d_pinv: &[DenseMatrix],
    config: &FitConfig,
) -> Vec<DenseMatrix> {
    let l = u.len();
    let n = u.first().map_or(0, |uk| uk.ncols());
    let n_groups = objective.groups.len();
    let fixed = objective.fixed_predictor(beta);
    let solver = lbfgs(config, config.max_u_iters);

    let results: Vec<_> = (0..n_groups)
        .into_par_iter()
        .map(|g| {
            let x0: Vec<f64> = u.iter().flat_map(|uk| uk.row(g)).collect();
            let problem = GroupProblem {
                objective: *objective,
                g,
                fixed: &fixed,
                d_pinv,
            };
            match solver.minimize(problem, &x0) {
                Ok(r) => (r.x, r.converged),
                Err(e) => {
                    debug!("U-step for group {} failed: {}", g, e);
                    (x0, false)
                }
            }
        })
        .collect();

    let failed = results.iter().filter(|(_, converged)| !converged).count();
    if failed > 0 {
        warn!("U-step: {} of {} groups did not converge", failed, n_groups);
    }

    let mut out = vec![DenseMatrix::zeros(n_groups, n); l];
    for (g, (x, _)) in results.iter().enumerate() {
        for (k, uk) in out.iter_mut().enumerate() {
            uk.set_row(g, &x[k * n..(k + 1) * n]);
        }
    }
    out
}

/// D_k = U_k' U_k / G, projected onto the PSD cone.
pub fn estimate_covariance(u: &[DenseMatrix]) -> Result<Vec<DenseMatrix>, LinalgError> {
    u.iter()
        .map(|uk| project_psd(&uk.gram().scale(1.0 / uk.nrows().max(1) as f64)))
        .collect()
}

fn flatten_mats(mats: &[DenseMatrix]) -> Vec<f64> {
    mats.iter().flat_map(|m| m.to_col_major()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccount_linalg::decomposition::check_psd;

    use crate::glmm::family::FamilyKind;
    use crate::model::{ModelInput, ModelOptions};

    fn poisson_model() -> CorrelatedModel {
        let m = 12;
        let y = DenseMatrix::from_fn(m, 2, |i, j| ((i * 3 + j) % 4) as f64);
        let x = Grid::from_fn(1, 2, |_, _| {
            Some(DenseMatrix::from_fn(m, 1, |i, _| (i as f64 * 0.37).cos()))
        });
        let group_id: Vec<i64> = (0..m as i64).map(|i| i / 3).collect();
        let options = ModelOptions {
            add_intercepts: true,
            normalize_x: true,
        };
        CorrelatedModel::new(
            FamilyKind::Poisson.build(),
            ModelInput::new(y, x).with_groups(group_id),
            options,
        )
        .unwrap()
    }

    fn norm(v: &[f64]) -> f64 {
        v.iter().map(|g| g * g).sum::<f64>().sqrt()
    }

    #[test]
    fn test_default_config() {
        let config = FitConfig::default();
        assert_eq!(config.max_iters, 10);
        assert!(config.optimize_beta && config.optimize_u && config.compute_d);
        assert!(config.rel_tol.is_none());
        assert_eq!(config.max_beta_iters, 1000);
        assert_eq!(config.max_u_iters, 1000);
    }

    #[test]
    fn test_estimate_covariance_is_psd() {
        let u = vec![
            DenseMatrix::from_row_major(4, 2, &[1.0, 0.5, -1.0, -0.2, 0.3, 0.1, -0.4, 0.0]),
            DenseMatrix::zeros(4, 2),
        ];
        let d = estimate_covariance(&u).unwrap();
        assert_eq!(d.len(), 2);
        check_psd(&d[0], 1e-8).unwrap();
        assert!((d[0].get(0, 0) - (1.0 + 1.0 + 0.09 + 0.16) / 4.0).abs() < 1e-10);
        assert!((d[0].get(0, 1) - (0.5 + 0.2 + 0.03) / 4.0).abs() < 1e-10);
        assert!(d[1].max_abs() < 1e-15);
    }

    #[test]
    fn test_estimate_covariance_single_group_is_rank_one() {
        let u = vec![DenseMatrix::from_row_major(1, 2, &[2.0, -1.0])];
        let d = estimate_covariance(&u).unwrap();
        let det = d[0].get(0, 0) * d[0].get(1, 1) - d[0].get(0, 1) * d[0].get(1, 0);
        assert!(det.abs() < 1e-10);
        assert!((d[0].get(0, 1) + 2.0).abs() < 1e-10);
    }

    #[test]
    fn test_beta_step_reaches_stationary_point() {
        let model = poisson_model();
        let d_pinv = pseudo_inverses(model.d()).unwrap();
        let objective = model.objective();
        let start = objective.value(model.beta(), model.u(), &d_pinv);

        let beta = beta_step(&objective, model.beta(), model.u(), &d_pinv, &FitConfig::default()).unwrap();
        let mut grad = beta.clone();
        let value = objective.beta_value_grad(&beta, model.u(), &d_pinv, &mut grad);
        assert!(value <= start + 1e-12, "{} > {}", value, start);
        assert!(norm(&grad.flatten()) < 1e-4, "grad={:?}", grad.flatten());
    }

    #[test]
    fn test_u_step_reaches_stationary_point_per_group() {
        let model = poisson_model();
        let d_pinv = pseudo_inverses(model.d()).unwrap();
        let objective = model.objective();
        let fixed = objective.fixed_predictor(model.beta());

        let u = u_step(&objective, model.beta(), model.u(), &d_pinv, &FitConfig::default());
        assert_eq!(u.len(), 1);
        assert_eq!((u[0].nrows(), u[0].ncols()), (4, 2));
        for g in 0..model.n_groups() {
            let u_g: Vec<f64> = u.iter().flat_map(|uk| uk.row(g)).collect();
            let mut grad = vec![0.0; u_g.len()];
            objective.group_value_grad(g, &fixed, &u_g, &d_pinv, &mut grad);
            assert!(norm(&grad) < 1e-4, "group {} grad={:?}", g, grad);
        }
    }
}
