//! L-BFGS minimisation through argmin.
//!
//! Problems implement argmin's `CostFunction` and `Gradient` over
//! `Vec<f64>`; `LbfgsSolver` carries the tolerances and history length and
//! runs `LBFGS` with a More-Thuente line search.

use argmin::core::{
    CostFunction, Executor, Gradient, State, TerminationReason, TerminationStatus,
};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;
use argmin_math::ArgminL2Norm;

use crate::decomposition::LinalgError;

/// L-BFGS configuration.
#[derive(Debug, Clone)]
pub struct LbfgsSolver {
    /// Stop when the gradient norm falls below this value.
    pub tol: f64,
    /// Stop when the change of the objective falls below this value.
    pub f_tol: f64,
    /// Maximum number of iterations.
    pub max_iter: u64,
    /// Number of correction pairs kept.
    pub history: usize,
}

impl Default for LbfgsSolver {
    fn default() -> Self {
        Self {
            tol: 1e-8,
            f_tol: 1e-12,
            max_iter: 1000,
            history: 10,
        }
    }
}

/// Result of an L-BFGS run.
#[derive(Debug, Clone)]
pub struct LbfgsResult {
    /// Best iterate found.
    pub x: Vec<f64>,
    /// Objective at `x`.
    pub value: f64,
    /// Number of iterations used.
    pub iterations: u64,
    /// Whether the solver stopped on a convergence criterion.
    pub converged: bool,
    /// Termination status as reported by the solver.
    pub message: String,
}

fn optimization_error(e: impl std::fmt::Display) -> LinalgError {
    LinalgError::Optimization(e.to_string())
}

impl LbfgsSolver {
    pub fn new(tol: f64, max_iter: u64, history: usize) -> Self {
        Self {
            tol,
            max_iter,
            history,
            ..Default::default()
        }
    }

    /// Minimise `problem` starting from `x0`.
    pub fn minimize<O>(&self, problem: O, x0: &[f64]) -> Result<LbfgsResult, LinalgError>
    where
        O: CostFunction<Param = Vec<f64>, Output = f64>
            + Gradient<Param = Vec<f64>, Gradient = Vec<f64>>,
    {
        let init = x0.to_vec();

        // The line search rejects a zero search direction, so a stationary
        // start is returned as is.
        let stationary = init.is_empty()
            || problem
                .gradient(&init)
                .map_err(optimization_error)?
                .l2_norm()
                <= self.tol;
        if stationary {
            let value = problem.cost(&init).map_err(optimization_error)?;
            return Ok(LbfgsResult {
                x: init,
                value,
                iterations: 0,
                converged: true,
                message: "Initial point is stationary".to_string(),
            });
        }

        let linesearch = MoreThuenteLineSearch::new();
        let solver = LBFGS::new(linesearch, self.history)
            .with_tolerance_grad(self.tol)
            .map_err(optimization_error)?
            .with_tolerance_cost(self.f_tol)
            .map_err(optimization_error)?;

        let res = Executor::new(problem, solver)
            .configure(|state| state.param(init).max_iters(self.max_iter))
            .run()
            .map_err(optimization_error)?;

        let state = res.state();
        let x = state
            .get_best_param()
            .ok_or_else(|| LinalgError::Optimization("No best parameters found".to_string()))?
            .clone();
        let termination = state.get_termination_status();
        let converged = matches!(
            termination,
            TerminationStatus::Terminated(TerminationReason::SolverConverged)
                | TerminationStatus::Terminated(TerminationReason::TargetCostReached)
        );

        Ok(LbfgsResult {
            x,
            value: state.get_best_cost(),
            iterations: state.get_iter(),
            converged,
            message: termination.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argmin::core::Error;

    // f(x) = (x0 - 1)^2 + 10 (x1 + 2)^2
    struct Quadratic;

    impl CostFunction for Quadratic {
        type Param = Vec<f64>;
        type Output = f64;

        fn cost(&self, x: &Self::Param) -> Result<f64, Error> {
            Ok((x[0] - 1.0).powi(2) + 10.0 * (x[1] + 2.0).powi(2))
        }
    }

    impl Gradient for Quadratic {
        type Param = Vec<f64>;
        type Gradient = Vec<f64>;

        fn gradient(&self, x: &Self::Param) -> Result<Vec<f64>, Error> {
            Ok(vec![2.0 * (x[0] - 1.0), 20.0 * (x[1] + 2.0)])
        }
    }

    struct Rosenbrock;

    impl CostFunction for Rosenbrock {
        type Param = Vec<f64>;
        type Output = f64;

        fn cost(&self, x: &Self::Param) -> Result<f64, Error> {
            let (a, b) = (x[0], x[1]);
            Ok((1.0 - a).powi(2) + 100.0 * (b - a * a).powi(2))
        }
    }

    impl Gradient for Rosenbrock {
        type Param = Vec<f64>;
        type Gradient = Vec<f64>;

        fn gradient(&self, x: &Self::Param) -> Result<Vec<f64>, Error> {
            let (a, b) = (x[0], x[1]);
            Ok(vec![
                -2.0 * (1.0 - a) - 400.0 * a * (b - a * a),
                200.0 * (b - a * a),
            ])
        }
    }

    #[test]
    fn test_quadratic() {
        let result = LbfgsSolver::default()
            .minimize(Quadratic, &[0.0, 0.0])
            .unwrap();
        assert!(result.converged, "{}", result.message);
        assert!((result.x[0] - 1.0).abs() < 1e-5, "x0={}", result.x[0]);
        assert!((result.x[1] + 2.0).abs() < 1e-5, "x1={}", result.x[1]);
        assert!(result.value < 1e-9);
    }

    #[test]
    fn test_rosenbrock() {
        let solver = LbfgsSolver::new(1e-10, 5000, 10);
        let result = solver.minimize(Rosenbrock, &[-1.2, 1.0]).unwrap();
        assert!((result.x[0] - 1.0).abs() < 1e-3, "x={:?}", result.x);
        assert!((result.x[1] - 1.0).abs() < 1e-3, "x={:?}", result.x);
        assert!(result.iterations > 0);
    }

    #[test]
    fn test_iteration_cap_is_not_convergence() {
        let solver = LbfgsSolver::new(1e-12, 2, 10);
        let result = solver.minimize(Rosenbrock, &[-1.2, 1.0]).unwrap();
        assert!(!result.converged, "{}", result.message);
        assert!(result.iterations <= 2);
    }

    #[test]
    fn test_stationary_start() {
        let result = LbfgsSolver::default()
            .minimize(Quadratic, &[1.0, -2.0])
            .unwrap();
        assert!(result.converged);
        assert_eq!(result.iterations, 0);
        assert_eq!(result.x, vec![1.0, -2.0]);
    }

    #[test]
    fn test_empty_problem() {
        struct Empty;
        impl CostFunction for Empty {
            type Param = Vec<f64>;
            type Output = f64;
            fn cost(&self, _: &Self::Param) -> Result<f64, Error> {
                Ok(0.0)
            }
        }
        impl Gradient for Empty {
            type Param = Vec<f64>;
            type Gradient = Vec<f64>;
            fn gradient(&self, _: &Self::Param) -> Result<Vec<f64>, Error> {
                Ok(Vec::new())
            }
        }

        let result = LbfgsSolver::default().minimize(Empty, &[]).unwrap();
        assert!(result.converged);
        assert_eq!(result.iterations, 0);
    }
}
