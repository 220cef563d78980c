#![allow(clippy::needless_range_loop)]
//! Penalized negative log-likelihood and its gradients.
//!
//! For parameter `k`, observation `i` (in group order) and outcome `j`:
//!
//!   eta_{k,i,j}   = X_{k,j}[i,:] beta_{k,j} + U_k[group(i), j]
//!   theta_{k,i,j} = offset_k[i] * g_k(eta_{k,i,j})
//!
//! and the objective is
//!
//!   (1/m) sum_i sum_j w_ij f(y_ij, theta_{.,i,j})
//!     + sum_k (1/2G) sum_g U_k[g,:] D_k^+ U_k[g,:]'
//!
//! The data term splits over groups, so the random effects of each group
//! can be optimised on their own.

use ccount_linalg::decomposition::{pseudo_inverse, LinalgError};
use ccount_linalg::DenseMatrix;

use super::family::CountFamily;
use super::link::Link;
use crate::model::groups::Groups;
use crate::util::grid::Grid;

/// Borrowed view of the data the objective is evaluated on. Rows are in group order.
#[derive(Clone, Copy)]
pub struct Objective<'a> {
    pub family: &'a dyn CountFamily,
    pub y: &'a DenseMatrix,
    pub weights: &'a DenseMatrix,
    /// One vector of length `m` per parameter.
    pub offset: &'a [Vec<f64>],
    pub x: &'a Grid<DenseMatrix>,
    pub groups: &'a Groups,
}

/// Scratch space for one (observation, outcome) cell.
struct CellBuffer {
    eta: Vec<f64>,
    theta: Vec<f64>,
    dtheta: Vec<f64>,
    score: Vec<f64>,
}

impl CellBuffer {
    fn new(l: usize) -> Self {
        Self {
            eta: vec![0.0; l],
            theta: vec![0.0; l],
            dtheta: vec![0.0; l],
            score: vec![0.0; l],
        }
    }
}

/// Pseudo-inverse of every random-effect covariance.
pub fn pseudo_inverses(d: &[DenseMatrix]) -> Result<Vec<DenseMatrix>, LinalgError> {
    d.iter().map(pseudo_inverse).collect()
}

/// Gaussian prior term `sum_k (1/2G) sum_g u_{k,g}' D_k^+ u_{k,g}`.
pub fn random_effect_penalty(u: &[DenseMatrix], d_pinv: &[DenseMatrix]) -> f64 {
    let mut total = 0.0;
    for (uk, dk) in u.iter().zip(d_pinv.iter()) {
        let n_groups = uk.nrows();
        if n_groups == 0 {
            continue;
        }
        let mut s = 0.0;
        for g in 0..n_groups {
            let row = uk.row(g);
            s += DenseMatrix::dot(&row, &dk.mat_vec(&row));
        }
        total += 0.5 * s / n_groups as f64;
    }
    total
}

impl<'a> Objective<'a> {
    fn n_obs(&self) -> usize {
        self.y.nrows()
    }

    fn n_outcomes(&self) -> usize {
        self.y.ncols()
    }

    fn n_params(&self) -> usize {
        self.offset.len()
    }

    /// `X_{k,j} beta_{k,j}` for every parameter, as `l` matrices of size `m x n`.
    pub fn fixed_predictor(&self, beta: &Grid<Vec<f64>>) -> Vec<DenseMatrix> {
        let (m, n) = (self.n_obs(), self.n_outcomes());
        (0..self.n_params())
            .map(|k| {
                let mut eta = DenseMatrix::zeros(m, n);
                for j in 0..n {
                    eta.set_col(j, &self.x.get(k, j).mat_vec(beta.get(k, j)));
                }
                eta
            })
            .collect()
    }

    /// Fixed predictor plus each row's group random effect.
    pub fn linear_predictor(&self, beta: &Grid<Vec<f64>>, u: &[DenseMatrix]) -> Vec<DenseMatrix> {
        let mut eta = self.fixed_predictor(beta);
        let n = self.n_outcomes();
        for (k, eta_k) in eta.iter_mut().enumerate() {
            for g in 0..self.groups.len() {
                for i in self.groups.rows(g) {
                    for j in 0..n {
                        eta_k.set(i, j, eta_k.get(i, j) + u[k].get(g, j));
                    }
                }
            }
        }
        eta
    }

    /// Distribution parameters, as `l` matrices of size `m x n`.
    pub fn params(&self, beta: &Grid<Vec<f64>>, u: &[DenseMatrix]) -> Vec<DenseMatrix> {
        let links = self.family.links();
        self.linear_predictor(beta, u)
            .into_iter()
            .enumerate()
            .map(|(k, eta)| {
                DenseMatrix::from_fn(eta.nrows(), eta.ncols(), |i, j| {
                    self.offset[k][i] * links[k].inv_link(eta.get(i, j))
                })
            })
            .collect()
    }

    /// Weighted negative log-likelihood of cell (i, j) divided by `m`, at `buf.eta`.
    ///
    /// With `grad`, `buf.score[k]` receives its derivative with respect to eta_k.
    fn cell(&self, i: usize, j: usize, buf: &mut CellBuffer, grad: bool) -> f64 {
        let w = self.weights.get(i, j);
        if w == 0.0 {
            buf.score.fill(0.0);
            return 0.0;
        }
        let links = self.family.links();
        for k in 0..buf.eta.len() {
            buf.theta[k] = self.offset[k][i] * links[k].inv_link(buf.eta[k]);
        }
        let y = self.y.get(i, j);
        let scale = w / self.n_obs() as f64;
        let value = scale * self.family.neg_log_likelihood(y, &buf.theta);
        if grad {
            self.family.gradient(y, &buf.theta, &mut buf.dtheta);
            for k in 0..buf.eta.len() {
                buf.score[k] =
                    scale * buf.dtheta[k] * self.offset[k][i] * links[k].inv_link_deriv(buf.eta[k]);
            }
        }
        value
    }

    /// Objective value.
    pub fn value(&self, beta: &Grid<Vec<f64>>, u: &[DenseMatrix], d_pinv: &[DenseMatrix]) -> f64 {
        let eta = self.linear_predictor(beta, u);
        let mut buf = CellBuffer::new(self.n_params());
        let mut total = 0.0;
        for i in 0..self.n_obs() {
            for j in 0..self.n_outcomes() {
                for k in 0..self.n_params() {
                    buf.eta[k] = eta[k].get(i, j);
                }
                total += self.cell(i, j, &mut buf, false);
            }
        }
        total + random_effect_penalty(u, d_pinv)
    }

    /// Objective value, with its gradient in beta written into `grad`.
    pub fn beta_value_grad(
        &self,
        beta: &Grid<Vec<f64>>,
        u: &[DenseMatrix],
        d_pinv: &[DenseMatrix],
        grad: &mut Grid<Vec<f64>>,
    ) -> f64 {
        let (m, n, l) = (self.n_obs(), self.n_outcomes(), self.n_params());
        let eta = self.linear_predictor(beta, u);
        let mut scores = vec![DenseMatrix::zeros(m, n); l];
        let mut buf = CellBuffer::new(l);
        let mut total = 0.0;
        for i in 0..m {
            for j in 0..n {
                for k in 0..l {
                    buf.eta[k] = eta[k].get(i, j);
                }
                total += self.cell(i, j, &mut buf, true);
                for k in 0..l {
                    scores[k].set(i, j, buf.score[k]);
                }
            }
        }
        for k in 0..l {
            for j in 0..n {
                *grad.get_mut(k, j) = self.x.get(k, j).t_mat_vec(&scores[k].col(j));
            }
        }
        total + random_effect_penalty(u, d_pinv)
    }

    /// Contribution of group `g` to the objective, as a function of its random effects.
    ///
    /// `u_g[k * n + j]` is the effect on parameter `k` of outcome `j`, and
    /// `fixed` comes from [`Objective::fixed_predictor`]. Summed over groups
    /// this equals [`Objective::value`].
    pub fn group_value_grad(
        &self,
        g: usize,
        fixed: &[DenseMatrix],
        u_g: &[f64],
        d_pinv: &[DenseMatrix],
        grad: &mut [f64],
    ) -> f64 {
        let (n, l) = (self.n_outcomes(), self.n_params());
        let n_groups = self.groups.len() as f64;
        grad.fill(0.0);
        let mut buf = CellBuffer::new(l);
        let mut total = 0.0;
        for i in self.groups.rows(g) {
            for j in 0..n {
                for k in 0..l {
                    buf.eta[k] = fixed[k].get(i, j) + u_g[k * n + j];
                }
                total += self.cell(i, j, &mut buf, true);
                for k in 0..l {
                    grad[k * n + j] += buf.score[k];
                }
            }
        }
        for k in 0..l {
            let uk = &u_g[k * n..(k + 1) * n];
            let du = d_pinv[k].mat_vec(uk);
            total += 0.5 * DenseMatrix::dot(uk, &du) / n_groups;
            for j in 0..n {
                grad[k * n + j] += du[j] / n_groups;
            }
        }
        total
    }
}
