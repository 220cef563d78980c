//! Simulation of correlated count data.
//!
//! Draws group random effects `U_k[g,:] ~ N(0, D_k)` through the symmetric
//! square root of `D_k` (so singular covariances are fine), builds the
//! distribution parameters exactly as the model does, and samples each
//! count from the family.

use anyhow::Result;
use rand::Rng;
use rand_distr::StandardNormal;
use tracing::debug;

use ccount_linalg::decomposition::{check_psd, psd_sqrt};
use ccount_linalg::DenseMatrix;

use crate::glmm::family::FamilyKind;
use crate::glmm::link::Link;
use crate::model::correlated::{check_offset, PSD_TOL};
use crate::model::error::ModelError;
use crate::model::groups::Groups;
use crate::util::grid::Grid;

/// A data-generating process.
#[derive(Debug, Clone)]
pub struct Simulation {
    pub family: FamilyKind,
    /// Design per (parameter, outcome), all with the same number of rows.
    pub x: Grid<DenseMatrix>,
    pub beta: Grid<Vec<f64>>,
    /// Random-effect covariance per parameter, `n x n`.
    pub d: Vec<DenseMatrix>,
    pub group_id: Option<Vec<i64>>,
    pub offset: Option<Vec<Option<Vec<f64>>>>,
}

/// One simulated data set.
#[derive(Debug, Clone)]
pub struct SimulatedData {
    /// `m x n` counts.
    pub y: DenseMatrix,
    /// Random effects, `l` matrices `G x n`, rows in ascending group id.
    pub u: Vec<DenseMatrix>,
    /// Distribution parameters, `l` matrices `m x n`.
    pub params: Vec<DenseMatrix>,
    /// Unique group ids, in the row order of `u`.
    pub group_ids: Vec<i64>,
}

impl Simulation {
    pub fn new(family: FamilyKind, x: Grid<DenseMatrix>, beta: Grid<Vec<f64>>, d: Vec<DenseMatrix>) -> Self {
        Self {
            family,
            x,
            beta,
            d,
            group_id: None,
            offset: None,
        }
    }

    pub fn with_groups(mut self, group_id: Vec<i64>) -> Self {
        self.group_id = Some(group_id);
        self
    }

    pub fn with_offset(mut self, offset: Vec<Option<Vec<f64>>>) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Number of observations.
    pub fn n_obs(&self) -> usize {
        self.x.cells().first().map_or(0, |x| x.nrows())
    }

    fn validate(&self, l: usize) -> Result<(), ModelError> {
        let (m, n) = (self.n_obs(), self.x.n_outcomes());
        if self.x.n_params() != l || self.beta.n_params() != l || self.beta.n_outcomes() != n {
            return Err(ModelError::shape(
                "simulation grids",
                format!("{} x {}", l, n),
                format!(
                    "x {} x {}, beta {} x {}",
                    self.x.n_params(),
                    n,
                    self.beta.n_params(),
                    self.beta.n_outcomes()
                ),
            ));
        }
        for ((k, j), x) in self.x.iter() {
            if x.nrows() != m {
                return Err(ModelError::shape(format!("design rows ({}, {})", k, j), m, x.nrows()));
            }
            let b = self.beta.get(k, j);
            if b.len() != x.ncols() {
                return Err(ModelError::shape(format!("beta ({}, {})", k, j), x.ncols(), b.len()));
            }
        }
        if self.d.len() != l {
            return Err(ModelError::shape("D", l, self.d.len()));
        }
        for (k, dk) in self.d.iter().enumerate() {
            if dk.nrows() != n || dk.ncols() != n {
                return Err(ModelError::shape(
                    format!("D ({})", k),
                    format!("{} x {}", n, n),
                    format!("{} x {}", dk.nrows(), dk.ncols()),
                ));
            }
            check_psd(dk, PSD_TOL).map_err(|source| ModelError::InvalidCovariance { k, source })?;
        }
        if let Some(ids) = &self.group_id {
            if ids.len() != m {
                return Err(ModelError::shape("group ids", m, ids.len()));
            }
        }
        Ok(())
    }

    /// Draw random effects and counts.
    pub fn simulate<R: Rng>(&self, rng: &mut R) -> Result<SimulatedData> {
        let family = self.family.build();
        let l = family.n_params();
        self.validate(l)?;
        let (m, n) = (self.n_obs(), self.x.n_outcomes());
        let offset = check_offset(self.offset.clone(), l, m)?;
        let groups = match &self.group_id {
            Some(ids) => Groups::new(ids),
            None => Groups::singletons(m),
        };
        let n_groups = groups.len();
        debug!(
            "Simulating {}: m={}, n={}, groups={}",
            family.name(),
            m,
            n,
            n_groups
        );

        let mut u = Vec::with_capacity(l);
        for dk in &self.d {
            let root = psd_sqrt(dk)?;
            let mut uk = DenseMatrix::zeros(n_groups, n);
            for g in 0..n_groups {
                let z: Vec<f64> = (0..n).map(|_| rng.sample(StandardNormal)).collect();
                uk.set_row(g, &root.mat_vec(&z));
            }
            u.push(uk);
        }

        let row_group: Vec<usize> = match &self.group_id {
            Some(ids) => ids
                .iter()
                .map(|&id| groups.position(id).unwrap_or_default())
                .collect(),
            None => (0..m).collect(),
        };

        let links = family.links();
        let params: Vec<DenseMatrix> = (0..l)
            .map(|k| {
                let mut theta = DenseMatrix::zeros(m, n);
                for j in 0..n {
                    let fixed = self.x.get(k, j).mat_vec(self.beta.get(k, j));
                    for (i, eta) in fixed.into_iter().enumerate() {
                        let eta = eta + u[k].get(row_group[i], j);
                        theta.set(i, j, offset[k][i] * links[k].inv_link(eta));
                    }
                }
                theta
            })
            .collect();

        let mut y = DenseMatrix::zeros(m, n);
        let mut theta = vec![0.0; l];
        for i in 0..m {
            for j in 0..n {
                for (k, t) in theta.iter_mut().enumerate() {
                    *t = params[k].get(i, j);
                }
                y.set(i, j, family.sample(&theta, rng));
            }
        }

        Ok(SimulatedData {
            y,
            u,
            params,
            group_ids: groups.ids().to_vec(),
        })
    }
}
