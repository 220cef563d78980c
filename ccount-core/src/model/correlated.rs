//! The correlated count model: data, design and fitted state.
//!
//! Rows are stored sorted by group id so every group is a contiguous block;
//! everything returned to the caller is put back into the caller's row order.

use anyhow::Result;
use tracing::info;

use ccount_linalg::decomposition::check_psd;
use ccount_linalg::DenseMatrix;

use super::error::ModelError;
use super::groups::Groups;
use super::input::{ModelInput, ModelOptions, ParamUpdate};
use crate::design::DesignTransform;
use crate::glmm::family::CountFamily;
use crate::glmm::fit::{self, FitConfig, FitReport};
use crate::glmm::objective::{pseudo_inverses, Objective};
use crate::util::grid::Grid;

/// Tolerance for accepting a user-supplied covariance as symmetric PSD.
pub const PSD_TOL: f64 = 1e-8;

/// Generalized linear mixed model for multivariate counts with random
/// effects correlated across outcomes.
#[derive(Debug)]
pub struct CorrelatedModel {
    family: Box<dyn CountFamily>,
    y: DenseMatrix,
    weights: DenseMatrix,
    offset: Vec<Vec<f64>>,
    x: Grid<DenseMatrix>,
    groups: Groups,
    design: DesignTransform,
    beta: Grid<Vec<f64>>,
    u: Vec<DenseMatrix>,
    d: Vec<DenseMatrix>,
    params: Vec<DenseMatrix>,
}

impl CorrelatedModel {
    /// Validate the input, build the designs and initialise the state:
    /// beta = 0, U = 0, D = I.
    pub fn new(family: Box<dyn CountFamily>, input: ModelInput, options: ModelOptions) -> Result<Self> {
        let ModelInput {
            y,
            x,
            group_id,
            offset,
            weights,
            splines,
        } = input;
        let (m, n, l) = (y.nrows(), y.ncols(), family.n_params());
        if m == 0 || n == 0 || l == 0 {
            return Err(ModelError::EmptyModel { m, n, l }.into());
        }
        if x.n_params() != l || x.n_outcomes() != n {
            return Err(ModelError::shape(
                "covariates",
                format!("{} x {}", l, n),
                format!("{} x {}", x.n_params(), x.n_outcomes()),
            )
            .into());
        }
        if !y.is_finite() {
            return Err(ModelError::NonFinite {
                what: "responses".into(),
            }
            .into());
        }
        if (0..n).any(|j| y.col(j).iter().any(|&v| v < 0.0)) {
            return Err(ModelError::Negative {
                what: "responses".into(),
            }
            .into());
        }

        let groups = match group_id {
            Some(ids) => {
                if ids.len() != m {
                    return Err(ModelError::shape("group ids", m, ids.len()).into());
                }
                Groups::new(&ids)
            }
            None => Groups::singletons(m),
        };
        let offset = check_offset(offset, l, m)?;
        let weights = match weights {
            Some(w) => {
                if w.nrows() != m || w.ncols() != n {
                    return Err(ModelError::shape(
                        "weights",
                        format!("{} x {}", m, n),
                        format!("{} x {}", w.nrows(), w.ncols()),
                    )
                    .into());
                }
                if !w.is_finite() {
                    return Err(ModelError::NonFinite {
                        what: "weights".into(),
                    }
                    .into());
                }
                if (0..n).any(|j| w.col(j).iter().any(|&v| v < 0.0)) {
                    return Err(ModelError::Negative {
                        what: "weights".into(),
                    }
                    .into());
                }
                w
            }
            None => DenseMatrix::full(m, n, 1.0),
        };

        let (design, designs) = DesignTransform::fit(
            &x,
            splines.as_ref(),
            m,
            options.add_intercepts,
            options.normalize_x,
        )?;

        let order = groups.order();
        let x = designs.map(|_, _, d| d.select_rows(order));
        let y = y.select_rows(order);
        let weights = weights.select_rows(order);
        let offset: Vec<Vec<f64>> = offset
            .iter()
            .map(|o| order.iter().map(|&i| o[i]).collect())
            .collect();

        let beta = x.map(|_, _, d| vec![0.0; d.ncols()]);
        let u = vec![DenseMatrix::zeros(groups.len(), n); l];
        let d = vec![DenseMatrix::identity(n); l];

        info!(
            "Built {} model: m={}, n={}, l={}, groups={}, coefficients={}",
            family.name(),
            m,
            n,
            l,
            groups.len(),
            beta.total_len()
        );

        let mut model = Self {
            family,
            y,
            weights,
            offset,
            x,
            groups,
            design,
            beta,
            u,
            d,
            params: Vec::new(),
        };
        model.params = model.objective().params(&model.beta, &model.u);
        Ok(model)
    }

    pub fn family(&self) -> &dyn CountFamily {
        self.family.as_ref()
    }

    /// Number of observations `m`.
    pub fn n_obs(&self) -> usize {
        self.y.nrows()
    }

    /// Number of outcomes `n`.
    pub fn n_outcomes(&self) -> usize {
        self.y.ncols()
    }

    /// Number of distribution parameters `l`.
    pub fn n_params(&self) -> usize {
        self.family.n_params()
    }

    /// Number of random-effect groups `G`.
    pub fn n_groups(&self) -> usize {
        self.groups.len()
    }

    /// Unique group ids, in the row order of each `U_k`.
    pub fn group_ids(&self) -> &[i64] {
        self.groups.ids()
    }

    pub fn group_sizes(&self) -> Vec<usize> {
        self.groups.sizes()
    }

    pub(crate) fn groups(&self) -> &Groups {
        &self.groups
    }

    pub fn design(&self) -> &DesignTransform {
        &self.design
    }

    /// Fixed effects on the normalised design.
    pub fn beta(&self) -> &Grid<Vec<f64>> {
        &self.beta
    }

    /// Random effects, `l` matrices of size `G x n`.
    pub fn u(&self) -> &[DenseMatrix] {
        &self.u
    }

    /// Random-effect covariances, `l` matrices of size `n x n`.
    pub fn d(&self) -> &[DenseMatrix] {
        &self.d
    }

    /// Current distribution parameters in the caller's row order.
    pub fn params(&self) -> Vec<DenseMatrix> {
        self.params.iter().map(|p| self.to_caller_order(p)).collect()
    }

    /// Objective evaluated on this model's (group-sorted) data.
    pub fn objective(&self) -> Objective<'_> {
        Objective {
            family: self.family.as_ref(),
            y: &self.y,
            weights: &self.weights,
            offset: &self.offset,
            x: &self.x,
            groups: &self.groups,
        }
    }

    /// Distribution parameters for the given effects, in the caller's row order.
    pub fn compute_params(&self, beta: &Grid<Vec<f64>>, u: &[DenseMatrix]) -> Result<Vec<DenseMatrix>> {
        self.check_beta(beta)?;
        self.check_u(u)?;
        Ok(self
            .objective()
            .params(beta, u)
            .iter()
            .map(|p| self.to_caller_order(p))
            .collect())
    }

    /// Overwrite any subset of the state.
    ///
    /// Parameters are recomputed from beta and U unless given explicitly
    /// (in the caller's row order).
    pub fn update_params(&mut self, update: ParamUpdate) -> Result<()> {
        if let Some(beta) = &update.beta {
            self.check_beta(beta)?;
        }
        if let Some(u) = &update.u {
            self.check_u(u)?;
        }
        if let Some(d) = &update.d {
            self.check_d(d)?;
        }
        let params = match &update.params {
            Some(params) => {
                self.check_stack("parameters", params, self.n_obs(), self.n_outcomes())?;
                Some(params.iter().map(|p| p.select_rows(self.groups.order())).collect())
            }
            None => None,
        };

        if let Some(beta) = update.beta {
            self.beta = beta;
        }
        if let Some(u) = update.u {
            self.u = u;
        }
        if let Some(d) = update.d {
            self.d = d;
        }
        self.params = match params {
            Some(p) => p,
            None => self.objective().params(&self.beta, &self.u),
        };
        Ok(())
    }

    /// Replace parts of the state from the optimiser and refresh the parameters.
    pub(crate) fn set_state(
        &mut self,
        beta: Option<Grid<Vec<f64>>>,
        u: Option<Vec<DenseMatrix>>,
        d: Option<Vec<DenseMatrix>>,
    ) {
        if let Some(beta) = beta {
            self.beta = beta;
        }
        if let Some(u) = u {
            self.u = u;
        }
        if let Some(d) = d {
            self.d = d;
        }
        self.params = self.objective().params(&self.beta, &self.u);
    }

    /// Objective at the current state.
    pub fn neg_log_likelihood(&self) -> Result<f64> {
        let d_pinv = pseudo_inverses(&self.d)?;
        Ok(self.objective().value(&self.beta, &self.u, &d_pinv))
    }

    /// Objective with any of beta, U and D replaced.
    pub fn neg_log_likelihood_at(
        &self,
        beta: Option<&Grid<Vec<f64>>>,
        u: Option<&[DenseMatrix]>,
        d: Option<&[DenseMatrix]>,
    ) -> Result<f64> {
        let beta = beta.unwrap_or(&self.beta);
        let u = u.unwrap_or(&self.u);
        let d = d.unwrap_or(&self.d);
        self.check_beta(beta)?;
        self.check_u(u)?;
        self.check_stack("D", d, self.n_outcomes(), self.n_outcomes())?;
        let d_pinv = pseudo_inverses(d)?;
        Ok(self.objective().value(beta, u, &d_pinv))
    }

    /// Fit beta, U and D by alternating optimisation.
    pub fn optimize_params(&mut self, config: &FitConfig) -> Result<FitReport> {
        fit::optimize(self, config)
    }

    /// Expected outcomes for the training rows, in the caller's row order.
    pub fn fitted_values(&self) -> DenseMatrix {
        let (m, n, l) = (self.n_obs(), self.n_outcomes(), self.n_params());
        let mut theta = vec![0.0; l];
        let sorted = DenseMatrix::from_fn(m, n, |i, j| {
            for (k, t) in theta.iter_mut().enumerate() {
                *t = self.params[k].get(i, j);
            }
            self.family.mean(&theta)
        });
        self.to_caller_order(&sorted)
    }

    fn to_caller_order(&self, sorted: &DenseMatrix) -> DenseMatrix {
        let mut inverse = vec![0; self.groups.n_obs()];
        for (pos, &row) in self.groups.order().iter().enumerate() {
            inverse[row] = pos;
        }
        sorted.select_rows(&inverse)
    }

    fn check_beta(&self, beta: &Grid<Vec<f64>>) -> Result<(), ModelError> {
        if beta.n_params() != self.n_params() || beta.n_outcomes() != self.n_outcomes() {
            return Err(ModelError::shape(
                "beta",
                format!("{} x {}", self.n_params(), self.n_outcomes()),
                format!("{} x {}", beta.n_params(), beta.n_outcomes()),
            ));
        }
        for ((k, j), b) in beta.iter() {
            let width = self.x.get(k, j).ncols();
            if b.len() != width {
                return Err(ModelError::shape(format!("beta ({}, {})", k, j), width, b.len()));
            }
            if b.iter().any(|v| !v.is_finite()) {
                return Err(ModelError::NonFinite {
                    what: format!("beta ({}, {})", k, j),
                });
            }
        }
        Ok(())
    }

    fn check_u(&self, u: &[DenseMatrix]) -> Result<(), ModelError> {
        self.check_stack("U", u, self.n_groups(), self.n_outcomes())
    }

    fn check_d(&self, d: &[DenseMatrix]) -> Result<(), ModelError> {
        self.check_stack("D", d, self.n_outcomes(), self.n_outcomes())?;
        for (k, dk) in d.iter().enumerate() {
            check_psd(dk, PSD_TOL).map_err(|source| ModelError::InvalidCovariance { k, source })?;
        }
        Ok(())
    }

    /// `l` finite matrices of the given shape.
    fn check_stack(&self, what: &str, mats: &[DenseMatrix], nrows: usize, ncols: usize) -> Result<(), ModelError> {
        if mats.len() != self.n_params() {
            return Err(ModelError::shape(what, self.n_params(), mats.len()));
        }
        for (k, mk) in mats.iter().enumerate() {
            if mk.nrows() != nrows || mk.ncols() != ncols {
                return Err(ModelError::shape(
                    format!("{} ({})", what, k),
                    format!("{} x {}", nrows, ncols),
                    format!("{} x {}", mk.nrows(), mk.ncols()),
                ));
            }
            if !mk.is_finite() {
                return Err(ModelError::NonFinite {
                    what: format!("{} ({})", what, k),
                });
            }
        }
        Ok(())
    }
}

/// Fill missing offsets with ones and check the rest.
pub(crate) fn check_offset(
    offset: Option<Vec<Option<Vec<f64>>>>,
    l: usize,
    m: usize,
) -> Result<Vec<Vec<f64>>, ModelError> {
    let offset = match offset {
        Some(o) => {
            if o.len() != l {
                return Err(ModelError::shape("offsets", l, o.len()));
            }
            o
        }
        None => vec![None; l],
    };
    offset
        .into_iter()
        .enumerate()
        .map(|(k, o)| match o {
            Some(v) => {
                if v.len() != m {
                    return Err(ModelError::shape(format!("offset ({})", k), m, v.len()));
                }
                if v.iter().any(|x| !x.is_finite()) {
                    return Err(ModelError::NonFinite {
                        what: format!("offset ({})", k),
                    });
                }
                Ok(v)
            }
            None => Ok(vec![1.0; m]),
        })
        .collect()
}
