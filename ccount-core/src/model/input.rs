//! Inputs to model construction, parameter updates and prediction.

use ccount_linalg::DenseMatrix;

use crate::design::SplineSpec;
use crate::util::grid::Grid;

/// Training data for a correlated count model.
#[derive(Debug, Clone)]
pub struct ModelInput {
    /// `m x n` counts.
    pub y: DenseMatrix,
    /// Covariates per (parameter, outcome); `None` means intercept only.
    pub x: Grid<Option<DenseMatrix>>,
    /// Group of each observation; defaults to one group per observation.
    pub group_id: Option<Vec<i64>>,
    /// Multiplicative offset per parameter, applied after the inverse link.
    pub offset: Option<Vec<Option<Vec<f64>>>>,
    /// `m x n` weights on the negative log-likelihood.
    pub weights: Option<DenseMatrix>,
    /// Covariates to expand in B-spline bases, per (parameter, outcome).
    pub splines: Option<Grid<Vec<SplineSpec>>>,
}

impl ModelInput {
    pub fn new(y: DenseMatrix, x: Grid<Option<DenseMatrix>>) -> Self {
        Self {
            y,
            x,
            group_id: None,
            offset: None,
            weights: None,
            splines: None,
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

    pub fn with_weights(mut self, weights: DenseMatrix) -> Self {
        self.weights = Some(weights);
        self
    }

    pub fn with_splines(mut self, splines: Grid<Vec<SplineSpec>>) -> Self {
        self.splines = Some(splines);
        self
    }
}

/// Design options.
#[derive(Debug, Clone, Copy)]
pub struct ModelOptions {
    /// Prepend a column of ones to every design.
    pub add_intercepts: bool,
    /// Centre and scale the non-intercept columns.
    pub normalize_x: bool,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            add_intercepts: false,
            normalize_x: true,
        }
    }
}

/// New rows to predict for.
#[derive(Debug, Clone)]
pub struct PredictInput {
    pub n_obs: usize,
    /// Raw covariates with the same columns as in training.
    pub x: Grid<Option<DenseMatrix>>,
    /// Values of the spline covariates, in the order of the training specs.
    pub spline_values: Option<Grid<Vec<Vec<f64>>>>,
    /// Groups of the new rows; unseen groups get no random effect.
    pub group_id: Option<Vec<i64>>,
    pub offset: Option<Vec<Option<Vec<f64>>>>,
}

impl PredictInput {
    pub fn new(n_obs: usize, x: Grid<Option<DenseMatrix>>) -> Self {
        Self {
            n_obs,
            x,
            spline_values: None,
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

    pub fn with_spline_values(mut self, values: Grid<Vec<Vec<f64>>>) -> Self {
        self.spline_values = Some(values);
        self
    }
}

/// A partial overwrite of the model state. Unset fields are left alone.
#[derive(Debug, Clone, Default)]
pub struct ParamUpdate {
    pub beta: Option<Grid<Vec<f64>>>,
    /// `l` matrices of size `G x n`.
    pub u: Option<Vec<DenseMatrix>>,
    /// `l` matrices of size `n x n`.
    pub d: Option<Vec<DenseMatrix>>,
    /// `l` matrices of size `m x n`; recomputed from beta and u when unset.
    pub params: Option<Vec<DenseMatrix>>,
}
