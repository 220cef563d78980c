//! Design matrices for every (parameter, outcome) pair.
//!
//! A design is assembled as `[intercept | covariates | spline columns]` and
//! then centred and scaled column by column from the first covariate on.
//! The statistics and spline bases fitted on the training data are kept in
//! a [`DesignTransform`] so new data is mapped onto the same columns.

pub mod bspline;

pub use bspline::{BSpline, KnotsType, SplineSpec};

use ccount_linalg::DenseMatrix;

use crate::model::error::ModelError;
use crate::util::grid::Grid;
use crate::util::math::mean_std;

/// Columns whose standard deviation falls below this are left unscaled.
const CONSTANT_COLUMN_STD: f64 = 1e-12;

/// Per-column centring and scaling.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnScaling {
    pub mean: Vec<f64>,
    pub std: Vec<f64>,
}

impl ColumnScaling {
    /// Mean 0, scale 1 for every column.
    pub fn identity(ncols: usize) -> Self {
        Self {
            mean: vec![0.0; ncols],
            std: vec![1.0; ncols],
        }
    }

    /// Population mean and standard deviation of the columns from `first` on.
    ///
    /// Columns before `first`, constant columns, and all columns when
    /// `normalize` is false keep mean 0 and scale 1.
    pub fn fit(x: &DenseMatrix, first: usize, normalize: bool) -> Self {
        let mut scaling = Self::identity(x.ncols());
        if !normalize {
            return scaling;
        }
        for c in first..x.ncols() {
            let (mean, std) = mean_std(&x.col(c));
            if std > CONSTANT_COLUMN_STD * mean.abs().max(1.0) {
                scaling.mean[c] = mean;
                scaling.std[c] = std;
            }
        }
        scaling
    }

    pub fn apply(&self, x: &DenseMatrix) -> DenseMatrix {
        DenseMatrix::from_fn(x.nrows(), x.ncols(), |i, c| {
            (x.get(i, c) - self.mean[c]) / self.std[c]
        })
    }
}

/// Everything needed to rebuild the training design on new rows.
#[derive(Debug, Clone)]
pub struct DesignTransform {
    add_intercepts: bool,
    n_covariates: Grid<usize>,
    splines: Grid<Vec<BSpline>>,
    scaling: Grid<ColumnScaling>,
}

impl DesignTransform {
    /// Fit spline bases and column statistics, returning the transform and
    /// the normalised training designs.
    pub fn fit(
        x: &Grid<Option<DenseMatrix>>,
        splines: Option<&Grid<Vec<SplineSpec>>>,
        n_obs: usize,
        add_intercepts: bool,
        normalize: bool,
    ) -> Result<(Self, Grid<DenseMatrix>), ModelError> {
        let (l, n) = (x.n_params(), x.n_outcomes());
        if let Some(specs) = splines {
            check_grid_dims("spline specs", specs, l, n)?;
        }

        let splines_fitted = Grid::try_from_fn(l, n, |k, j| match splines {
            Some(specs) => specs
                .get(k, j)
                .iter()
                .map(|spec| {
                    if spec.values.len() != n_obs {
                        return Err(ModelError::shape(
                            format!("spline values ({}, {})", k, j),
                            n_obs,
                            spec.values.len(),
                        ));
                    }
                    BSpline::fit(spec)
                })
                .collect::<Result<Vec<_>, _>>(),
            None => Ok(Vec::new()),
        })?;

        let raw = Grid::try_from_fn(l, n, |k, j| {
            let values: Vec<&[f64]> = match splines {
                Some(specs) => specs.get(k, j).iter().map(|s| s.values.as_slice()).collect(),
                None => Vec::new(),
            };
            assemble(
                k,
                j,
                x.get(k, j).as_ref(),
                splines_fitted.get(k, j),
                &values,
                n_obs,
                add_intercepts,
            )
        })?;

        let first = usize::from(add_intercepts);
        let scaling = raw.map(|_, _, r| ColumnScaling::fit(r, first, normalize));
        let designs = raw.map(|k, j, r| scaling.get(k, j).apply(r));
        let n_covariates = x.map(|_, _, cell| cell.as_ref().map_or(0, |m| m.ncols()));

        Ok((
            Self {
                add_intercepts,
                n_covariates,
                splines: splines_fitted,
                scaling,
            },
            designs,
        ))
    }

    /// Build normalised designs for new rows with the training bases and statistics.
    pub fn apply(
        &self,
        x: &Grid<Option<DenseMatrix>>,
        spline_values: Option<&Grid<Vec<Vec<f64>>>>,
        n_obs: usize,
    ) -> Result<Grid<DenseMatrix>, ModelError> {
        let (l, n) = (self.scaling.n_params(), self.scaling.n_outcomes());
        check_grid_dims("covariates", x, l, n)?;
        if let Some(values) = spline_values {
            check_grid_dims("spline values", values, l, n)?;
        }

        Grid::try_from_fn(l, n, |k, j| {
            let given = x.get(k, j).as_ref().map_or(0, |m| m.ncols());
            if given != *self.n_covariates.get(k, j) {
                return Err(ModelError::shape(
                    format!("covariate columns ({}, {})", k, j),
                    self.n_covariates.get(k, j),
                    given,
                ));
            }
            let bases = self.splines.get(k, j);
            let values: Vec<&[f64]> = match spline_values {
                Some(v) => v.get(k, j).iter().map(|s| s.as_slice()).collect(),
                None => Vec::new(),
            };
            if values.len() != bases.len() {
                return Err(ModelError::shape(
                    format!("spline covariates ({}, {})", k, j),
                    bases.len(),
                    values.len(),
                ));
            }
            let raw = assemble(k, j, x.get(k, j).as_ref(), bases, &values, n_obs, self.add_intercepts)?;
            Ok(self.scaling.get(k, j).apply(&raw))
        })
    }

    pub fn add_intercepts(&self) -> bool {
        self.add_intercepts
    }

    /// Index of the first column that is not the intercept.
    pub fn first_covariate(&self) -> usize {
        usize::from(self.add_intercepts)
    }

    /// Number of user-supplied covariate columns of a cell.
    pub fn n_covariates(&self, k: usize, j: usize) -> usize {
        *self.n_covariates.get(k, j)
    }

    pub fn scaling(&self, k: usize, j: usize) -> &ColumnScaling {
        self.scaling.get(k, j)
    }

    pub fn splines(&self, k: usize, j: usize) -> &[BSpline] {
        self.splines.get(k, j)
    }
}

fn check_grid_dims<T>(what: &str, grid: &Grid<T>, l: usize, n: usize) -> Result<(), ModelError> {
    if grid.n_params() != l || grid.n_outcomes() != n {
        return Err(ModelError::shape(
            what,
            format!("{} x {}", l, n),
            format!("{} x {}", grid.n_params(), grid.n_outcomes()),
        ));
    }
    Ok(())
}

/// Raw design `[intercept | covariates | spline bases without their first column]`.
fn assemble(
    k: usize,
    j: usize,
    x: Option<&DenseMatrix>,
    bases: &[BSpline],
    values: &[&[f64]],
    n_obs: usize,
    add_intercept: bool,
) -> Result<DenseMatrix, ModelError> {
    if x.is_none() && !add_intercept {
        return Err(ModelError::MissingCovariates { k, j });
    }

    let mut blocks = Vec::new();
    if add_intercept {
        blocks.push(DenseMatrix::full(n_obs, 1, 1.0));
    }
    if let Some(x) = x {
        if x.nrows() != n_obs {
            return Err(ModelError::shape(
                format!("covariate rows ({}, {})", k, j),
                n_obs,
                x.nrows(),
            ));
        }
        if !x.is_finite() {
            return Err(ModelError::NonFinite {
                what: format!("covariates ({}, {})", k, j),
            });
        }
        blocks.push(x.clone());
    }
    for (basis, v) in bases.iter().zip(values.iter()) {
        if v.len() != n_obs {
            return Err(ModelError::shape(
                format!("spline values ({}, {})", k, j),
                n_obs,
                v.len(),
            ));
        }
        if v.iter().any(|x| !x.is_finite()) {
            return Err(ModelError::NonFinite {
                what: format!("spline values ({}, {})", k, j),
            });
        }
        let full = basis.design_mat(v);
        let cols: Vec<usize> = (1..full.ncols()).collect();
        blocks.push(select_cols(&full, &cols));
    }

    let width: usize = blocks.iter().map(|b| b.ncols()).sum();
    if width == 0 {
        return Err(ModelError::shape(format!("design columns ({}, {})", k, j), "at least 1", 0));
    }
    let refs: Vec<&DenseMatrix> = blocks.iter().collect();
    Ok(DenseMatrix::hstack(&refs))
}

fn select_cols(x: &DenseMatrix, cols: &[usize]) -> DenseMatrix {
    DenseMatrix::from_fn(x.nrows(), cols.len(), |i, c| x.get(i, cols[c]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_cell(x: Option<DenseMatrix>) -> Grid<Option<DenseMatrix>> {
        Grid::from_rows(vec![vec![x]]).unwrap()
    }

    #[test]
    fn test_intercept_is_prepended_and_not_scaled() {
        let x = one_cell(Some(DenseMatrix::column(&[1.0, 2.0, 3.0, 6.0])));
        let (transform, designs) = DesignTransform::fit(&x, None, 4, true, true).unwrap();
        let d = designs.get(0, 0);
        assert_eq!(d.ncols(), 2);
        assert_eq!(d.col(0), vec![1.0; 4]);
        let (mean, std) = mean_std(&d.col(1));
        assert!(mean.abs() < 1e-12);
        assert!((std - 1.0).abs() < 1e-12);
        assert_eq!(transform.first_covariate(), 1);
        assert_eq!(transform.n_covariates(0, 0), 1);
    }

    #[test]
    fn test_missing_design_becomes_intercept() {
        let x = one_cell(None);
        let (_, designs) = DesignTransform::fit(&x, None, 3, true, true).unwrap();
        assert_eq!(designs.get(0, 0).ncols(), 1);
    }

    #[test]
    fn test_missing_design_without_intercept_is_an_error() {
        let x = one_cell(None);
        let err = DesignTransform::fit(&x, None, 3, false, true).unwrap_err();
        assert!(matches!(err, ModelError::MissingCovariates { k: 0, j: 0 }));
    }

    #[test]
    fn test_zero_width_design_without_intercept_is_an_error() {
        let x = one_cell(Some(DenseMatrix::zeros(3, 0)));
        let err = DesignTransform::fit(&x, None, 3, false, true).unwrap_err();
        assert!(matches!(err, ModelError::ShapeMismatch { .. }));

        let (_, designs) = DesignTransform::fit(&x, None, 3, true, true).unwrap();
        assert_eq!(designs.get(0, 0).ncols(), 1);
    }

    #[test]
    fn test_constant_column_keeps_unit_scale() {
        let x = one_cell(Some(DenseMatrix::full(5, 1, 1.0)));
        let (transform, designs) = DesignTransform::fit(&x, None, 5, false, true).unwrap();
        assert_eq!(designs.get(0, 0).col(0), vec![1.0; 5]);
        assert_eq!(transform.scaling(0, 0), &ColumnScaling::identity(1));
    }

    #[test]
    fn test_no_normalisation() {
        let x = one_cell(Some(DenseMatrix::column(&[1.0, 2.0, 3.0])));
        let (_, designs) = DesignTransform::fit(&x, None, 3, false, false).unwrap();
        assert_eq!(designs.get(0, 0).col(0), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_spline_columns_are_appended() {
        let values: Vec<f64> = (0..40).map(|i| i as f64 / 4.0).collect();
        let spec = SplineSpec::new(values.clone(), 4);
        let specs = Grid::from_fn(1, 1, |_, _| vec![spec.clone()]);
        let x = one_cell(Some(DenseMatrix::column(&values)));
        let (transform, designs) = DesignTransform::fit(&x, Some(&specs), 40, true, true).unwrap();
        // intercept + covariate + (4 - 1 + 3) - 1 spline columns
        assert_eq!(designs.get(0, 0).ncols(), 1 + 1 + 5);

        // replaying on the training rows reproduces the training design
        let replay = transform
            .apply(&x, Some(&Grid::from_fn(1, 1, |_, _| vec![values.clone()])), 40)
            .unwrap();
        let a = designs.get(0, 0);
        let b = replay.get(0, 0);
        for i in 0..a.nrows() {
            for c in 0..a.ncols() {
                assert!((a.get(i, c) - b.get(i, c)).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_apply_checks_covariate_width() {
        let x = one_cell(Some(DenseMatrix::column(&[1.0, 2.0, 3.0])));
        let (transform, _) = DesignTransform::fit(&x, None, 3, true, true).unwrap();
        let wide = one_cell(Some(DenseMatrix::zeros(2, 2)));
        assert!(matches!(
            transform.apply(&wide, None, 2),
            Err(ModelError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_rejects_row_mismatch() {
        let x = one_cell(Some(DenseMatrix::column(&[1.0, 2.0])));
        assert!(DesignTransform::fit(&x, None, 3, true, true).is_err());
    }
}
