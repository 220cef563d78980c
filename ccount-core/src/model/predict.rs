//! Prediction for new observations.

use anyhow::Result;
use tracing::debug;

use ccount_linalg::DenseMatrix;

use super::correlated::{check_offset, CorrelatedModel};
use super::error::ModelError;
use super::input::PredictInput;
use crate::glmm::link::Link;

impl CorrelatedModel {
    /// Distribution parameters for new rows, `l` matrices of size `m' x n`, in input order.
    ///
    /// Designs are rebuilt with the training intercepts, spline bases and
    /// column statistics. Rows whose group was seen in training get that
    /// group's random effects; other rows get none. Without group ids row
    /// `i` is taken to belong to group `i`.
    pub fn predict_params(&self, input: &PredictInput) -> Result<Vec<DenseMatrix>> {
        let (m, n, l) = (input.n_obs, self.n_outcomes(), self.n_params());
        let designs = self
            .design()
            .apply(&input.x, input.spline_values.as_ref(), m)?;

        let group_id: Vec<i64> = match &input.group_id {
            Some(ids) => {
                if ids.len() != m {
                    return Err(ModelError::shape("group ids", m, ids.len()).into());
                }
                ids.clone()
            }
            None => (0..m as i64).collect(),
        };
        let offset = check_offset(input.offset.clone(), l, m)?;

        let row_group: Vec<Option<usize>> = group_id
            .iter()
            .map(|&id| self.groups().position(id))
            .collect();
        let unseen = row_group.iter().filter(|g| g.is_none()).count();
        if unseen > 0 {
            debug!("{} of {} rows belong to groups without random effects", unseen, m);
        }

        let links = self.family().links();
        let params = (0..l)
            .map(|k| {
                let mut theta = DenseMatrix::zeros(m, n);
                for j in 0..n {
                    let fixed = designs.get(k, j).mat_vec(self.beta().get(k, j));
                    for (i, eta) in fixed.into_iter().enumerate() {
                        let re = row_group[i].map_or(0.0, |g| self.u()[k].get(g, j));
                        theta.set(i, j, offset[k][i] * links[k].inv_link(eta + re));
                    }
                }
                theta
            })
            .collect();
        Ok(params)
    }

    /// Expected outcomes for new rows, `m' x n`, in input order.
    pub fn predict(&self, input: &PredictInput) -> Result<DenseMatrix> {
        let params = self.predict_params(input)?;
        let mut theta = vec![0.0; params.len()];
        Ok(DenseMatrix::from_fn(input.n_obs, self.n_outcomes(), |i, j| {
            for (k, t) in theta.iter_mut().enumerate() {
                *t = params[k].get(i, j);
            }
            self.family().mean(&theta)
        }))
    }
}

#[cfg(test)]
mod tests {
    use crate::glmm::family::FamilyKind;
    use crate::model::input::{ModelInput, ModelOptions, ParamUpdate, PredictInput};
    use crate::model::CorrelatedModel;
    use crate::util::grid::Grid;
    use ccount_linalg::DenseMatrix;

    fn model() -> CorrelatedModel {
        let m = 6;
        let y = DenseMatrix::from_fn(m, 1, |i, _| i as f64);
        let x = Grid::from_fn(1, 1, |_, _| Some(DenseMatrix::column(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0])));
        let input = ModelInput::new(y, x).with_groups(vec![10, 10, 20, 20, 30, 30]);
        let options = ModelOptions {
            add_intercepts: true,
            normalize_x: true,
        };
        let mut model = CorrelatedModel::new(FamilyKind::Poisson.build(), input, options).unwrap();
        model
            .update_params(ParamUpdate {
                beta: Some(Grid::from_fn(1, 1, |_, _| vec![0.2, 0.5])),
                u: Some(vec![DenseMatrix::column(&[0.1, -0.3, 0.7])]),
                ..Default::default()
            })
            .unwrap();
        model
    }

    #[test]
    fn test_predict_on_training_rows_matches_fitted() {
        let model = model();
        let x = Grid::from_fn(1, 1, |_, _| Some(DenseMatrix::column(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0])));
        let input = PredictInput::new(6, x).with_groups(vec![10, 10, 20, 20, 30, 30]);
        let predicted = model.predict(&input).unwrap();
        let fitted = model.fitted_values();
        for i in 0..6 {
            assert!((predicted.get(i, 0) - fitted.get(i, 0)).abs() < 1e-12);
        }
    }

    #[test]
    fn test_unseen_groups_get_no_random_effect() {
        let model = model();
        let x = Grid::from_fn(1, 1, |_, _| Some(DenseMatrix::column(&[2.5, 2.5, 2.5])));
        let input = PredictInput::new(3, x).with_groups(vec![30, 99, 10]);
        let p = model.predict(&input).unwrap();
        // covariate 2.5 is the training mean, so the fixed part is the intercept
        assert!((p.get(0, 0) - (0.2_f64 + 0.7).exp()).abs() < 1e-12);
        assert!((p.get(1, 0) - 0.2_f64.exp()).abs() < 1e-12);
        assert!((p.get(2, 0) - (0.2_f64 + 0.1).exp()).abs() < 1e-12);
    }

    #[test]
    fn test_offsets_scale_predictions() {
        let model = model();
        let x = Grid::from_fn(1, 1, |_, _| Some(DenseMatrix::column(&[2.5, 2.5])));
        let input = PredictInput::new(2, x)
            .with_groups(vec![99, 99])
            .with_offset(vec![Some(vec![1.0, 3.0])]);
        let p = model.predict(&input).unwrap();
        assert!((p.get(1, 0) - 3.0 * p.get(0, 0)).abs() < 1e-12);
    }

    #[test]
    fn test_rejects_mismatched_design() {
        let model = model();
        let x = Grid::from_fn(1, 1, |_, _| Some(DenseMatrix::zeros(3, 2)));
        assert!(model.predict(&PredictInput::new(3, x)).is_err());

        let x = Grid::from_fn(1, 1, |_, _| Some(DenseMatrix::zeros(3, 1)));
        let input = PredictInput::new(3, x).with_groups(vec![1, 2]);
        assert!(model.predict(&input).is_err());
    }
}
