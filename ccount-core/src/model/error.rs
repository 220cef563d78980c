//! Input validation errors.

use ccount_linalg::LinalgError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Model needs at least one observation, outcome and parameter (m={m}, n={n}, l={l})")]
    EmptyModel { m: usize, n: usize, l: usize },

    #[error("No covariates for parameter {k}, outcome {j} and intercepts are disabled")]
    MissingCovariates { k: usize, j: usize },

    #[error("Shape mismatch for {what}: expected {expected}, got {got}")]
    ShapeMismatch {
        what: String,
        expected: String,
        got: String,
    },

    #[error("Non-finite values in {what}")]
    NonFinite { what: String },

    #[error("Negative values in {what}")]
    Negative { what: String },

    #[error("Invalid spline: {0}")]
    InvalidSpline(String),

    #[error("Invalid random-effect covariance for parameter {k}: {source}")]
    InvalidCovariance {
        k: usize,
        #[source]
        source: LinalgError,
    },

    #[error("Nothing to optimize: beta, u and d updates are all disabled")]
    NothingToOptimize,
}

impl ModelError {
    pub(crate) fn shape(
        what: impl Into<String>,
        expected: impl std::fmt::Display,
        got: impl std::fmt::Display,
    ) -> Self {
        ModelError::ShapeMismatch {
            what: what.into(),
            expected: expected.to_string(),
            got: got.to_string(),
        }
    }
}
