//! ccount-linalg: Linear algebra for correlated count models
//!
//! Provides the dense matrix wrapper, symmetric eigen-based helpers for
//! random-effects covariances, and the argmin-backed L-BFGS wrapper used to fit
//! fixed and random effects.

pub mod dense;
pub mod decomposition;
pub mod optimizer;

pub use decomposition::LinalgError;
pub use dense::DenseMatrix;
pub use optimizer::{LbfgsResult, LbfgsSolver};
