//! ccount-core: Correlated count regression
//!
//! Fits generalized linear mixed models to multivariate count outcomes.
//! Every distribution parameter of every outcome has its own linear
//! predictor, and per-group random effects are correlated across the
//! outcomes through a covariance matrix per parameter.

pub mod design;
pub mod glmm;
pub mod model;
pub mod simulate;
pub mod util;

pub use design::{KnotsType, SplineSpec};
pub use glmm::family::{CountFamily, FamilyKind};
pub use glmm::fit::{FitConfig, FitReport};
pub use glmm::link::{Link, LinkKind};
pub use model::{CorrelatedModel, ModelError, ModelInput, ModelOptions, ParamUpdate, PredictInput};
pub use simulate::{SimulatedData, Simulation};
pub use util::grid::Grid;
