//! The correlated count model and its inputs.

pub mod correlated;
pub mod error;
pub mod groups;
pub mod input;
mod predict;
mod summary;

pub use correlated::CorrelatedModel;
pub use error::ModelError;
pub use input::{ModelInput, ModelOptions, ParamUpdate, PredictInput};
