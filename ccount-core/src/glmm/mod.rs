//! Generalized linear mixed model machinery.
//!
//! - Count families and link functions
//! - Penalized objective with analytic gradients
//! - Alternating beta / U / D optimisation

pub mod family;
pub mod fit;
pub mod link;
pub mod objective;
