//! Link functions for the distribution parameters.
//!
//! Maps between the linear predictor (eta) and a parameter's natural scale.
//! The model only ever needs the inverse direction and its derivative; the
//! forward link is used to build starting values and in tests.

use crate::util::math::expit;

/// Which link a parameter uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    /// exp(eta): positive rates, means and dispersions.
    Log,
    /// 1 / (1 + exp(-eta)): probabilities.
    Logit,
    /// eta unchanged.
    Identity,
}

/// Link function interface.
pub trait Link {
    /// Apply the link function: eta = g(theta).
    fn link(&self, theta: f64) -> f64;
    /// Apply the inverse link: theta = g^{-1}(eta).
    fn inv_link(&self, eta: f64) -> f64;
    /// Derivative of the inverse link: d(theta)/d(eta).
    fn inv_link_deriv(&self, eta: f64) -> f64;
}

/// Log link for positive parameters.
#[derive(Debug, Clone, Copy)]
pub struct LogLink;

impl Link for LogLink {
    fn link(&self, theta: f64) -> f64 {
        theta.ln()
    }

    fn inv_link(&self, eta: f64) -> f64 {
        eta.exp()
    }

    fn inv_link_deriv(&self, eta: f64) -> f64 {
        eta.exp()
    }
}

/// Logit link for probabilities.
#[derive(Debug, Clone, Copy)]
pub struct LogitLink;

impl Link for LogitLink {
    fn link(&self, theta: f64) -> f64 {
        (theta / (1.0 - theta)).ln()
    }

    fn inv_link(&self, eta: f64) -> f64 {
        expit(eta)
    }

    fn inv_link_deriv(&self, eta: f64) -> f64 {
        let p = expit(eta);
        p * (1.0 - p)
    }
}

/// Identity link.
#[derive(Debug, Clone, Copy)]
pub struct IdentityLink;

impl Link for IdentityLink {
    fn link(&self, theta: f64) -> f64 {
        theta
    }

    fn inv_link(&self, eta: f64) -> f64 {
        eta
    }

    fn inv_link_deriv(&self, _eta: f64) -> f64 {
        1.0
    }
}

impl LinkKind {
    /// Get the link implementation for this kind.
    pub fn get(self) -> &'static (dyn Link + Send + Sync) {
        match self {
            LinkKind::Log => &LogLink,
            LinkKind::Logit => &LogitLink,
            LinkKind::Identity => &IdentityLink,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            LinkKind::Log => "log",
            LinkKind::Logit => "logit",
            LinkKind::Identity => "identity",
        }
    }
}

impl Link for LinkKind {
    fn link(&self, theta: f64) -> f64 {
        self.get().link(theta)
    }

    fn inv_link(&self, eta: f64) -> f64 {
        self.get().inv_link(eta)
    }

    fn inv_link_deriv(&self, eta: f64) -> f64 {
        self.get().inv_link_deriv(eta)
    }
}
