//! Count distributions for the correlated model.
//!
//! A family fixes the number of distribution parameters `l`, the link of
//! each parameter, and the per-cell negative log-likelihood with its
//! gradient with respect to the parameters on their natural scale. The
//! chain rule through the links and offsets lives in the objective.

use rand::RngCore;
use rand_distr::{Distribution, Gamma, Poisson as PoissonSampler};
use statrs::function::gamma::{digamma, ln_gamma};

use super::link::LinkKind;
use crate::util::math::{clamp_prob, log1m_plus, log1mexp, RATE_EPS};

/// A count distribution with `l` parameters.
///
/// Implementations must be cheap to call: the objective evaluates them for
/// every observation and outcome on every optimizer step.
pub trait CountFamily: Send + Sync + std::fmt::Debug {
    /// Human-readable family name.
    fn name(&self) -> &'static str;

    /// Names of the distribution parameters, in order.
    fn parameter_names(&self) -> &'static [&'static str];

    /// Link of each parameter; its length is `l`.
    fn links(&self) -> &'static [LinkKind];

    /// Number of distribution parameters.
    fn n_params(&self) -> usize {
        self.links().len()
    }

    /// Negative log-likelihood of a single count given the parameters.
    fn neg_log_likelihood(&self, y: f64, theta: &[f64]) -> f64;

    /// Gradient of `neg_log_likelihood` with respect to `theta`, written into `grad`.
    fn gradient(&self, y: f64, theta: &[f64], grad: &mut [f64]);

    /// Expected count given the parameters.
    fn mean(&self, theta: &[f64]) -> f64;

    /// Draw a count given the parameters.
    fn sample(&self, theta: &[f64], rng: &mut dyn RngCore) -> f64;
}

/// Built-in families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FamilyKind {
    Poisson,
    ZeroInflatedPoisson,
    HurdlePoisson,
    NegativeBinomial,
}

impl FamilyKind {
    /// Get the family implementation for this kind.
    pub fn build(self) -> Box<dyn CountFamily> {
        match self {
            FamilyKind::Poisson => Box::new(Poisson),
            FamilyKind::ZeroInflatedPoisson => Box::new(ZeroInflatedPoisson),
            FamilyKind::HurdlePoisson => Box::new(HurdlePoisson),
            FamilyKind::NegativeBinomial => Box::new(NegativeBinomial),
        }
    }

    /// Parse names such as `poisson`, `zip`, `hurdle-poisson`, `negbin`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().replace(['_', ' '], "-").as_str() {
            "poisson" => Some(FamilyKind::Poisson),
            "zip" | "zero-inflated-poisson" => Some(FamilyKind::ZeroInflatedPoisson),
            "hurdle" | "hurdle-poisson" => Some(FamilyKind::HurdlePoisson),
            "nb" | "negbin" | "negative-binomial" => Some(FamilyKind::NegativeBinomial),
            _ => None,
        }
    }
}

fn poisson_nll(y: f64, lambda: f64) -> f64 {
    let lambda = lambda.max(RATE_EPS);
    lambda - y * lambda.ln() + ln_gamma(y + 1.0)
}

fn sample_poisson(lambda: f64, rng: &mut dyn RngCore) -> f64 {
    match PoissonSampler::new(lambda) {
        Ok(dist) => dist.sample(rng),
        Err(_) => 0.0,
    }
}

fn sample_bernoulli(p: f64, rng: &mut dyn RngCore) -> bool {
    use rand::Rng;
    rng.gen::<f64>() < p
}

/// Draw from a Poisson conditioned on being positive.
fn sample_zero_truncated_poisson(lambda: f64, rng: &mut dyn RngCore) -> f64 {
    use rand::Rng;
    if lambda > 1.0 {
        // acceptance probability 1 - exp(-lambda) > 0.63
        loop {
            let y = sample_poisson(lambda, rng);
            if y > 0.0 {
                return y;
            }
        }
    }
    // inversion on P(Y = k | Y > 0) = lambda^k / (k! * expm1(lambda))
    let u: f64 = rng.gen();
    let mut k = 1.0;
    let mut pk = lambda.max(RATE_EPS) / lambda.max(RATE_EPS).exp_m1();
    let mut cdf = pk;
    while cdf < u && k < 1000.0 {
        pk *= lambda / (k + 1.0);
        k += 1.0;
        cdf += pk;
    }
    k
}

/// Poisson counts, one parameter: the rate.
#[derive(Debug, Clone, Copy, Default)]
pub struct Poisson;

impl CountFamily for Poisson {
    fn name(&self) -> &'static str {
        "poisson"
    }

    fn parameter_names(&self) -> &'static [&'static str] {
        &["mean"]
    }

    fn links(&self) -> &'static [LinkKind] {
        &[LinkKind::Log]
    }

    fn neg_log_likelihood(&self, y: f64, theta: &[f64]) -> f64 {
        poisson_nll(y, theta[0])
    }

    fn gradient(&self, y: f64, theta: &[f64], grad: &mut [f64]) {
        grad[0] = 1.0 - y / theta[0].max(RATE_EPS);
    }

    fn mean(&self, theta: &[f64]) -> f64 {
        theta[0]
    }

    fn sample(&self, theta: &[f64], rng: &mut dyn RngCore) -> f64 {
        sample_poisson(theta[0], rng)
    }
}

/// Zero-inflated Poisson: a structural zero with probability `p`,
/// otherwise a Poisson draw with rate `lambda`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZeroInflatedPoisson;

impl CountFamily for ZeroInflatedPoisson {
    fn name(&self) -> &'static str {
        "zero-inflated poisson"
    }

    fn parameter_names(&self) -> &'static [&'static str] {
        &["p", "mean"]
    }

    fn links(&self) -> &'static [LinkKind] {
        &[LinkKind::Logit, LinkKind::Log]
    }

    fn neg_log_likelihood(&self, y: f64, theta: &[f64]) -> f64 {
        let p = clamp_prob(theta[0]);
        let lambda = theta[1].max(RATE_EPS);
        if y == 0.0 {
            -(p + (1.0 - p) * (-lambda).exp()).ln()
        } else {
            -(1.0 - p).ln() + poisson_nll(y, lambda)
        }
    }

    fn gradient(&self, y: f64, theta: &[f64], grad: &mut [f64]) {
        let p = clamp_prob(theta[0]);
        let lambda = theta[1].max(RATE_EPS);
        if y == 0.0 {
            let e = (-lambda).exp();
            let lik = p + (1.0 - p) * e;
            grad[0] = -(1.0 - e) / lik;
            grad[1] = (1.0 - p) * e / lik;
        } else {
            grad[0] = 1.0 / (1.0 - p);
            grad[1] = 1.0 - y / lambda;
        }
    }

    fn mean(&self, theta: &[f64]) -> f64 {
        (1.0 - theta[0]) * theta[1]
    }

    fn sample(&self, theta: &[f64], rng: &mut dyn RngCore) -> f64 {
        if sample_bernoulli(theta[0], rng) {
            0.0
        } else {
            sample_poisson(theta[1], rng)
        }
    }
}

/// Hurdle Poisson: zero with probability `p`, otherwise a zero-truncated
/// Poisson draw with rate `lambda`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HurdlePoisson;

impl CountFamily for HurdlePoisson {
    fn name(&self) -> &'static str {
        "hurdle poisson"
    }

    fn parameter_names(&self) -> &'static [&'static str] {
        &["p", "mean"]
    }

    fn links(&self) -> &'static [LinkKind] {
        &[LinkKind::Logit, LinkKind::Log]
    }

    fn neg_log_likelihood(&self, y: f64, theta: &[f64]) -> f64 {
        let p = clamp_prob(theta[0]);
        let lambda = theta[1].max(RATE_EPS);
        if y == 0.0 {
            -p.ln()
        } else {
            -(1.0 - p).ln() + poisson_nll(y, lambda) + log1mexp(lambda)
        }
    }

    fn gradient(&self, y: f64, theta: &[f64], grad: &mut [f64]) {
        let p = clamp_prob(theta[0]);
        let lambda = theta[1].max(RATE_EPS);
        if y == 0.0 {
            grad[0] = -1.0 / p;
            grad[1] = 0.0;
        } else {
            grad[0] = 1.0 / (1.0 - p);
            grad[1] = 1.0 - y / lambda + 1.0 / lambda.exp_m1();
        }
    }

    fn mean(&self, theta: &[f64]) -> f64 {
        let lambda = theta[1].max(RATE_EPS);
        (1.0 - theta[0]) * lambda / -(-lambda).exp_m1()
    }

    fn sample(&self, theta: &[f64], rng: &mut dyn RngCore) -> f64 {
        if sample_bernoulli(theta[0], rng) {
            0.0
        } else {
            sample_zero_truncated_poisson(theta[1], rng)
        }
    }
}

/// Negative binomial with mean `mu` and dispersion `alpha`:
/// Var(Y) = mu + alpha * mu^2.
#[derive(Debug, Clone, Copy, Default)]
pub struct NegativeBinomial;

/// Smallest dispersion used; below it the family is numerically Poisson.
const MIN_DISPERSION: f64 = 1e-10;

/// Largest count whose gamma-function ratios are expanded term by term.
const MAX_EXPANDED_COUNT: f64 = 1e4;

/// Integer counts for which Gamma(y + r) / Gamma(r) is expanded as a product.
fn is_small_count(y: f64) -> bool {
    y.fract() == 0.0 && y <= MAX_EXPANDED_COUNT
}

impl CountFamily for NegativeBinomial {
    fn name(&self) -> &'static str {
        "negative binomial"
    }

    fn parameter_names(&self) -> &'static [&'static str] {
        &["mean", "dispersion"]
    }

    fn links(&self) -> &'static [LinkKind] {
        &[LinkKind::Log, LinkKind::Log]
    }

    fn neg_log_likelihood(&self, y: f64, theta: &[f64]) -> f64 {
        let mu = theta[0].max(RATE_EPS);
        let r = 1.0 / theta[1].max(MIN_DISPERSION);
        let t = mu / (r + mu);
        // ln Gamma(y + r) - ln Gamma(r) + y ln(mu / (r + mu))
        let count_terms = if is_small_count(y) {
            (0..y as usize)
                .map(|i| ((i as f64 - mu) / (r + mu)).ln_1p())
                .sum::<f64>()
                + y * mu.ln()
        } else {
            ln_gamma(y + r) - ln_gamma(r) + y * t.ln()
        };
        -(count_terms - ln_gamma(y + 1.0) + r * (-t).ln_1p())
    }

    fn gradient(&self, y: f64, theta: &[f64], grad: &mut [f64]) {
        let mu = theta[0].max(RATE_EPS);
        let r = 1.0 / theta[1].max(MIN_DISPERSION);
        let t = mu / (r + mu);
        grad[0] = (r + y) / (r + mu) - y / mu;
        // r^2 * d(loglik)/dr, since dr/dalpha = -r^2; each piece vanishes as r grows
        let count_terms = if is_small_count(y) {
            let s = r / (r + mu);
            (0..y as usize)
                .map(|i| {
                    let i = i as f64;
                    (mu - i) * (r / (r + i)) * s
                })
                .sum::<f64>()
        } else {
            r * r * (digamma(y + r) - digamma(r) - y / (r + mu))
        };
        grad[1] = count_terms + r * r * log1m_plus(t);
    }

    fn mean(&self, theta: &[f64]) -> f64 {
        theta[0]
    }

    fn sample(&self, theta: &[f64], rng: &mut dyn RngCore) -> f64 {
        let mu = theta[0].max(RATE_EPS);
        let r = 1.0 / theta[1].max(MIN_DISPERSION);
        match Gamma::new(r, mu / r) {
            Ok(gamma) => {
                let rate: f64 = gamma.sample(rng);
                sample_poisson(rate, rng)
            }
            Err(_) => sample_poisson(mu, rng),
        }
    }
}
