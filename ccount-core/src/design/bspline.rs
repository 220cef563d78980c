#![allow(clippy::needless_range_loop)]
//! B-spline bases for smooth covariate effects.
//!
//! Knots are placed either at empirical quantiles of the covariate
//! (`Frequency`) or evenly over its range (`Domain`). The basis is built on
//! a clamped knot vector; outside the inner knot range every basis function
//! continues linearly, which is also how `l_linear` / `r_linear` make the
//! outermost segments linear: the first/last knot is dropped from the inner
//! knots and the dropped segment is covered by the linear tail.

use ccount_linalg::DenseMatrix;

use crate::model::error::ModelError;
use crate::util::math::quantile;

/// How knots are placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnotsType {
    /// At evenly spaced quantiles of the data.
    Frequency,
    /// Evenly spaced between the data minimum and maximum.
    Domain,
}

/// A covariate to expand in a B-spline basis.
#[derive(Debug, Clone)]
pub struct SplineSpec {
    /// Covariate values, one per observation.
    pub values: Vec<f64>,
    pub knots_type: KnotsType,
    /// Number of knots, boundary knots included.
    pub knots_num: usize,
    pub degree: usize,
    /// Make the segment left of the second knot linear.
    pub l_linear: bool,
    /// Make the segment right of the second-to-last knot linear.
    pub r_linear: bool,
}

impl SplineSpec {
    /// Cubic spline with frequency knots and no linear tails.
    pub fn new(values: Vec<f64>, knots_num: usize) -> Self {
        Self {
            values,
            knots_type: KnotsType::Frequency,
            knots_num,
            degree: 3,
            l_linear: false,
            r_linear: false,
        }
    }

    pub fn with_degree(mut self, degree: usize) -> Self {
        self.degree = degree;
        self
    }

    pub fn with_knots_type(mut self, knots_type: KnotsType) -> Self {
        self.knots_type = knots_type;
        self
    }

    pub fn with_linear_tails(mut self, l_linear: bool, r_linear: bool) -> Self {
        self.l_linear = l_linear;
        self.r_linear = r_linear;
        self
    }
}

/// A fitted B-spline basis; evaluates the same basis on new data.
#[derive(Debug, Clone)]
pub struct BSpline {
    knots: Vec<f64>,
    degree: usize,
    /// Clamped knot vector over the inner knots.
    aug: Vec<f64>,
    lower: f64,
    upper: f64,
}

impl BSpline {
    /// Place knots from the data and build the basis.
    pub fn fit(spec: &SplineSpec) -> Result<Self, ModelError> {
        if spec.values.is_empty() {
            return Err(ModelError::InvalidSpline("no covariate values".into()));
        }
        if spec.values.iter().any(|v| !v.is_finite()) {
            return Err(ModelError::NonFinite {
                what: "spline covariate".into(),
            });
        }
        if spec.knots_num < 2 {
            return Err(ModelError::InvalidSpline(format!(
                "need at least 2 knots, got {}",
                spec.knots_num
            )));
        }

        let mut sorted = spec.values.clone();
        sorted.sort_by(f64::total_cmp);
        let (lo, hi) = (sorted[0], sorted[sorted.len() - 1]);
        let last = (spec.knots_num - 1) as f64;
        let knots: Vec<f64> = (0..spec.knots_num)
            .map(|i| {
                let q = i as f64 / last;
                match spec.knots_type {
                    KnotsType::Frequency => quantile(&sorted, q),
                    KnotsType::Domain => lo + q * (hi - lo),
                }
            })
            .collect();

        Self::from_knots(knots, spec.degree, spec.l_linear, spec.r_linear)
    }

    /// Build the basis from explicit knots (ties are merged).
    pub fn from_knots(
        knots: Vec<f64>,
        degree: usize,
        l_linear: bool,
        r_linear: bool,
    ) -> Result<Self, ModelError> {
        let span = knots.last().copied().unwrap_or(0.0) - knots.first().copied().unwrap_or(0.0);
        let mut distinct: Vec<f64> = Vec::with_capacity(knots.len());
        for k in knots {
            match distinct.last() {
                Some(&prev) if k - prev <= 1e-12 * span.abs().max(1.0) => {}
                _ => distinct.push(k),
            }
        }

        let start = usize::from(l_linear);
        let end = distinct.len().saturating_sub(usize::from(r_linear));
        if end < start + 2 {
            return Err(ModelError::InvalidSpline(format!(
                "{} distinct knots leave fewer than 2 inner knots",
                distinct.len()
            )));
        }
        let inner = &distinct[start..end];
        if inner.len() + degree < 3 {
            return Err(ModelError::InvalidSpline(
                "basis has no columns besides the one absorbed by the intercept".into(),
            ));
        }

        let lower = inner[0];
        let upper = inner[inner.len() - 1];
        let mut aug = vec![lower; degree];
        aug.extend_from_slice(inner);
        aug.extend(std::iter::repeat(upper).take(degree));

        Ok(Self {
            knots: distinct,
            degree,
            aug,
            lower,
            upper,
        })
    }

    /// All distinct knots, boundary knots included.
    pub fn knots(&self) -> &[f64] {
        &self.knots
    }

    pub fn degree(&self) -> usize {
        self.degree
    }

    /// Number of basis functions.
    pub fn n_basis(&self) -> usize {
        self.aug.len() - 1 - self.degree
    }

    /// Basis functions evaluated at each value, one row per value.
    pub fn design_mat(&self, values: &[f64]) -> DenseMatrix {
        let mut out = DenseMatrix::zeros(values.len(), self.n_basis());
        for (i, &x) in values.iter().enumerate() {
            out.set_row(i, &self.eval(x));
        }
        out
    }

    /// Basis values at a single point.
    pub fn eval(&self, x: f64) -> Vec<f64> {
        if x < self.lower {
            self.linear_tail(self.lower, x)
        } else if x > self.upper {
            self.linear_tail(self.upper, x)
        } else {
            basis_at(&self.aug, self.degree, x)
        }
    }

    fn linear_tail(&self, anchor: f64, x: f64) -> Vec<f64> {
        let value = basis_at(&self.aug, self.degree, anchor);
        let slope = self.derivative_at(anchor);
        value
            .iter()
            .zip(slope.iter())
            .map(|(v, d)| v + d * (x - anchor))
            .collect()
    }

    /// First derivative of every basis function at `x` (inside the knot range).
    fn derivative_at(&self, x: f64) -> Vec<f64> {
        let p = self.degree;
        let n = self.n_basis();
        if p == 0 {
            return vec![0.0; n];
        }
        let lower = basis_at(&self.aug, p - 1, x);
        let t = &self.aug;
        (0..n)
            .map(|i| {
                let mut d = 0.0;
                let left = t[i + p] - t[i];
                if left > 0.0 {
                    d += lower[i] / left;
                }
                let right = t[i + p + 1] - t[i + 1];
                if right > 0.0 {
                    d -= lower[i + 1] / right;
                }
                p as f64 * d
            })
            .collect()
    }
}

/// Index of the knot interval used for `x`; the upper end maps to the last non-empty interval.
fn find_span(aug: &[f64], x: f64) -> usize {
    let mut span = 0;
    for i in 0..aug.len() - 1 {
        if aug[i] < aug[i + 1] {
            span = i;
            if x < aug[i + 1] {
                return i;
            }
        }
    }
    span
}

/// Cox-de Boor recursion for all basis functions of degree `p` on knot vector `aug`.
fn basis_at(aug: &[f64], p: usize, x: f64) -> Vec<f64> {
    let mut b = vec![0.0; aug.len() - 1];
    b[find_span(aug, x)] = 1.0;
    for q in 1..=p {
        let mut next = vec![0.0; aug.len() - 1 - q];
        for i in 0..next.len() {
            let mut v = 0.0;
            let left = aug[i + q] - aug[i];
            if left > 0.0 {
                v += (x - aug[i]) / left * b[i];
            }
            let right = aug[i + q + 1] - aug[i + 1];
            if right > 0.0 {
                v += (aug[i + q + 1] - x) / right * b[i + 1];
            }
            next[i] = v;
        }
        b = next;
    }
    b
}
