//! Human-readable model summary.

use std::fmt::Write;

use super::correlated::CorrelatedModel;
use crate::glmm::link::Link;

const RULE: &str = "------------------------------------------";

fn fmt_vec(values: &[f64]) -> String {
    let parts: Vec<String> = values.iter().map(|v| format!("{:.6}", v)).collect();
    format!("[{}]", parts.join(", "))
}

impl CorrelatedModel {
    /// Coefficients of the user-supplied covariates on their original scale.
    ///
    /// Spline columns and the intercept are left out; each coefficient is
    /// divided by its column's scale.
    pub fn covariate_effects(&self, k: usize, j: usize) -> Vec<f64> {
        let design = self.design();
        let first = design.first_covariate();
        let scaling = design.scaling(k, j);
        let beta = self.beta().get(k, j);
        (first..first + design.n_covariates(k, j))
            .map(|c| beta[c] / scaling.std[c])
            .collect()
    }

    /// Multi-line report of the fitted model.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        // writing into a String cannot fail
        let _ = self.write_summary(&mut out);
        out
    }

    fn write_summary(&self, out: &mut String) -> std::fmt::Result {
        let family = self.family();
        let names = family.parameter_names();
        let links = family.links();
        let (n, l) = (self.n_outcomes(), self.n_params());
        let intercept = self.design().add_intercepts();

        writeln!(out, "MODEL SUMMARY FOR {}", family.name().to_uppercase())?;
        writeln!(out, "{}", RULE)?;
        writeln!(out, "NUM OBSERVATIONS: {}", self.n_obs())?;
        writeln!(out, "NUM OUTCOMES: {}", n)?;
        writeln!(out, "NUM PARAMETERS: {}", l)?;
        writeln!(out, "NUM GROUPS: {}", self.n_groups())?;
        writeln!(out, "{}", RULE)?;
        writeln!(out, "FIXED EFFECTS")?;
        writeln!(out, "{}", RULE)?;

        for transformed in [false, true] {
            writeln!(out, "{}", if transformed { "\nTRANSFORMED" } else { "UNTRANSFORMED" })?;
            for k in 0..l {
                let link = links[k];
                let map = |v: f64| if transformed { link.inv_link(v) } else { v };
                writeln!(out, "\n{} ({} link)", names[k].to_uppercase(), link.name())?;
                for j in 0..n {
                    writeln!(out, "OUTCOME {}", j)?;
                    if intercept {
                        writeln!(
                            out,
                            "value for observations with average covariate values: {:.6}",
                            map(self.beta().get(k, j)[0])
                        )?;
                    }
                    let effects: Vec<f64> = self.covariate_effects(k, j).into_iter().map(map).collect();
                    writeln!(out, "estimated coefficients: {}", fmt_vec(&effects))?;
                }
            }
        }

        writeln!(out, "{}", RULE)?;
        writeln!(out, "RANDOM EFFECTS")?;
        writeln!(out, "{}", RULE)?;
        writeln!(out, "RANDOM EFFECTS VARIANCE-COVARIANCE MATRIX")?;
        for (k, d) in self.d().iter().enumerate() {
            writeln!(out, "\n{}", names[k].to_uppercase())?;
            write!(out, "{}", d)?;
        }
        writeln!(out, "{}", RULE)?;
        writeln!(out, "RANDOM EFFECTS BY GROUP")?;
        for (k, u) in self.u().iter().enumerate() {
            writeln!(out, "\n{}", names[k].to_uppercase())?;
            for (g, id) in self.group_ids().iter().enumerate() {
                writeln!(out, "group id {}: {}", id, fmt_vec(&u.row(g)))?;
            }
        }
        Ok(())
    }
}
