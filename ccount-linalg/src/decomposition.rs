#![allow(clippy::needless_range_loop)]
//! Symmetric matrix decompositions.
//!
//! Wrappers around faer's self-adjoint eigendecomposition, plus the
//! spectral helpers the random-effects covariance needs: Moore-Penrose
//! pseudo-inverse, projection onto the PSD cone and the symmetric square
//! root used to draw correlated normal vectors.

use crate::dense::DenseMatrix;
use thiserror::Error;

/// Relative cutoff for treating an eigenvalue as zero (matches LAPACK-style pinv).
pub const PINV_RCOND: f64 = 1e-15;

#[derive(Error, Debug)]
pub enum LinalgError {
    #[error("Matrix is not square: {nrows} x {ncols}")]
    NotSquare { nrows: usize, ncols: usize },

    #[error("Matrix is not symmetric")]
    NotSymmetric,

    #[error("Matrix is not positive semi-definite (smallest eigenvalue {min_eigenvalue:.3e})")]
    NotPositiveSemiDefinite { min_eigenvalue: f64 },

    #[error("Matrix contains non-finite entries")]
    NonFinite,

    #[error("Optimization failed: {0}")]
    Optimization(String),
}

/// Eigendecomposition A = V * diag(values) * V' of a symmetric matrix.
#[derive(Debug, Clone)]
pub struct SymmetricEigen {
    /// Eigenvalues in ascending order.
    pub values: Vec<f64>,
    /// Orthonormal eigenvectors stored as columns.
    pub vectors: DenseMatrix,
}

impl SymmetricEigen {
    /// Decompose a symmetric matrix. Only the lower triangle is read.
    pub fn new(a: &DenseMatrix) -> Result<Self, LinalgError> {
        let n = a.nrows();
        if n != a.ncols() {
            return Err(LinalgError::NotSquare {
                nrows: n,
                ncols: a.ncols(),
            });
        }
        if !a.is_finite() {
            return Err(LinalgError::NonFinite);
        }

        let evd = a.as_faer().selfadjoint_eigendecomposition(faer::Side::Lower);
        let s = evd.s();
        let u = evd.u();
        let mut order: Vec<usize> = (0..n).collect();
        let raw: Vec<f64> = (0..n).map(|i| s.column_vector().read(i)).collect();
        order.sort_by(|&i, &j| raw[i].total_cmp(&raw[j]));

        let values = order.iter().map(|&i| raw[i]).collect();
        let vectors = DenseMatrix::from_fn(n, n, |i, j| u.read(i, order[j]));
        Ok(Self { values, vectors })
    }

    /// Largest eigenvalue magnitude.
    pub fn spectral_radius(&self) -> f64 {
        self.values.iter().fold(0.0_f64, |m, v| m.max(v.abs()))
    }

    /// Rebuild V * diag(f(values)) * V'.
    pub fn map_values<F>(&self, f: F) -> DenseMatrix
    where
        F: Fn(f64) -> f64,
    {
        let n = self.values.len();
        let mapped: Vec<f64> = self.values.iter().map(|&v| f(v)).collect();
        let mut out = DenseMatrix::zeros(n, n);
        for i in 0..n {
            for j in i..n {
                let mut s = 0.0;
                for k in 0..n {
                    s += self.vectors.get(i, k) * mapped[k] * self.vectors.get(j, k);
                }
                out.set(i, j, s);
                out.set(j, i, s);
            }
        }
        out
    }
}

/// Average a square matrix with its transpose.
pub fn symmetrize(a: &DenseMatrix) -> DenseMatrix {
    a.add(&a.transpose()).scale(0.5)
}

/// Moore-Penrose pseudo-inverse of a symmetric matrix.
///
/// Eigenvalues with magnitude below `PINV_RCOND * max|lambda|` are treated as zero.
pub fn pseudo_inverse(a: &DenseMatrix) -> Result<DenseMatrix, LinalgError> {
    let eig = SymmetricEigen::new(&symmetrize(a))?;
    let cutoff = PINV_RCOND * eig.spectral_radius();
    Ok(eig.map_values(|v| if v.abs() > cutoff { 1.0 / v } else { 0.0 }))
}

/// Nearest (Frobenius) symmetric PSD matrix: negative eigenvalues are clipped to zero.
pub fn project_psd(a: &DenseMatrix) -> Result<DenseMatrix, LinalgError> {
    let eig = SymmetricEigen::new(&symmetrize(a))?;
    Ok(eig.map_values(|v| v.max(0.0)))
}

/// Symmetric square root S of a PSD matrix, S * S = A.
pub fn psd_sqrt(a: &DenseMatrix) -> Result<DenseMatrix, LinalgError> {
    let eig = SymmetricEigen::new(&symmetrize(a))?;
    Ok(eig.map_values(|v| v.max(0.0).sqrt()))
}

/// Check that `a` is symmetric and positive semi-definite up to `tol`.
///
/// The eigenvalue tolerance is relative to `max(1, |lambda_max|)`.
pub fn check_psd(a: &DenseMatrix, tol: f64) -> Result<(), LinalgError> {
    if a.nrows() != a.ncols() {
        return Err(LinalgError::NotSquare {
            nrows: a.nrows(),
            ncols: a.ncols(),
        });
    }
    if !a.is_symmetric(tol) {
        return Err(LinalgError::NotSymmetric);
    }
    let eig = SymmetricEigen::new(a)?;
    let min = eig.values.first().copied().unwrap_or(0.0);
    if min < -tol * eig.spectral_radius().max(1.0) {
        return Err(LinalgError::NotPositiveSemiDefinite { min_eigenvalue: min });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: &DenseMatrix, b: &DenseMatrix, tol: f64) {
        for i in 0..a.nrows() {
            for j in 0..a.ncols() {
                assert!(
                    (a.get(i, j) - b.get(i, j)).abs() < tol,
                    "[{},{}]: {} vs {}",
                    i,
                    j,
                    a.get(i, j),
                    b.get(i, j)
                );
            }
        }
    }

    #[test]
    fn test_eigenvalues_ascending() {
        let a = DenseMatrix::from_row_major(2, 2, &[3.0, 1.0, 1.0, 3.0]);
        let eig = SymmetricEigen::new(&a).unwrap();
        assert!((eig.values[0] - 2.0).abs() < 1e-10);
        assert!((eig.values[1] - 4.0).abs() < 1e-10);
        assert_close(&eig.map_values(|v| v), &a, 1e-10);
    }

    #[test]
    fn test_pseudo_inverse_of_invertible_matrix() {
        let a = DenseMatrix::from_row_major(2, 2, &[4.0, 2.0, 2.0, 3.0]);
        let inv = pseudo_inverse(&a).unwrap();
        assert_close(&a.mat_mul(&inv), &DenseMatrix::identity(2), 1e-10);
    }

    #[test]
    fn test_pseudo_inverse_of_singular_matrix() {
        // rank one: [1,1]' [1,1]
        let a = DenseMatrix::from_row_major(2, 2, &[1.0, 1.0, 1.0, 1.0]);
        let pinv = pseudo_inverse(&a).unwrap();
        // pinv = a / 4
        assert_close(&pinv, &a.scale(0.25), 1e-10);
        // A * A+ * A = A
        assert_close(&a.mat_mul(&pinv).mat_mul(&a), &a, 1e-10);
    }

    #[test]
    fn test_project_psd_clips_negative_eigenvalues() {
        let a = DenseMatrix::from_row_major(2, 2, &[1.0, 3.0, 3.0, 1.0]);
        assert!(check_psd(&a, 1e-8).is_err());
        let p = project_psd(&a).unwrap();
        assert!(check_psd(&p, 1e-8).is_ok());
        // eigenvalues 4 and -2 -> 4 along [1,1]/sqrt(2)
        assert_close(&p, &DenseMatrix::full(2, 2, 2.0), 1e-10);
    }

    #[test]
    fn test_psd_sqrt() {
        let a = DenseMatrix::from_row_major(2, 2, &[1.0, 0.1, 0.1, 1.0]);
        let s = psd_sqrt(&a).unwrap();
        assert_close(&s.mat_mul(&s), &a, 1e-10);
    }

    #[test]
    fn test_check_psd_rejects_non_square() {
        let a = DenseMatrix::zeros(2, 3);
        assert!(matches!(
            check_psd(&a, 1e-8),
            Err(LinalgError::NotSquare { nrows: 2, ncols: 3 })
        ));
    }
}
