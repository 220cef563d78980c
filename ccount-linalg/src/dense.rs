#![allow(clippy::needless_range_loop)]
//! Dense matrix operations backed by faer.
//!
//! Wraps faer's column-major `Mat<f64>` with the handful of operations the
//! correlated count model needs: products with vectors, column statistics,
//! row selection for grouping, and horizontal concatenation of designs.

use faer::Mat;

/// A dense matrix wrapper around faer's `Mat<f64>`.
#[derive(Debug, Clone)]
pub struct DenseMatrix {
    inner: Mat<f64>,
}

impl DenseMatrix {
    /// Create a new dense matrix filled with zeros.
    pub fn zeros(nrows: usize, ncols: usize) -> Self {
        Self {
            inner: Mat::zeros(nrows, ncols),
        }
    }

    /// Create a new dense matrix filled with a constant value.
    pub fn full(nrows: usize, ncols: usize, value: f64) -> Self {
        Self {
            inner: Mat::from_fn(nrows, ncols, |_, _| value),
        }
    }

    /// Create a matrix by evaluating `f(row, col)` for every entry.
    pub fn from_fn<F>(nrows: usize, ncols: usize, f: F) -> Self
    where
        F: FnMut(usize, usize) -> f64,
    {
        Self {
            inner: Mat::from_fn(nrows, ncols, f),
        }
    }

    /// Create a dense matrix from a row-major slice.
    pub fn from_row_major(nrows: usize, ncols: usize, data: &[f64]) -> Self {
        assert_eq!(data.len(), nrows * ncols);
        let inner = Mat::from_fn(nrows, ncols, |i, j| data[i * ncols + j]);
        Self { inner }
    }

    /// Create a single-column matrix from a slice.
    pub fn column(data: &[f64]) -> Self {
        let inner = Mat::from_fn(data.len(), 1, |i, _| data[i]);
        Self { inner }
    }

    /// Create an identity matrix of size n x n.
    pub fn identity(n: usize) -> Self {
        let inner = Mat::from_fn(n, n, |i, j| if i == j { 1.0 } else { 0.0 });
        Self { inner }
    }

    /// Number of rows.
    pub fn nrows(&self) -> usize {
        self.inner.nrows()
    }

    /// Number of columns.
    pub fn ncols(&self) -> usize {
        self.inner.ncols()
    }

    /// Get element at (row, col).
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.inner.read(row, col)
    }

    /// Set element at (row, col).
    pub fn set(&mut self, row: usize, col: usize, value: f64) {
        self.inner.write(row, col, value);
    }

    /// Get a reference to the underlying faer matrix.
    pub fn as_faer(&self) -> &Mat<f64> {
        &self.inner
    }

    /// Matrix-vector product: self * v.
    pub fn mat_vec(&self, v: &[f64]) -> Vec<f64> {
        assert_eq!(self.ncols(), v.len());
        let n = self.nrows();
        let mut result = vec![0.0; n];
        for j in 0..self.ncols() {
            let vj = v[j];
            if vj == 0.0 {
                continue;
            }
            for i in 0..n {
                result[i] += self.inner.read(i, j) * vj;
            }
        }
        result
    }

    /// Transposed matrix-vector product: self' * v.
    pub fn t_mat_vec(&self, v: &[f64]) -> Vec<f64> {
        assert_eq!(self.nrows(), v.len());
        (0..self.ncols())
            .map(|j| {
                let mut s = 0.0;
                for i in 0..self.nrows() {
                    s += self.inner.read(i, j) * v[i];
                }
                s
            })
            .collect()
    }

    /// Matrix-matrix product: self * other.
    pub fn mat_mul(&self, other: &DenseMatrix) -> DenseMatrix {
        assert_eq!(self.ncols(), other.nrows());
        let result = &self.inner * &other.inner;
        DenseMatrix { inner: result }
    }

    /// Transpose.
    pub fn transpose(&self) -> DenseMatrix {
        let inner = self.inner.transpose().to_owned();
        DenseMatrix { inner }
    }

    /// Extract column as a Vec<f64>.
    pub fn col(&self, j: usize) -> Vec<f64> {
        (0..self.nrows()).map(|i| self.inner.read(i, j)).collect()
    }

    /// Extract row as a Vec<f64>.
    pub fn row(&self, i: usize) -> Vec<f64> {
        (0..self.ncols()).map(|j| self.inner.read(i, j)).collect()
    }

    /// Set an entire column from a slice.
    pub fn set_col(&mut self, j: usize, data: &[f64]) {
        assert_eq!(data.len(), self.nrows());
        for i in 0..self.nrows() {
            self.inner.write(i, j, data[i]);
        }
    }

    /// Set an entire row from a slice.
    pub fn set_row(&mut self, i: usize, data: &[f64]) {
        assert_eq!(data.len(), self.ncols());
        for j in 0..self.ncols() {
            self.inner.write(i, j, data[j]);
        }
    }

    /// New matrix made of the given rows, in the given order.
    pub fn select_rows(&self, rows: &[usize]) -> DenseMatrix {
        let inner = Mat::from_fn(rows.len(), self.ncols(), |i, j| self.inner.read(rows[i], j));
        DenseMatrix { inner }
    }

    /// Concatenate matrices with equal row counts side by side.
    pub fn hstack(blocks: &[&DenseMatrix]) -> DenseMatrix {
        let nrows = blocks.first().map_or(0, |b| b.nrows());
        assert!(blocks.iter().all(|b| b.nrows() == nrows));
        let ncols = blocks.iter().map(|b| b.ncols()).sum();
        let mut out = DenseMatrix::zeros(nrows, ncols);
        let mut offset = 0;
        for block in blocks {
            for j in 0..block.ncols() {
                for i in 0..nrows {
                    out.set(i, offset + j, block.get(i, j));
                }
            }
            offset += block.ncols();
        }
        out
    }

    /// Element-wise addition: self + other.
    pub fn add(&self, other: &DenseMatrix) -> DenseMatrix {
        assert_eq!(self.nrows(), other.nrows());
        assert_eq!(self.ncols(), other.ncols());
        let inner = Mat::from_fn(self.nrows(), self.ncols(), |i, j| {
            self.inner.read(i, j) + other.inner.read(i, j)
        });
        DenseMatrix { inner }
    }

    /// Scalar multiplication.
    pub fn scale(&self, s: f64) -> DenseMatrix {
        let inner = Mat::from_fn(self.nrows(), self.ncols(), |i, j| self.inner.read(i, j) * s);
        DenseMatrix { inner }
    }

    /// Create a diagonal matrix from a vector.
    pub fn from_diag(diag: &[f64]) -> Self {
        let n = diag.len();
        let inner = Mat::from_fn(n, n, |i, j| if i == j { diag[i] } else { 0.0 });
        Self { inner }
    }

    /// Dot product of two slices.
    pub fn dot(a: &[f64], b: &[f64]) -> f64 {
        assert_eq!(a.len(), b.len());
        a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
    }

    /// Compute self' * self.
    pub fn gram(&self) -> DenseMatrix {
        let p = self.ncols();
        let mut result = DenseMatrix::zeros(p, p);
        for j in 0..p {
            for k in j..p {
                let mut s = 0.0;
                for i in 0..self.nrows() {
                    s += self.inner.read(i, j) * self.inner.read(i, k);
                }
                result.set(j, k, s);
                result.set(k, j, s);
            }
        }
        result
    }

    /// Entries on and above the diagonal, row by row.
    pub fn upper_triangle(&self) -> Vec<f64> {
        let n = self.nrows().min(self.ncols());
        let mut out = Vec::with_capacity(n * (n + 1) / 2);
        for i in 0..n {
            for j in i..self.ncols() {
                out.push(self.inner.read(i, j));
            }
        }
        out
    }

    /// Whether the matrix is square and symmetric up to `tol` (relative to its largest entry).
    pub fn is_symmetric(&self, tol: f64) -> bool {
        if self.nrows() != self.ncols() {
            return false;
        }
        let scale = self.max_abs().max(1.0);
        for i in 0..self.nrows() {
            for j in (i + 1)..self.ncols() {
                if (self.get(i, j) - self.get(j, i)).abs() > tol * scale {
                    return false;
                }
            }
        }
        true
    }

    /// Largest absolute entry.
    pub fn max_abs(&self) -> f64 {
        let mut m: f64 = 0.0;
        for j in 0..self.ncols() {
            for i in 0..self.nrows() {
                m = m.max(self.inner.read(i, j).abs());
            }
        }
        m
    }

    /// Whether every entry is finite.
    pub fn is_finite(&self) -> bool {
        (0..self.ncols()).all(|j| (0..self.nrows()).all(|i| self.inner.read(i, j).is_finite()))
    }

    /// Extract data as a flat Vec in column-major order.
    pub fn to_col_major(&self) -> Vec<f64> {
        let mut data = Vec::with_capacity(self.nrows() * self.ncols());
        for j in 0..self.ncols() {
            for i in 0..self.nrows() {
                data.push(self.inner.read(i, j));
            }
        }
        data
    }
}

impl std::fmt::Display for DenseMatrix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for i in 0..self.nrows() {
            write!(f, "[")?;
            for j in 0..self.ncols() {
                if j > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{:.6}", self.inner.read(i, j))?;
            }
            writeln!(f, "]")?;
        }
        Ok(())
    }
}
