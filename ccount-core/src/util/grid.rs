//! A dense `l x n` table indexed by (parameter, outcome).
//!
//! Designs, coefficients, covariate statistics and spline bases all come
//! one per distribution parameter `k` and outcome `j`.

/// Row-major table with one cell per (parameter k, outcome j).
#[derive(Debug, Clone, PartialEq)]
pub struct Grid<T> {
    n_params: usize,
    n_outcomes: usize,
    cells: Vec<T>,
}

impl<T> Grid<T> {
    /// Build a grid by evaluating `f(k, j)` for every cell.
    pub fn from_fn<F>(n_params: usize, n_outcomes: usize, mut f: F) -> Self
    where
        F: FnMut(usize, usize) -> T,
    {
        let mut cells = Vec::with_capacity(n_params * n_outcomes);
        for k in 0..n_params {
            for j in 0..n_outcomes {
                cells.push(f(k, j));
            }
        }
        Self {
            n_params,
            n_outcomes,
            cells,
        }
    }

    /// Like `from_fn`, stopping at the first error.
    pub fn try_from_fn<E, F>(n_params: usize, n_outcomes: usize, mut f: F) -> Result<Self, E>
    where
        F: FnMut(usize, usize) -> Result<T, E>,
    {
        let mut cells = Vec::with_capacity(n_params * n_outcomes);
        for k in 0..n_params {
            for j in 0..n_outcomes {
                cells.push(f(k, j)?);
            }
        }
        Ok(Self {
            n_params,
            n_outcomes,
            cells,
        })
    }

    /// Build from nested rows `rows[k][j]`. Returns `None` if the rows are ragged.
    pub fn from_rows(rows: Vec<Vec<T>>) -> Option<Self> {
        let n_params = rows.len();
        let n_outcomes = rows.first().map_or(0, |r| r.len());
        if rows.iter().any(|r| r.len() != n_outcomes) {
            return None;
        }
        Some(Self {
            n_params,
            n_outcomes,
            cells: rows.into_iter().flatten().collect(),
        })
    }

    pub fn n_params(&self) -> usize {
        self.n_params
    }

    pub fn n_outcomes(&self) -> usize {
        self.n_outcomes
    }

    pub fn get(&self, k: usize, j: usize) -> &T {
        &self.cells[k * self.n_outcomes + j]
    }

    pub fn get_mut(&mut self, k: usize, j: usize) -> &mut T {
        &mut self.cells[k * self.n_outcomes + j]
    }

    /// Iterate over `((k, j), cell)` in row-major order.
    pub fn iter(&self) -> impl Iterator<Item = ((usize, usize), &T)> {
        let n = self.n_outcomes;
        self.cells
            .iter()
            .enumerate()
            .map(move |(idx, c)| ((idx / n.max(1), idx % n.max(1)), c))
    }

    /// Cells in row-major order.
    pub fn cells(&self) -> &[T] {
        &self.cells
    }

    /// Apply `f(k, j, cell)` to every cell.
    pub fn map<U, F>(&self, mut f: F) -> Grid<U>
    where
        F: FnMut(usize, usize, &T) -> U,
    {
        Grid::from_fn(self.n_params, self.n_outcomes, |k, j| f(k, j, self.get(k, j)))
    }
}

impl Grid<Vec<f64>> {
    /// All cells concatenated in row-major order.
    pub fn flatten(&self) -> Vec<f64> {
        self.cells.iter().flatten().copied().collect()
    }

    /// Overwrite the cells from a flat vector produced by `flatten`.
    pub fn unflatten_from(&mut self, flat: &[f64]) {
        let mut offset = 0;
        for cell in self.cells.iter_mut() {
            let len = cell.len();
            cell.copy_from_slice(&flat[offset..offset + len]);
            offset += len;
        }
        debug_assert_eq!(offset, flat.len());
    }

    /// Total number of entries over all cells.
    pub fn total_len(&self) -> usize {
        self.cells.iter().map(|c| c.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indexing_is_row_major() {
        let g = Grid::from_fn(2, 3, |k, j| 10 * k + j);
        assert_eq!(*g.get(1, 2), 12);
        assert_eq!(g.cells(), &[0, 1, 2, 10, 11, 12]);
        let keys: Vec<(usize, usize)> = g.iter().map(|(kj, _)| kj).collect();
        assert_eq!(keys[4], (1, 1));
    }

    #[test]
    fn test_from_rows_rejects_ragged() {
        assert!(Grid::from_rows(vec![vec![1, 2], vec![3]]).is_none());
        let g = Grid::from_rows(vec![vec![1, 2], vec![3, 4]]).unwrap();
        assert_eq!(*g.get(1, 0), 3);
    }

    #[test]
    fn test_flatten_roundtrip() {
        let mut g = Grid::from_fn(2, 2, |k, j| vec![0.0; k + j + 1]);
        assert_eq!(g.total_len(), 1 + 2 + 2 + 3);
        let flat: Vec<f64> = (0..8).map(|v| v as f64).collect();
        g.unflatten_from(&flat);
        assert_eq!(g.get(1, 1), &vec![5.0, 6.0, 7.0]);
        assert_eq!(g.flatten(), flat);
    }
}
