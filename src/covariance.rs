//! Sparse spatial covariance between the spaxels of a square emission-line map.
//!
//! Neighbouring MaNGA spaxels are not independent: the reconstruction of the datacube
//! correlates each spaxel with those within a few spaxels of it. The covariance between
//! spaxels `i` and `j` is modelled as `kernel(d_ij) * sigma_i * sigma_j`, which vanishes
//! exactly beyond the kernel cutoff, so the N^2 x N^2 matrix is stored in compressed
//! sparse column form.

use crate::error::{Result, SfrError};
use crate::kernel::Kernel;
use crate::PixelIndex;
use log::debug;
use rayon::prelude::*;
use serde_derive::{Deserialize, Serialize};

/// Square N x N arrangement of spaxels addressed by row-major linear index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelGrid {
    side: usize,
}

impl PixelGrid {
    pub fn new(side: usize) -> Result<Self> {
        if side == 0 {
            return Err(SfrError::InvalidArgument(
                "grid side length must be at least 1".to_string(),
            ));
        }
        Ok(PixelGrid { side })
    }

    pub fn side(&self) -> usize {
        self.side
    }

    /// Total number of spaxels, N^2
    pub fn pixels(&self) -> usize {
        self.side * self.side
    }

    pub fn index(&self, row: usize, col: usize) -> PixelIndex {
        row * self.side + col
    }

    pub fn position(&self, index: PixelIndex) -> (usize, usize) {
        (index / self.side, index % self.side)
    }

    /// Euclidean separation of two spaxels in grid units
    pub fn distance(&self, a: PixelIndex, b: PixelIndex) -> f64 {
        let (ra, ca) = self.position(a);
        let (rb, cb) = self.position(b);
        let dr = ra as f64 - rb as f64;
        let dc = ca as f64 - cb as f64;
        (dr * dr + dc * dc).sqrt()
    }
}

/// Symmetric covariance matrix in compressed sparse column layout.
///
/// Row indices within each column are strictly increasing and explicit zeros are
/// never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CovarianceMatrix {
    dim: usize,
    col_ptr: Vec<usize>,
    row_idx: Vec<PixelIndex>,
    values: Vec<f64>,
}

impl CovarianceMatrix {
    /// The all-zero `dim` x `dim` matrix
    pub fn zeros(dim: usize) -> Self {
        CovarianceMatrix {
            dim,
            col_ptr: vec![0; dim + 1],
            row_idx: vec![],
            values: vec![],
        }
    }

    /// Assemble a matrix from `(row, col, value)` triplets. Duplicate coordinates are
    /// summed and zeros are dropped.
    pub fn from_triplets(dim: usize, triplets: Vec<(PixelIndex, PixelIndex, f64)>) -> Result<Self> {
        if let Some(&(row, col, _)) = triplets.iter().find(|&&(r, c, _)| r >= dim || c >= dim) {
            return Err(SfrError::IndexOutOfRange {
                index: row.max(col),
                pixels: dim,
            });
        }
        Ok(Self::assemble(dim, triplets))
    }

    /// Sort in-bounds triplets into CSC order.
    fn assemble(dim: usize, mut triplets: Vec<(PixelIndex, PixelIndex, f64)>) -> Self {
        triplets.sort_unstable_by_key(|&(row, col, _)| (col, row));

        let mut col_ptr = vec![0; dim + 1];
        let mut row_idx: Vec<PixelIndex> = Vec::with_capacity(triplets.len());
        let mut values: Vec<f64> = Vec::with_capacity(triplets.len());
        let mut cols: Vec<PixelIndex> = Vec::with_capacity(triplets.len());

        for (row, col, value) in triplets {
            // Merge duplicates
            if let (Some(&last_row), Some(&last_col)) = (row_idx.last(), cols.last()) {
                if last_row == row && last_col == col {
                    if let Some(last) = values.last_mut() {
                        *last += value;
                    }
                    continue;
                }
            }
            row_idx.push(row);
            cols.push(col);
            values.push(value);
        }

        // Drop entries that are (or summed to) exactly zero
        let mut kept = 0;
        for k in 0..values.len() {
            if values[k] != 0.0 {
                row_idx[kept] = row_idx[k];
                cols[kept] = cols[k];
                values[kept] = values[k];
                kept += 1;
            }
        }
        row_idx.truncate(kept);
        cols.truncate(kept);
        values.truncate(kept);

        for &col in &cols {
            col_ptr[col + 1] += 1;
        }
        for c in 0..dim {
            col_ptr[c + 1] += col_ptr[c];
        }

        CovarianceMatrix {
            dim,
            col_ptr,
            row_idx,
            values,
        }
    }

    /// Number of rows (and columns)
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of stored non-zero entries
    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Entry at `(row, col)`; zero when not stored or out of range.
    pub fn get(&self, row: PixelIndex, col: PixelIndex) -> f64 {
        if row >= self.dim || col >= self.dim {
            return 0.0;
        }
        let (start, end) = (self.col_ptr[col], self.col_ptr[col + 1]);
        match self.row_idx[start..end].binary_search(&row) {
            Ok(offset) => self.values[start + offset],
            Err(_) => 0.0,
        }
    }

    /// Stored `(row, value)` pairs of one column, in increasing row order.
    pub fn column(&self, col: PixelIndex) -> impl Iterator<Item = (PixelIndex, f64)> + '_ {
        let (start, end) = if col < self.dim {
            (self.col_ptr[col], self.col_ptr[col + 1])
        } else {
            (0, 0)
        };
        self.row_idx[start..end]
            .iter()
            .copied()
            .zip(self.values[start..end].iter().copied())
    }

    /// All stored entries as `(row, col, value)`, column-major.
    pub fn triplets(&self) -> impl Iterator<Item = (PixelIndex, PixelIndex, f64)> + '_ {
        (0..self.dim).flat_map(move |col| self.column(col).map(move |(row, value)| (row, col, value)))
    }

    pub fn diagonal(&self) -> Vec<f64> {
        (0..self.dim).map(|i| self.get(i, i)).collect()
    }

    /// Exact symmetry check, `C[i,j] == C[j,i]` for every stored entry
    pub fn is_symmetric(&self) -> bool {
        self.triplets().all(|(row, col, value)| self.get(col, row) == value)
    }

    /// Sum of every entry of the matrix
    pub fn total(&self) -> f64 {
        self.values.iter().sum()
    }

    /// Structural consistency of the CSC arrays. Used to reject cache entries that
    /// decode but do not describe a matrix.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.col_ptr.len() != self.dim + 1 {
            return Err(format!(
                "column pointer length {} does not match dimension {}",
                self.col_ptr.len(),
                self.dim
            ));
        }
        if self.row_idx.len() != self.values.len() {
            return Err(format!(
                "{} row indices but {} values",
                self.row_idx.len(),
                self.values.len()
            ));
        }
        if self.col_ptr[0] != 0 || self.col_ptr[self.dim] != self.values.len() {
            return Err("column pointers do not span the stored values".to_string());
        }
        for col in 0..self.dim {
            let (start, end) = (self.col_ptr[col], self.col_ptr[col + 1]);
            if start > end || end > self.row_idx.len() {
                return Err(format!("invalid column pointers at column {col}"));
            }
            let rows = &self.row_idx[start..end];
            if rows.windows(2).any(|w| w[0] >= w[1]) {
                return Err(format!("row indices of column {col} are not strictly increasing"));
            }
            if rows.last().map_or(false, |&row| row >= self.dim) {
                return Err(format!("row index out of range in column {col}"));
            }
        }
        if self.values.iter().any(|v| !v.is_finite()) {
            return Err("non-finite covariance entry".to_string());
        }
        Ok(())
    }
}

/// Builds the spatially-correlated covariance matrix for one emission line of one galaxy.
///
/// `errors` holds the per-spaxel standard deviation in row-major order; `None` marks a
/// spaxel without a usable error (masked, missing, non-finite or negative). Such spaxels
/// get no entries at all, neither on the diagonal nor off it.
pub fn build_covariance(
    grid: PixelGrid,
    errors: &[Option<f64>],
    kernel: &Kernel,
) -> Result<CovarianceMatrix> {
    if errors.len() != grid.pixels() {
        return Err(SfrError::ShapeMismatch {
            expected: grid.pixels(),
            found: errors.len(),
        });
    }

    // Only keep errors that can act as a standard deviation
    let sigma: Vec<Option<f64>> = errors
        .iter()
        .map(|e| e.filter(|s| s.is_finite() && *s >= 0.0))
        .collect();

    Ok(assemble_covariance(grid, &sigma, kernel))
}

/// Correlation matrix of the grid, i.e. the covariance with unit error on every spaxel.
pub fn correlation_matrix(grid: PixelGrid, kernel: &Kernel) -> CovarianceMatrix {
    assemble_covariance(grid, &vec![Some(1.0); grid.pixels()], kernel)
}

fn assemble_covariance(grid: PixelGrid, sigma: &[Option<f64>], kernel: &Kernel) -> CovarianceMatrix {
    let side = grid.side() as isize;
    let offsets = kernel.forward_offsets(grid.side() - 1);

    // Each valid spaxel emits its diagonal entry and the pairs it forms with valid
    // neighbours of larger index, mirrored across the diagonal.
    let triplets: Vec<(PixelIndex, PixelIndex, f64)> = (0..grid.pixels())
        .into_par_iter()
        .filter_map(|i| sigma[i].map(|s| (i, s)))
        .flat_map_iter(|(i, sigma_i)| {
            let (row, col) = grid.position(i);
            let (row, col) = (row as isize, col as isize);

            let neighbours = offsets.iter().filter_map(move |&(d_row, d_col, rho)| {
                let (r, c) = (row + d_row, col + d_col);
                if r < 0 || r >= side || c < 0 || c >= side {
                    return None;
                }
                let j = grid.index(r as usize, c as usize);
                sigma[j].map(|sigma_j| (j, rho * sigma_i * sigma_j))
            });

            std::iter::once((i, i, sigma_i * sigma_i))
                .chain(neighbours.flat_map(move |(j, value)| [(i, j, value), (j, i, value)]))
        })
        .collect();

    let valid = sigma.iter().filter(|s| s.is_some()).count();
    debug!(
        "assembling covariance for {} spaxels ({} with errors) from {} entries",
        grid.pixels(),
        valid,
        triplets.len()
    );

    CovarianceMatrix::assemble(grid.pixels(), triplets)
}

#[test]
fn test_grid_indexing() {
    let grid = PixelGrid::new(4).unwrap();
    assert_eq!(grid.pixels(), 16);
    assert_eq!(grid.index(2, 3), 11);
    assert_eq!(grid.position(11), (2, 3));
    assert_eq!(grid.distance(0, 5), 2.0_f64.sqrt());
    assert!(PixelGrid::new(0).is_err());
}

#[test]
fn test_from_triplets_merges_and_drops_zeros() {
    let matrix =
        CovarianceMatrix::from_triplets(3, vec![(0, 1, 1.0), (0, 1, 2.0), (2, 2, 0.0), (1, 0, 3.0)])
            .unwrap();
    assert_eq!(matrix.nnz(), 2);
    assert_eq!(matrix.get(0, 1), 3.0);
    assert_eq!(matrix.get(1, 0), 3.0);
    assert_eq!(matrix.get(2, 2), 0.0);
    assert!(matrix.validate().is_ok());

    assert!(CovarianceMatrix::from_triplets(3, vec![(3, 0, 1.0)]).is_err());
}

#[test]
fn test_covariance_symmetric_and_sparse() {
    let grid = PixelGrid::new(20).unwrap();
    let errors: Vec<Option<f64>> = (0..grid.pixels())
        .map(|i| if i % 7 == 3 { None } else { Some(0.5 + (i % 5) as f64 * 0.25) })
        .collect();
    let matrix = build_covariance(grid, &errors, &Kernel::default()).unwrap();

    assert!(matrix.is_symmetric());
    assert!(matrix.validate().is_ok());
    for (row, col, value) in matrix.triplets() {
        assert_ne!(value, 0.0);
        if row != col {
            assert!(grid.distance(row, col) < 6.4, "{row},{col} beyond cutoff");
        }
        assert!(errors[row].is_some() && errors[col].is_some());
    }
}

#[test]
fn test_covariance_diagonal_is_variance() {
    let grid = PixelGrid::new(5).unwrap();
    let mut errors: Vec<Option<f64>> = (0..25).map(|i| Some(1.0 + i as f64 / 10.0)).collect();
    errors[7] = None;
    errors[12] = Some(f64::NAN);
    errors[13] = Some(-1.0);
    let matrix = build_covariance(grid, &errors, &Kernel::default()).unwrap();

    for i in 0..25 {
        match i {
            7 | 12 | 13 => {
                assert_eq!(matrix.get(i, i), 0.0);
                assert_eq!(matrix.column(i).count(), 0);
            }
            _ => {
                let sigma = errors[i].unwrap();
                assert_eq!(matrix.get(i, i), sigma * sigma);
            }
        }
    }
}

#[test]
fn test_covariance_off_diagonal_value() {
    use approx::assert_relative_eq;

    let grid = PixelGrid::new(10).unwrap();
    let errors: Vec<Option<f64>> = (0..100).map(|i| Some(1.0 + (i % 3) as f64)).collect();
    let kernel = Kernel::default();
    let matrix = build_covariance(grid, &errors, &kernel).unwrap();

    let (i, j) = (grid.index(2, 2), grid.index(4, 5));
    let expected = kernel.correlation(grid.distance(i, j)) * errors[i].unwrap() * errors[j].unwrap();
    assert_relative_eq!(matrix.get(i, j), expected, max_relative = 1e-14);

    // Beyond the cutoff there is no entry
    let far = grid.index(2, 2 + 7);
    assert_eq!(matrix.get(i, far), 0.0);
}

#[test]
fn test_covariance_all_absent_is_zero() {
    let grid = PixelGrid::new(6).unwrap();
    let matrix = build_covariance(grid, &vec![None; 36], &Kernel::default()).unwrap();
    assert_eq!(matrix.nnz(), 0);
    assert_eq!(matrix.dim(), 36);
    assert_eq!(matrix, CovarianceMatrix::zeros(36));
}

#[test]
fn test_covariance_rejects_wrong_length() {
    let grid = PixelGrid::new(3).unwrap();
    let result = build_covariance(grid, &vec![Some(1.0); 8], &Kernel::default());
    assert!(matches!(
        result,
        Err(SfrError::ShapeMismatch {
            expected: 9,
            found: 8
        })
    ));
}

#[test]
fn test_correlation_matrix_unit_diagonal() {
    let grid = PixelGrid::new(8).unwrap();
    let kernel = Kernel::default();
    let corr = correlation_matrix(grid, &kernel);
    assert!(corr.diagonal().iter().all(|&d| d == 1.0));
    assert_eq!(corr.get(0, 1), kernel.correlation(1.0));
    assert!(corr.is_symmetric());
}

#[test]
fn test_single_pixel_grid() {
    let grid = PixelGrid::new(1).unwrap();
    let matrix = build_covariance(grid, &[Some(2.0)], &Kernel::default()).unwrap();
    assert_eq!(matrix.nnz(), 1);
    assert_eq!(matrix.get(0, 0), 4.0);
}
