//! Compressed sparse row matrix used by the one-hot, hashing and
//! interaction blocks.

use crate::error::{PrepError, Result};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// CSR matrix of `f64` values. Column indices are sorted within each row and
/// explicit zeros are never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CsrMatrix {
    nrows: usize,
    ncols: usize,
    indptr: Vec<usize>,
    indices: Vec<usize>,
    data: Vec<f64>,
}

impl CsrMatrix {
    pub fn zeros(nrows: usize, ncols: usize) -> Self {
        Self {
            nrows,
            ncols,
            indptr: vec![0; nrows + 1],
            indices: Vec::new(),
            data: Vec::new(),
        }
    }

    /// Build from per-row `(column, value)` entries. Duplicate columns in a
    /// row are summed.
    pub fn from_rows(ncols: usize, rows: Vec<Vec<(usize, f64)>>) -> Result<Self> {
        let nrows = rows.len();
        let mut indptr = Vec::with_capacity(nrows + 1);
        let mut indices = Vec::new();
        let mut data = Vec::new();
        indptr.push(0);

        for mut row in rows {
            row.sort_by_key(|(c, _)| *c);
            let mut last: Option<usize> = None;
            for (c, v) in row {
                if c >= ncols {
                    return Err(PrepError::ShapeError {
                        expected: format!("column < {}", ncols),
                        actual: c.to_string(),
                    });
                }
                if last == Some(c) {
                    if let Some(d) = data.last_mut() {
                        *d += v;
                    }
                } else {
                    indices.push(c);
                    data.push(v);
                    last = Some(c);
                }
            }
            indptr.push(indices.len());
        }

        let mut m = Self { nrows, ncols, indptr, indices, data };
        m.prune_zeros();
        Ok(m)
    }

    /// One-hot matrix: row `i` gets a `1.0` in column `labels[i]`, or nothing.
    pub fn from_row_labels(labels: &[Option<usize>], ncols: usize) -> Result<Self> {
        let rows = labels
            .iter()
            .map(|l| l.map(|c| vec![(c, 1.0)]).unwrap_or_default())
            .collect();
        Self::from_rows(ncols, rows)
    }

    pub fn from_dense(array: &Array2<f64>) -> Self {
        let mut indptr = Vec::with_capacity(array.nrows() + 1);
        let mut indices = Vec::new();
        let mut data = Vec::new();
        indptr.push(0);
        for row in array.rows() {
            for (c, &v) in row.iter().enumerate() {
                if v != 0.0 {
                    indices.push(c);
                    data.push(v);
                }
            }
            indptr.push(indices.len());
        }
        Self {
            nrows: array.nrows(),
            ncols: array.ncols(),
            indptr,
            indices,
            data,
        }
    }

    fn prune_zeros(&mut self) {
        if !self.data.iter().any(|v| *v == 0.0) {
            return;
        }
        let mut indptr = Vec::with_capacity(self.nrows + 1);
        let mut indices = Vec::with_capacity(self.indices.len());
        let mut data = Vec::with_capacity(self.data.len());
        indptr.push(0);
        for r in 0..self.nrows {
            for k in self.indptr[r]..self.indptr[r + 1] {
                if self.data[k] != 0.0 {
                    indices.push(self.indices[k]);
                    data.push(self.data[k]);
                }
            }
            indptr.push(indices.len());
        }
        self.indptr = indptr;
        self.indices = indices;
        self.data = data;
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    pub fn nnz(&self) -> usize {
        self.data.len()
    }

    /// Non-zero entries of one row.
    pub fn row(&self, r: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        let range = self.indptr[r]..self.indptr[r + 1];
        self.indices[range.clone()]
            .iter()
            .copied()
            .zip(self.data[range].iter().copied())
    }

    pub fn get(&self, r: usize, c: usize) -> f64 {
        let range = self.indptr[r]..self.indptr[r + 1];
        match self.indices[range.clone()].binary_search(&c) {
            Ok(pos) => self.data[range.start + pos],
            Err(_) => 0.0,
        }
    }

    /// Dense copy of one column.
    pub fn column(&self, c: usize) -> Vec<f64> {
        (0..self.nrows).map(|r| self.get(r, c)).collect()
    }

    /// Keep the rows at the given positions, in order.
    pub fn select_rows(&self, rows: &[usize]) -> Self {
        let mut indptr = Vec::with_capacity(rows.len() + 1);
        let mut indices = Vec::new();
        let mut data = Vec::new();
        indptr.push(0);
        for &r in rows {
            let range = self.indptr[r]..self.indptr[r + 1];
            indices.extend_from_slice(&self.indices[range.clone()]);
            data.extend_from_slice(&self.data[range]);
            indptr.push(indices.len());
        }
        Self {
            nrows: rows.len(),
            ncols: self.ncols,
            indptr,
            indices,
            data,
        }
    }

    /// Remove every row whose mask entry is `true`.
    pub fn delete_rows(&self, mask: &[bool]) -> Self {
        let kept: Vec<usize> = (0..self.nrows).filter(|&r| !mask[r]).collect();
        self.select_rows(&kept)
    }

    /// Keep the given columns, renumbered in the given order.
    pub fn select_columns(&self, cols: &[usize]) -> Self {
        let mut remap = vec![None; self.ncols];
        for (new, &old) in cols.iter().enumerate() {
            remap[old] = Some(new);
        }
        let rows = (0..self.nrows)
            .map(|r| {
                self.row(r)
                    .filter_map(|(c, v)| remap[c].map(|nc| (nc, v)))
                    .collect()
            })
            .collect();
        // column indices are validated by construction
        Self::from_rows(cols.len(), rows).unwrap_or_else(|_| Self::zeros(self.nrows, cols.len()))
    }

    /// Drop the trailing `n` columns.
    pub fn drop_last_columns(&self, n: usize) -> Self {
        let keep: Vec<usize> = (0..self.ncols.saturating_sub(n)).collect();
        self.select_columns(&keep)
    }

    /// Multiply every row `r` by `factors[r]`.
    pub fn scale_rows(&self, factors: &[f64]) -> Self {
        let mut out = self.clone();
        for r in 0..self.nrows {
            for k in self.indptr[r]..self.indptr[r + 1] {
                out.data[k] *= factors[r];
            }
        }
        out.prune_zeros();
        out
    }

    /// Apply `f(column, value)` to every stored entry.
    pub fn map_values(&self, f: impl Fn(usize, f64) -> f64) -> Self {
        let mut out = self.clone();
        for r in 0..self.nrows {
            for k in self.indptr[r]..self.indptr[r + 1] {
                out.data[k] = f(self.indices[k], self.data[k]);
            }
        }
        out.prune_zeros();
        out
    }

    /// Horizontal concatenation.
    pub fn hstack(blocks: &[&CsrMatrix]) -> Result<Self> {
        let nrows = blocks.first().map(|b| b.nrows).unwrap_or(0);
        if let Some(bad) = blocks.iter().find(|b| b.nrows != nrows) {
            return Err(PrepError::ShapeError {
                expected: format!("{} rows", nrows),
                actual: format!("{} rows", bad.nrows),
            });
        }
        let ncols = blocks.iter().map(|b| b.ncols).sum();
        let mut indptr = Vec::with_capacity(nrows + 1);
        let mut indices = Vec::new();
        let mut data = Vec::new();
        indptr.push(0);
        for r in 0..nrows {
            let mut offset = 0;
            for b in blocks {
                for (c, v) in b.row(r) {
                    indices.push(c + offset);
                    data.push(v);
                }
                offset += b.ncols;
            }
            indptr.push(indices.len());
        }
        Ok(Self { nrows, ncols, indptr, indices, data })
    }

    pub fn to_dense(&self) -> Array2<f64> {
        let mut out = Array2::zeros((self.nrows, self.ncols));
        for r in 0..self.nrows {
            for (c, v) in self.row(r) {
                out[[r, c]] = v;
            }
        }
        out
    }

    /// Euclidean norm of every row.
    pub fn row_norms(&self) -> Vec<f64> {
        (0..self.nrows)
            .map(|r| self.row(r).map(|(_, v)| v * v).sum::<f64>().sqrt())
            .collect()
    }
}
