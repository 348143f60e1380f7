//! MultiFrame: named column blocks sharing one row index.
//!
//! Blocks come in three shapes:
//! - `Dense`: an `ndarray` matrix with column names
//! - `Sparse`: a CSR matrix with optional names (`<block>:<i>` when absent)
//! - `Columns`: named typed columns, the output of a flushed builder
//!
//! Every block has a `keep` flag; blocks that are not kept are carried along
//! (and row-dropped) but never exported.

use std::collections::{HashMap, HashSet};

use ndarray::Array2;
use polars::prelude::*;
use tracing::{debug, warn};

use super::input::ColumnValues;
use super::sparse::CsrMatrix;
use crate::error::{PrepError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum BlockData {
    Dense { array: Array2<f64>, names: Vec<String> },
    Sparse { matrix: CsrMatrix, names: Option<Vec<String>> },
    Columns(Vec<(String, ColumnValues)>),
}

impl BlockData {
    pub fn nrows(&self, index_len: usize) -> usize {
        match self {
            BlockData::Dense { array, .. } => array.nrows(),
            BlockData::Sparse { matrix, .. } => matrix.nrows(),
            BlockData::Columns(cols) => cols.first().map(|(_, c)| c.len()).unwrap_or(index_len),
        }
    }

    pub fn ncols(&self) -> usize {
        match self {
            BlockData::Dense { array, .. } => array.ncols(),
            BlockData::Sparse { matrix, .. } => matrix.ncols(),
            BlockData::Columns(cols) => cols.len(),
        }
    }

    fn drop_rows(&mut self, mask: &[bool]) {
        match self {
            BlockData::Dense { array, .. } => {
                let kept: Vec<usize> = (0..array.nrows()).filter(|&r| !mask[r]).collect();
                *array = array.select(ndarray::Axis(0), &kept);
            }
            BlockData::Sparse { matrix, .. } => *matrix = matrix.delete_rows(mask),
            BlockData::Columns(cols) => {
                for (_, c) in cols.iter_mut() {
                    *c = c.drop_rows(mask);
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub name: String,
    pub data: BlockData,
    pub keep: bool,
}

impl Block {
    /// Column names, generating `<block>:<i>` for unnamed sparse blocks.
    pub fn column_names(&self) -> Vec<String> {
        match &self.data {
            BlockData::Dense { names, .. } => names.clone(),
            BlockData::Sparse { names: Some(names), .. } => names.clone(),
            BlockData::Sparse { matrix, names: None } => {
                (0..matrix.ncols()).map(|i| format!("{}:{}", self.name, i)).collect()
            }
            BlockData::Columns(cols) => cols.iter().map(|(n, _)| n.clone()).collect(),
        }
    }

    /// Numeric content of the block as a dense matrix.
    pub fn to_dense(&self) -> Result<Array2<f64>> {
        match &self.data {
            BlockData::Dense { array, .. } => Ok(array.clone()),
            BlockData::Sparse { matrix, .. } => Ok(matrix.to_dense()),
            BlockData::Columns(cols) => {
                let nrows = cols.first().map(|(_, c)| c.len()).unwrap_or(0);
                let mut out = Array2::zeros((nrows, cols.len()));
                for (j, (name, c)) in cols.iter().enumerate() {
                    match c {
                        ColumnValues::Numeric(v) => {
                            for (i, x) in v.iter().enumerate() {
                                out[[i, j]] = *x;
                            }
                        }
                        ColumnValues::Text(_) => {
                            return Err(PrepError::DataError(format!(
                                "Column {} of block {} is not numeric",
                                name, self.name
                            )))
                        }
                    }
                }
                Ok(out)
            }
        }
    }

    fn to_csr(&self) -> Result<CsrMatrix> {
        match &self.data {
            BlockData::Sparse { matrix, .. } => Ok(matrix.clone()),
            _ => Ok(CsrMatrix::from_dense(&self.to_dense()?)),
        }
    }
}

/// Collects columns in insertion order, remembering the row ids each column
/// was computed on.
#[derive(Debug, Clone, Default)]
pub struct DataFrameBuilder {
    prefix: String,
    columns: Vec<(Option<String>, Vec<usize>, ColumnValues)>,
}

impl DataFrameBuilder {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            columns: Vec::new(),
        }
    }

    pub fn add_column(&mut self, name: impl Into<String>, row_ids: &[usize], values: ColumnValues) -> Result<()> {
        self.push(Some(name.into()), row_ids, values)
    }

    /// Column named after the builder prefix alone.
    pub fn add_unnamed_column(&mut self, row_ids: &[usize], values: ColumnValues) -> Result<()> {
        self.push(None, row_ids, values)
    }

    fn push(&mut self, name: Option<String>, row_ids: &[usize], values: ColumnValues) -> Result<()> {
        if self.columns.iter().any(|(n, _, _)| *n == name) {
            return Err(PrepError::DataError(format!(
                "Column {} already added to builder {}",
                name.unwrap_or_default(),
                self.prefix
            )));
        }
        if row_ids.len() != values.len() {
            return Err(PrepError::ShapeError {
                expected: format!("{} values", row_ids.len()),
                actual: format!("{} values", values.len()),
            });
        }
        self.columns.push((name, row_ids.to_vec(), values));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    fn output_name(&self, name: &Option<String>) -> String {
        match name {
            Some(n) => format!("{}:{}", self.prefix, n),
            None => self.prefix.clone(),
        }
    }
}

/// Named blocks over one row index.
#[derive(Debug, Clone, Default)]
pub struct MultiFrame {
    index: Vec<usize>,
    blocks: Vec<Block>,
    builders: Vec<DataFrameBuilder>,
}

impl MultiFrame {
    pub fn new(index: Vec<usize>) -> Self {
        Self {
            index,
            blocks: Vec::new(),
            builders: Vec::new(),
        }
    }

    pub fn index(&self) -> &[usize] {
        &self.index
    }

    pub fn height(&self) -> usize {
        self.index.len()
    }

    fn check_new_block(&self, name: &str, nrows: usize) -> Result<()> {
        if self.has_block(name) {
            return Err(PrepError::DataError(format!("Block {} already exists in multiframe", name)));
        }
        if nrows != self.index.len() {
            return Err(PrepError::ShapeError {
                expected: format!("{} rows (index)", self.index.len()),
                actual: format!("{} rows in block {}", nrows, name),
            });
        }
        Ok(())
    }

    pub fn append_columns(&mut self, name: &str, columns: Vec<(String, ColumnValues)>, keep: bool) -> Result<()> {
        let data = BlockData::Columns(columns);
        self.check_new_block(name, data.nrows(self.index.len()))?;
        self.blocks.push(Block { name: name.to_string(), data, keep });
        Ok(())
    }

    pub fn append_dense(&mut self, name: &str, array: Array2<f64>, names: Vec<String>) -> Result<()> {
        self.check_new_block(name, array.nrows())?;
        if names.len() != array.ncols() {
            return Err(PrepError::ShapeError {
                expected: format!("{} names", array.ncols()),
                actual: format!("{} names", names.len()),
            });
        }
        self.blocks.push(Block {
            name: name.to_string(),
            data: BlockData::Dense { array, names },
            keep: true,
        });
        Ok(())
    }

    pub fn append_sparse(&mut self, name: &str, matrix: CsrMatrix, names: Option<Vec<String>>) -> Result<()> {
        self.check_new_block(name, matrix.nrows())?;
        if let Some(n) = &names {
            if n.len() != matrix.ncols() {
                return Err(PrepError::ShapeError {
                    expected: format!("{} names", matrix.ncols()),
                    actual: format!("{} names", n.len()),
                });
            }
        }
        self.blocks.push(Block {
            name: name.to_string(),
            data: BlockData::Sparse { matrix, names },
            keep: true,
        });
        Ok(())
    }

    pub fn has_block(&self, name: &str) -> bool {
        self.blocks.iter().any(|b| b.name == name)
    }

    pub fn get_block(&self, name: &str) -> Result<&Block> {
        self.blocks
            .iter()
            .find(|b| b.name == name)
            .ok_or_else(|| PrepError::BlockNotFound(name.to_string()))
    }

    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter()
    }

    fn kept_blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter().filter(|b| b.keep)
    }

    /// One column of a block, by name.
    pub fn col_as_values(&self, block: &str, col: &str) -> Result<ColumnValues> {
        let blk = self.get_block(block)?;
        let missing = || PrepError::ColumnNotFound(format!("{} in block {}", col, block));
        match &blk.data {
            BlockData::Columns(cols) => cols
                .iter()
                .find(|(n, _)| n == col)
                .map(|(_, c)| c.clone())
                .ok_or_else(missing),
            BlockData::Dense { array, names } => {
                let j = names.iter().position(|n| n == col).ok_or_else(missing)?;
                Ok(ColumnValues::Numeric(array.column(j).to_vec()))
            }
            BlockData::Sparse { matrix, .. } => {
                let j = blk.column_names().iter().position(|n| n == col).ok_or_else(missing)?;
                Ok(ColumnValues::Numeric(matrix.column(j)))
            }
        }
    }

    /// Overwrite one column of a block in place.
    pub fn replace_column(&mut self, block: &str, col: &str, values: ColumnValues) -> Result<()> {
        let height = self.index.len();
        if values.len() != height {
            return Err(PrepError::ShapeError {
                expected: format!("{} rows", height),
                actual: format!("{} rows for column {}", values.len(), col),
            });
        }
        let blk = self
            .blocks
            .iter_mut()
            .find(|b| b.name == block)
            .ok_or_else(|| PrepError::BlockNotFound(block.to_string()))?;
        let missing = || PrepError::ColumnNotFound(format!("{} in block {}", col, block));
        match &mut blk.data {
            BlockData::Columns(cols) => {
                let slot = cols.iter_mut().find(|(n, _)| n == col).ok_or_else(missing)?;
                slot.1 = values;
            }
            BlockData::Dense { array, names } => {
                let j = names.iter().position(|n| n == col).ok_or_else(missing)?;
                let values = values.to_f64_vec();
                array.column_mut(j).iter_mut().zip(values).for_each(|(x, v)| *x = v);
            }
            BlockData::Sparse { .. } => {
                return Err(PrepError::DataError(format!(
                    "Cannot overwrite column {} of sparse block {}",
                    col, block
                )))
            }
        }
        Ok(())
    }

    /// Remove the rows whose mask entry is `true` from the index and every block.
    pub fn drop_rows(&mut self, mask: &[bool]) {
        let n = mask.iter().filter(|m| **m).count();
        if n == 0 {
            return;
        }
        debug!(rows = n, "MultiFrame, dropping rows");
        self.index = self
            .index
            .iter()
            .zip(mask)
            .filter(|(_, &m)| !m)
            .map(|(i, _)| *i)
            .collect();
        for blk in self.blocks.iter_mut() {
            blk.data.drop_rows(mask);
        }
    }

    /// Exported column names.
    pub fn columns(&self) -> Vec<String> {
        self.kept_blocks().flat_map(|b| b.column_names()).collect()
    }

    /// `(rows, exported columns)`.
    pub fn shape(&self) -> (usize, usize) {
        (self.index.len(), self.kept_blocks().map(|b| b.data.ncols()).sum())
    }

    pub fn nnz(&self) -> usize {
        self.kept_blocks()
            .map(|b| match &b.data {
                BlockData::Sparse { matrix, .. } => matrix.nnz(),
                other => other.ncols() * self.index.len(),
            })
            .sum()
    }

    pub fn as_dense_array(&self) -> Result<Array2<f64>> {
        let parts = self
            .kept_blocks()
            .map(|b| b.to_dense())
            .collect::<Result<Vec<_>>>()?;
        if parts.is_empty() {
            return Ok(Array2::zeros((self.index.len(), 0)));
        }
        let views: Vec<_> = parts.iter().map(|a| a.view()).collect();
        Ok(ndarray::concatenate(ndarray::Axis(1), &views)?)
    }

    pub fn as_csr(&self) -> Result<CsrMatrix> {
        let parts = self
            .kept_blocks()
            .filter(|b| b.data.ncols() > 0)
            .map(|b| b.to_csr())
            .collect::<Result<Vec<_>>>()?;
        if parts.is_empty() {
            return Ok(CsrMatrix::zeros(self.index.len(), 0));
        }
        let refs: Vec<&CsrMatrix> = parts.iter().collect();
        CsrMatrix::hstack(&refs)
    }

    /// Export kept blocks as a polars frame, column names as in `columns()`.
    pub fn as_dataframe(&self) -> Result<DataFrame> {
        let mut cols: Vec<Column> = Vec::new();
        for blk in self.kept_blocks() {
            match &blk.data {
                BlockData::Columns(values) => {
                    for (name, c) in values {
                        let col: Column = match c {
                            ColumnValues::Numeric(v) => Series::new(name.as_str().into(), v.clone()).into(),
                            ColumnValues::Text(v) => {
                                let v: Vec<Option<&str>> = v.iter().map(|x| x.as_deref()).collect();
                                Series::new(name.as_str().into(), v).into()
                            }
                        };
                        cols.push(col);
                    }
                }
                _ => {
                    let dense = blk.to_dense()?;
                    for (j, name) in blk.column_names().iter().enumerate() {
                        cols.push(Series::new(name.as_str().into(), dense.column(j).to_vec()).into());
                    }
                }
            }
        }
        Ok(DataFrame::new(cols)?)
    }

    /// Keep only the named columns in every block.
    pub fn select_columns(&mut self, names: &[String]) {
        let wanted: HashSet<&str> = names.iter().map(|s| s.as_str()).collect();
        for blk in self.blocks.iter_mut() {
            let all_names = blk.column_names();
            let positions: Vec<usize> = all_names
                .iter()
                .enumerate()
                .filter(|(_, n)| wanted.contains(n.as_str()))
                .map(|(i, _)| i)
                .collect();
            let kept_names: Vec<String> = positions.iter().map(|&i| all_names[i].clone()).collect();
            match &mut blk.data {
                BlockData::Dense { array, names } => {
                    *array = array.select(ndarray::Axis(1), &positions);
                    *names = kept_names;
                }
                BlockData::Sparse { matrix, names } => {
                    *matrix = matrix.select_columns(&positions);
                    *names = Some(kept_names);
                }
                BlockData::Columns(cols) => {
                    // deterministic lexicographic order for column blocks
                    let mut kept: Vec<(String, ColumnValues)> =
                        cols.drain(..).filter(|(n, _)| wanted.contains(n.as_str())).collect();
                    kept.sort_by(|a, b| a.0.cmp(&b.0));
                    *cols = kept;
                }
            }
        }
    }

    pub fn get_df_builder(&mut self, name: &str) -> &mut DataFrameBuilder {
        let pos = match self.builders.iter().position(|b| b.prefix == name) {
            Some(p) => p,
            None => {
                self.builders.push(DataFrameBuilder::new(name));
                self.builders.len() - 1
            }
        };
        &mut self.builders[pos]
    }

    pub fn has_df_builder(&self, name: &str) -> bool {
        self.builders.iter().any(|b| b.prefix == name)
    }

    /// Move a builder into a `Columns` block aligned on the frame index.
    ///
    /// Builder rows that are no longer in the frame are ignored. Frame rows
    /// that no builder column covers are dropped from the frame; their ids are
    /// returned so the caller can drop them from the input too.
    pub fn flush_df_builder(&mut self, name: &str) -> Result<Vec<usize>> {
        let pos = self
            .builders
            .iter()
            .position(|b| b.prefix == name)
            .ok_or_else(|| PrepError::BlockNotFound(format!("builder {}", name)))?;
        let builder = self.builders.remove(pos);

        if builder.is_empty() {
            self.append_columns(name, Vec::new(), true)?;
            return Ok(Vec::new());
        }

        let covered: HashSet<usize> = builder
            .columns
            .iter()
            .flat_map(|(_, ids, _)| ids.iter().copied())
            .collect();
        let index_set: HashSet<usize> = self.index.iter().copied().collect();
        let stale = covered.difference(&index_set).count();
        if stale > 0 {
            warn!(block = name, rows = stale, "Builder rows absent from the frame index are ignored");
        }

        let mask: Vec<bool> = self.index.iter().map(|i| !covered.contains(i)).collect();
        let dropped: Vec<usize> = self
            .index
            .iter()
            .zip(&mask)
            .filter(|(_, &m)| m)
            .map(|(i, _)| *i)
            .collect();
        if !dropped.is_empty() {
            warn!(block = name, rows = dropped.len(), "Frame rows missing from the builder are dropped");
            self.drop_rows(&mask);
        }

        let mut columns = Vec::with_capacity(builder.columns.len());
        for (col_name, ids, values) in &builder.columns {
            let positions: HashMap<usize, usize> = ids.iter().enumerate().map(|(p, id)| (*id, p)).collect();
            let aligned = match values {
                ColumnValues::Numeric(v) => ColumnValues::Numeric(
                    self.index
                        .iter()
                        .map(|id| positions.get(id).map(|&p| v[p]).unwrap_or(f64::NAN))
                        .collect(),
                ),
                ColumnValues::Text(v) => ColumnValues::Text(
                    self.index
                        .iter()
                        .map(|id| positions.get(id).and_then(|&p| v[p].clone()))
                        .collect(),
                ),
            };
            columns.push((builder.output_name(col_name), aligned));
        }
        self.append_columns(name, columns, true)?;
        Ok(dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn frame() -> MultiFrame {
        let mut mf = MultiFrame::new(vec![0, 1, 2]);
        mf.append_dense("num", array![[1.0], [2.0], [3.0]], vec!["a".into()]).unwrap();
        let dummies = CsrMatrix::from_row_labels(&[Some(0), Some(1), None], 2).unwrap();
        mf.append_sparse("dummy:c", dummies, None).unwrap();
        mf
    }

    #[test]
    fn test_columns_and_shape() {
        let mf = frame();
        assert_eq!(mf.columns(), vec!["a", "dummy:c:0", "dummy:c:1"]);
        assert_eq!(mf.shape(), (3, 3));
        assert_eq!(mf.nnz(), 3 + 2);
    }

    #[test]
    fn test_duplicate_and_misaligned_blocks() {
        let mut mf = frame();
        assert!(mf.append_dense("num", array![[1.0], [2.0], [3.0]], vec!["b".into()]).is_err());
        assert!(mf.append_dense("short", array![[1.0]], vec!["b".into()]).is_err());
    }

    #[test]
    fn test_drop_rows_all_blocks() {
        let mut mf = frame();
        mf.drop_rows(&[true, false, false]);
        assert_eq!(mf.index(), &[1, 2]);
        let dense = mf.as_dense_array().unwrap();
        assert_eq!(dense, array![[2.0, 0.0, 1.0], [3.0, 0.0, 0.0]]);
    }

    #[test]
    fn test_hidden_blocks_not_exported() {
        let mut mf = frame();
        mf.append_columns("raw", vec![("x".into(), ColumnValues::Numeric(vec![0.0; 3]))], false)
            .unwrap();
        assert_eq!(mf.shape(), (3, 3));
        assert!(mf.col_as_values("raw", "x").is_ok());
    }

    #[test]
    fn test_flush_builder_aligns_on_row_ids() {
        let mut mf = frame();
        mf.drop_rows(&[false, true, false]);
        let builder = mf.get_df_builder("flags");
        builder
            .add_column("a:not_missing", &[0, 1, 2], ColumnValues::Numeric(vec![1.0, 0.0, 1.0]))
            .unwrap();
        let dropped = mf.flush_df_builder("flags").unwrap();
        assert!(dropped.is_empty());
        assert!(!mf.has_df_builder("flags"));
        assert_eq!(
            mf.col_as_values("flags", "flags:a:not_missing").unwrap(),
            ColumnValues::Numeric(vec![1.0, 1.0])
        );
    }

    #[test]
    fn test_flush_drops_uncovered_rows() {
        let mut mf = frame();
        mf.get_df_builder("b")
            .add_column("x", &[0, 2], ColumnValues::Numeric(vec![5.0, 6.0]))
            .unwrap();
        let dropped = mf.flush_df_builder("b").unwrap();
        assert_eq!(dropped, vec![1]);
        assert_eq!(mf.index(), &[0, 2]);
    }

    #[test]
    fn test_select_columns_sorts_column_blocks() {
        let mut mf = MultiFrame::new(vec![0]);
        mf.append_columns(
            "cols",
            vec![
                ("z".into(), ColumnValues::Numeric(vec![1.0])),
                ("b".into(), ColumnValues::Numeric(vec![2.0])),
                ("m".into(), ColumnValues::Numeric(vec![3.0])),
            ],
            true,
        )
        .unwrap();
        mf.select_columns(&["z".to_string(), "b".to_string()]);
        assert_eq!(mf.columns(), vec!["b", "z"]);
    }

    #[test]
    fn test_replace_column() {
        let mut mf = frame();
        mf.replace_column("num", "a", ColumnValues::Numeric(vec![0.0, 0.5, 1.0])).unwrap();
        assert_eq!(mf.col_as_values("num", "a").unwrap(), ColumnValues::Numeric(vec![0.0, 0.5, 1.0]));
        assert!(mf.replace_column("dummy:c", "dummy:c:0", ColumnValues::Numeric(vec![0.0; 3])).is_err());
        assert!(mf.replace_column("num", "a", ColumnValues::Numeric(vec![0.0])).is_err());
    }

    #[test]
    fn test_text_columns_fail_dense_export() {
        let mut mf = MultiFrame::new(vec![0]);
        mf.append_columns("t", vec![("x".into(), ColumnValues::Text(vec![Some("a".into())]))], true)
            .unwrap();
        assert!(mf.as_dense_array().is_err());
        assert_eq!(mf.as_dataframe().unwrap().width(), 1);
    }
}
