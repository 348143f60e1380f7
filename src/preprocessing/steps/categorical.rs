//! One-hot encoding and feature hashing of categorical columns.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::frame::CsrMatrix;
use crate::preprocessing::collector::NA_LABEL;
use crate::preprocessing::hashing::hash_tokens;
use crate::preprocessing::resources::ResourceStore;
use crate::preprocessing::step::{PreprocessingStep, StepContext};

use super::{append_sparse_with_prefix, source_column};

const OTHERS_LABEL: &str = "__Others__";

/// Vocabulary of a dummified column.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DummyLevels {
    pub levels: Vec<String>,
    /// Unknown values go to an `__Others__` column instead of an empty row.
    pub with_others: bool,
    /// Missing values go to an `N/A` column instead of an empty row.
    pub with_na: bool,
}

impl DummyLevels {
    pub fn new(levels: Vec<String>, with_na: bool, with_others: bool) -> Self {
        Self { levels, with_others, with_na }
    }

    pub fn width(&self) -> usize {
        self.levels.len() + usize::from(self.with_na) + usize::from(self.with_others)
    }

    /// Output names for `column`, in matrix order.
    pub fn names(&self, column: &str) -> Vec<String> {
        let mut names: Vec<String> = self.levels.iter().map(|v| format!("dummy:{}:{}", column, v)).collect();
        if self.with_na {
            names.push(format!("dummy:{}:{}", column, NA_LABEL));
        }
        if self.with_others {
            names.push(format!("dummy:{}:{}", column, OTHERS_LABEL));
        }
        names
    }

    /// One-hot matrix of `labels` against the levels. Rows with no column
    /// stay empty.
    pub fn encode(&self, labels: &[Option<String>]) -> Result<CsrMatrix> {
        let table: HashMap<&str, usize> = self.levels.iter().enumerate().map(|(i, v)| (v.as_str(), i)).collect();
        let na_col = self.with_na.then_some(self.levels.len());
        let others_col = self.with_others.then(|| self.levels.len() + usize::from(self.with_na));
        let codes: Vec<Option<usize>> = labels
            .iter()
            .map(|l| match l {
                None => na_col,
                Some(v) => table.get(v.as_str()).copied().or(others_col),
            })
            .collect();
        CsrMatrix::from_row_labels(&codes, self.width())
    }
}

/// Sparse one-hot block `dummy:<col>`.
pub struct FastSparseDummify {
    input_block: Option<String>,
    column: String,
    levels: DummyLevels,
}

impl FastSparseDummify {
    pub fn new(input_block: Option<String>, column: impl Into<String>, levels: DummyLevels) -> Self {
        Self {
            input_block,
            column: column.into(),
            levels,
        }
    }
}

impl PreprocessingStep for FastSparseDummify {
    fn name(&self) -> String {
        format!("FastSparseDummify ({})", self.column)
    }

    fn init_resources(&mut self, resources: &mut ResourceStore) -> Result<()> {
        let dummies = resources.dummies()?;
        match dummies.get(&self.column) {
            Some(stored) => self.levels = stored.clone(),
            None => {
                dummies.insert(self.column.clone(), self.levels.clone());
            }
        }
        Ok(())
    }

    fn process(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        let labels = source_column(ctx, self.input_block.as_deref(), &self.column)?.to_text_vec();
        let matrix = self.levels.encode(&labels)?;
        debug!(
            column = %self.column,
            rows = matrix.nrows(),
            cols = matrix.ncols(),
            nnz = matrix.nnz(),
            "Dummifier: append a sparse block"
        );
        let names = self.levels.names(&self.column);
        append_sparse_with_prefix(ctx, "dummy:", &self.column, matrix, Some(names))
    }
}

/// Hashing trick on categories, block `hashing:<col>` without names.
pub struct CategoricalFeatureHashing {
    input_block: Option<String>,
    column: String,
    hash_whole_categories: bool,
    n_features: usize,
}

impl CategoricalFeatureHashing {
    pub const DEFAULT_N_FEATURES: usize = 1 << 20;

    pub fn new(input_block: Option<String>, column: impl Into<String>, hash_whole_categories: bool, n_features: usize) -> Self {
        Self {
            input_block,
            column: column.into(),
            hash_whole_categories,
            n_features: n_features.max(1),
        }
    }
}

impl PreprocessingStep for CategoricalFeatureHashing {
    fn name(&self) -> String {
        format!("CategoricalFeatureHashing ({})", self.column)
    }

    fn process(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        let labels = source_column(ctx, self.input_block.as_deref(), &self.column)?.to_text_vec();
        let rows = labels
            .iter()
            .map(|label| match label {
                None => Vec::new(),
                Some(v) if self.hash_whole_categories => hash_tokens([v.as_str()], self.n_features),
                Some(v) => {
                    let chars: Vec<String> = v.chars().map(String::from).collect();
                    hash_tokens(chars.iter().map(|c| c.as_str()), self.n_features)
                }
            })
            .collect();
        let matrix = CsrMatrix::from_rows(self.n_features, rows)?;
        append_sparse_with_prefix(ctx, "hashing:", &self.column, matrix, None)
    }
}
