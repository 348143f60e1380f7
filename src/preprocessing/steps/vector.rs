//! Unfolding of JSON array columns.

use ndarray::Array2;
use serde_json::Value;

use crate::error::{PrepError, Result};
use crate::preprocessing::resources::ResourceStore;
use crate::preprocessing::step::{PreprocessingStep, StepContext};

use super::source_column;

/// Spread a vector column over `vector_length` dense columns
/// `unfold:<col>:<i>` in block `unfold_<col>`.
pub struct UnfoldVector {
    column: String,
    vector_length: usize,
    in_block: Option<String>,
}

impl UnfoldVector {
    pub fn new(column: impl Into<String>, vector_length: usize, in_block: Option<String>) -> Self {
        Self {
            column: column.into(),
            vector_length,
            in_block,
        }
    }

    fn parse_row(&self, raw: Option<&str>) -> Result<Vec<f64>> {
        let raw = raw.ok_or_else(|| {
            PrepError::DataError(format!("Invalid vector data in column '{}' - maybe empty?", self.column))
        })?;
        let parsed: Value = serde_json::from_str(raw)
            .map_err(|e| PrepError::DataError(format!("Invalid vector data in column '{}': {}", self.column, e)))?;
        let items = match parsed {
            Value::Array(items) => items,
            _ => {
                return Err(PrepError::DataError(format!(
                    "Invalid vector data in column '{}': not an array",
                    self.column
                )))
            }
        };
        if items.len() != self.vector_length {
            return Err(PrepError::DataError(format!(
                "Size mismatch between different rows when unfolding vector column '{}'. Expected: {}, found: {}",
                self.column,
                self.vector_length,
                items.len()
            )));
        }
        items
            .iter()
            .map(|x| {
                x.as_f64().ok_or_else(|| {
                    PrepError::DataError(format!("Some elements of vector column '{}' are not numbers", self.column))
                })
            })
            .collect()
    }
}

impl PreprocessingStep for UnfoldVector {
    fn name(&self) -> String {
        format!("UnfoldVector ({})", self.column)
    }

    fn init_resources(&mut self, resources: &mut ResourceStore) -> Result<()> {
        let lengths = resources.vectors_unfold()?;
        match lengths.get(&self.column) {
            Some(stored) => self.vector_length = *stored,
            None => {
                lengths.insert(self.column.clone(), self.vector_length);
            }
        }
        Ok(())
    }

    fn process(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        let rows = source_column(ctx, self.in_block.as_deref(), &self.column)?.to_text_vec();
        let mut array = Array2::zeros((rows.len(), self.vector_length));
        for (r, raw) in rows.iter().enumerate() {
            for (c, v) in self.parse_row(raw.as_deref())?.into_iter().enumerate() {
                array[[r, c]] = v;
            }
        }
        let block = format!("unfold_{}", self.column);
        let names = (0..self.vector_length).map(|i| format!("unfold:{}:{}", self.column, i)).collect();
        ctx.mapping.add_whole_block_mapping(&block, &self.column);
        ctx.mf.append_dense(&block, array, names)
    }
}
