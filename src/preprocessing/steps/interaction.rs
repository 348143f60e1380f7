//! Manual feature interactions.

use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use crate::error::{PrepError, Result};
use crate::frame::{ColumnValues, CsrMatrix};
use crate::preprocessing::collector::NA_LABEL;
use crate::preprocessing::resources::{NumNumScaling, RescaleFactors, ResourceStore};
use crate::preprocessing::step::{PreprocessingStep, StepContext};

const NUM_BLOCK: &str = "NUM_IMPUTED";
const CAT_BLOCK: &str = "CAT_IMPUTED";

fn categorical_labels(ctx: &StepContext<'_>, column: &str) -> Result<Vec<String>> {
    let values = ctx.block_or_input_column(CAT_BLOCK, column)?.to_text_vec();
    Ok(values
        .into_iter()
        .map(|v| v.unwrap_or_else(|| NA_LABEL.to_string()))
        .collect())
}

/// Product of two numeric columns, optionally standardized.
pub struct NumericalNumericalInteraction {
    out_block: String,
    column_1: String,
    column_2: String,
    scaling: NumNumScaling,
}

impl NumericalNumericalInteraction {
    pub fn new(out_block: impl Into<String>, column_1: impl Into<String>, column_2: impl Into<String>, rescale: bool) -> Self {
        let column_1 = column_1.into();
        let column_2 = column_2.into();
        Self {
            out_block: out_block.into(),
            scaling: NumNumScaling {
                column_1: column_1.clone(),
                column_2: column_2.clone(),
                rescale,
                shift: 0.0,
                inv_scale: 1.0,
            },
            column_1,
            column_2,
        }
    }

    fn output_name(&self) -> String {
        format!("{}:{}", self.column_1, self.column_2)
    }

    fn product(&self, ctx: &StepContext<'_>) -> Result<Vec<f64>> {
        let s1 = ctx.block_or_input_column(NUM_BLOCK, &self.column_1)?.to_f64_vec();
        let s2 = ctx.block_or_input_column(NUM_BLOCK, &self.column_2)?.to_f64_vec();
        Ok(s1.iter().zip(&s2).map(|(a, b)| a * b).collect())
    }
}

impl PreprocessingStep for NumericalNumericalInteraction {
    fn name(&self) -> String {
        format!("NumericalNumericalInteraction ({})", self.output_name())
    }

    fn init_resources(&mut self, resources: &mut ResourceStore) -> Result<()> {
        if let Some(stored) = resources.num_num()?.get(&self.output_name()) {
            self.scaling = stored.clone();
        }
        Ok(())
    }

    fn fit_and_process(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        if self.scaling.rescale {
            let product = self.product(ctx)?;
            let present: Vec<f64> = product.into_iter().filter(|v| !v.is_nan()).collect();
            let n = present.len() as f64;
            let mean = present.iter().sum::<f64>() / n;
            let std = (present.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
            let factors = RescaleFactors::from_scale(mean, std);
            self.scaling.shift = factors.shift;
            self.scaling.inv_scale = factors.inv_scale;
        }
        ctx.resources.num_num()?.insert(self.output_name(), self.scaling.clone());
        self.process(ctx)
    }

    fn process(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        let mut values = self.product(ctx)?;
        if self.scaling.rescale {
            let factors = RescaleFactors { shift: self.scaling.shift, inv_scale: self.scaling.inv_scale };
            values.iter_mut().for_each(|v| *v = factors.apply(*v));
        }
        let row_ids = ctx.row_ids();
        ctx.mf
            .get_df_builder(&self.out_block)
            .add_column(self.output_name(), &row_ids, ColumnValues::Numeric(values))
    }
}

/// Numeric column spread over the levels of a categorical column: one
/// sparse column per level holding the numeric value where the level occurs.
pub struct NumericalCategoricalInteraction {
    out_block: String,
    cat: String,
    num: String,
    max_features: usize,
    values: Option<Vec<String>>,
}

impl NumericalCategoricalInteraction {
    pub fn new(out_block: impl Into<String>, cat: impl Into<String>, num: impl Into<String>, max_features: usize) -> Self {
        Self {
            out_block: out_block.into(),
            cat: cat.into(),
            num: num.into(),
            max_features,
            values: None,
        }
    }
}

impl PreprocessingStep for NumericalCategoricalInteraction {
    fn name(&self) -> String {
        format!("NumericalCategoricalInteraction ({})", self.out_block)
    }

    fn init_resources(&mut self, resources: &mut ResourceStore) -> Result<()> {
        if let Some(stored) = resources.num_cat()?.get(&self.out_block) {
            self.values = Some(stored.clone());
        }
        Ok(())
    }

    fn fit_and_process(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        let labels = categorical_labels(ctx, &self.cat)?;
        let values: Vec<String> = labels
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .take(self.max_features)
            .collect();
        ctx.resources.num_cat()?.insert(self.out_block.clone(), values.clone());
        self.values = Some(values);
        self.process(ctx)
    }

    fn process(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        let values = self
            .values
            .as_ref()
            .ok_or_else(|| PrepError::not_fitted("num_cat", &self.out_block))?;
        let labels = categorical_labels(ctx, &self.cat)?;
        let numbers = ctx.block_or_input_column(NUM_BLOCK, &self.num)?.to_f64_vec();
        let table: HashMap<&str, usize> = values.iter().enumerate().map(|(i, v)| (v.as_str(), i)).collect();
        let rows = labels
            .iter()
            .zip(&numbers)
            .map(|(label, x)| match table.get(label.as_str()) {
                Some(&c) => vec![(c, *x)],
                None => Vec::new(),
            })
            .collect();
        let matrix = CsrMatrix::from_rows(values.len(), rows)?;
        let names = values
            .iter()
            .map(|v| format!("interaction:{}:{}:{}", self.num, self.cat, v))
            .collect();
        debug!(block = %self.out_block, nnz = matrix.nnz(), "Numerical x categorical interaction");
        ctx.mf.append_sparse(&self.out_block, matrix, Some(names))
    }
}

/// One sparse indicator per frequent pair of levels of two categorical columns.
pub struct CategoricalCategoricalInteraction {
    out_block: String,
    column_1: String,
    column_2: String,
    max_features: usize,
    values: Option<Vec<(String, String)>>,
}

impl CategoricalCategoricalInteraction {
    pub fn new(out_block: impl Into<String>, column_1: impl Into<String>, column_2: impl Into<String>, max_features: usize) -> Self {
        Self {
            out_block: out_block.into(),
            column_1: column_1.into(),
            column_2: column_2.into(),
            max_features,
            values: None,
        }
    }
}

impl PreprocessingStep for CategoricalCategoricalInteraction {
    fn name(&self) -> String {
        format!("CategoricalCategoricalInteraction ({})", self.out_block)
    }

    fn init_resources(&mut self, resources: &mut ResourceStore) -> Result<()> {
        if let Some(stored) = resources.cat_cat()?.get(&self.out_block) {
            self.values = Some(stored.clone());
        }
        Ok(())
    }

    fn fit_and_process(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        let s1 = categorical_labels(ctx, &self.column_1)?;
        let s2 = categorical_labels(ctx, &self.column_2)?;
        let mut counts: HashMap<(String, String), usize> = HashMap::new();
        for pair in s1.into_iter().zip(s2) {
            *counts.entry(pair).or_insert(0) += 1;
        }
        let mut pairs: Vec<((String, String), usize)> = counts.into_iter().collect();
        // count descending, then pair ascending
        pairs.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        let values: Vec<(String, String)> = pairs.into_iter().take(self.max_features).map(|(p, _)| p).collect();
        ctx.resources.cat_cat()?.insert(self.out_block.clone(), values.clone());
        self.values = Some(values);
        self.process(ctx)
    }

    fn process(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        let values = self
            .values
            .as_ref()
            .ok_or_else(|| PrepError::not_fitted("cat_cat", &self.out_block))?;
        let s1 = categorical_labels(ctx, &self.column_1)?;
        let s2 = categorical_labels(ctx, &self.column_2)?;
        let table: HashMap<(&str, &str), usize> = values
            .iter()
            .enumerate()
            .map(|(i, (a, b))| ((a.as_str(), b.as_str()), i))
            .collect();
        let codes: Vec<Option<usize>> = s1
            .iter()
            .zip(&s2)
            .map(|(a, b)| table.get(&(a.as_str(), b.as_str())).copied())
            .collect();
        let matrix = CsrMatrix::from_row_labels(&codes, values.len())?;
        let names = values
            .iter()
            .map(|(a, b)| format!("interaction:{}:{}:{}:{}", self.column_1, self.column_2, a, b))
            .collect();
        ctx.mf.append_sparse(&self.out_block, matrix, Some(names))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::InputFrame;
    use crate::preprocessing::steps::columns::FlushDfBuilder;
    use crate::preprocessing::steps::testing::Harness;

    fn text(values: &[&str]) -> ColumnValues {
        ColumnValues::Text(values.iter().map(|v| Some(v.to_string())).collect())
    }

    fn harness() -> Harness {
        Harness::new(
            InputFrame::new(vec![
                ("x".into(), ColumnValues::Numeric(vec![1.0, 2.0, 3.0, 4.0])),
                ("y".into(), ColumnValues::Numeric(vec![2.0, 2.0, 2.0, 2.0])),
                ("c".into(), text(&["b", "a", "b", "c"])),
                ("d".into(), text(&["u", "u", "u", "v"])),
            ])
            .unwrap(),
        )
    }

    #[test]
    fn test_num_num_with_rescale() {
        let mut h = harness();
        h.run(&mut NumericalNumericalInteraction::new("interaction", "x", "y", true)).unwrap();
        h.run(&mut FlushDfBuilder::new("interaction")).unwrap();
        let values = h.mf.col_as_values("interaction", "interaction:x:y").unwrap().to_f64_vec();
        assert!(values.iter().sum::<f64>().abs() < 1e-12);
        let stored = &h.resources.num_num().unwrap()["x:y"];
        assert_eq!(stored.shift, 5.0);
    }

    #[test]
    fn test_num_cat() {
        let mut h = harness();
        h.run(&mut NumericalCategoricalInteraction::new("interaction:c:x", "c", "x", 2)).unwrap();
        assert_eq!(h.mf.columns(), vec!["interaction:x:c:a", "interaction:x:c:b"]);
        let dense = h.mf.as_dense_array().unwrap();
        assert_eq!(dense.column(1).to_vec(), vec![1.0, 0.0, 3.0, 0.0]);
        assert_eq!(dense.row(3).sum(), 0.0);
    }

    #[test]
    fn test_cat_cat_top_pairs() {
        let mut h = harness();
        h.run(&mut CategoricalCategoricalInteraction::new("interaction:c:d", "c", "d", 1)).unwrap();
        assert_eq!(h.mf.columns(), vec!["interaction:c:d:b:u"]);
        assert_eq!(h.resources.cat_cat().unwrap()["interaction:c:d"], vec![("b".to_string(), "u".to_string())]);
    }

    #[test]
    fn test_replay_without_fit() {
        let mut h = harness();
        let err = h.replay(&mut CategoricalCategoricalInteraction::new("i", "c", "d", 1)).unwrap_err();
        assert!(matches!(err, PrepError::ResourceNotFitted { .. }));
    }
}
