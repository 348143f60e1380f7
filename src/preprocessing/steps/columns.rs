//! Steps that move input columns into blocks.

use tracing::debug;

use crate::error::{PrepError, Result};
use crate::frame::ColumnValues;
use crate::preprocessing::collector::ImputeValue;
use crate::preprocessing::resources::ResourceStore;
use crate::preprocessing::step::{PreprocessingStep, StepContext};

use super::add_column_to_builder;

/// Move a builder into its block, if anything created it.
pub struct FlushDfBuilder {
    block: String,
}

impl FlushDfBuilder {
    pub fn new(block: impl Into<String>) -> Self {
        Self { block: block.into() }
    }
}

impl PreprocessingStep for FlushDfBuilder {
    fn name(&self) -> String {
        format!("FlushDfBuilder ({})", self.block)
    }

    fn process(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        if ctx.mf.has_df_builder(&self.block) {
            ctx.flush(&self.block)?;
        }
        Ok(())
    }
}

/// Copy input columns as they are into one block.
pub struct CopyMultipleColumnsFromInput {
    columns: Vec<String>,
    block: String,
}

impl CopyMultipleColumnsFromInput {
    pub fn new(columns: Vec<String>, block: impl Into<String>) -> Self {
        Self {
            columns,
            block: block.into(),
        }
    }
}

impl PreprocessingStep for CopyMultipleColumnsFromInput {
    fn name(&self) -> String {
        format!("CopyMultipleColumnsFromInput ({})", self.block)
    }

    fn process(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        let columns = self
            .columns
            .iter()
            .map(|c| Ok((c.clone(), ctx.input.column(c)?.clone())))
            .collect::<Result<Vec<_>>>()?;
        ctx.mf.append_columns(&self.block, columns, true)
    }
}

/// Fill missing values of several input columns into one block.
/// A `None` impute value copies the column unchanged.
pub struct MultipleImputeMissingFromInput {
    impute_map: Vec<(String, Option<ImputeValue>)>,
    block: String,
    keep_block: bool,
    as_categorical: bool,
}

impl MultipleImputeMissingFromInput {
    pub fn new(
        impute_map: Vec<(String, Option<ImputeValue>)>,
        block: impl Into<String>,
        keep_block: bool,
        as_categorical: bool,
    ) -> Self {
        Self {
            impute_map,
            block: block.into(),
            keep_block,
            as_categorical,
        }
    }

    fn impute(&self, column: &str, values: &ColumnValues, with: &Option<ImputeValue>) -> Result<ColumnValues> {
        if self.as_categorical {
            let mut labels = values.to_text_vec();
            if let Some(with) = with {
                let fill = with.as_text();
                labels.iter_mut().filter(|l| l.is_none()).for_each(|l| *l = Some(fill.clone()));
            }
            return Ok(ColumnValues::Text(labels));
        }
        let mut numbers = values.to_f64_vec();
        match with {
            Some(ImputeValue::Number(fill)) => numbers.iter_mut().filter(|v| v.is_nan()).for_each(|v| *v = *fill),
            Some(ImputeValue::Text(s)) => {
                return Err(PrepError::ConfigError(format!(
                    "Cannot impute numeric column {} with {}",
                    column, s
                )))
            }
            None => {}
        }
        Ok(ColumnValues::Numeric(numbers))
    }
}

impl PreprocessingStep for MultipleImputeMissingFromInput {
    fn name(&self) -> String {
        format!("MultipleImputeMissingFromInput ({})", self.block)
    }

    fn init_resources(&mut self, resources: &mut ResourceStore) -> Result<()> {
        let imputed = resources.imputed()?;
        for (column, value) in &self.impute_map {
            if self.as_categorical {
                imputed.register_categorical(column, value.as_ref().map(|v| v.as_text()));
            } else {
                let number = match value {
                    Some(ImputeValue::Number(v)) => Some(*v),
                    _ => None,
                };
                imputed.register_numeric(column, number);
            }
        }
        Ok(())
    }

    fn process(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        if self.impute_map.is_empty() {
            return Ok(());
        }
        debug!(block = %self.block, columns = self.impute_map.len(), "Imputing missing values");
        let columns = self
            .impute_map
            .iter()
            .map(|(column, with)| Ok((column.clone(), self.impute(column, ctx.input.column(column)?, with)?)))
            .collect::<Result<Vec<_>>>()?;
        ctx.mf.append_columns(&self.block, columns, self.keep_block)
    }
}

/// Indicator column: 1 when the input value is present.
pub struct FlagMissingValue {
    feature: String,
    block: String,
}

impl FlagMissingValue {
    pub fn new(feature: impl Into<String>, block: impl Into<String>) -> Self {
        Self {
            feature: feature.into(),
            block: block.into(),
        }
    }
}

impl PreprocessingStep for FlagMissingValue {
    fn name(&self) -> String {
        format!("FlagMissingValue ({})", self.feature)
    }

    fn init_resources(&mut self, resources: &mut ResourceStore) -> Result<()> {
        let output_name = format!("{}:{}:not_missing", self.block, self.feature);
        resources.flagged()?.register(&self.feature, &output_name);
        Ok(())
    }

    fn process(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        let present: Vec<f64> = ctx
            .input
            .column(&self.feature)?
            .missing_mask()
            .into_iter()
            .map(|m| if m { 0.0 } else { 1.0 })
            .collect();
        let row_ids = ctx.input.index().to_vec();
        add_column_to_builder(
            ctx,
            &self.block,
            &format!("{}:not_missing", self.feature),
            &self.feature,
            &row_ids,
            ColumnValues::Numeric(present),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::InputFrame;
    use crate::preprocessing::steps::testing::Harness;

    fn input() -> InputFrame {
        InputFrame::new(vec![
            ("n".into(), ColumnValues::Numeric(vec![1.0, f64::NAN, 3.0])),
            ("c".into(), ColumnValues::Text(vec![None, Some("a".into()), Some("b".into())])),
        ])
        .unwrap()
    }

    #[test]
    fn test_numeric_impute_and_copy() {
        let mut h = Harness::new(input());
        let mut step = MultipleImputeMissingFromInput::new(
            vec![("n".into(), Some(ImputeValue::Number(2.0)))],
            "NUM_IMPUTED",
            true,
            false,
        );
        h.run(&mut step).unwrap();
        assert_eq!(
            h.mf.col_as_values("NUM_IMPUTED", "n").unwrap(),
            ColumnValues::Numeric(vec![1.0, 2.0, 3.0])
        );
        assert_eq!(h.resources.imputed().unwrap().num_values, vec![Some(2.0)]);

        let mut h = Harness::new(input());
        let mut copy = MultipleImputeMissingFromInput::new(vec![("n".into(), None)], "NUM_IMPUTED", true, false);
        h.run(&mut copy).unwrap();
        assert!(h.mf.col_as_values("NUM_IMPUTED", "n").unwrap().is_missing(1));
    }

    #[test]
    fn test_categorical_impute_hidden_block() {
        let mut h = Harness::new(input());
        let mut step = MultipleImputeMissingFromInput::new(
            vec![("c".into(), Some(ImputeValue::Text("NULL_Value".into())))],
            "CAT_IMPUTED",
            false,
            true,
        );
        h.run(&mut step).unwrap();
        assert_eq!(h.mf.shape(), (3, 0));
        assert_eq!(
            h.mf.col_as_values("CAT_IMPUTED", "c").unwrap().as_text(0).as_deref(),
            Some("NULL_Value")
        );
    }

    #[test]
    fn test_flag_missing_then_flush() {
        let mut h = Harness::new(input());
        h.run(&mut FlagMissingValue::new("n", "num_flagonly")).unwrap();
        h.run(&mut FlushDfBuilder::new("num_flagonly")).unwrap();
        assert_eq!(h.mf.columns(), vec!["num_flagonly:n:not_missing"]);
        assert_eq!(
            h.mf.col_as_values("num_flagonly", "num_flagonly:n:not_missing").unwrap(),
            ColumnValues::Numeric(vec![1.0, 0.0, 1.0])
        );
        assert_eq!(h.mapping.per_column_original("num_flagonly", "num_flagonly:n:not_missing"), "n");
        // nothing left to flush
        h.run(&mut FlushDfBuilder::new("num_flagonly")).unwrap();
    }

    #[test]
    fn test_copy_columns() {
        let mut h = Harness::new(input());
        h.run(&mut CopyMultipleColumnsFromInput::new(vec!["c".into(), "n".into()], "CAT_COPIED"))
            .unwrap();
        assert_eq!(h.mf.columns(), vec!["c", "n"]);
    }
}
