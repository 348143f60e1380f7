//! Row dropping, side channels and output plumbing.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, warn};

use crate::error::{PrepError, Result};
use crate::frame::{BlockData, ColumnValues};
use crate::preprocessing::output::{MlAssertion, MlAssertionParams, SideSeries, SpecialOutput};
use crate::preprocessing::resources::ResourceStore;
use crate::preprocessing::step::{PreprocessingStep, StepContext};

/// Drop the rows where one input column is missing.
pub struct SingleColumnDropNaRows {
    column: String,
}

impl SingleColumnDropNaRows {
    pub fn new(column: impl Into<String>) -> Self {
        Self { column: column.into() }
    }
}

impl PreprocessingStep for SingleColumnDropNaRows {
    fn name(&self) -> String {
        format!("SingleColumnDropNaRows ({})", self.column)
    }

    fn init_resources(&mut self, resources: &mut ResourceStore) -> Result<()> {
        resources.drop_rows()?.register(&self.column);
        Ok(())
    }

    fn process(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        let mask = ctx.input.column(&self.column)?.missing_mask();
        let n = mask.iter().filter(|m| **m).count();
        debug!(column = %self.column, rows = n, "Deleting rows with missing values");
        ctx.drop_rows(&mask);
        info!(rows = ctx.input.height(), "Input after single column drop");
        Ok(())
    }
}

/// Drop the rows holding a missing value in any dense or column block.
/// Sparse blocks never hold missing values.
pub struct DropNaRows;

impl PreprocessingStep for DropNaRows {
    fn name(&self) -> String {
        "DropNaRows".to_string()
    }

    fn process(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        let mut mask = vec![false; ctx.mf.height()];
        for block in ctx.mf.blocks() {
            match &block.data {
                BlockData::Dense { array, .. } => {
                    for (r, row) in array.rows().into_iter().enumerate() {
                        mask[r] |= row.iter().any(|v| v.is_nan());
                    }
                }
                BlockData::Columns(cols) => {
                    for (_, c) in cols {
                        for (r, m) in c.missing_mask().into_iter().enumerate() {
                            mask[r] |= m;
                        }
                    }
                }
                BlockData::Sparse { .. } => {}
            }
        }
        debug!(rows = mask.iter().filter(|m| **m).count(), "Deleting rows with missing values");
        ctx.drop_rows(&mask);
        Ok(())
    }
}

/// Drop the rows where one of the selected side channels is missing.
pub struct SpecialOutputsDropNaRows {
    outputs: Vec<SpecialOutput>,
    allow_empty_mf: bool,
}

impl SpecialOutputsDropNaRows {
    pub fn new(outputs: Vec<SpecialOutput>, allow_empty_mf: bool) -> Self {
        Self { outputs, allow_empty_mf }
    }

    pub fn no_target(allow_empty_mf: bool) -> Self {
        Self::new(vec![SpecialOutput::Target], allow_empty_mf)
    }

    pub fn no_target_or_no_weight(allow_empty_mf: bool) -> Self {
        Self::new(vec![SpecialOutput::Target, SpecialOutput::Weight], allow_empty_mf)
    }

    pub fn no_target_or_no_prediction(allow_empty_mf: bool, has_probas: bool) -> Self {
        let mut outputs = vec![SpecialOutput::Target, SpecialOutput::Prediction];
        if has_probas {
            outputs.push(SpecialOutput::Probas);
        }
        Self::new(outputs, allow_empty_mf)
    }

    pub fn no_target_or_no_weight_or_no_prediction(allow_empty_mf: bool, has_probas: bool) -> Self {
        let mut outputs = vec![SpecialOutput::Target, SpecialOutput::Weight, SpecialOutput::Prediction];
        if has_probas {
            outputs.push(SpecialOutput::Probas);
        }
        Self::new(outputs, allow_empty_mf)
    }

    fn names(&self) -> Vec<&'static str> {
        self.outputs.iter().map(|o| o.name()).collect()
    }
}

impl PreprocessingStep for SpecialOutputsDropNaRows {
    fn name(&self) -> String {
        format!("SpecialOutputsDropNaRows ({})", self.names().join(", "))
    }

    fn process(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        let mut bad: BTreeSet<usize> = BTreeSet::new();
        for which in &self.outputs {
            match which {
                SpecialOutput::Probas => {
                    let probas = ctx.output.probas.as_ref().ok_or_else(|| {
                        PrepError::ConfigError("Probability columns were not extracted".to_string())
                    })?;
                    for (_, col) in probas.columns() {
                        for (id, m) in probas.index().iter().zip(col.missing_mask()) {
                            if m {
                                bad.insert(*id);
                            }
                        }
                    }
                }
                other => {
                    let side = ctx.output.side(*other).ok_or_else(|| {
                        PrepError::ConfigError(format!("Output {} was not extracted", other.name()))
                    })?;
                    for (id, m) in side.index.iter().zip(side.missing_mask()) {
                        if m {
                            bad.insert(*id);
                        }
                    }
                }
            }
        }
        debug!(rows = bad.len(), outputs = ?self.names(), "Deleting rows because an output is missing");

        for which in &self.outputs {
            match which {
                SpecialOutput::Probas => {
                    if let Some(p) = ctx.output.probas.as_mut() {
                        let ids: Vec<usize> = bad.iter().copied().collect();
                        p.drop_row_ids(&ids);
                    }
                }
                other => {
                    if let Some(side) = ctx.output.side_mut(*other) {
                        let mask: Vec<bool> = side.index.iter().map(|id| bad.contains(id)).collect();
                        side.drop_rows(&mask);
                    }
                }
            }
        }

        let rows_before = ctx.mf.height();
        let mask: Vec<bool> = ctx.mf.index().iter().map(|id| bad.contains(id)).collect();
        ctx.drop_rows(&mask);
        if ctx.mf.height() == 0 && (!self.allow_empty_mf || rows_before > 0) {
            return Err(PrepError::DroppedMultiframe(format!(
                "{:?} values all empty or with unknown classes (you may need to recompute the training set)",
                self.names()
            )));
        }
        debug!(rows = ctx.mf.height(), "Frame after dropping rows without outputs");
        Ok(())
    }
}

/// Copy an input column to a side channel, mapping its labels through
/// `values_map` when one is given.
pub struct RemapValueToOutput {
    column: String,
    output: SpecialOutput,
    values_map: Option<BTreeMap<String, i64>>,
}

impl RemapValueToOutput {
    pub fn new(column: impl Into<String>, output: SpecialOutput, values_map: Option<BTreeMap<String, i64>>) -> Self {
        Self {
            column: column.into(),
            output,
            values_map,
        }
    }
}

impl PreprocessingStep for RemapValueToOutput {
    fn name(&self) -> String {
        format!("RemapValueToOutput ({} -> {})", self.column, self.output.name())
    }

    fn process(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        let raw = ctx.input.column(&self.column)?;
        let values = match &self.values_map {
            Some(map) if !map.is_empty() => {
                let mapped: Vec<f64> = (0..raw.len())
                    .map(|i| {
                        raw.as_text(i)
                            .and_then(|label| map.get(&label).map(|v| *v as f64))
                            .unwrap_or(f64::NAN)
                    })
                    .collect();
                let nulls = mapped.iter().filter(|v| v.is_nan()).count();
                if nulls > 0 {
                    warn!(column = %self.column, nulls, "Found nulls in remapped column");
                }
                ColumnValues::Numeric(mapped)
            }
            _ => raw.clone(),
        };

        if self.output == SpecialOutput::Weight {
            let weights = values.to_f64_vec();
            if weights.iter().any(|w| !w.is_nan() && *w <= 0.0) {
                return Err(PrepError::DataError(format!(
                    "Sample weight column {} contains non-positive values",
                    self.column
                )));
            }
        }

        let series = SideSeries::new(ctx.input.index().to_vec(), values)?;
        match self.output {
            SpecialOutput::Target => ctx.output.target = Some(series),
            SpecialOutput::Weight => ctx.output.weight = Some(series),
            SpecialOutput::Prediction => ctx.output.prediction = Some(series),
            SpecialOutput::Probas => {
                return Err(PrepError::ConfigError(
                    "Probabilities are extracted with OutputRawColumns".to_string(),
                ))
            }
        }
        Ok(())
    }
}

/// Copy raw input columns to the probabilities output.
pub struct OutputRawColumns {
    columns: Vec<String>,
}

impl OutputRawColumns {
    pub fn new(columns: Vec<String>) -> Self {
        Self { columns }
    }
}

impl PreprocessingStep for OutputRawColumns {
    fn name(&self) -> String {
        format!("OutputRawColumns ({})", self.columns.join(", "))
    }

    fn process(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        ctx.output.probas = Some(ctx.input.subset(&self.columns)?);
        Ok(())
    }
}

/// Restrict a side channel to the rows of the current frame.
pub struct RealignSideOutput {
    output: SpecialOutput,
}

impl RealignSideOutput {
    pub fn target() -> Self {
        Self { output: SpecialOutput::Target }
    }

    pub fn weight() -> Self {
        Self { output: SpecialOutput::Weight }
    }
}

impl PreprocessingStep for RealignSideOutput {
    fn name(&self) -> String {
        format!("Realign ({})", self.output.name())
    }

    fn process(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        let index = ctx.mf.index().to_vec();
        let side = ctx
            .output
            .side_mut(self.output)
            .ok_or_else(|| PrepError::ConfigError(format!("Output {} was not extracted", self.output.name())))?;
        debug!(output = self.output.name(), before = side.len(), after = index.len(), "Realigning side output");
        *side = side.realign(&index)?;
        Ok(())
    }
}

fn is_truthy(values: &ColumnValues, i: usize) -> bool {
    match values {
        ColumnValues::Numeric(v) => !v[i].is_nan() && v[i] != 0.0,
        ColumnValues::Text(v) => matches!(v[i].as_deref(), Some("true") | Some("True") | Some("1")),
    }
}

/// Count the rows each assertion applies to, before any row is dropped.
pub struct ExtractAssertionMasksNbInitialRows {
    assertions: Option<Vec<MlAssertionParams>>,
}

impl ExtractAssertionMasksNbInitialRows {
    pub fn new(assertions: Option<Vec<MlAssertionParams>>) -> Self {
        Self { assertions }
    }
}

impl PreprocessingStep for ExtractAssertionMasksNbInitialRows {
    fn name(&self) -> String {
        "ExtractAssertionMasksNbInitialRows".to_string()
    }

    fn process(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        let Some(assertions) = &self.assertions else {
            return Ok(());
        };
        let mut found = Vec::new();
        for params in assertions {
            let Some(mask) = ctx.input.get_column(&params.mask_column()) else {
                debug!(assertion = %params.name, "Assertion column not found, skipping computation");
                continue;
            };
            let nb_initial_rows = (0..mask.len()).filter(|&i| is_truthy(mask, i)).count();
            found.push(MlAssertion {
                params: params.clone(),
                nb_initial_rows,
                mask: None,
            });
        }
        if !found.is_empty() {
            ctx.output.assertions = Some(found);
        }
        Ok(())
    }
}

/// Attach the surviving rows' assertion masks.
pub struct ExtractAssertionMasks {
    assertions: Option<Vec<MlAssertionParams>>,
}

impl ExtractAssertionMasks {
    pub fn new(assertions: Option<Vec<MlAssertionParams>>) -> Self {
        Self { assertions }
    }
}

impl PreprocessingStep for ExtractAssertionMasks {
    fn name(&self) -> String {
        "ExtractAssertionMasks".to_string()
    }

    fn process(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        let Some(assertions) = &self.assertions else {
            return Ok(());
        };
        for params in assertions {
            let Some(column) = ctx.input.get_column(&params.mask_column()) else {
                debug!(assertion = %params.name, "Assertion column not found, skipping computation");
                continue;
            };
            let mask: Vec<f64> = (0..column.len())
                .map(|i| if is_truthy(column, i) { 1.0 } else { 0.0 })
                .collect();
            let series = SideSeries::new(ctx.input.index().to_vec(), ColumnValues::Numeric(mask))?;
            if let Some(slot) = ctx
                .output
                .assertions
                .as_mut()
                .and_then(|list| list.iter_mut().find(|a| a.params.name == params.name))
            {
                slot.mask = Some(series);
            }
        }
        Ok(())
    }
}

/// Store the current frame under a name and continue on a fresh frame.
pub struct EmitCurrentMfAsResult {
    output_name: String,
}

impl EmitCurrentMfAsResult {
    pub fn new(output_name: impl Into<String>) -> Self {
        Self {
            output_name: output_name.into(),
        }
    }
}

impl PreprocessingStep for EmitCurrentMfAsResult {
    fn name(&self) -> String {
        format!("EmitCurrentMfAsResult ({})", self.output_name)
    }

    fn process(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        let emitted = ctx.restart_frame();
        ctx.output.frames.insert(self.output_name.clone(), emitted);
        ctx.output.unprocessed = Some(ctx.input.clone());
        Ok(())
    }
}

/// Alias one output frame under another name.
pub struct AddReferenceInOutput {
    from: String,
    to: String,
}

impl AddReferenceInOutput {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

impl PreprocessingStep for AddReferenceInOutput {
    fn name(&self) -> String {
        format!("AddReferenceInOutput ({} -> {})", self.from, self.to)
    }

    fn process(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        let frame = ctx.output.frame(&self.from)?.clone();
        ctx.output.frames.insert(self.to.clone(), frame);
        Ok(())
    }
}

/// Log the shapes of everything in flight.
pub struct DumpPipelineState {
    label: String,
}

impl DumpPipelineState {
    pub fn new(label: impl Into<String>) -> Self {
        Self { label: label.into() }
    }
}

impl PreprocessingStep for DumpPipelineState {
    fn name(&self) -> String {
        format!("DumpPipelineState ({})", self.label)
    }

    fn process(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        debug!(label = %self.label, input_rows = ctx.input.height(), mf = ?ctx.mf.shape(), "Pipeline state");
        for (name, frame) in &ctx.output.frames {
            debug!(output = %name, shape = ?frame.shape(), "  output frame");
        }
        if let Some(assertions) = &ctx.output.assertions {
            debug!(assertions = assertions.len(), "  assertions");
        }
        Ok(())
    }
}
