//! The step abstraction and the mutable state a step runs against.

use tracing::warn;

use super::output::{FitReport, GeneratedFeaturesMapping, PreprocessingResult};
use super::resources::ResourceStore;
use crate::error::Result;
use crate::frame::{ColumnValues, InputFrame, MultiFrame};

/// Everything a step may read or mutate while running.
pub struct StepContext<'a> {
    pub input: &'a mut InputFrame,
    pub mf: &'a mut MultiFrame,
    pub output: &'a mut PreprocessingResult,
    pub mapping: &'a mut GeneratedFeaturesMapping,
    pub resources: &'a mut ResourceStore,
}

impl<'a> StepContext<'a> {
    /// Drop rows from the current frame and the input together.
    pub fn drop_rows(&mut self, mask: &[bool]) {
        self.mf.drop_rows(mask);
        self.input.drop_rows(mask);
    }

    /// Flush a builder into its block and drop from the input every row the
    /// flush removed from the frame.
    pub fn flush(&mut self, block: &str) -> Result<()> {
        let dropped = self.mf.flush_df_builder(block)?;
        if !dropped.is_empty() {
            warn!(block, rows = dropped.len(), "Rows dropped while flushing builder");
            self.input.drop_row_ids(&dropped);
        }
        Ok(())
    }

    /// Column from a block of the current frame when present, from the input otherwise.
    pub fn block_or_input_column(&self, block: &str, column: &str) -> Result<ColumnValues> {
        match self.mf.col_as_values(block, column) {
            Ok(values) => Ok(values),
            Err(_) => Ok(self.input.column(column)?.clone()),
        }
    }

    /// Row ids of the current frame, which builder columns are keyed by.
    pub fn row_ids(&self) -> Vec<usize> {
        self.mf.index().to_vec()
    }

    /// Start a new current frame on the input's rows, returning the old one.
    pub fn restart_frame(&mut self) -> MultiFrame {
        std::mem::replace(self.mf, MultiFrame::new(self.input.index().to_vec()))
    }
}

/// One stage of the pipeline.
///
/// Steps never compute dataset statistics themselves: the constructor gets
/// them from the collector. Stateful steps fit in `fit_and_process` and keep
/// what they learned in the resource store, which `process` only reads.
pub trait PreprocessingStep: Send {
    fn name(&self) -> String;

    /// Register or load the resources this step uses.
    fn init_resources(&mut self, _resources: &mut ResourceStore) -> Result<()> {
        Ok(())
    }

    fn fit_and_process(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        self.process(ctx)
    }

    fn process(&mut self, ctx: &mut StepContext<'_>) -> Result<()>;

    fn report_fit(&self, _report: &mut FitReport, _resources: &mut ResourceStore) -> Result<()> {
        Ok(())
    }
}
