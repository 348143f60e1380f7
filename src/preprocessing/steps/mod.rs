//! The step catalogue.

mod categorical;
mod columns;
mod interaction;
mod numeric;
mod reduction;
mod rows;
mod selection;
mod text;
mod vector;

#[cfg(test)]
pub(crate) mod testing;

pub use categorical::{CategoricalFeatureHashing, DummyLevels, FastSparseDummify};
pub use columns::{CopyMultipleColumnsFromInput, FlagMissingValue, FlushDfBuilder, MultipleImputeMissingFromInput};
pub use interaction::{
    CategoricalCategoricalInteraction, NumericalCategoricalInteraction, NumericalNumericalInteraction,
};
pub use numeric::{
    AllInteractionFeaturesGenerator, BinarizeSeries, BlockStdRescaling, NumericalDerivativesGenerator,
    PairwiseLinearCombinationsGenerator, QuantileBinSeries, RescalingProcessor,
};
pub use reduction::{KMeansModel, OutlierDetection, OutlierModel, PcaModel, PcaSettings, PcaStep};
pub use rows::{
    AddReferenceInOutput, DropNaRows, DumpPipelineState, EmitCurrentMfAsResult, ExtractAssertionMasks,
    ExtractAssertionMasksNbInitialRows, OutputRawColumns, RealignSideOutput, RemapValueToOutput,
    SingleColumnDropNaRows, SpecialOutputsDropNaRows,
};
pub use selection::{FeatureSelectionModel, FeatureSelectionStep};
pub use text::TextHashingVectorizer;
pub use vector::UnfoldVector;

use crate::error::Result;
use crate::frame::{ColumnValues, CsrMatrix};
use crate::preprocessing::step::StepContext;

/// Add a generated column to a builder and record which input feature it
/// came from.
pub(crate) fn add_column_to_builder(
    ctx: &mut StepContext<'_>,
    block: &str,
    new_column: &str,
    feature: &str,
    row_ids: &[usize],
    values: ColumnValues,
) -> Result<()> {
    ctx.mf.get_df_builder(block).add_column(new_column, row_ids, values)?;
    ctx.mapping
        .add_per_column_mapping(block, feature, &format!("{}:{}", block, new_column));
    Ok(())
}

/// Append a sparse block named `<prefix><feature>` that maps back to one feature.
pub(crate) fn append_sparse_with_prefix(
    ctx: &mut StepContext<'_>,
    prefix: &str,
    feature: &str,
    matrix: CsrMatrix,
    names: Option<Vec<String>>,
) -> Result<()> {
    let block = format!("{}{}", prefix, feature);
    ctx.mapping.add_whole_block_mapping(&block, feature);
    ctx.mf.append_sparse(&block, matrix, names)
}

/// Column from a block, or from the input when no block is given.
pub(crate) fn source_column(ctx: &StepContext<'_>, block: Option<&str>, column: &str) -> Result<ColumnValues> {
    match block {
        Some(b) => ctx.mf.col_as_values(b, column),
        None => Ok(ctx.input.column(column)?.clone()),
    }
}
