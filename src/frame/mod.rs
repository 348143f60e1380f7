//! Tabular containers consumed by the preprocessing pipeline

mod input;
mod multiframe;
mod sparse;

pub use input::{column_values_from_polars, format_number, ColumnValues, InputFrame};
pub use multiframe::{Block, BlockData, DataFrameBuilder, MultiFrame};
pub use sparse::CsrMatrix;
