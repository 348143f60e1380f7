//! Host supplied transformations.
//!
//! The pipeline never evaluates user code. Hosts register processor
//! factories and file functions in a [`CustomCodeRegistry`], keyed by the
//! code string found in the column settings, and the steps below call them.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use ndarray::Array2;
use serde_json::Value;
use tracing::debug;

use super::resources::ResourceStore;
use super::step::{PreprocessingStep, StepContext};
use crate::error::{PrepError, Result};
use crate::frame::{ColumnValues, CsrMatrix, InputFrame};

/// Name of the single column a matrix-wanting processor receives.
pub const MATRIX_COLUMN: &str = "_";

/// What a custom processor is fed.
pub enum CustomInput<'a> {
    Series(&'a ColumnValues),
    /// One-column frame whose column is named [`MATRIX_COLUMN`].
    Matrix(&'a InputFrame),
}

/// What a custom processor returns. Without names the columns are called
/// `<col>:unnamed_<i>`.
#[derive(Debug, Clone)]
pub enum CustomOutput {
    Dense { array: Array2<f64>, names: Option<Vec<String>> },
    Sparse { matrix: CsrMatrix, names: Option<Vec<String>> },
}

/// A fitted transformation of one column.
pub trait CustomProcessor: Send {
    fn fit(&mut self, input: CustomInput<'_>) -> Result<()>;

    fn transform(&self, input: CustomInput<'_>) -> Result<CustomOutput>;

    /// State persisted in the `custom_prep` resource.
    fn state(&self) -> Result<Value>;

    fn restore(&mut self, state: Value) -> Result<()>;
}

/// Turns one file into a feature vector.
pub trait FileFunction: Send + Sync {
    fn apply(&self, content: &[u8]) -> Result<Vec<f64>>;
}

impl<F> FileFunction for F
where
    F: Fn(&[u8]) -> Result<Vec<f64>> + Send + Sync,
{
    fn apply(&self, content: &[u8]) -> Result<Vec<f64>> {
        self(content)
    }
}

/// Resolves the paths stored in a column.
pub trait FileReader: Send + Sync {
    fn read(&self, path: &str) -> Result<Vec<u8>>;
}

/// Reads paths relative to a folder on disk.
#[derive(Debug, Clone)]
pub struct FolderFileReader {
    root: PathBuf,
}

impl FolderFileReader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl FileReader for FolderFileReader {
    fn read(&self, path: &str) -> Result<Vec<u8>> {
        Ok(fs::read(self.root.join(path.trim_start_matches('/')))?)
    }
}

pub type ProcessorFactory = Arc<dyn Fn() -> Box<dyn CustomProcessor> + Send + Sync>;

/// Custom code known to the host.
#[derive(Clone, Default)]
pub struct CustomCodeRegistry {
    processors: HashMap<String, ProcessorFactory>,
    file_functions: HashMap<String, Arc<dyn FileFunction>>,
    file_readers: HashMap<String, Arc<dyn FileReader>>,
}

impl fmt::Debug for CustomCodeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomCodeRegistry")
            .field("processors", &self.processors.keys().collect::<Vec<_>>())
            .field("file_functions", &self.file_functions.keys().collect::<Vec<_>>())
            .field("file_readers", &self.file_readers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl CustomCodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_processor<F>(mut self, code: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Box<dyn CustomProcessor> + Send + Sync + 'static,
    {
        self.processors.insert(code.into(), Arc::new(factory));
        self
    }

    pub fn register_file_function(mut self, code: impl Into<String>, function: impl FileFunction + 'static) -> Self {
        self.file_functions.insert(code.into(), Arc::new(function));
        self
    }

    /// Reader for the files of one managed folder.
    pub fn register_file_reader(mut self, folder_id: impl Into<String>, reader: impl FileReader + 'static) -> Self {
        self.file_readers.insert(folder_id.into(), Arc::new(reader));
        self
    }

    pub fn processor(&self, code: &str, column: &str) -> Result<ProcessorFactory> {
        self.processors.get(code).cloned().ok_or_else(|| {
            PrepError::CustomCodeError(format!("No processor registered for custom preprocessing of feature '{}'", column))
        })
    }

    pub fn file_function(&self, code: &str, column: &str) -> Result<Arc<dyn FileFunction>> {
        self.file_functions.get(code).cloned().ok_or_else(|| {
            PrepError::CustomCodeError(format!("No file function registered for feature '{}'", column))
        })
    }

    pub fn file_reader(&self, folder_id: &str) -> Result<Arc<dyn FileReader>> {
        self.file_readers.get(folder_id).cloned().ok_or_else(|| {
            PrepError::CustomCodeError(format!("No file reader registered for folder '{}'", folder_id))
        })
    }
}

/// Runs a registered processor on one input column and appends its output
/// as block `custom_prep_<col>`.
pub struct CustomPreprocessingStep {
    column: String,
    factory: ProcessorFactory,
    wants_matrix: bool,
    fit_and_process_only_fits: bool,
    processor: Option<Box<dyn CustomProcessor>>,
}

impl CustomPreprocessingStep {
    pub fn new(column: impl Into<String>, factory: ProcessorFactory, wants_matrix: bool) -> Self {
        Self {
            column: column.into(),
            factory,
            wants_matrix,
            fit_and_process_only_fits: false,
            processor: None,
        }
    }

    /// Fit without appending anything, for columns too costly to transform twice.
    pub fn fit_only(mut self, fit_and_process_only_fits: bool) -> Self {
        self.fit_and_process_only_fits = fit_and_process_only_fits;
        self
    }

    fn with_input<T>(&self, input: &InputFrame, f: impl FnOnce(CustomInput<'_>) -> Result<T>) -> Result<T> {
        let values = input.column(&self.column)?;
        if self.wants_matrix {
            let frame = InputFrame::new(vec![(MATRIX_COLUMN.to_string(), values.clone())])?;
            f(CustomInput::Matrix(&frame))
        } else {
            f(CustomInput::Series(values))
        }
    }

    fn default_names(&self, n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{}:unnamed_{}", self.column, i)).collect()
    }
}

impl PreprocessingStep for CustomPreprocessingStep {
    fn name(&self) -> String {
        format!("CustomPreprocessingStep ({})", self.column)
    }

    fn init_resources(&mut self, resources: &mut ResourceStore) -> Result<()> {
        if let Some(state) = resources.custom_prep()?.get(&self.column) {
            let mut processor = (self.factory)();
            processor.restore(state.clone())?;
            self.processor = Some(processor);
        }
        Ok(())
    }

    fn fit_and_process(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        let mut processor = (self.factory)();
        self.with_input(ctx.input, |input| processor.fit(input))?;
        ctx.resources.custom_prep()?.insert(self.column.clone(), processor.state()?);
        self.processor = Some(processor);
        if self.fit_and_process_only_fits {
            return Ok(());
        }
        self.process(ctx)
    }

    fn process(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        let processor = self
            .processor
            .as_ref()
            .ok_or_else(|| PrepError::not_fitted("custom_prep", &self.column))?;
        let output = self.with_input(ctx.input, |input| processor.transform(input))?;
        let block = format!("custom_prep_{}", self.column);
        match output {
            CustomOutput::Dense { array, names } => {
                let names = names.unwrap_or_else(|| self.default_names(array.ncols()));
                if names.len() != array.ncols() {
                    return Err(PrepError::CustomCodeError(format!(
                        "Size mismatch between feature names ({}) and preprocessed array ({})",
                        names.len(),
                        array.ncols()
                    )));
                }
                ctx.mf.append_dense(&block, array, names)?;
            }
            CustomOutput::Sparse { matrix, names } => {
                let names = names.unwrap_or_else(|| self.default_names(matrix.ncols()));
                if names.len() != matrix.ncols() {
                    return Err(PrepError::CustomCodeError(format!(
                        "Size mismatch between feature names ({}) and preprocessed array ({})",
                        names.len(),
                        matrix.ncols()
                    )));
                }
                ctx.mf.append_sparse(&block, matrix, Some(names))?;
            }
        }
        debug!(block = %block, "Custom preprocessing appended");
        ctx.mapping.add_whole_block_mapping(&block, &self.column);
        Ok(())
    }
}

/// Applies a registered file function to every path of a column and
/// appends the vectors as dense block `custom_file_prep_<col>`.
pub struct FileFunctionPreprocessing {
    column: String,
    function: Arc<dyn FileFunction>,
    reader: Arc<dyn FileReader>,
    fit_and_process_only_fits: bool,
}

impl FileFunctionPreprocessing {
    pub fn new(
        column: impl Into<String>,
        function: Arc<dyn FileFunction>,
        reader: Arc<dyn FileReader>,
        fit_and_process_only_fits: bool,
    ) -> Self {
        Self {
            column: column.into(),
            function,
            reader,
            fit_and_process_only_fits,
        }
    }

    fn featurize(&self, path: Option<&str>) -> Result<Vec<f64>> {
        let path = path.unwrap_or_default();
        let content = self.reader.read(path)
            .and_then(|content| self.function.apply(&content))
            .map_err(|e| {
                PrepError::CustomCodeError(format!("Failed to preprocess the following file: '{}': {}", path, e))
            })?;
        Ok(content)
    }
}

impl PreprocessingStep for FileFunctionPreprocessing {
    fn name(&self) -> String {
        format!("FileFunctionPreprocessing ({})", self.column)
    }

    fn fit_and_process(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        if self.fit_and_process_only_fits {
            return Ok(());
        }
        self.process(ctx)
    }

    fn process(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        let paths = ctx.input.column(&self.column)?.to_text_vec();
        let rows = paths
            .iter()
            .map(|p| self.featurize(p.as_deref()))
            .collect::<Result<Vec<_>>>()?;
        let width = rows.first().map(Vec::len).unwrap_or(0);
        if let Some(bad) = rows.iter().find(|r| r.len() != width) {
            return Err(PrepError::CustomCodeError(format!(
                "Output of the file function for feature '{}' should have {} values per row, found {}",
                self.column,
                width,
                bad.len()
            )));
        }
        let flat: Vec<f64> = rows.into_iter().flatten().collect();
        let array = Array2::from_shape_vec((paths.len(), width), flat)?;
        let block = format!("custom_file_prep_{}", self.column);
        let names = (0..width).map(|i| format!("{}:{}", block, i)).collect();
        ctx.mf.append_dense(&block, array, names)?;
        ctx.mapping.add_whole_block_mapping(&block, &self.column);
        Ok(())
    }
}
