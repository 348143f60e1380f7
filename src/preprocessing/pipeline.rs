//! Runs an ordered list of steps, in fit or replay mode.

use std::time::Instant;

use polars::prelude::DataFrame;
use tracing::{debug, info};

use super::output::{FitReport, GeneratedFeaturesMapping, PreprocessingResult};
use super::resources::ResourceStore;
use super::step::{PreprocessingStep, StepContext};
use crate::error::Result;
use crate::frame::{InputFrame, MultiFrame};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Fit,
    Process,
}

/// Ordered steps plus the resource store they share.
///
/// Steps run one after the other on a single thread; each one sees the
/// frame exactly as the previous one left it.
pub struct PreprocessingPipeline {
    steps: Vec<Box<dyn PreprocessingStep>>,
    resources: ResourceStore,
    mapping: GeneratedFeaturesMapping,
    /// Seconds spent in the last fit.
    fit_time: Option<f64>,
    /// Seconds spent in the last replay.
    process_time: Option<f64>,
}

impl std::fmt::Debug for PreprocessingPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreprocessingPipeline")
            .field("steps", &self.step_names())
            .field("resources", &self.resources)
            .finish()
    }
}

impl PreprocessingPipeline {
    pub fn new(steps: Vec<Box<dyn PreprocessingStep>>, resources: ResourceStore) -> Self {
        Self {
            steps,
            resources,
            mapping: GeneratedFeaturesMapping::default(),
            fit_time: None,
            process_time: None,
        }
    }

    /// Let every step register or load its resources.
    pub fn init_resources(&mut self) -> Result<()> {
        for step in self.steps.iter_mut() {
            step.init_resources(&mut self.resources)?;
        }
        Ok(())
    }

    pub fn step_names(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn resources(&self) -> &ResourceStore {
        &self.resources
    }

    pub fn resources_mut(&mut self) -> &mut ResourceStore {
        &mut self.resources
    }

    /// Origins of the generated blocks and columns, as of the last run.
    pub fn generated_features_mapping(&self) -> &GeneratedFeaturesMapping {
        &self.mapping
    }

    pub fn fit_time(&self) -> Option<f64> {
        self.fit_time
    }

    pub fn process_time(&self) -> Option<f64> {
        self.process_time
    }

    /// Fit every step on `df` and return the transformed outputs.
    pub fn fit_and_process(&mut self, df: &DataFrame) -> Result<PreprocessingResult> {
        self.fit_and_process_frame(InputFrame::from_dataframe(df)?)
    }

    pub fn fit_and_process_frame(&mut self, input: InputFrame) -> Result<PreprocessingResult> {
        let start = Instant::now();
        let output = self.run(input, Mode::Fit)?;
        self.fit_time = Some(start.elapsed().as_secs_f64());
        info!(seconds = self.fit_time, outputs = ?output.frames.keys().collect::<Vec<_>>(), "Fitted preprocessing");
        Ok(output)
    }

    /// Replay the fitted steps on `df`. `retain` restricts the outputs kept.
    pub fn process(&mut self, df: &DataFrame, retain: Option<&[&str]>) -> Result<PreprocessingResult> {
        self.process_frame(InputFrame::from_dataframe(df)?, retain)
    }

    pub fn process_frame(&mut self, input: InputFrame, retain: Option<&[&str]>) -> Result<PreprocessingResult> {
        let start = Instant::now();
        let mut output = self.run(input, Mode::Process)?;
        if let Some(keys) = retain {
            output.retain(keys);
        }
        self.process_time = Some(start.elapsed().as_secs_f64());
        debug!(seconds = self.process_time, "Processed");
        Ok(output)
    }

    /// Ask every step for its part of the fit report.
    pub fn report_fit(&mut self) -> Result<FitReport> {
        let mut report = FitReport::default();
        for step in &self.steps {
            step.report_fit(&mut report, &mut self.resources)?;
        }
        Ok(report)
    }

    fn run(&mut self, mut input: InputFrame, mode: Mode) -> Result<PreprocessingResult> {
        let mut mf = MultiFrame::new(input.index().to_vec());
        let mut output = PreprocessingResult::default();
        let mut mapping = GeneratedFeaturesMapping::default();
        info!(rows = input.height(), steps = self.steps.len(), mode = ?mode, "Running preprocessing");

        for step in self.steps.iter_mut() {
            let name = step.name();
            let rows_before = mf.height();
            let step_start = Instant::now();
            let mut ctx = StepContext {
                input: &mut input,
                mf: &mut mf,
                output: &mut output,
                mapping: &mut mapping,
                resources: &mut self.resources,
            };
            match mode {
                Mode::Fit => step.fit_and_process(&mut ctx)?,
                Mode::Process => step.process(&mut ctx)?,
            }
            debug!(
                step = %name,
                shape = ?mf.shape(),
                elapsed_ms = step_start.elapsed().as_millis() as u64,
                "Step done"
            );
            if mf.height() < rows_before {
                info!(step = %name, dropped = rows_before - mf.height(), "Rows dropped");
            }
        }

        self.mapping = mapping;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocessing::steps::{
        EmitCurrentMfAsResult, MultipleImputeMissingFromInput, RescalingProcessor, SingleColumnDropNaRows,
    };
    use crate::preprocessing::collector::ImputeValue;
    use polars::prelude::*;

    fn steps() -> Vec<Box<dyn PreprocessingStep>> {
        vec![
            Box::new(SingleColumnDropNaRows::new("b")),
            Box::new(MultipleImputeMissingFromInput::new(
                vec![("a".to_string(), Some(ImputeValue::Number(0.0)))],
                "NUM_IMPUTED",
                true,
                false,
            )),
            Box::new(RescalingProcessor::from_minmax("NUM_IMPUTED", "a", 0.0, 4.0)),
            Box::new(EmitCurrentMfAsResult::new("TRAIN")),
        ]
    }

    fn train() -> DataFrame {
        df!(
            "a" => &[Some(1.0), None, Some(4.0), Some(2.0)],
            "b" => &[Some("x"), Some("y"), None, Some("z")],
        )
        .unwrap()
    }

    #[test]
    fn test_fit_then_replay_is_stable() {
        let mut pipeline = PreprocessingPipeline::new(steps(), ResourceStore::in_memory());
        pipeline.init_resources().unwrap();
        let fitted = pipeline.fit_and_process(&train()).unwrap();
        let mf = fitted.train().unwrap();
        assert_eq!(mf.shape(), (3, 1));
        assert_eq!(mf.index(), &[0, 1, 3]);
        let values = mf.as_dense_array().unwrap();
        assert_eq!(values[[0, 0]], 0.25);
        assert_eq!(values[[1, 0]], 0.0);

        let first = pipeline.process(&train(), None).unwrap();
        let second = pipeline.process(&train(), None).unwrap();
        assert_eq!(
            first.train().unwrap().as_dense_array().unwrap(),
            second.train().unwrap().as_dense_array().unwrap()
        );
        assert!(pipeline.fit_time().is_some());
    }

    #[test]
    fn test_retain_outputs() {
        let mut pipeline = PreprocessingPipeline::new(steps(), ResourceStore::in_memory());
        pipeline.init_resources().unwrap();
        pipeline.fit_and_process(&train()).unwrap();
        let out = pipeline.process(&train(), Some(&["target"])).unwrap();
        assert!(out.frames.is_empty());
        assert!(out.unprocessed.is_none());
    }

    #[test]
    fn test_step_names() {
        let pipeline = PreprocessingPipeline::new(steps(), ResourceStore::in_memory());
        assert_eq!(pipeline.len(), 4);
        assert_eq!(pipeline.step_names()[3], "EmitCurrentMfAsResult (TRAIN)");
    }
}
