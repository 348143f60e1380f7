//! Shared fixture for step tests.

use crate::error::Result;
use crate::frame::{InputFrame, MultiFrame};
use crate::preprocessing::output::{GeneratedFeaturesMapping, PreprocessingResult};
use crate::preprocessing::resources::ResourceStore;
use crate::preprocessing::step::{PreprocessingStep, StepContext};

pub(crate) struct Harness {
    pub input: InputFrame,
    pub mf: MultiFrame,
    pub output: PreprocessingResult,
    pub mapping: GeneratedFeaturesMapping,
    pub resources: ResourceStore,
}

impl Harness {
    pub fn new(input: InputFrame) -> Self {
        let mf = MultiFrame::new(input.index().to_vec());
        Self {
            input,
            mf,
            output: PreprocessingResult::default(),
            mapping: GeneratedFeaturesMapping::default(),
            resources: ResourceStore::in_memory(),
        }
    }

    /// Same resources, fresh frames over `input`.
    pub fn replay_on(&mut self, input: InputFrame) {
        self.mf = MultiFrame::new(input.index().to_vec());
        self.input = input;
        self.output = PreprocessingResult::default();
    }

    fn ctx(&mut self) -> StepContext<'_> {
        StepContext {
            input: &mut self.input,
            mf: &mut self.mf,
            output: &mut self.output,
            mapping: &mut self.mapping,
            resources: &mut self.resources,
        }
    }

    pub fn run(&mut self, step: &mut dyn PreprocessingStep) -> Result<()> {
        step.init_resources(&mut self.resources)?;
        step.fit_and_process(&mut self.ctx())
    }

    pub fn replay(&mut self, step: &mut dyn PreprocessingStep) -> Result<()> {
        step.init_resources(&mut self.resources)?;
        step.process(&mut self.ctx())
    }
}
