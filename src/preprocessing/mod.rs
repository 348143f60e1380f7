//! Feature preprocessing: settings documents, the data collector, the step
//! catalogue, and the pipeline that fits once and replays many times.

pub mod collector;
pub mod custom;
pub mod handler;
pub mod hashing;
pub mod impact;
pub mod output;
pub mod params;
pub mod pipeline;
pub mod resources;
pub mod step;
pub mod steps;

pub use collector::{CollectorData, CollectorMode, FeatureAnalysis, ImputeValue, PreprocessingDataCollector};
pub use custom::{CustomCodeRegistry, CustomInput, CustomOutput, CustomProcessor, FileFunction, FileReader, FolderFileReader};
pub use handler::{PipelineOptions, PreprocessingHandler};
pub use impact::{ImpactCoder, ImpactTable, TargetRescaling};
pub use output::{FitReport, GeneratedFeaturesMapping, PreprocessingResult, SideSeries, SpecialOutput};
pub use params::{CoreParams, PerFeatureParams, PredictionType, PreprocessingParams};
pub use pipeline::PreprocessingPipeline;
pub use resources::ResourceStore;
pub use step::{PreprocessingStep, StepContext};
