//! Kolosal Prep - feature preprocessing and hyperparameter search for tabular AutoML
//!
//! This crate provides:
//! - A step-based preprocessing pipeline that turns a raw frame into a
//!   model-ready matrix, with fitted resources that replay on new data
//! - Hyperparameter spaces for grid, random and Bayesian search, including
//!   entangled parameters that only exist for some values of others
//! - A cross-validated search runner with parallel workers, iteration and
//!   time caps, and per-candidate failure isolation
//!
//! # Modules
//!
//! - [`frame`] - Input frames, multi-block frames and sparse blocks
//! - [`preprocessing`] - Pipeline steps, collector, handler and resources
//! - [`optimizer`] - Dimensions, spaces and the conditional Bayesian optimizer
//! - [`search`] - Estimator contract, scorers, workers and the search runner

// Core error handling
pub mod error;

// Data
pub mod frame;
pub mod preprocessing;

// Hyperparameter search
pub mod optimizer;
pub mod search;

pub use error::{PrepError, Result};

/// Re-export commonly used types
pub mod prelude {
    // Error handling
    pub use crate::error::{PrepError, Result};

    // Frames
    pub use crate::frame::{InputFrame, MultiFrame};

    // Preprocessing
    pub use crate::preprocessing::{
        CollectorData, PipelineOptions, PreprocessingDataCollector, PreprocessingHandler, PreprocessingParams,
        PreprocessingPipeline, PreprocessingResult,
    };

    // Optimization
    pub use crate::optimizer::{
        BayesianSettings, ConditionalOptimizer, HyperparamPoint, HyperparameterDimension, HyperparametersSpace,
        ParameterValue, SearchStrategyKind,
    };

    // Search
    pub use crate::search::{Estimator, KFold, Metric, SearchRunner, SearchSettings};
}
