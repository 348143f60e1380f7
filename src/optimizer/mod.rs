//! Hyperparameter spaces and the optimizers that walk them.

pub mod bayesian;
pub mod dimension;
pub mod gaussian_process;
pub mod space;
pub mod value;

pub use bayesian::{BayesianSettings, ConditionalOptimizer, SequentialOptimizer};
pub use dimension::{
    build_float_grid, build_integer_grid, DimensionDefinition, DimensionSpace, Distribution, HyperparameterDimension,
    Prior, Scaling, SearchMode,
};
pub use gaussian_process::{AcquisitionFunction, GaussianProcess, KernelType};
pub use space::{
    cartesian_product, sgd_regression, svm, trees, Activation, ConditionalDimension, EnrichRule,
    GridHyperparametersSpace, HyperparametersSpace, ParameterGrid, SearchSpace,
};
pub use value::{format_point, HyperparamPoint, ParameterValue, SearchStrategyKind};
