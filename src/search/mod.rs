//! Cross-validated hyperparameter search over an [`Estimator`].

pub mod context;
pub mod estimator;
pub mod evaluator;
pub mod result_store;
pub mod runner;
pub mod scoring;
pub mod strategy;
pub mod worker;

pub use context::{KFold, SearchContext, Split, SplitResult};
pub use estimator::Estimator;
pub use evaluator::{aggregate_point_results, AggregatedResult, HpPointResult, PointOutcome, SearchEvaluator};
pub use result_store::{
    NoopResultStore, OnDiskResultStore, ResultStore, SearchScores, AGGREGATED_RESULTS_FILE, PER_SPLIT_RESULTS_FILE,
};
pub use runner::{CandidateFailure, GridCell, ScoreInfo, SearchRunner, SearchSettings};
pub use scoring::{compute_metric, log_loss, metric_sign, CustomScorer, Metric, MetricScorer, ScoreFn, Scorer};
pub use strategy::{BayesianSearchStrategy, GridSearchStrategy, RandomSearchStrategy, SearchStrategy};
pub use worker::{LocalWorker, RemoteWorkerFactory, Task, TaskOutcome, WorkScheduler, Worker};
