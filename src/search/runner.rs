//! Top-level hyperparameter search: builds the strategy, runs it on the
//! scheduler under the configured caps and picks the best point.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::context::{KFold, SearchContext};
use super::estimator::Estimator;
use super::evaluator::{AggregatedResult, PointOutcome, SearchEvaluator};
use super::result_store::{NoopResultStore, OnDiskResultStore, ResultStore};
use super::scoring::{metric_sign, Metric, MetricScorer, Scorer};
use super::strategy::{BayesianSearchStrategy, GridSearchStrategy, RandomSearchStrategy, SearchStrategy};
use super::worker::{RemoteWorkerFactory, WorkScheduler};
use crate::error::{PrepError, Result};
use crate::optimizer::{format_point, BayesianSettings, HyperparamPoint, HyperparametersSpace, SearchStrategyKind};

const WATCH_INTERVAL: Duration = Duration::from_millis(20);

/// Search configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    /// Local worker threads; 0 uses every available core.
    pub n_threads: usize,
    pub n_containers: usize,
    pub distributed: bool,
    /// Cap on the number of evaluated points.
    pub n_iter: Option<usize>,
    pub timeout_minutes: Option<f64>,
    pub seed: u64,
    pub strategy: SearchStrategyKind,
    /// Shuffle grid points before evaluation.
    pub randomized: bool,
    pub evaluation_metric: Metric,
    pub custom_evaluation_metric_gib: bool,
    pub bayesian: BayesianSettings,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            n_threads: 4,
            n_containers: 1,
            distributed: false,
            n_iter: None,
            timeout_minutes: None,
            seed: 1337,
            strategy: SearchStrategyKind::Grid,
            randomized: false,
            evaluation_metric: Metric::R2,
            custom_evaluation_metric_gib: true,
            bayesian: BayesianSettings::default(),
        }
    }
}

impl SearchSettings {
    pub fn with_threads(mut self, n_threads: usize) -> Self {
        self.n_threads = n_threads;
        self
    }

    pub fn with_containers(mut self, n_containers: usize) -> Self {
        self.n_containers = n_containers;
        self.distributed = n_containers > 1;
        self
    }

    pub fn with_n_iter(mut self, n_iter: usize) -> Self {
        self.n_iter = Some(n_iter);
        self
    }

    pub fn with_timeout_minutes(mut self, minutes: f64) -> Self {
        self.timeout_minutes = Some(minutes);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_strategy(mut self, strategy: SearchStrategyKind) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_randomized(mut self, randomized: bool) -> Self {
        self.randomized = randomized;
        self
    }

    pub fn with_metric(mut self, metric: Metric) -> Self {
        self.evaluation_metric = metric;
        self
    }

    pub fn with_custom_metric_gib(mut self, greater_is_better: bool) -> Self {
        self.custom_evaluation_metric_gib = greater_is_better;
        self
    }

    pub fn with_bayesian(mut self, bayesian: BayesianSettings) -> Self {
        self.bayesian = bayesian;
        self
    }
}

/// One evaluated point as reported to the caller. Times are in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GridCell {
    pub params: HyperparamPoint,
    pub score: f64,
    pub score_std: f64,
    pub fit_time: f64,
    pub fit_time_std: f64,
    pub score_time: f64,
    pub score_time_std: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreInfo {
    pub used_grid_search: bool,
    pub grid_size: usize,
    pub grid_best_score: Option<f64>,
    pub grid_cells: Vec<GridCell>,
}

/// A point that failed on at least one split.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateFailure {
    pub parameters: HyperparamPoint,
    pub error: String,
}

/// Runs a search for one estimator over one space.
pub struct SearchRunner {
    base_estimator: Box<dyn Estimator>,
    space: HyperparametersSpace,
    scorer: Arc<dyn Scorer>,
    settings: SearchSettings,
    result_store: Box<dyn ResultStore>,
    remote_factory: Option<RemoteWorkerFactory>,
    interrupted: Arc<AtomicBool>,
    searched: bool,
    results: Vec<AggregatedResult>,
    failures: Vec<CandidateFailure>,
    best: Option<AggregatedResult>,
}

impl std::fmt::Debug for SearchRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchRunner")
            .field("estimator", &self.base_estimator.name())
            .field("settings", &self.settings)
            .field("results", &self.results.len())
            .field("failures", &self.failures.len())
            .finish()
    }
}

impl SearchRunner {
    /// Runner scoring with the built-in `settings.evaluation_metric`.
    pub fn new(estimator: Box<dyn Estimator>, space: HyperparametersSpace, settings: SearchSettings) -> Result<Self> {
        let scorer = Arc::new(MetricScorer::new(settings.evaluation_metric)?);
        Ok(Self::with_scorer(estimator, space, scorer, settings))
    }

    pub fn with_scorer(
        estimator: Box<dyn Estimator>,
        space: HyperparametersSpace,
        scorer: Arc<dyn Scorer>,
        settings: SearchSettings,
    ) -> Self {
        Self {
            base_estimator: estimator,
            space,
            scorer,
            settings,
            result_store: Box::new(NoopResultStore),
            remote_factory: None,
            interrupted: Arc::new(AtomicBool::new(false)),
            searched: false,
            results: Vec::new(),
            failures: Vec::new(),
            best: None,
        }
    }

    /// Persist results in `folder` and resume from whatever is already there.
    pub fn with_result_folder(mut self, folder: impl Into<std::path::PathBuf>) -> Self {
        self.result_store = Box::new(OnDiskResultStore::new(folder));
        self
    }

    pub fn with_result_store(mut self, store: Box<dyn ResultStore>) -> Self {
        self.result_store = store;
        self
    }

    pub fn with_remote_workers(mut self, factory: RemoteWorkerFactory) -> Self {
        self.remote_factory = Some(factory);
        self
    }

    pub fn settings(&self) -> &SearchSettings {
        &self.settings
    }

    /// Setting the flag stops the search from issuing new points.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupted)
    }

    pub fn aggregated_results(&self) -> &[AggregatedResult] {
        &self.results
    }

    pub fn failures(&self) -> &[CandidateFailure] {
        &self.failures
    }

    pub fn best_result(&self) -> Option<&AggregatedResult> {
        self.best.as_ref()
    }

    fn build_strategy(&self) -> Result<Box<dyn SearchStrategy>> {
        let mut space = self.space.clone();
        space.set_random_state(self.settings.seed);
        Ok(match self.settings.strategy {
            SearchStrategyKind::Grid => {
                let shuffle = self.settings.randomized.then_some(self.settings.seed);
                Box::new(GridSearchStrategy::new(&space, shuffle)?)
            }
            SearchStrategyKind::Random => Box::new(RandomSearchStrategy::new(space, self.settings.n_iter)),
            SearchStrategyKind::Bayesian => Box::new(BayesianSearchStrategy::new(
                space,
                self.settings.n_iter,
                self.settings.bayesian.clone(),
            )?),
        })
    }

    /// Points the search will evaluate, `None` when only the timeout
    /// bounds it.
    pub fn get_experiments_count(&self) -> Result<Option<usize>> {
        let count = self.build_strategy()?.get_experiments_count();
        Ok(match (count, self.settings.n_iter) {
            (Some(c), Some(n)) => Some(c.min(n)),
            (Some(c), None) => Some(c),
            (None, n) => n,
        })
    }

    /// With at most one point there is nothing to compare.
    pub fn search_skipped(&self) -> Result<bool> {
        Ok(matches!(self.get_experiments_count()?, Some(c) if c <= 1))
    }

    /// Run the search and return an unfitted estimator carrying the best
    /// parameters. Best is the highest mean greater-is-better test score.
    pub fn get_best_estimator(
        &mut self,
        x: &Array2<f64>,
        y: &Array1<f64>,
        sample_weight: Option<&Array1<f64>>,
        cv: &KFold,
    ) -> Result<Box<dyn Estimator>> {
        let strategy = self.build_strategy()?;
        self.results.clear();
        self.failures.clear();
        self.best = None;

        if self.search_skipped()? {
            let params = strategy.get_default_parameters()?;
            info!(params = %format_point(&params), "Skipping hyperparameter search");
            self.searched = false;
            let mut estimator = self.base_estimator.clone_box();
            estimator.set_params(&params)?;
            return Ok(estimator);
        }

        let strategy_kind = self.settings.strategy;
        if strategy_kind != SearchStrategyKind::Grid
            && self.settings.n_iter.is_none()
            && self.settings.timeout_minutes.is_none()
        {
            return Err(PrepError::ConfigError(format!(
                "Search strategy {} needs a number of iterations or a timeout",
                strategy_kind.name()
            )));
        }

        let outcomes = self.run_search(strategy, x, y, sample_weight, cv)?;
        self.searched = true;
        self.collect_outcomes(outcomes)?;

        let best = self
            .best
            .as_ref()
            .ok_or_else(|| PrepError::ComputationError("No hyperparameter point was evaluated".to_string()))?;
        info!(
            params = %format_point(&best.parameters),
            score = best.test_score_mean,
            evaluated = self.results.len(),
            failed = self.failures.len(),
            "Best hyperparameters"
        );
        let mut estimator = self.base_estimator.clone_box();
        estimator.set_params(&best.parameters)?;
        Ok(estimator)
    }

    fn run_search(
        &self,
        mut strategy: Box<dyn SearchStrategy>,
        x: &Array2<f64>,
        y: &Array1<f64>,
        sample_weight: Option<&Array1<f64>>,
        cv: &KFold,
    ) -> Result<Vec<PointOutcome>> {
        let splits = cv.split(y.len())?;
        let n_splits = splits.len();
        let sign = metric_sign(self.scorer.as_ref(), self.settings.custom_evaluation_metric_gib);
        let context = SearchContext::new(
            Arc::new(x.clone()),
            Arc::new(y.clone()),
            splits,
            sample_weight.map(|w| Arc::new(w.clone())),
            self.base_estimator.clone_box(),
            Arc::clone(&self.scorer),
            sign,
        )?;

        let remote = if self.settings.distributed { self.remote_factory.as_ref() } else { None };
        let scheduler = WorkScheduler::with_layout(self.settings.n_threads, self.settings.n_containers, remote)?;
        self.result_store.init_result_file(
            self.get_experiments_count()?,
            scheduler.workers_count(),
            n_splits,
            self.settings.evaluation_metric.name(),
            self.settings.timeout_minutes,
        )?;

        let timeout = self.settings.timeout_minutes.map(|m| Duration::from_secs_f64(m.max(0.0) * 60.0));
        let finished = AtomicBool::new(false);
        let started = Instant::now();

        let outcomes = thread::scope(|scope| {
            let scheduler = &scheduler;
            let finished = &finished;
            let interrupted = &self.interrupted;
            scope.spawn(move || {
                while !finished.load(Ordering::SeqCst) {
                    if interrupted.load(Ordering::SeqCst) {
                        info!("Search interrupted by the caller");
                        scheduler.interrupt_soft();
                        return;
                    }
                    if let Some(limit) = timeout {
                        if started.elapsed() >= limit {
                            info!(elapsed_s = started.elapsed().as_secs_f64(), "Search timeout reached");
                            scheduler.interrupt_soft();
                            return;
                        }
                    }
                    thread::sleep(WATCH_INTERVAL);
                }
            });

            let mut evaluator = SearchEvaluator::new(scheduler, &context, self.result_store.as_ref(), self.settings.n_iter);
            let outcomes = strategy.explore(&mut evaluator);
            info!(points = evaluator.n_iter(), elapsed_s = started.elapsed().as_secs_f64(), "Search finished");
            finished.store(true, Ordering::SeqCst);
            outcomes
        })?;

        self.result_store.update_final_grid_size()?;
        scheduler.shutdown();
        Ok(outcomes)
    }

    fn collect_outcomes(&mut self, outcomes: Vec<PointOutcome>) -> Result<()> {
        for outcome in outcomes {
            match outcome {
                PointOutcome::Evaluated(r) => self.results.push(r.aggregated),
                PointOutcome::Failed { parameters, error } => {
                    warn!(params = %format_point(&parameters), error = %error, "Hyperparameter point failed");
                    self.failures.push(CandidateFailure { parameters, error });
                }
                PointOutcome::Interrupted(_) => {}
            }
        }
        if self.results.is_empty() {
            if let Some(first) = self.failures.first() {
                return Err(PrepError::CandidateError(format!(
                    "All {} hyperparameter points failed, first error: {}",
                    self.failures.len(),
                    first.error
                )));
            }
        }
        self.best = self
            .results
            .iter()
            .filter(|r| !r.test_score_gib_mean.is_nan())
            .max_by(|a, b| a.test_score_gib_mean.total_cmp(&b.test_score_gib_mean))
            .cloned();
        Ok(())
    }

    /// Summary of the last search.
    pub fn get_score_info(&self) -> ScoreInfo {
        ScoreInfo {
            used_grid_search: self.searched,
            grid_size: self.results.len(),
            grid_best_score: self.best.as_ref().map(|b| b.test_score_mean),
            grid_cells: self
                .results
                .iter()
                .map(|r| GridCell {
                    params: r.parameters.clone(),
                    score: r.test_score_mean,
                    score_std: r.test_score_std,
                    fit_time: r.fit_time_mean / 1000.0,
                    fit_time_std: r.fit_time_std / 1000.0,
                    score_time: r.score_time_mean / 1000.0,
                    score_time_std: r.score_time_std / 1000.0,
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::{
        DimensionDefinition, GridHyperparametersSpace, HyperparameterDimension, ParameterGrid, ParameterValue, Scaling,
    };
    use crate::search::test_support::ShiftRegressor;
    use ndarray::Array;

    fn data() -> (Array2<f64>, Array1<f64>) {
        let x = Array2::from_shape_fn((12, 1), |(i, _)| i as f64);
        let y = Array::from_iter((0..12).map(|i| i as f64));
        (x, y)
    }

    fn shift_grid(shifts: &[f64], fail: &[bool]) -> HyperparametersSpace {
        let mut grid = ParameterGrid::new();
        grid.insert("shift".to_string(), shifts.iter().map(|s| ParameterValue::from(*s)).collect());
        grid.insert("fail".to_string(), fail.iter().map(|f| ParameterValue::from(*f)).collect());
        GridHyperparametersSpace::new(vec![grid])
    }

    fn shift(point: &HyperparamPoint) -> f64 {
        point.get("shift").and_then(|v| v.as_float()).unwrap()
    }

    #[test]
    fn test_grid_search_picks_best_point() {
        let (x, y) = data();
        let settings = SearchSettings::default().with_threads(2).with_metric(Metric::Mae);
        let mut runner =
            SearchRunner::new(Box::new(ShiftRegressor::default()), shift_grid(&[2.0, -1.0, 0.0, 0.5], &[false]), settings)
                .unwrap();
        assert_eq!(runner.get_experiments_count().unwrap(), Some(4));
        let best = runner.get_best_estimator(&x, &y, None, &KFold::new(3)).unwrap();
        assert_eq!(shift(&best.get_params()), 0.0);

        let info = runner.get_score_info();
        assert!(info.used_grid_search);
        assert_eq!(info.grid_size, 4);
        assert_eq!(info.grid_best_score, Some(0.0));
        let worst = info.grid_cells.iter().map(|c| c.score).fold(f64::MIN, f64::max);
        assert_eq!(worst, 2.0);
    }

    #[test]
    fn test_failing_candidates_are_recorded() {
        let (x, y) = data();
        let settings = SearchSettings::default().with_threads(3).with_metric(Metric::Mse);
        let mut runner =
            SearchRunner::new(Box::new(ShiftRegressor::default()), shift_grid(&[0.0, 1.0], &[false, true]), settings)
                .unwrap();
        let best = runner.get_best_estimator(&x, &y, None, &KFold::new(2)).unwrap();
        assert_eq!(shift(&best.get_params()), 0.0);
        assert_eq!(runner.aggregated_results().len(), 2);
        assert_eq!(runner.failures().len(), 2);
        assert!(runner
            .failures()
            .iter()
            .all(|f| f.parameters.get("fail") == Some(&ParameterValue::Bool(true))));
    }

    #[test]
    fn test_all_failing_is_candidate_error() {
        let (x, y) = data();
        let mut runner = SearchRunner::new(
            Box::new(ShiftRegressor::default()),
            shift_grid(&[0.0, 1.0], &[true]),
            SearchSettings::default().with_metric(Metric::Mse),
        )
        .unwrap();
        let err = runner.get_best_estimator(&x, &y, None, &KFold::new(2)).unwrap_err();
        assert!(matches!(err, PrepError::CandidateError(_)));
    }

    #[test]
    fn test_n_iter_caps_grid() {
        let (x, y) = data();
        let settings = SearchSettings::default().with_threads(1).with_metric(Metric::Mae).with_n_iter(2);
        let mut runner =
            SearchRunner::new(Box::new(ShiftRegressor::default()), shift_grid(&[3.0, 2.0, 0.0, 1.0], &[false]), settings)
                .unwrap();
        assert_eq!(runner.get_experiments_count().unwrap(), Some(2));
        let best = runner.get_best_estimator(&x, &y, None, &KFold::new(2)).unwrap();
        assert_eq!(shift(&best.get_params()), 2.0);
        assert_eq!(runner.get_score_info().grid_size, 2);
    }

    #[test]
    fn test_single_point_skips_search() {
        let (x, y) = data();
        let mut runner = SearchRunner::new(
            Box::new(ShiftRegressor::default()),
            shift_grid(&[0.5], &[false]),
            SearchSettings::default(),
        )
        .unwrap();
        assert!(runner.search_skipped().unwrap());
        let est = runner.get_best_estimator(&x, &y, None, &KFold::new(2)).unwrap();
        assert_eq!(shift(&est.get_params()), 0.5);
        let info = runner.get_score_info();
        assert!(!info.used_grid_search);
        assert_eq!(info.grid_size, 0);
    }

    fn shift_space() -> HyperparametersSpace {
        let dim = HyperparameterDimension::float(DimensionDefinition::range(-2.0, 2.0, Scaling::Linear, 5)).unwrap();
        HyperparametersSpace::new(vec![("shift".to_string(), dim)])
    }

    #[test]
    fn test_unbounded_random_search_is_rejected() {
        let (x, y) = data();
        let settings = SearchSettings::default().with_strategy(SearchStrategyKind::Random).with_metric(Metric::Mae);
        let mut runner = SearchRunner::new(Box::new(ShiftRegressor::default()), shift_space(), settings).unwrap();
        assert_eq!(runner.get_experiments_count().unwrap(), None);
        let err = runner.get_best_estimator(&x, &y, None, &KFold::new(2)).unwrap_err();
        assert!(matches!(err, PrepError::ConfigError(_)));
    }

    #[test]
    fn test_random_search_with_n_iter() {
        let (x, y) = data();
        let settings = SearchSettings::default()
            .with_strategy(SearchStrategyKind::Random)
            .with_metric(Metric::Mae)
            .with_n_iter(6)
            .with_seed(3);
        let mut runner = SearchRunner::new(Box::new(ShiftRegressor::default()), shift_space(), settings).unwrap();
        runner.get_best_estimator(&x, &y, None, &KFold::new(2)).unwrap();
        let n = runner.aggregated_results().len();
        assert!((1..=6).contains(&n));
        let best = runner.best_result().unwrap();
        assert!(runner.aggregated_results().iter().all(|r| r.test_score_gib_mean <= best.test_score_gib_mean));
    }

    #[test]
    fn test_timeout_stops_bayesian_search() {
        let (x, y) = data();
        let settings = SearchSettings::default()
            .with_strategy(SearchStrategyKind::Bayesian)
            .with_metric(Metric::Mae)
            .with_threads(2)
            .with_timeout_minutes(0.0)
            .with_bayesian(BayesianSettings::default().with_candidates(50));
        let mut runner = SearchRunner::new(Box::new(ShiftRegressor::default()), shift_space(), settings).unwrap();
        runner.get_best_estimator(&x, &y, None, &KFold::new(2)).unwrap();
        assert!(!runner.aggregated_results().is_empty());
    }

    #[test]
    fn test_interrupt_handle_stops_search() {
        let (x, y) = data();
        let settings = SearchSettings::default()
            .with_strategy(SearchStrategyKind::Random)
            .with_metric(Metric::Mae)
            .with_timeout_minutes(60.0);
        let mut runner = SearchRunner::new(Box::new(ShiftRegressor::default()), shift_space(), settings).unwrap();
        runner.interrupt_handle().store(true, Ordering::SeqCst);
        runner.get_best_estimator(&x, &y, None, &KFold::new(2)).unwrap();
        assert!(!runner.aggregated_results().is_empty());
    }

    #[test]
    fn test_results_resume_from_folder() {
        let (x, y) = data();
        let dir = tempfile::tempdir().unwrap();
        let settings = SearchSettings::default().with_metric(Metric::Mae);
        let mut first = SearchRunner::new(Box::new(ShiftRegressor::default()), shift_grid(&[0.0, 1.0], &[false]), settings.clone())
            .unwrap()
            .with_result_folder(dir.path());
        first.get_best_estimator(&x, &y, None, &KFold::new(2)).unwrap();

        let mut second = SearchRunner::new(Box::new(ShiftRegressor::default()), shift_grid(&[0.0, 1.0], &[false]), settings)
            .unwrap()
            .with_result_folder(dir.path());
        second.get_best_estimator(&x, &y, None, &KFold::new(2)).unwrap();
        assert_eq!(first.aggregated_results(), second.aggregated_results());

        let scores = OnDiskResultStore::new(dir.path()).scores().unwrap().unwrap();
        assert_eq!(scores.grid_size, Some(2));
        assert_eq!(scores.metric, "MAE");
    }
}
