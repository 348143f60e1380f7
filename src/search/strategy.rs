//! Search strategies: which points get evaluated, and in which order.

use std::collections::HashSet;

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use tracing::{debug, info};

use super::evaluator::{PointOutcome, SearchEvaluator};
use crate::error::{PrepError, Result};
use crate::optimizer::{BayesianSettings, ConditionalOptimizer, HyperparamPoint, HyperparametersSpace};

/// Consecutive rounds without a new point after which a random search
/// considers its space exhausted.
const MAX_STALE_ROUNDS: usize = 32;

pub trait SearchStrategy: Send {
    /// Number of points the strategy would explore, when bounded.
    fn get_experiments_count(&self) -> Option<usize>;

    /// Point used when no search happens.
    fn get_default_parameters(&self) -> Result<HyperparamPoint>;

    /// Evaluate points until exhausted, capped or interrupted.
    fn explore(&mut self, evaluator: &mut SearchEvaluator<'_>) -> Result<Vec<PointOutcome>>;
}

fn point_key(point: &HyperparamPoint) -> String {
    serde_json::to_string(point).unwrap_or_default()
}

/// Evaluate a fixed list of points in batches until one batch is cut short.
fn explore_points(points: &[HyperparamPoint], evaluator: &mut SearchEvaluator<'_>) -> Result<Vec<PointOutcome>> {
    let mut outcomes = Vec::with_capacity(points.len());
    for batch in points.chunks(evaluator.parallelism()) {
        let batch_outcomes = evaluator.evaluate(batch.to_vec())?;
        let stop = batch_outcomes.iter().any(PointOutcome::is_interrupted);
        outcomes.extend(batch_outcomes);
        if stop {
            break;
        }
    }
    Ok(outcomes)
}

/// Every point of the space's grids, optionally shuffled.
#[derive(Debug, Clone)]
pub struct GridSearchStrategy {
    points: Vec<HyperparamPoint>,
}

impl GridSearchStrategy {
    pub fn new(space: &HyperparametersSpace, shuffle_seed: Option<u64>) -> Result<Self> {
        let mut points = space.grid_points()?;
        if let Some(seed) = shuffle_seed {
            points.shuffle(&mut Xoshiro256PlusPlus::seed_from_u64(seed));
        }
        Ok(Self { points })
    }

    pub fn points(&self) -> &[HyperparamPoint] {
        &self.points
    }
}

impl SearchStrategy for GridSearchStrategy {
    fn get_experiments_count(&self) -> Option<usize> {
        Some(self.points.len())
    }

    fn get_default_parameters(&self) -> Result<HyperparamPoint> {
        self.points
            .first()
            .cloned()
            .ok_or_else(|| PrepError::ConfigError("Empty hyperparameter grid".to_string()))
    }

    fn explore(&mut self, evaluator: &mut SearchEvaluator<'_>) -> Result<Vec<PointOutcome>> {
        info!(points = self.points.len(), "Grid search");
        explore_points(&self.points, evaluator)
    }
}

/// Independent draws from the space's distributions. Without an iteration
/// cap, draws continue in rounds until the space stops yielding new
/// points or the search is interrupted.
#[derive(Debug, Clone)]
pub struct RandomSearchStrategy {
    space: HyperparametersSpace,
    n_iter: Option<usize>,
}

impl RandomSearchStrategy {
    pub fn new(space: HyperparametersSpace, n_iter: Option<usize>) -> Self {
        Self { space, n_iter }
    }

    fn round(&self, round: u64, n: usize) -> Result<Vec<HyperparamPoint>> {
        let mut space = self.space.clone();
        space.set_random_state(self.space.random_state().unwrap_or(0).wrapping_add(round));
        space.get_random_parameters(n)
    }
}

impl SearchStrategy for RandomSearchStrategy {
    fn get_experiments_count(&self) -> Option<usize> {
        self.n_iter
    }

    fn get_default_parameters(&self) -> Result<HyperparamPoint> {
        self.round(0, 1)?
            .pop()
            .ok_or_else(|| PrepError::ConfigError("Empty hyperparameter space".to_string()))
    }

    fn explore(&mut self, evaluator: &mut SearchEvaluator<'_>) -> Result<Vec<PointOutcome>> {
        if let Some(n) = self.n_iter {
            let mut seen = HashSet::new();
            let points: Vec<HyperparamPoint> = self
                .round(0, n)?
                .into_iter()
                .filter(|p| seen.insert(point_key(p)))
                .collect();
            info!(points = points.len(), "Random search");
            return explore_points(&points, evaluator);
        }

        let mut seen = HashSet::new();
        let mut outcomes = Vec::new();
        let mut round = 0u64;
        let mut stale_rounds = 0;
        while !evaluator.is_interrupted() {
            let fresh: Vec<HyperparamPoint> = self
                .round(round, evaluator.parallelism())?
                .into_iter()
                .filter(|p| seen.insert(point_key(p)))
                .collect();
            round += 1;
            if fresh.is_empty() {
                stale_rounds += 1;
                if stale_rounds >= MAX_STALE_ROUNDS {
                    debug!(rounds = round, "Random search exhausted the space");
                    break;
                }
                continue;
            }
            stale_rounds = 0;
            let batch = evaluator.evaluate(fresh)?;
            let stop = batch.iter().any(PointOutcome::is_interrupted);
            outcomes.extend(batch);
            if stop {
                break;
            }
        }
        Ok(outcomes)
    }
}

/// Ask a batch, evaluate it, tell the losses.
///
/// The optimizer minimizes, so it is told the negated greater-is-better
/// score. A failed point is told the worst loss seen so far; until any
/// point succeeds, failures are held back.
pub struct BayesianSearchStrategy {
    space: HyperparametersSpace,
    optimizer: ConditionalOptimizer,
    n_iter: Option<usize>,
    settings: BayesianSettings,
}

impl std::fmt::Debug for BayesianSearchStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BayesianSearchStrategy")
            .field("n_iter", &self.n_iter)
            .field("settings", &self.settings)
            .finish()
    }
}

impl BayesianSearchStrategy {
    pub fn new(space: HyperparametersSpace, n_iter: Option<usize>, settings: BayesianSettings) -> Result<Self> {
        let optimizer = space.get_optimizer(settings.clone())?;
        Ok(Self {
            space,
            optimizer,
            n_iter,
            settings,
        })
    }

    pub fn optimizer(&self) -> &ConditionalOptimizer {
        &self.optimizer
    }
}

impl SearchStrategy for BayesianSearchStrategy {
    fn get_experiments_count(&self) -> Option<usize> {
        self.n_iter
    }

    fn get_default_parameters(&self) -> Result<HyperparamPoint> {
        let mut fresh = self.space.get_optimizer(self.settings.clone())?;
        fresh
            .ask(1)?
            .pop()
            .ok_or_else(|| PrepError::ConfigError("Empty hyperparameter space".to_string()))
    }

    fn explore(&mut self, evaluator: &mut SearchEvaluator<'_>) -> Result<Vec<PointOutcome>> {
        let mut outcomes = Vec::new();
        let mut pending_failures: Vec<HyperparamPoint> = Vec::new();
        let mut worst_loss: Option<f64> = None;

        while !evaluator.is_interrupted() {
            let n = evaluator
                .remaining()
                .map_or(evaluator.parallelism(), |r| r.min(evaluator.parallelism()));
            let points = self.optimizer.ask(n)?;
            let batch = evaluator.evaluate(points)?;

            let mut told_points = Vec::new();
            let mut told_losses = Vec::new();
            for outcome in &batch {
                match outcome {
                    PointOutcome::Evaluated(r) => {
                        let loss = -r.aggregated.test_score_gib_mean;
                        worst_loss = Some(worst_loss.map_or(loss, |w: f64| w.max(loss)));
                        told_points.push(r.aggregated.parameters.clone());
                        told_losses.push(loss);
                    }
                    PointOutcome::Failed { parameters, .. } => pending_failures.push(parameters.clone()),
                    PointOutcome::Interrupted(_) => {}
                }
            }
            if let Some(worst) = worst_loss {
                for failed in pending_failures.drain(..) {
                    told_points.push(failed);
                    told_losses.push(worst);
                }
            }
            if !told_points.is_empty() {
                self.optimizer.tell(&told_points, &told_losses)?;
            }

            let stop = batch.iter().any(PointOutcome::is_interrupted);
            outcomes.extend(batch);
            if stop {
                break;
            }
        }
        Ok(outcomes)
    }
}
