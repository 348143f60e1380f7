//! Evaluates hyperparameter points on every split and aggregates the scores.

use serde::{Deserialize, Serialize};
use tracing::info;

use super::context::{SearchContext, SplitResult};
use super::result_store::ResultStore;
use super::worker::{Task, TaskOutcome, WorkScheduler};
use crate::error::{PrepError, Result};
use crate::optimizer::{format_point, HyperparamPoint};

/// Cross-split summary of one point. Scores are weighted by the test
/// size of each split, times are not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedResult {
    pub finished_at: u64,
    pub score: f64,
    pub test_score_gib_mean: f64,
    pub test_score_mean: f64,
    pub test_score_std: f64,
    pub train_score_mean: f64,
    pub train_score_std: f64,
    /// Total milliseconds over all splits.
    pub time: f64,
    pub fit_time_mean: f64,
    pub fit_time_std: f64,
    pub score_time_mean: f64,
    pub score_time_std: f64,
    pub parameters: HyperparamPoint,
}

fn mean_and_std(values: &[f64], weights: Option<&[f64]>) -> (f64, f64) {
    let uniform = vec![1.0; values.len()];
    let weights = weights.unwrap_or(&uniform);
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return (f64::NAN, f64::NAN);
    }
    let mean = values.iter().zip(weights).map(|(v, w)| v * w).sum::<f64>() / total;
    let var = values
        .iter()
        .zip(weights)
        .map(|(v, w)| w * (v - mean) * (v - mean))
        .sum::<f64>()
        / total;
    (mean, var.sqrt())
}

pub fn aggregate_point_results(results: &[SplitResult]) -> Result<AggregatedResult> {
    let first = results
        .first()
        .ok_or_else(|| PrepError::ComputationError("Trying to aggregate over an empty list of results".to_string()))?;
    let weights: Vec<f64> = results.iter().map(|r| r.num_samples as f64).collect();
    let collect = |f: fn(&SplitResult) -> f64| results.iter().map(f).collect::<Vec<f64>>();

    let (test_mean, test_std) = mean_and_std(&collect(|r| r.test_score), Some(&weights));
    let (train_mean, train_std) = mean_and_std(&collect(|r| r.train_score), Some(&weights));
    let (gib_mean, _) = mean_and_std(&collect(|r| r.test_score_gib), Some(&weights));
    let (fit_mean, fit_std) = mean_and_std(&collect(|r| r.fit_time), None);
    let (score_mean, score_std) = mean_and_std(&collect(|r| r.score_time), None);

    Ok(AggregatedResult {
        finished_at: results.iter().map(|r| r.done_at).max().unwrap_or(0),
        score: test_mean,
        test_score_gib_mean: gib_mean,
        test_score_mean: test_mean,
        test_score_std: test_std,
        train_score_mean: train_mean,
        train_score_std: train_std,
        time: results.iter().map(|r| r.time).sum(),
        fit_time_mean: fit_mean,
        fit_time_std: fit_std,
        score_time_mean: score_mean,
        score_time_std: score_std,
        parameters: first.parameters.clone(),
    })
}

/// One point evaluated on every split.
#[derive(Debug, Clone)]
pub struct HpPointResult {
    pub aggregated: AggregatedResult,
    pub per_split: Vec<SplitResult>,
}

#[derive(Debug, Clone)]
pub enum PointOutcome {
    Evaluated(HpPointResult),
    /// At least one split failed to fit or score.
    Failed { parameters: HyperparamPoint, error: String },
    /// Not evaluated: iteration cap reached or search interrupted.
    Interrupted(HyperparamPoint),
}

impl PointOutcome {
    pub fn parameters(&self) -> &HyperparamPoint {
        match self {
            PointOutcome::Evaluated(r) => &r.aggregated.parameters,
            PointOutcome::Failed { parameters, .. } => parameters,
            PointOutcome::Interrupted(p) => p,
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, PointOutcome::Interrupted(_))
    }
}

/// Drives the scheduler for a search strategy and persists what it gets.
pub struct SearchEvaluator<'a> {
    scheduler: &'a WorkScheduler,
    context: &'a SearchContext,
    result_store: &'a dyn ResultStore,
    max_n_iter: Option<usize>,
    n_iter: usize,
}

impl<'a> SearchEvaluator<'a> {
    pub fn new(
        scheduler: &'a WorkScheduler,
        context: &'a SearchContext,
        result_store: &'a dyn ResultStore,
        max_n_iter: Option<usize>,
    ) -> Self {
        Self {
            scheduler,
            context,
            result_store,
            max_n_iter,
            n_iter: 0,
        }
    }

    pub fn n_iter(&self) -> usize {
        self.n_iter
    }

    /// Points that can still be scheduled before the iteration cap.
    pub fn remaining(&self) -> Option<usize> {
        self.max_n_iter.map(|m| m.saturating_sub(self.n_iter))
    }

    /// Never true before the first point, so a search always has a result.
    pub fn is_interrupted(&self) -> bool {
        (self.n_iter > 0 && self.scheduler.soft_interrupted()) || self.remaining() == Some(0)
    }

    /// Number of points worth evaluating together.
    pub fn parallelism(&self) -> usize {
        self.scheduler.workers_count().max(1)
    }

    /// Evaluate `points` on every split. The very first point of a search
    /// always runs, even after an interruption, so there is a result.
    pub fn evaluate(&mut self, points: Vec<HyperparamPoint>) -> Result<Vec<PointOutcome>> {
        let n_splits = self.context.splits().len();
        let mut slots: Vec<Vec<Option<TaskOutcome>>> = Vec::with_capacity(points.len());
        let mut tasks = Vec::new();
        let mut task_slots = Vec::new();
        let mut capped = Vec::with_capacity(points.len());

        for (p, point) in points.iter().enumerate() {
            if self.remaining() == Some(0) {
                info!("Aborting search for hyperparameters (max nb. of iterations)");
                capped.push(true);
                slots.push(Vec::new());
                continue;
            }
            capped.push(false);
            let soft_interruptible = self.n_iter > 0;
            self.n_iter += 1;
            let mut point_slots = vec![None; n_splits];
            for (split_id, slot) in point_slots.iter_mut().enumerate() {
                match self.result_store.find_split_result(split_id, point)? {
                    Some(stored) => {
                        info!(split = split_id, params = %format_point(point), "Re-using evaluation");
                        *slot = Some(if self.scheduler.soft_interrupted() && soft_interruptible {
                            TaskOutcome::Interrupted
                        } else {
                            TaskOutcome::Done(stored)
                        });
                    }
                    None => {
                        tasks.push(Task {
                            split_id,
                            parameters: point.clone(),
                            soft_interruptible,
                        });
                        task_slots.push((p, split_id));
                    }
                }
            }
            slots.push(point_slots);
        }

        if !tasks.is_empty() {
            let outcomes = self.scheduler.run(self.context, tasks)?;
            for ((p, split_id), outcome) in task_slots.into_iter().zip(outcomes) {
                slots[p][split_id] = Some(outcome);
            }
        }

        let mut results = Vec::with_capacity(points.len());
        for ((point, point_slots), capped) in points.into_iter().zip(slots).zip(capped) {
            if capped {
                results.push(PointOutcome::Interrupted(point));
                continue;
            }
            results.push(self.collect_point(point, point_slots)?);
        }
        Ok(results)
    }

    fn collect_point(&self, point: HyperparamPoint, slots: Vec<Option<TaskOutcome>>) -> Result<PointOutcome> {
        let mut per_split = Vec::with_capacity(slots.len());
        let mut interrupted = false;
        for slot in slots {
            match slot {
                Some(TaskOutcome::Done(r)) => per_split.push(r),
                Some(TaskOutcome::Failed(error)) => {
                    return Ok(PointOutcome::Failed { parameters: point, error });
                }
                Some(TaskOutcome::Interrupted) | None => interrupted = true,
            }
        }
        if interrupted || per_split.is_empty() {
            return Ok(PointOutcome::Interrupted(point));
        }
        self.result_store.append_split_results(&per_split)?;
        let aggregated = aggregate_point_results(&per_split)?;
        self.result_store.append_aggregated_result(&aggregated)?;
        Ok(PointOutcome::Evaluated(HpPointResult { aggregated, per_split }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(split_id: usize, score: f64, n: usize, fit_time: f64) -> SplitResult {
        SplitResult {
            test_score_gib: -score,
            train_score: score,
            test_score: score,
            num_samples: n,
            fit_time,
            score_time: 1.0,
            time: fit_time + 1.0,
            parameters: HyperparamPoint::new(),
            done_at: split_id as u64,
            split_id,
        }
    }

    #[test]
    fn test_weighted_scores_unweighted_times() {
        let agg = aggregate_point_results(&[result(0, 1.0, 3, 10.0), result(1, 3.0, 1, 20.0)]).unwrap();
        assert_eq!(agg.test_score_mean, 1.5);
        assert_eq!(agg.test_score_gib_mean, -1.5);
        assert!((agg.test_score_std - 0.75_f64.sqrt()).abs() < 1e-12);
        assert_eq!(agg.fit_time_mean, 15.0);
        assert_eq!(agg.fit_time_std, 5.0);
        assert_eq!(agg.time, 32.0);
        assert_eq!(agg.finished_at, 1);
    }

    #[test]
    fn test_empty_aggregation_is_error() {
        assert!(aggregate_point_results(&[]).is_err());
    }
}
