//! Cross-validation splits and the per-split fit-and-score unit of work.

use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use ndarray::{Array1, Array2, Axis};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::estimator::Estimator;
use super::scoring::Scorer;
use crate::error::{PrepError, Result};
use crate::optimizer::{format_point, HyperparamPoint};

/// Row positions of one train/test split.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Split {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

/// K-fold splitter. The first `n % k` folds get one extra row.
#[derive(Debug, Clone)]
pub struct KFold {
    n_splits: usize,
    shuffle: bool,
    random_state: u64,
}

impl KFold {
    pub fn new(n_splits: usize) -> Self {
        Self {
            n_splits,
            shuffle: false,
            random_state: 0,
        }
    }

    pub fn with_shuffle(mut self, random_state: u64) -> Self {
        self.shuffle = true;
        self.random_state = random_state;
        self
    }

    pub fn n_splits(&self) -> usize {
        self.n_splits
    }

    pub fn split(&self, n_samples: usize) -> Result<Vec<Split>> {
        if self.n_splits < 2 {
            return Err(PrepError::ConfigError("n_splits must be at least 2".to_string()));
        }
        if n_samples < self.n_splits {
            return Err(PrepError::DataError(format!(
                "Cannot split {} rows into {} folds",
                n_samples, self.n_splits
            )));
        }

        let mut indices: Vec<usize> = (0..n_samples).collect();
        if self.shuffle {
            indices.shuffle(&mut ChaCha8Rng::seed_from_u64(self.random_state));
        }

        let base = n_samples / self.n_splits;
        let remainder = n_samples % self.n_splits;
        let mut splits = Vec::with_capacity(self.n_splits);
        let mut start = 0;
        for fold in 0..self.n_splits {
            let size = if fold < remainder { base + 1 } else { base };
            let test = indices[start..start + size].to_vec();
            let train = indices[..start]
                .iter()
                .chain(&indices[start + size..])
                .copied()
                .collect();
            splits.push(Split { train, test });
            start += size;
        }
        Ok(splits)
    }
}

/// Outcome of one point on one split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitResult {
    /// Greater-is-better test score, used to rank points.
    pub test_score_gib: f64,
    /// Raw metric values.
    pub train_score: f64,
    pub test_score: f64,
    pub num_samples: usize,
    /// Milliseconds.
    pub fit_time: f64,
    pub score_time: f64,
    pub time: f64,
    pub parameters: HyperparamPoint,
    /// Unix epoch milliseconds.
    pub done_at: u64,
    pub split_id: usize,
}

pub(crate) fn unix_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Everything needed to evaluate a point on a split. Shared read-only by
/// every worker.
pub struct SearchContext {
    x: Arc<Array2<f64>>,
    y: Arc<Array1<f64>>,
    splits: Vec<Split>,
    sample_weight: Option<Arc<Array1<f64>>>,
    base_estimator: Box<dyn Estimator>,
    scorer: Arc<dyn Scorer>,
    metric_sign: f64,
}

impl std::fmt::Debug for SearchContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchContext")
            .field("shape", &self.x.dim())
            .field("splits", &self.splits.len())
            .field("weighted", &self.sample_weight.is_some())
            .finish()
    }
}

impl SearchContext {
    pub fn new(
        x: Arc<Array2<f64>>,
        y: Arc<Array1<f64>>,
        splits: Vec<Split>,
        sample_weight: Option<Arc<Array1<f64>>>,
        base_estimator: Box<dyn Estimator>,
        scorer: Arc<dyn Scorer>,
        metric_sign: f64,
    ) -> Result<Self> {
        if x.nrows() != y.len() {
            return Err(PrepError::ShapeError {
                expected: format!("{} targets", x.nrows()),
                actual: format!("{} targets", y.len()),
            });
        }
        if let Some(w) = &sample_weight {
            if w.len() != y.len() {
                return Err(PrepError::ShapeError {
                    expected: format!("{} weights", y.len()),
                    actual: format!("{} weights", w.len()),
                });
            }
        }
        let n = y.len();
        if splits.iter().flat_map(|s| s.train.iter().chain(&s.test)).any(|&i| i >= n) {
            return Err(PrepError::DataError("Split refers to a row past the end of the data".to_string()));
        }
        Ok(Self {
            x,
            y,
            splits,
            sample_weight,
            base_estimator,
            scorer,
            metric_sign,
        })
    }

    pub fn splits(&self) -> &[Split] {
        &self.splits
    }

    pub fn metric_sign(&self) -> f64 {
        self.metric_sign
    }

    /// Fit a fresh estimator with `parameters` on one split and score it.
    pub fn execute_work(&self, split_id: usize, parameters: &HyperparamPoint) -> Result<SplitResult> {
        let split = self
            .splits
            .get(split_id)
            .ok_or_else(|| PrepError::ConfigError(format!("No split {}", split_id)))?;
        let mut estimator = self.base_estimator.clone_box();
        estimator.set_params(parameters)?;
        let msg = format_point(parameters);
        info!(split = split_id, params = %msg, "Fit");

        let start = Instant::now();
        let x_train = self.x.select(Axis(0), &split.train);
        let y_train = self.y.select(Axis(0), &split.train);
        let w_train = self.sample_weight.as_ref().map(|w| w.select(Axis(0), &split.train));
        let fit_weight = if estimator.supports_sample_weight() { w_train.as_ref() } else { None };
        estimator.fit(x_train.view(), y_train.view(), fit_weight.map(|w| w.view()))?;
        let fit_time = start.elapsed().as_secs_f64() * 1000.0;

        let train_score = self.scorer.score(
            estimator.as_ref(),
            x_train.view(),
            y_train.view(),
            w_train.as_ref().map(|w| w.view()),
        )?;
        drop(x_train);
        let x_test = self.x.select(Axis(0), &split.test);
        let y_test = self.y.select(Axis(0), &split.test);
        let w_test = self.sample_weight.as_ref().map(|w| w.select(Axis(0), &split.test));
        let test_score = self.scorer.score(
            estimator.as_ref(),
            x_test.view(),
            y_test.view(),
            w_test.as_ref().map(|w| w.view()),
        )?;
        let score_time = start.elapsed().as_secs_f64() * 1000.0 - fit_time;

        info!(
            split = split_id,
            params = %msg,
            fit_s = fit_time / 1000.0,
            score_s = score_time / 1000.0,
            score = test_score,
            sign = self.metric_sign,
            "Done"
        );
        Ok(SplitResult {
            test_score_gib: test_score,
            train_score: self.metric_sign * train_score,
            test_score: self.metric_sign * test_score,
            num_samples: split.test.len(),
            fit_time,
            score_time,
            time: fit_time + score_time,
            parameters: parameters.clone(),
            done_at: unix_time_millis(),
            split_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::scoring::{Metric, MetricScorer};
    use crate::search::test_support::ShiftRegressor;

    #[test]
    fn test_kfold_sizes_and_coverage() {
        let splits = KFold::new(3).split(10).unwrap();
        let sizes: Vec<usize> = splits.iter().map(|s| s.test.len()).collect();
        assert_eq!(sizes, vec![4, 3, 3]);
        let mut all: Vec<usize> = splits.iter().flat_map(|s| s.test.clone()).collect();
        all.sort_unstable();
        assert_eq!(all, (0..10).collect::<Vec<_>>());
        assert!(splits.iter().all(|s| s.train.len() + s.test.len() == 10));
    }

    #[test]
    fn test_kfold_validation() {
        assert!(KFold::new(1).split(10).is_err());
        assert!(KFold::new(5).split(3).is_err());
        let a = KFold::new(2).with_shuffle(9).split(6).unwrap();
        let b = KFold::new(2).with_shuffle(9).split(6).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_execute_work_signs_scores() {
        let x = Arc::new(Array2::from_shape_fn((6, 1), |(i, _)| i as f64));
        let y = Arc::new(Array1::from_iter((0..6).map(|i| i as f64)));
        let scorer = Arc::new(MetricScorer::new(Metric::Mae).unwrap());
        let ctx = SearchContext::new(
            x,
            y,
            KFold::new(2).split(6).unwrap(),
            None,
            Box::new(ShiftRegressor::default()),
            scorer,
            -1.0,
        )
        .unwrap();
        let mut params = HyperparamPoint::new();
        params.insert("shift".to_string(), 1.0.into());
        let result = ctx.execute_work(0, &params).unwrap();
        assert_eq!(result.test_score, 1.0);
        assert_eq!(result.test_score_gib, -1.0);
        assert_eq!(result.num_samples, 3);
        assert_eq!(result.parameters, params);
    }
}
