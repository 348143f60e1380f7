//! Evaluation metrics and the scorers built on them.
//!
//! Scorers always return "greater is better" values; the sign needed to
//! recover the raw metric is exposed separately.

use std::fmt;
use std::sync::Arc;

use ndarray::{ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};

use super::estimator::Estimator;
use crate::error::{PrepError, Result};

const PROBA_EPS: f64 = 1e-15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Metric {
    Accuracy,
    R2,
    Mae,
    Mse,
    Rmse,
    Rmsle,
    LogLoss,
    Mape,
    Custom,
}

impl Metric {
    pub fn name(&self) -> &'static str {
        match self {
            Metric::Accuracy => "ACCURACY",
            Metric::R2 => "R2",
            Metric::Mae => "MAE",
            Metric::Mse => "MSE",
            Metric::Rmse => "RMSE",
            Metric::Rmsle => "RMSLE",
            Metric::LogLoss => "LOG_LOSS",
            Metric::Mape => "MAPE",
            Metric::Custom => "CUSTOM",
        }
    }

    /// For `Custom`, the caller's declaration decides.
    pub fn greater_is_better(&self, custom_evaluation_metric_gib: bool) -> bool {
        match self {
            Metric::Custom => custom_evaluation_metric_gib,
            Metric::Mae | Metric::Mse | Metric::Rmse | Metric::Rmsle | Metric::LogLoss | Metric::Mape => false,
            Metric::Accuracy | Metric::R2 => true,
        }
    }

    fn needs_proba(&self) -> bool {
        matches!(self, Metric::LogLoss)
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Scores a fitted estimator on held-out rows.
pub trait Scorer: Send + Sync {
    /// Greater-is-better score.
    fn score(
        &self,
        estimator: &dyn Estimator,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        sample_weight: Option<ArrayView1<f64>>,
    ) -> Result<f64>;

    /// `1` or `-1` when known; a wrapped callback does not know it.
    fn sign(&self) -> Option<f64>;
}

/// Built-in metric scorer.
#[derive(Debug, Clone, Copy)]
pub struct MetricScorer {
    metric: Metric,
}

impl MetricScorer {
    pub fn new(metric: Metric) -> Result<Self> {
        if metric == Metric::Custom {
            return Err(PrepError::ConfigError(
                "CUSTOM metric needs a scoring callback".to_string(),
            ));
        }
        Ok(Self { metric })
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }
}

impl Scorer for MetricScorer {
    fn score(
        &self,
        estimator: &dyn Estimator,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        sample_weight: Option<ArrayView1<f64>>,
    ) -> Result<f64> {
        let value = if self.metric.needs_proba() {
            let proba = estimator.predict_proba(x)?;
            log_loss(y, proba.view(), sample_weight)?
        } else {
            let pred = estimator.predict(x)?;
            compute_metric(self.metric, y, pred.view(), sample_weight)?
        };
        Ok(self.sign().unwrap_or(1.0) * value)
    }

    fn sign(&self) -> Option<f64> {
        Some(if self.metric.greater_is_better(true) { 1.0 } else { -1.0 })
    }
}

/// Host-supplied scoring function on `(y_true, y_pred, sample_weight)`.
pub type ScoreFn = Arc<dyn Fn(ArrayView1<f64>, ArrayView1<f64>, Option<ArrayView1<f64>>) -> Result<f64> + Send + Sync>;

/// Wraps a host callback; the result is oriented with the declared
/// direction so the search can always maximize.
#[derive(Clone)]
pub struct CustomScorer {
    func: ScoreFn,
    greater_is_better: bool,
}

impl CustomScorer {
    pub fn new(func: ScoreFn, greater_is_better: bool) -> Self {
        Self { func, greater_is_better }
    }
}

impl fmt::Debug for CustomScorer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomScorer")
            .field("greater_is_better", &self.greater_is_better)
            .finish()
    }
}

impl Scorer for CustomScorer {
    fn score(
        &self,
        estimator: &dyn Estimator,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        sample_weight: Option<ArrayView1<f64>>,
    ) -> Result<f64> {
        let pred = estimator.predict(x)?;
        let raw = (self.func)(y, pred.view(), sample_weight)?;
        if !raw.is_finite() {
            return Err(PrepError::CustomCodeError(format!(
                "Custom scoring function must return a finite number, got {}",
                raw
            )));
        }
        Ok(if self.greater_is_better { raw } else { -raw })
    }

    fn sign(&self) -> Option<f64> {
        None
    }
}

/// Sign turning a greater-is-better score back into the metric's value.
pub fn metric_sign(scorer: &dyn Scorer, custom_evaluation_metric_gib: bool) -> f64 {
    scorer
        .sign()
        .unwrap_or(if custom_evaluation_metric_gib { 1.0 } else { -1.0 })
}

fn check_lengths(y: ArrayView1<f64>, other: usize, w: Option<ArrayView1<f64>>) -> Result<()> {
    if y.len() != other || w.map(|w| w.len() != y.len()).unwrap_or(false) {
        return Err(PrepError::ShapeError {
            expected: format!("{} rows", y.len()),
            actual: format!("{} rows", other),
        });
    }
    if y.is_empty() {
        return Err(PrepError::DataError("Cannot score on an empty split".to_string()));
    }
    Ok(())
}

fn weighted_mean(values: impl Iterator<Item = f64>, w: Option<ArrayView1<f64>>) -> f64 {
    match w {
        Some(w) => {
            let (num, den) = values
                .zip(w.iter())
                .fold((0.0, 0.0), |(n, d), (v, wi)| (n + v * wi, d + wi));
            if den > 0.0 {
                num / den
            } else {
                0.0
            }
        }
        None => {
            let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
            sum / count.max(1) as f64
        }
    }
}

/// Raw metric value, not sign-adjusted.
pub fn compute_metric(
    metric: Metric,
    y_true: ArrayView1<f64>,
    y_pred: ArrayView1<f64>,
    w: Option<ArrayView1<f64>>,
) -> Result<f64> {
    check_lengths(y_true, y_pred.len(), w)?;
    let pairs = || y_true.iter().zip(y_pred.iter()).map(|(t, p)| (*t, *p));
    match metric {
        Metric::Accuracy => Ok(weighted_mean(pairs().map(|(t, p)| f64::from((t - p).abs() < 1e-9)), w)),
        Metric::Mae => Ok(weighted_mean(pairs().map(|(t, p)| (t - p).abs()), w)),
        Metric::Mse => Ok(weighted_mean(pairs().map(|(t, p)| (t - p) * (t - p)), w)),
        Metric::Rmse => Ok(weighted_mean(pairs().map(|(t, p)| (t - p) * (t - p)), w).sqrt()),
        Metric::Rmsle => {
            if pairs().any(|(t, p)| t < 0.0 || p < 0.0) {
                return Err(PrepError::DataError(
                    "RMSLE cannot be used when targets or predictions are negative".to_string(),
                ));
            }
            Ok(weighted_mean(pairs().map(|(t, p)| (t.ln_1p() - p.ln_1p()).powi(2)), w).sqrt())
        }
        Metric::Mape => Ok(weighted_mean(
            pairs().map(|(t, p)| (t - p).abs() / t.abs().max(f64::EPSILON)),
            w,
        )),
        Metric::R2 => {
            let mean = weighted_mean(y_true.iter().copied(), w);
            let ss_res = weighted_mean(pairs().map(|(t, p)| (t - p) * (t - p)), w);
            let ss_tot = weighted_mean(y_true.iter().map(|t| (t - mean) * (t - mean)), w);
            if ss_tot == 0.0 {
                Ok(if ss_res == 0.0 { 1.0 } else { 0.0 })
            } else {
                Ok(1.0 - ss_res / ss_tot)
            }
        }
        Metric::LogLoss | Metric::Custom => Err(PrepError::ConfigError(format!(
            "Metric {} cannot be computed from predictions",
            metric
        ))),
    }
}

/// Cross-entropy of class probabilities; `y_true` holds class indices.
pub fn log_loss(y_true: ArrayView1<f64>, proba: ArrayView2<f64>, w: Option<ArrayView1<f64>>) -> Result<f64> {
    check_lengths(y_true, proba.nrows(), w)?;
    let mut losses = Vec::with_capacity(y_true.len());
    for (i, t) in y_true.iter().enumerate() {
        let class = *t as usize;
        if t.fract() != 0.0 || *t < 0.0 || class >= proba.ncols() {
            return Err(PrepError::DataError(format!(
                "Target {} is not a class index below {}",
                t,
                proba.ncols()
            )));
        }
        let row_sum: f64 = proba.row(i).sum();
        let p = (proba[[i, class]] / if row_sum > 0.0 { row_sum } else { 1.0 }).clamp(PROBA_EPS, 1.0 - PROBA_EPS);
        losses.push(-p.ln());
    }
    Ok(weighted_mean(losses.into_iter(), w))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_lower_is_better_metrics() {
        for m in [Metric::Mae, Metric::Mse, Metric::Rmse, Metric::Rmsle, Metric::LogLoss, Metric::Mape] {
            assert!(!m.greater_is_better(true));
        }
        assert!(Metric::R2.greater_is_better(false));
        assert!(!Metric::Custom.greater_is_better(false));
    }

    #[test]
    fn test_regression_metrics() {
        let t = array![1.0, 2.0, 3.0, 4.0];
        let p = array![1.0, 2.0, 3.0, 6.0];
        assert_eq!(compute_metric(Metric::Mae, t.view(), p.view(), None).unwrap(), 0.5);
        assert_eq!(compute_metric(Metric::Mse, t.view(), p.view(), None).unwrap(), 1.0);
        assert_eq!(compute_metric(Metric::Rmse, t.view(), p.view(), None).unwrap(), 1.0);
        let r2 = compute_metric(Metric::R2, t.view(), p.view(), None).unwrap();
        assert!((r2 - 0.2).abs() < 1e-12);
        let w = array![1.0, 1.0, 1.0, 0.0];
        assert_eq!(compute_metric(Metric::Mae, t.view(), p.view(), Some(w.view())).unwrap(), 0.0);
    }

    #[test]
    fn test_accuracy_and_log_loss() {
        let t = array![0.0, 1.0, 1.0, 0.0];
        let p = array![0.0, 1.0, 0.0, 0.0];
        assert_eq!(compute_metric(Metric::Accuracy, t.view(), p.view(), None).unwrap(), 0.75);
        let proba = array![[1.0, 0.0], [0.0, 1.0]];
        let loss = log_loss(array![0.0, 1.0].view(), proba.view(), None).unwrap();
        assert!(loss < 1e-10);
        assert!(log_loss(array![2.0].view(), array![[0.5, 0.5]].view(), None).is_err());
    }

    #[test]
    fn test_metric_sign() {
        let scorer = MetricScorer::new(Metric::Mse).unwrap();
        assert_eq!(metric_sign(&scorer, true), -1.0);
        let custom = CustomScorer::new(Arc::new(|_: ArrayView1<f64>, _: ArrayView1<f64>, _: Option<ArrayView1<f64>>| Ok(1.0)), false);
        assert_eq!(metric_sign(&custom, false), -1.0);
        assert_eq!(metric_sign(&custom, true), 1.0);
        assert!(MetricScorer::new(Metric::Custom).is_err());
    }
}
